//! Backend load balancer
//!
//! Policy-driven selection of one server from a tagged pool, invoked on
//! every task dispatch. The pool is immutable after construction; replacing
//! the pool is the only way to change the server set, which keeps selection
//! lock-free.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::error;
use url::Url;

use crate::error::{Error, Result};
use crate::task::Task;

/// The request surface selection policies consume, as exposed by the HTTP
/// front-end.
pub trait BackendRequest {
    fn real_ip(&self) -> &str;
    fn header(&self, key: &str) -> Option<&str>;
}

impl BackendRequest for Task {
    fn real_ip(&self) -> &str {
        Task::real_ip(self)
    }

    fn header(&self, key: &str) -> Option<&str> {
        Task::header(self, key)
    }
}

/// Server selection policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Policy {
    RoundRobin,
    Random,
    WeightedRandom,
    IpHash,
    HeaderHash,
}

/// Load-balance configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadBalance {
    pub policy: Policy,

    #[serde(rename = "headerHashKey", default)]
    pub header_hash_key: String,
}

impl LoadBalance {
    pub fn validate(&self) -> Result<()> {
        if self.policy == Policy::HeaderHash && self.header_hash_key.is_empty() {
            return Err(Error::InvalidConfig(
                "headerHash needs to specify headerHashKey".to_string(),
            ));
        }
        Ok(())
    }
}

/// One backend server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub url: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheme: Option<String>,

    #[serde(default)]
    pub tags: Vec<String>,

    #[serde(default)]
    pub weight: u32,
}

impl Server {
    pub fn validate(&self) -> Result<()> {
        Url::parse(&self.url)
            .map_err(|e| Error::InvalidConfig(format!("invalid server url {}: {}", self.url, e)))?;
        let mut seen = HashSet::new();
        for tag in &self.tags {
            if !seen.insert(tag) {
                return Err(Error::InvalidConfig(format!(
                    "duplicate server tag {}",
                    tag
                )));
            }
        }
        if self.weight > 100 {
            return Err(Error::InvalidConfig(format!(
                "server weight {} out of range [0, 100]",
                self.weight
            )));
        }
        Ok(())
    }

    fn has_any_tag(&self, tags: &[String]) -> bool {
        tags.iter().any(|tag| self.tags.contains(tag))
    }
}

/// Backend specification: the full server list, an optional tag filter and
/// the selection policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendSpec {
    #[serde(default)]
    pub servers: Vec<Server>,

    #[serde(rename = "serversTags", default)]
    pub servers_tags: Vec<String>,

    #[serde(rename = "loadBalance")]
    pub load_balance: LoadBalance,
}

impl BackendSpec {
    pub fn validate(&self) -> Result<()> {
        self.load_balance.validate()?;
        for server in &self.servers {
            server.validate()?;
        }
        Ok(())
    }
}

/// Immutable pool of the spec's servers participating in selection.
///
/// When the spec declares a non-empty tag filter, only servers whose tag
/// set intersects it participate; otherwise all servers do. The weight sum
/// is precomputed once.
pub struct ServerPool {
    servers: Vec<Arc<Server>>,
    weights_sum: u32,
    policy: Policy,
    header_hash_key: String,
    counter: AtomicU64,
}

impl ServerPool {
    pub fn new(spec: &BackendSpec) -> Result<Self> {
        spec.validate()?;

        let servers: Vec<Arc<Server>> = spec
            .servers
            .iter()
            .filter(|s| spec.servers_tags.is_empty() || s.has_any_tag(&spec.servers_tags))
            .cloned()
            .map(Arc::new)
            .collect();
        let weights_sum = servers.iter().map(|s| s.weight).sum();

        Ok(Self {
            servers,
            weights_sum,
            policy: spec.load_balance.policy,
            header_hash_key: spec.load_balance.header_hash_key.clone(),
            counter: AtomicU64::new(0),
        })
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    pub fn servers(&self) -> &[Arc<Server>] {
        &self.servers
    }

    /// Select one server for this dispatch, or `None` on an empty pool.
    pub fn next(&self, req: &dyn BackendRequest) -> Option<Arc<Server>> {
        if self.servers.is_empty() {
            return None;
        }
        let server = match self.policy {
            Policy::RoundRobin => self.round_robin(),
            Policy::Random => self.random(),
            Policy::WeightedRandom => self.weighted_random(),
            Policy::IpHash => self.ip_hash(req),
            Policy::HeaderHash => self.header_hash(req),
        };
        Some(server)
    }

    fn round_robin(&self) -> Arc<Server> {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        self.servers[(n % self.servers.len() as u64) as usize].clone()
    }

    fn random(&self) -> Arc<Server> {
        let idx = rand::thread_rng().gen_range(0..self.servers.len());
        self.servers[idx].clone()
    }

    fn weighted_random(&self) -> Arc<Server> {
        if self.weights_sum == 0 {
            return self.random();
        }
        let mut remaining = rand::thread_rng().gen_range(0..self.weights_sum) as i64;
        for server in &self.servers {
            remaining -= server.weight as i64;
            if remaining < 0 {
                return server.clone();
            }
        }

        error!(
            "BUG: weighted random can't pick a server: sum({}) servers({})",
            self.weights_sum,
            self.servers.len()
        );
        self.random()
    }

    fn ip_hash(&self, req: &dyn BackendRequest) -> Arc<Server> {
        let sum32 = hash32(req.real_ip());
        self.servers[sum32 as usize % self.servers.len()].clone()
    }

    fn header_hash(&self, req: &dyn BackendRequest) -> Arc<Server> {
        // A missing header hashes the empty string.
        let value = req.header(&self.header_hash_key).unwrap_or("");
        let sum32 = hash32(value);
        self.servers[sum32 as usize % self.servers.len()].clone()
    }
}

/// Stable 32-bit non-cryptographic hash used by the hash policies.
fn hash32(value: &str) -> u32 {
    crc32fast::hash(value.as_bytes())
}
