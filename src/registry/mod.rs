//! Service registry
//!
//! Holds the latest backend-server snapshot per registry name for
//! downstream routing. The process-global registry of the original system
//! is modeled as an injected collaborator ([`ServersRegistry`]) so tests
//! and embedders can supply their own.

mod sync;

pub use sync::{
    AppInstance, Application, ClientBuilder, DiscoveryClient, PortStatus, RegistrySpec,
    RegistryStatus, RegistrySync,
};

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// One backend service instance discovered upstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceServer {
    pub service_name: String,
    pub hostname: String,
    pub host_ip: String,
    pub port: u16,
    pub scheme: String,
}

/// The registry surface the sync loop publishes into.
///
/// The most recent snapshot wins; there is no merging.
pub trait ServersRegistry: Send + Sync {
    fn replace_servers(&self, name: &str, servers: Vec<ServiceServer>);
    fn close_registry(&self, name: &str);
}

/// In-memory registry with atomic snapshot publication.
#[derive(Default)]
pub struct MemoryRegistry {
    inner: RwLock<HashMap<String, Arc<Vec<ServiceServer>>>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The current snapshot for `name`, if any.
    pub fn servers(&self, name: &str) -> Option<Arc<Vec<ServiceServer>>> {
        self.inner.read().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.inner.read().keys().cloned().collect()
    }
}

impl ServersRegistry for MemoryRegistry {
    fn replace_servers(&self, name: &str, servers: Vec<ServiceServer>) {
        self.inner
            .write()
            .insert(name.to_string(), Arc::new(servers));
    }

    fn close_registry(&self, name: &str) {
        self.inner.write().remove(name);
    }
}
