//! Service-registry sync loop
//!
//! Periodically pulls the application list from an external discovery
//! source (Eureka-shaped), flattens it to one server entry per enabled
//! port, and atomically replaces the registry snapshot. Fetch failures are
//! logged and the previous snapshot is kept; the loop retries on the next
//! tick.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, OnceCell};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use url::Url;

use crate::error::{Error, Result};

use super::{ServersRegistry, ServiceServer};

/// Specification of one registry sync.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrySpec {
    /// Registry name the snapshot is published under.
    pub name: String,

    /// Upstream discovery endpoints.
    pub endpoints: Vec<String>,

    /// Tick interval as a duration string, e.g. `"10s"`.
    #[serde(rename = "syncInterval")]
    pub sync_interval: String,
}

impl RegistrySpec {
    pub fn validate(&self) -> Result<()> {
        if self.endpoints.is_empty() {
            return Err(Error::InvalidConfig("endpoints must not be empty".to_string()));
        }
        let mut seen = std::collections::HashSet::new();
        for endpoint in &self.endpoints {
            Url::parse(endpoint).map_err(|e| {
                Error::InvalidConfig(format!("invalid endpoint {}: {}", endpoint, e))
            })?;
            if !seen.insert(endpoint) {
                return Err(Error::InvalidConfig(format!(
                    "duplicate endpoint {}",
                    endpoint
                )));
            }
        }
        self.interval()?;
        Ok(())
    }

    /// The parsed sync interval.
    pub fn interval(&self) -> Result<Duration> {
        humantime::parse_duration(&self.sync_interval).map_err(|e| {
            Error::InvalidConfig(format!(
                "invalid syncInterval {}: {}",
                self.sync_interval, e
            ))
        })
    }
}

/// One port of a discovered instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortStatus {
    pub port: u16,
    pub enabled: bool,
}

/// One discovered instance, with its plain and secure ports reported
/// independently.
#[derive(Debug, Clone)]
pub struct AppInstance {
    pub hostname: String,
    pub ip_addr: String,
    pub port: Option<PortStatus>,
    pub secure_port: Option<PortStatus>,
}

/// One upstream application and its instances.
#[derive(Debug, Clone)]
pub struct Application {
    pub name: String,
    pub instances: Vec<AppInstance>,
}

/// The discovery surface the sync loop consumes; the real client library
/// stays external.
#[async_trait]
pub trait DiscoveryClient: Send + Sync {
    async fn applications(&self) -> Result<Vec<Application>>;
}

/// Builds the discovery client from the configured endpoints, at most once.
pub type ClientBuilder =
    Box<dyn Fn(&[String]) -> Result<Arc<dyn DiscoveryClient>> + Send + Sync>;

/// Status snapshot of a sync loop.
#[derive(Debug, Clone, Serialize)]
pub struct RegistryStatus {
    pub timestamp: i64,
    pub health: String,
    #[serde(rename = "serversNum")]
    pub servers_num: HashMap<String, usize>,
}

/// Periodic registry sync.
///
/// Runs an immediate first sync, then one per `syncInterval` until closed.
pub struct RegistrySync {
    inner: Arc<SyncInner>,
    handle: Mutex<Option<JoinHandle<()>>>,
    done_tx: watch::Sender<bool>,
}

struct SyncInner {
    spec: RegistrySpec,
    registry: Arc<dyn ServersRegistry>,
    builder: ClientBuilder,
    client: OnceCell<Arc<dyn DiscoveryClient>>,
    servers_num: Mutex<HashMap<String, usize>>,
    last_error: Mutex<Option<String>>,
}

impl RegistrySync {
    /// Validate the spec and start the loop.
    ///
    /// Malformed specs (including the interval string) fail here, never
    /// inside the loop.
    pub fn new(
        spec: RegistrySpec,
        builder: ClientBuilder,
        registry: Arc<dyn ServersRegistry>,
    ) -> Result<Self> {
        spec.validate()?;
        let interval = spec.interval()?;

        let inner = Arc::new(SyncInner {
            spec,
            registry,
            builder,
            client: OnceCell::new(),
            servers_num: Mutex::new(HashMap::new()),
            last_error: Mutex::new(None),
        });

        let (done_tx, done_rx) = watch::channel(false);
        let handle = tokio::spawn(run_loop(inner.clone(), interval, done_rx));

        Ok(Self {
            inner,
            handle: Mutex::new(Some(handle)),
            done_tx,
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.spec.name
    }

    pub fn status(&self) -> RegistryStatus {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        let health = self
            .inner
            .last_error
            .lock()
            .clone()
            .unwrap_or_else(|| "ready".to_string());
        RegistryStatus {
            timestamp,
            health,
            servers_num: self.inner.servers_num.lock().clone(),
        }
    }

    /// Drain the loop and drop the registry snapshot.
    pub async fn close(&self) {
        let _ = self.done_tx.send(true);
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.inner.registry.close_registry(&self.inner.spec.name);
    }
}

async fn run_loop(inner: Arc<SyncInner>, interval: Duration, mut done_rx: watch::Receiver<bool>) {
    inner.update().await;

    loop {
        tokio::select! {
            _ = done_rx.changed() => return,
            _ = tokio::time::sleep(interval) => inner.update().await,
        }
    }
}

impl SyncInner {
    /// The discovery client, constructed at most once and published
    /// atomically.
    async fn client(&self) -> Result<Arc<dyn DiscoveryClient>> {
        self.client
            .get_or_try_init(|| async { (self.builder)(&self.spec.endpoints) })
            .await
            .map(Arc::clone)
    }

    async fn update(&self) {
        let apps = match self.fetch().await {
            Ok(apps) => apps,
            Err(e) => {
                // Keep the previous snapshot; retry on the next tick.
                warn!("[{}] upstream fetch failed: {}", self.spec.name, e);
                *self.last_error.lock() = Some(e.to_string());
                return;
            }
        };

        let mut servers = Vec::new();
        let mut servers_num: HashMap<String, usize> = HashMap::new();
        for app in &apps {
            for instance in &app.instances {
                if let Some(port) = &instance.port {
                    if port.enabled {
                        servers.push(ServiceServer {
                            service_name: app.name.clone(),
                            hostname: instance.hostname.clone(),
                            host_ip: instance.ip_addr.clone(),
                            port: port.port,
                            scheme: "http".to_string(),
                        });
                        *servers_num.entry(app.name.clone()).or_default() += 1;
                    }
                }
                if let Some(port) = &instance.secure_port {
                    if port.enabled {
                        servers.push(ServiceServer {
                            service_name: app.name.clone(),
                            hostname: instance.hostname.clone(),
                            host_ip: instance.ip_addr.clone(),
                            port: port.port,
                            scheme: "https".to_string(),
                        });
                        *servers_num.entry(app.name.clone()).or_default() += 1;
                    }
                }
            }
        }

        debug!(
            "[{}] publishing {} servers across {} services",
            self.spec.name,
            servers.len(),
            servers_num.len()
        );
        self.registry.replace_servers(&self.spec.name, servers);
        *self.servers_num.lock() = servers_num;
        *self.last_error.lock() = None;
    }

    async fn fetch(&self) -> Result<Vec<Application>> {
        let client = self.client().await?;
        client.applications().await
    }
}
