//! Hub acquisition: spawn a hub, or attach to the one already running.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use conclave_core::{CoordinationConfig, Result};

use crate::protocol::HubLink;
use crate::server::HubProcess;

/// The capability to reach a hub for this application instance.
#[async_trait]
pub trait HubSpawner: Send + Sync {
    /// Whether this capability works in the current environment.
    fn is_supported(&self) -> bool {
        true
    }

    /// Obtain a fresh channel to the hub, spawning it if needed.
    async fn acquire(&self) -> Result<HubLink>;
}

/// Running in-process hubs, keyed by [`hub_cache_key`].
static HUBS: Lazy<Mutex<HashMap<String, Arc<HubProcess>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Stable key identifying the hub body (this crate's name and version) for
/// one application.
pub fn hub_cache_key(app_key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(env!("CARGO_PKG_NAME").as_bytes());
    hasher.update(b"\0");
    hasher.update(env!("CARGO_PKG_VERSION").as_bytes());
    hasher.update(b"\0");
    hasher.update(app_key.as_bytes());
    format!("conclave-hub-{}", hex::encode(hasher.finalize()))
}

/// Spawns hubs inside this process and shares them by cache key.
#[derive(Debug, Clone)]
pub struct LocalHubSpawner {
    key: String,
    config: CoordinationConfig,
}

impl LocalHubSpawner {
    pub fn new(app_key: &str, config: CoordinationConfig) -> Self {
        Self {
            key: hub_cache_key(app_key),
            config,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// The running hub for this key, started if absent or stopped.
    pub fn hub(&self) -> Arc<HubProcess> {
        let mut hubs = HUBS.lock();
        if let Some(hub) = hubs.get(&self.key).filter(|h| h.is_running()) {
            debug!("Reusing hub {}", self.key);
            return Arc::clone(hub);
        }
        info!("Spawning hub {}", self.key);
        let hub = HubProcess::start(self.config.clone());
        hubs.insert(self.key.clone(), Arc::clone(&hub));
        hub
    }
}

#[async_trait]
impl HubSpawner for LocalHubSpawner {
    async fn acquire(&self) -> Result<HubLink> {
        Ok(self.hub().attach())
    }
}
