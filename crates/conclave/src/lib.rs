//! Conclave: leader election, membership and correlated calls between
//! cooperating contexts.
//!
//! [`create`] hands out the process-wide coordinated context, backed by a hub
//! when one can be spawned or reached, and by peer gossip over a shared
//! medium otherwise.
//!
//! ```no_run
//! # async fn demo() -> conclave::Result<()> {
//! let ctx = conclave::create("worker", conclave::CreateOptions::default())?;
//! if ctx.is_master().await? {
//!     ctx.send(serde_json::json!({"hello": "followers"}), None)?;
//! }
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tracing::{debug, info};

pub use conclave_core::{
    CallHandler, ConclaveError, CoordinationConfig, Disposer, Event, EventHandler, EventName,
    Message, Peer, PeerId, Result, Transport, TransportKind, call_handler, event_handler,
};
pub use conclave_gossip::{GossipTransport, Medium, MemoryMedium};
pub use conclave_hub::{HubSpawner, HubTransport, LocalHubSpawner, WsHubConnector};

/// Application key used to scope the hub when none is given.
pub const DEFAULT_APP_KEY: &str = "conclave";

/// Construction-time choices for [`create`].
#[derive(Clone)]
pub struct CreateOptions {
    /// Force peer gossip over the shared medium.
    pub use_storage: bool,
    /// Attach to a running `conclave-hub` at this address instead of
    /// spawning one.
    pub endpoint: Option<String>,
    /// Scopes the spawned hub; contexts with the same key share a hub.
    pub app_key: String,
    pub config: CoordinationConfig,
    /// Medium for gossip mode. Defaults to the process-wide in-memory one.
    pub medium: Option<Arc<dyn Medium>>,
    /// Hub-spawn capability. Defaults to [`LocalHubSpawner`].
    pub spawner: Option<Arc<dyn HubSpawner>>,
}

impl Default for CreateOptions {
    fn default() -> Self {
        Self {
            use_storage: false,
            endpoint: None,
            app_key: DEFAULT_APP_KEY.to_string(),
            config: CoordinationConfig::default(),
            medium: None,
            spawner: None,
        }
    }
}

static INSTANCE: Lazy<Mutex<Option<Arc<dyn Transport>>>> = Lazy::new(|| Mutex::new(None));

/// The process-wide context named `name`.
///
/// Returns the existing instance, whatever its name and options, until it is
/// destroyed; the next call after that builds a fresh one. Must be called
/// inside a tokio runtime.
pub fn create(name: &str, options: CreateOptions) -> Result<Arc<dyn Transport>> {
    let mut instance = INSTANCE.lock();
    if let Some(existing) = instance.as_ref().filter(|t| !t.is_destroyed()) {
        debug!("Reusing context '{}'", existing.name());
        return Ok(Arc::clone(existing));
    }

    let transport = build(name, options)?;
    info!("Created {:?} context '{name}'", transport.kind());
    *instance = Some(Arc::clone(&transport));
    Ok(transport)
}

fn build(name: &str, options: CreateOptions) -> Result<Arc<dyn Transport>> {
    let CreateOptions {
        use_storage,
        endpoint,
        app_key,
        config,
        medium,
        spawner,
    } = options;

    if use_storage {
        return gossip(name, medium, config);
    }
    if let Some(endpoint) = endpoint {
        let connector: Arc<dyn HubSpawner> = Arc::new(WsHubConnector::new(&endpoint));
        return Ok(Arc::new(HubTransport::new(name, connector, config)));
    }

    let spawner =
        spawner.unwrap_or_else(|| Arc::new(LocalHubSpawner::new(&app_key, config.clone())));
    if spawner.is_supported() {
        Ok(Arc::new(HubTransport::new(name, spawner, config)))
    } else {
        debug!("Hub spawning unavailable, falling back to gossip");
        gossip(name, medium, config)
    }
}

fn gossip(
    name: &str,
    medium: Option<Arc<dyn Medium>>,
    config: CoordinationConfig,
) -> Result<Arc<dyn Transport>> {
    let medium = medium.unwrap_or_else(|| Arc::new(MemoryMedium::global().attach()));
    Ok(Arc::new(GossipTransport::new(name, medium, config)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use conclave_hub::HubLink;

    struct Unsupported;

    #[async_trait]
    impl HubSpawner for Unsupported {
        fn is_supported(&self) -> bool {
            false
        }

        async fn acquire(&self) -> Result<HubLink> {
            Err(ConclaveError::Transport("unsupported".into()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_selection() {
        let hub = build("h", CreateOptions {
            app_key: "facade-select".into(),
            ..CreateOptions::default()
        })
        .unwrap();
        assert_eq!(hub.kind(), TransportKind::Hub);

        let forced = build("g", CreateOptions {
            use_storage: true,
            medium: Some(Arc::new(MemoryMedium::new().attach())),
            ..CreateOptions::default()
        })
        .unwrap();
        assert_eq!(forced.kind(), TransportKind::Gossip);

        let fallback = build("f", CreateOptions {
            spawner: Some(Arc::new(Unsupported)),
            medium: Some(Arc::new(MemoryMedium::new().attach())),
            ..CreateOptions::default()
        })
        .unwrap();
        assert_eq!(fallback.kind(), TransportKind::Gossip);

        let remote = build("r", CreateOptions {
            endpoint: Some("127.0.0.1:1".into()),
            ..CreateOptions::default()
        })
        .unwrap();
        assert_eq!(remote.kind(), TransportKind::Hub);
        assert!(!remote.is_ready());
    }
}
