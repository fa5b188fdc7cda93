//! HubProcess: a running hub: coordinator, heartbeat loop and attachments.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

use conclave_core::{CoordinationConfig, PeerId};

use crate::coordinator::HubCoordinator;
use crate::protocol::HubLink;

/// Observer notified with the id assigned to each new attachment.
pub type AttachHandler = Arc<dyn Fn(&PeerId) + Send + Sync>;

/// Box a closure as an [`AttachHandler`].
pub fn attach_handler<F>(f: F) -> AttachHandler
where
    F: Fn(&PeerId) + Send + Sync + 'static,
{
    Arc::new(f)
}

pub struct HubProcess {
    coordinator: Arc<HubCoordinator>,
    config: CoordinationConfig,
    observers: Mutex<Vec<AttachHandler>>,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
    shutdown: broadcast::Sender<()>,
    running: AtomicBool,
}

impl HubProcess {
    /// Start a hub on the current tokio runtime.
    pub fn start(config: CoordinationConfig) -> Arc<Self> {
        let (shutdown, _) = broadcast::channel(4);
        let hub = Arc::new(Self {
            coordinator: Arc::new(HubCoordinator::new()),
            config,
            observers: Mutex::new(Vec::new()),
            heartbeat: Mutex::new(None),
            shutdown,
            running: AtomicBool::new(true),
        });

        let handle = tokio::spawn(Self::heartbeat_loop(
            Arc::clone(&hub.coordinator),
            hub.config.hub_heartbeat,
            hub.shutdown.subscribe(),
        ));
        *hub.heartbeat.lock() = Some(handle);
        info!("Hub started");
        hub
    }

    async fn heartbeat_loop(
        coordinator: Arc<HubCoordinator>,
        interval: std::time::Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => coordinator.heartbeat(),
                _ = shutdown.recv() => {
                    debug!("Hub heartbeat loop shutting down");
                    break;
                }
            }
        }
    }

    /// Open a new private channel to this hub.
    pub fn attach(&self) -> HubLink {
        let (outbound, mut from_client) = mpsc::unbounded_channel();
        let (to_client, inbound) = mpsc::unbounded_channel();
        let link = self.coordinator.attach(to_client);
        let id = PeerId::Seq(link.id);

        let coordinator = Arc::clone(&self.coordinator);
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    msg = from_client.recv() => match msg {
                        Some(envelope) => coordinator.handle(&link, envelope),
                        None => {
                            debug!("Channel {} closed by client", link.id);
                            break;
                        }
                    },
                    _ = shutdown.recv() => break,
                }
            }
        });

        let observers = self.observers.lock().clone();
        for observer in observers {
            observer(&id);
        }
        HubLink { outbound, inbound }
    }

    pub fn on_attach(&self, handler: AttachHandler) {
        self.observers.lock().push(handler);
    }

    pub fn coordinator(&self) -> &HubCoordinator {
        &self.coordinator
    }

    pub fn config(&self) -> &CoordinationConfig {
        &self.config
    }

    /// `false` once stopped, or once the runtime it ran on is gone.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
            && self
                .heartbeat
                .lock()
                .as_ref()
                .is_some_and(|h| !h.is_finished())
    }

    /// Stop the hub. Every attached client sees its link close.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown.send(());
        self.coordinator.clear();
        info!("Hub stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conclave_core::EventKind;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_attach_greets_and_notifies_observers() {
        let hub = HubProcess::start(CoordinationConfig::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        hub.on_attach(attach_handler(move |id| s.lock().push(id.clone())));

        let mut link = hub.attach();
        let first = link.inbound.recv().await.unwrap();
        assert_eq!(first.kind(), EventKind::Connected);
        assert_eq!(*seen.lock(), vec![PeerId::Seq(1)]);
        assert!(hub.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_link_is_evicted_by_heartbeat() {
        let hub = HubProcess::start(CoordinationConfig::default());
        let _silent = hub.attach();
        assert_eq!(hub.coordinator().len(), 1);

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(hub.coordinator().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_closes_links() {
        let hub = HubProcess::start(CoordinationConfig::default());
        let mut link = hub.attach();
        let drained = Arc::new(AtomicUsize::new(0));

        hub.stop();
        assert!(!hub.is_running());
        while link.inbound.recv().await.is_some() {
            drained.fetch_add(1, Ordering::SeqCst);
        }
        assert!(drained.load(Ordering::SeqCst) >= 1);
    }
}
