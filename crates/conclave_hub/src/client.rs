//! HubTransport: a context coordinated by a hub.
//!
//! The hub decides mastership and routes every envelope. The client only
//! translates its sends and calls into addressed [`HubEnvelope`]s and turns
//! hub broadcasts back into coordination events.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use conclave_core::{
    CallEnvelope, CallResponse, ConclaveError, CoordinationConfig, Endpoint, Envelope, Event,
    EventKind, Message, Peer, PeerId, Result, Transport, TransportKind, UNASSIGNED_ID, Wire,
};

use crate::protocol::{HubEnvelope, HubLink, InitialState, PeerDeclaration};
use crate::spawn::HubSpawner;

/// Posts onto whichever hub link is currently attached.
struct HubWire {
    outbound: Mutex<Option<mpsc::UnboundedSender<HubEnvelope>>>,
}

impl Wire for HubWire {
    fn post(&self, source: &Peer, target: &Peer, envelope: Envelope) -> Result<()> {
        let guard = self.outbound.lock();
        let Some(tx) = guard.as_ref() else {
            return Err(ConclaveError::Transport("not attached to a hub".into()));
        };
        tx.send(HubEnvelope::routed(source, target, envelope))
            .map_err(|_| ConclaveError::Transport("hub link closed".into()))
    }
}

struct ClientShared {
    endpoint: Endpoint,
    wire: Arc<HubWire>,
    spawner: Arc<dyn HubSpawner>,
    config: CoordinationConfig,
    peers: Mutex<Vec<Peer>>,
    shutdown: broadcast::Sender<()>,
}

impl ClientShared {
    async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let max = self.config.hub_attach_attempts;
        let mut attempts = 0;

        while attempts < max {
            attempts += 1;
            let acquired = tokio::select! {
                acquired = self.spawner.acquire() => acquired,
                _ = shutdown.recv() => return,
            };
            let HubLink {
                outbound,
                mut inbound,
            } = match acquired {
                Ok(link) => link,
                Err(e) => {
                    warn!("Hub acquisition failed (attempt {attempts}/{max}): {e}");
                    continue;
                }
            };
            if self.endpoint.is_destroyed() {
                return;
            }
            *self.wire.outbound.lock() = Some(outbound);

            loop {
                tokio::select! {
                    msg = inbound.recv() => match msg {
                        Some(envelope) => self.on_hub_message(envelope),
                        None => break,
                    },
                    _ = shutdown.recv() => return,
                }
            }

            self.wire.outbound.lock().take();
            if self.endpoint.is_destroyed() {
                return;
            }
            warn!("Lost hub link (attempt {attempts}/{max})");
        }
        warn!(
            "Context '{}' gave up on the hub after {max} attempts",
            self.endpoint.current().name
        );
    }

    fn on_hub_message(&self, message: HubEnvelope) {
        let HubEnvelope {
            envelope, source, ..
        } = message;

        match envelope.kind {
            EventKind::Ping => {
                if let Err(e) = self.endpoint.post(&Peer::hub(), Envelope::new(EventKind::Pong)) {
                    debug!("Failed to answer hub ping: {e}");
                }
            }
            EventKind::BecomeMaster => {
                self.endpoint.observe_master(self.endpoint.current());
            }
            EventKind::Connected => match envelope.decode::<InitialState>() {
                Ok(initial) => self.on_connected(initial),
                Err(e) => warn!("Malformed hub greeting: {e}"),
            },
            EventKind::UpdatePeers => match envelope.decode::<Vec<Peer>>() {
                Ok(peers) => {
                    *self.peers.lock() = peers.clone();
                    self.endpoint.emit(Event::PeerUpdate(peers));
                }
                Err(e) => warn!("Malformed membership update: {e}"),
            },
            EventKind::UpdateMaster => match envelope.decode::<Peer>() {
                Ok(master) => self.observe(master),
                Err(e) => warn!("Malformed master update: {e}"),
            },
            EventKind::Message => match envelope.decode::<Message>() {
                Ok(message) => self.endpoint.emit(Event::Message(message)),
                Err(e) => warn!("Malformed message: {e}"),
            },
            EventKind::Call => {
                let Some(source) = source else {
                    warn!("Call without a source dropped");
                    return;
                };
                match envelope.decode::<CallEnvelope>() {
                    Ok(call) => self.endpoint.handle_call(source, call),
                    Err(e) => warn!("Malformed call from {source}: {e}"),
                }
            }
            EventKind::CallResponse => match envelope.decode::<CallResponse>() {
                Ok(response) => self.endpoint.handle_call_response(response),
                Err(e) => warn!("Malformed call response: {e}"),
            },
            other => debug!("Ignoring {other:?} from hub"),
        }
    }

    fn on_connected(&self, initial: InitialState) {
        let InitialState { id, peers, master } = initial;
        self.endpoint.assign_id(id.clone());
        *self.peers.lock() = peers;

        let declaration = PeerDeclaration {
            name: self.endpoint.current().name,
        };
        match Envelope::with_data(EventKind::Initial, &declaration) {
            Ok(envelope) => {
                if let Err(e) = self.endpoint.post(&Peer::hub(), envelope) {
                    warn!("Failed to declare name: {e}");
                }
            }
            Err(e) => warn!("Failed to encode name declaration: {e}"),
        }

        self.observe(master);
        if self.endpoint.mark_ready() {
            info!("Context {} ready via hub", self.endpoint.current());
        } else {
            debug!("Re-attached to hub as {id}");
        }
    }

    /// The hub knows the local context by id only until its name is
    /// declared, so self-references use the local identity.
    fn observe(&self, master: Peer) {
        let master = if self.endpoint.is_self(&master.id) {
            self.endpoint.current()
        } else {
            master
        };
        self.endpoint.observe_master(master);
    }

    fn teardown(&self) {
        if self.endpoint.is_destroyed() {
            return;
        }
        if self.wire.outbound.lock().is_some() {
            if let Err(e) = self
                .endpoint
                .post(&Peer::hub(), Envelope::new(EventKind::Destroy))
            {
                debug!("Failed to announce departure: {e}");
            }
        }
        self.endpoint.destroy();
        self.wire.outbound.lock().take();
        let _ = self.shutdown.send(());
        self.peers.lock().clear();
        info!("Context {} destroyed", self.endpoint.current());
    }
}

/// Hub-mode transport.
pub struct HubTransport {
    shared: Arc<ClientShared>,
}

impl HubTransport {
    /// Start acquiring a hub through `spawner`. Must be called inside a
    /// tokio runtime.
    pub fn new(
        name: impl Into<String>,
        spawner: Arc<dyn HubSpawner>,
        config: CoordinationConfig,
    ) -> Self {
        let wire = Arc::new(HubWire {
            outbound: Mutex::new(None),
        });
        let endpoint = Endpoint::new(
            Peer::new(PeerId::Seq(UNASSIGNED_ID), name),
            Arc::clone(&wire) as Arc<dyn Wire>,
            config.call_timeout,
        );
        let (shutdown, _) = broadcast::channel(4);
        let shared = Arc::new(ClientShared {
            endpoint,
            wire,
            spawner,
            config,
            peers: Mutex::new(Vec::new()),
            shutdown,
        });
        tokio::spawn(Arc::clone(&shared).run(shared.shutdown.subscribe()));
        Self { shared }
    }

    /// Whether a hub link is currently attached.
    pub fn is_attached(&self) -> bool {
        self.shared.wire.outbound.lock().is_some()
    }
}

impl Drop for HubTransport {
    fn drop(&mut self) {
        self.shared.teardown();
    }
}

#[async_trait]
impl Transport for HubTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Hub
    }

    fn endpoint(&self) -> &Endpoint {
        &self.shared.endpoint
    }

    fn destroy(&self) {
        self.shared.teardown();
    }

    async fn get_peers(&self) -> Result<Vec<Peer>> {
        self.shared.endpoint.ensure_alive()?;
        self.shared.endpoint.wait_ready().await?;
        Ok(self.shared.peers.lock().clone())
    }
}
