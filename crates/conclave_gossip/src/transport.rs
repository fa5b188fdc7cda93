//! GossipTransport: coordination over a shared broadcast medium.
//!
//! Two slots carry all traffic: `<ns>.master` holds the current master
//! [`Peer`], `<ns>.message` carries addressed envelopes. Every context
//! listens to both, answers presence pings, and keeps its own peer table.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, broadcast, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use conclave_core::{
    AliveStatus, CHECK_ALIVE, CallEnvelope, CallResponse, CheckAliveReply, ConclaveError,
    CoordinationConfig, Endpoint, Envelope, Event, EventKind, Message, Peer, PeerId, Result,
    Transport, TransportKind, Wire, call_handler,
};

use crate::election::Phase;
use crate::medium::{Medium, SlotChange};
use crate::registry::PeerTable;

pub const MASTER_SLOT: &str = "master";
pub const MESSAGE_SLOT: &str = "message";

/// What the `message` slot holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GossipPayload {
    pub target: PeerId,
    pub source: Peer,
    pub data: Envelope,
}

/// A medium slot this transport understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Master,
    Message,
}

fn slot_key(namespace: &str, slot: &str) -> String {
    format!("{namespace}.{slot}")
}

/// Map a medium key to a slot. Foreign namespaces and nested keys yield `None`.
fn parse_slot(namespace: &str, key: &str) -> Option<std::result::Result<Slot, String>> {
    let rest = key.strip_prefix(namespace)?.strip_prefix('.')?;
    if rest.contains('.') {
        return None;
    }
    Some(match rest {
        MASTER_SLOT => Ok(Slot::Master),
        MESSAGE_SLOT => Ok(Slot::Message),
        other => Err(other.to_string()),
    })
}

struct GossipWire {
    medium: Arc<dyn Medium>,
    message_key: String,
}

impl Wire for GossipWire {
    fn post(&self, source: &Peer, target: &Peer, envelope: Envelope) -> Result<()> {
        let payload = GossipPayload {
            target: target.id.clone(),
            source: source.clone(),
            data: envelope,
        };
        self.medium
            .set(&self.message_key, serde_json::to_string(&payload)?)
    }
}

/// State shared between the transport handle and its background tasks.
pub(crate) struct Shared {
    pub(crate) endpoint: Endpoint,
    pub(crate) medium: Arc<dyn Medium>,
    pub(crate) config: CoordinationConfig,
    master_key: String,
    peers: Mutex<PeerTable>,
    /// Resolves an in-flight claim early when a master write is observed.
    pub(crate) pending_claim: Mutex<Option<oneshot::Sender<()>>>,
    /// Wakes the liveness loop when this context stops being master.
    pub(crate) role_changed: Notify,
    pub(crate) phase: Mutex<Phase>,
    shutdown: broadcast::Sender<()>,
}

impl Shared {
    pub(crate) fn new(
        name: String,
        medium: Arc<dyn Medium>,
        config: CoordinationConfig,
    ) -> Result<Arc<Self>> {
        let wire = Arc::new(GossipWire {
            medium: Arc::clone(&medium),
            message_key: slot_key(&config.namespace, MESSAGE_SLOT),
        });
        let endpoint = Endpoint::new(
            Peer::new(PeerId::generate(), name),
            wire,
            config.call_timeout,
        );
        register_check_alive(&endpoint)?;

        let (shutdown, _) = broadcast::channel(4);
        Ok(Arc::new(Self {
            master_key: slot_key(&config.namespace, MASTER_SLOT),
            endpoint,
            medium,
            config,
            peers: Mutex::new(PeerTable::new()),
            pending_claim: Mutex::new(None),
            role_changed: Notify::new(),
            phase: Mutex::new(Phase::Idle),
            shutdown,
        }))
    }

    /// Start observing the medium. Subscribes before returning so no write
    /// made afterwards is missed.
    pub(crate) fn start_listener(self: &Arc<Self>) {
        let changes = self.medium.subscribe();
        let shutdown = self.shutdown.subscribe();
        tokio::spawn(Arc::clone(self).listen(changes, shutdown));
    }

    fn start_driver(self: &Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = shared.connect() => {}
                _ = shutdown.recv() => {
                    debug!("Gossip driver shutting down");
                }
            }
        });
    }

    async fn connect(self: &Arc<Self>) {
        self.elect(false).await;
        if self.endpoint.is_destroyed() {
            return;
        }

        tokio::spawn(Arc::clone(self).membership_loop(self.shutdown.subscribe()));
        self.endpoint.mark_ready();
        info!(
            "Context {} ready (master: {})",
            self.endpoint.current(),
            self.endpoint
                .master()
                .map_or_else(|| "none".to_string(), |m| m.to_string())
        );

        self.watch_master().await;
    }

    // -----------------------------------------------------------------------
    // Medium
    // -----------------------------------------------------------------------

    pub(crate) fn read_master_slot(&self) -> Option<Peer> {
        let raw = self.medium.get(&self.master_key)?;
        match serde_json::from_str(&raw) {
            Ok(peer) => Some(peer),
            Err(e) => {
                warn!("Ignoring malformed master slot: {e}");
                None
            }
        }
    }

    pub(crate) fn write_master_slot(&self, peer: &Peer) -> Result<()> {
        self.medium
            .set(&self.master_key, serde_json::to_string(peer)?)
    }

    async fn listen(
        self: Arc<Self>,
        mut changes: BoxStream<'static, SlotChange>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                change = changes.next() => match change {
                    Some(change) => self.on_slot_change(change),
                    None => {
                        debug!("Medium closed");
                        break;
                    }
                },
                _ = shutdown.recv() => {
                    debug!("Medium listener shutting down");
                    break;
                }
            }
        }
    }

    fn on_slot_change(&self, change: SlotChange) {
        let Some(slot) = parse_slot(&self.config.namespace, &change.key) else {
            return;
        };
        let Some(raw) = change.new_value else {
            return;
        };

        match slot {
            Ok(Slot::Master) => match serde_json::from_str::<Peer>(&raw) {
                Ok(peer) => {
                    // Notifications trail the slot; its current value is the
                    // last write and wins.
                    let latest = self.read_master_slot().unwrap_or(peer);
                    debug!("Observed master write, slot names {latest}");
                    self.update_master(latest);
                }
                Err(e) => warn!("Malformed master write ignored: {e}"),
            },
            Ok(Slot::Message) => match serde_json::from_str::<GossipPayload>(&raw) {
                Ok(payload) => self.handle_message(payload),
                Err(e) => warn!("Malformed message ignored: {e}"),
            },
            Err(unknown) => warn!("Unknown slot: {unknown}"),
        }
    }

    fn handle_message(&self, payload: GossipPayload) {
        let GossipPayload {
            target,
            source,
            data,
        } = payload;
        if !target.is_broadcast() && !self.endpoint.is_self(&target) {
            return;
        }
        if self.endpoint.is_self(&source.id) {
            return;
        }

        match data.kind {
            EventKind::Ping => {
                self.touch(&source);
                if let Err(e) = self.endpoint.post(&source, Envelope::new(EventKind::Pong)) {
                    warn!("Failed to answer presence ping from {source}: {e}");
                }
            }
            EventKind::Pong => self.touch(&source),
            EventKind::Destroy => {
                debug!("Peer {source} departed");
                self.remove_peer(&source.id);
            }
            EventKind::Call => match data.decode::<CallEnvelope>() {
                Ok(call) => self.endpoint.handle_call(source, call),
                Err(e) => warn!("Malformed call from {source}: {e}"),
            },
            EventKind::CallResponse => match data.decode::<CallResponse>() {
                Ok(response) => self.endpoint.handle_call_response(response),
                Err(e) => warn!("Malformed call response from {source}: {e}"),
            },
            EventKind::Message => match data.decode::<Message>() {
                Ok(message) => self.endpoint.emit(Event::Message(message)),
                Err(e) => warn!("Malformed message from {source}: {e}"),
            },
            other => warn!("Unexpected {other:?} from {source}"),
        }
    }

    // -----------------------------------------------------------------------
    // Membership
    // -----------------------------------------------------------------------

    pub(crate) fn touch(&self, peer: &Peer) {
        let dirty = self.peers.lock().touch(peer, Instant::now());
        if dirty {
            self.emit_peer_update();
        }
    }

    fn remove_peer(&self, id: &PeerId) {
        let removed = self.peers.lock().remove(id);
        if removed {
            self.emit_peer_update();
        }
    }

    fn evict_zombies(&self) {
        let evicted = self
            .peers
            .lock()
            .evict_stale(Instant::now(), self.config.zombie_threshold);
        if !evicted.is_empty() {
            for peer in &evicted {
                debug!("Evicting silent peer {peer}");
            }
            self.emit_peer_update();
        }
    }

    pub(crate) fn peers(&self) -> Vec<Peer> {
        self.peers.lock().peers()
    }

    fn emit_peer_update(&self) {
        let peers = self.peers();
        self.endpoint.emit(Event::PeerUpdate(peers));
    }

    async fn membership_loop(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.config.peer_heartbeat);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.endpoint.is_destroyed() {
                        break;
                    }
                    if let Err(e) = self.endpoint.post(&Peer::broadcast(), Envelope::new(EventKind::Ping)) {
                        warn!("Presence ping failed: {e}");
                    }
                    self.evict_zombies();
                }
                _ = shutdown.recv() => {
                    debug!("Membership loop shutting down");
                    break;
                }
            }
        }
    }

    fn teardown(&self) {
        if self.endpoint.is_destroyed() {
            return;
        }
        if self.endpoint.is_ready() {
            if let Err(e) = self
                .endpoint
                .post(&Peer::broadcast(), Envelope::new(EventKind::Destroy))
            {
                warn!("Failed to announce departure: {e}");
            }
        }
        self.pending_claim.lock().take();
        self.endpoint.destroy();
        let _ = self.shutdown.send(());
        self.peers.lock().clear();
        *self.phase.lock() = Phase::Idle;
        info!("Context {} destroyed", self.endpoint.current());
    }
}

/// Answers liveness checks: `ok` when master, `correction` when another
/// master is known, no reply at all when no master is known.
fn register_check_alive(endpoint: &Endpoint) -> Result<()> {
    let weak = endpoint.downgrade();
    endpoint.response(
        CHECK_ALIVE,
        call_handler(move |caller, _args| {
            let weak = weak.clone();
            async move {
                let endpoint = weak.upgrade().ok_or(ConclaveError::Ignored)?;
                let status = match endpoint.master() {
                    Some(master) if endpoint.is_self(&master.id) => AliveStatus::Ok,
                    Some(master) => {
                        debug!("Correcting {caller}: master is {master}");
                        AliveStatus::Correction
                    }
                    None => return Err(ConclaveError::Ignored),
                };
                Ok(serde_json::to_value(CheckAliveReply { status })?)
            }
        }),
    )
}

/// Peer-gossip transport over a shared [`Medium`].
pub struct GossipTransport {
    shared: Arc<Shared>,
}

impl GossipTransport {
    /// Attach to `medium` and start connecting. Must be called inside a
    /// tokio runtime.
    pub fn new(
        name: impl Into<String>,
        medium: Arc<dyn Medium>,
        config: CoordinationConfig,
    ) -> Result<Self> {
        let shared = Shared::new(name.into(), medium, config)?;
        shared.start_listener();
        shared.start_driver();
        Ok(Self { shared })
    }

    /// Where the election state machine currently is.
    pub fn phase(&self) -> Phase {
        *self.shared.phase.lock()
    }
}

impl Drop for GossipTransport {
    fn drop(&mut self) {
        self.shared.teardown();
    }
}

#[async_trait]
impl Transport for GossipTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Gossip
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
        Ok(self.shared.peers())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::medium::MemoryMedium;
    use conclave_core::{EventName, event_handler};
    use serde_json::json;
    use std::time::Duration;

    fn spawn(medium: &MemoryMedium, name: &str) -> GossipTransport {
        GossipTransport::new(name, Arc::new(medium.attach()), CoordinationConfig::default())
            .unwrap()
    }

    fn record(t: &GossipTransport, name: EventName) -> Arc<Mutex<Vec<Event>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        t.on(name, event_handler(move |e| s.lock().push(e.clone())));
        seen
    }

    #[test]
    fn test_parse_slot() {
        assert_eq!(parse_slot("_NS_", "_NS_.master"), Some(Ok(Slot::Master)));
        assert_eq!(parse_slot("_NS_", "_NS_.message"), Some(Ok(Slot::Message)));
        assert_eq!(parse_slot("_NS_", "_NS_.other"), Some(Err("other".into())));
        assert_eq!(parse_slot("_NS_", "_FOREIGN_.master"), None);
        assert_eq!(parse_slot("_NS_", "_NS_master"), None);
        assert_eq!(parse_slot("_NS_", "_NS_.a.b"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lone_context_becomes_master_after_settle_window() {
        let medium = MemoryMedium::new();
        let start = Instant::now();
        let solo = spawn(&medium, "solo");

        let master = solo.get_master().await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(100));
        assert_eq!(master, solo.current());
        assert!(solo.is_master().await.unwrap());
        assert_eq!(solo.phase(), Phase::Leader);
    }

    #[tokio::test(start_paused = true)]
    async fn test_joiner_follows_live_master() {
        let medium = MemoryMedium::new();
        let first = spawn(&medium, "first");
        first.get_master().await.unwrap();

        let second = spawn(&medium, "second");
        let updates = record(&second, EventName::MasterUpdate);
        let became = record(&second, EventName::Master);

        assert_eq!(second.get_master().await.unwrap(), first.current());
        assert!(!second.is_master().await.unwrap());
        assert_eq!(second.phase(), Phase::Follower);
        assert_eq!(*updates.lock(), vec![Event::MasterUpdate(first.current())]);
        assert!(became.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_presence_pings_build_membership() {
        let medium = MemoryMedium::new();
        let a = spawn(&medium, "a");
        a.get_master().await.unwrap();
        let b = spawn(&medium, "b");
        b.get_master().await.unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(a.get_peers().await.unwrap(), vec![b.current()]);
        assert_eq!(b.get_peers().await.unwrap(), vec![a.current()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_departure_removes_peer_immediately() {
        let medium = MemoryMedium::new();
        let a = spawn(&medium, "a");
        a.get_master().await.unwrap();
        let b = spawn(&medium, "b");
        b.get_master().await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let updates = record(&a, EventName::PeerUpdate);
        b.destroy();
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert!(a.get_peers().await.unwrap().is_empty());
        assert_eq!(*updates.lock(), vec![Event::PeerUpdate(vec![])]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_peer_is_evicted_after_threshold() {
        let medium = MemoryMedium::new();
        let a = spawn(&medium, "a");
        a.get_master().await.unwrap();

        let ghost = Peer::new("ghost", "ghost");
        a.shared.touch(&ghost);
        assert_eq!(a.get_peers().await.unwrap(), vec![ghost.clone()]);
        let updates = record(&a, EventName::PeerUpdate);

        tokio::time::sleep(Duration::from_millis(3900)).await;
        assert_eq!(a.get_peers().await.unwrap(), vec![ghost]);

        tokio::time::sleep(Duration::from_millis(2600)).await;
        assert!(a.get_peers().await.unwrap().is_empty());
        assert_eq!(*updates.lock(), vec![Event::PeerUpdate(vec![])]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_messages_are_addressed_and_never_echoed() {
        let medium = MemoryMedium::new();
        let a = spawn(&medium, "a");
        a.get_master().await.unwrap();
        let b = spawn(&medium, "b");
        b.get_master().await.unwrap();
        let c = spawn(&medium, "c");
        c.get_master().await.unwrap();

        let at_a = record(&a, EventName::Message);
        let at_b = record(&b, EventName::Message);
        let at_c = record(&c, EventName::Message);

        a.send(json!("everyone"), None).unwrap();
        a.send(json!("just b"), Some(b.current())).unwrap();
        a.send(json!("me"), Some(a.current())).unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;

        let data = |seen: &Arc<Mutex<Vec<Event>>>| -> Vec<serde_json::Value> {
            seen.lock()
                .iter()
                .filter_map(|e| match e {
                    Event::Message(m) => Some(m.data.clone()),
                    _ => None,
                })
                .collect()
        };
        assert!(at_a.lock().is_empty());
        assert_eq!(data(&at_b), vec![json!("everyone"), json!("just b")]);
        assert_eq!(data(&at_c), vec![json!("everyone")]);
        match &at_b.lock()[0] {
            Event::Message(m) => assert_eq!(m.source, a.current()),
            other => panic!("Unexpected event {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_calls_round_trip_between_contexts() {
        let medium = MemoryMedium::new();
        let a = spawn(&medium, "a");
        a.get_master().await.unwrap();
        let b = spawn(&medium, "b");
        b.response(
            "greet",
            call_handler(|peer, args| async move {
                let who = args.first().and_then(|v| v.as_str()).unwrap_or("?").to_string();
                Ok(json!(format!("hello {who} from {}", peer.name)))
            }),
        )
        .unwrap();
        b.get_master().await.unwrap();

        let reply = a.call(&b.current(), "greet", vec![json!("bob")]).await.unwrap();
        assert_eq!(reply, json!("hello bob from a"));

        match a.call(&b.current(), "missing", vec![]).await {
            Err(ConclaveError::NotFound(name)) => assert_eq!(name, "missing"),
            other => panic!("Expected NotFound, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_alive_corrects_stale_caller() {
        let medium = MemoryMedium::new();
        let leader = spawn(&medium, "leader");
        leader.get_master().await.unwrap();
        let follower = spawn(&medium, "follower");
        follower.get_master().await.unwrap();

        // The follower knows of a different master, so it corrects.
        let reply = leader
            .shared
            .endpoint
            .call_within(&follower.current(), CHECK_ALIVE, vec![], Some(Duration::from_millis(500)))
            .await
            .unwrap();
        assert_eq!(reply, json!({"status": "correction"}));

        let reply = follower
            .call(&leader.current(), CHECK_ALIVE, vec![])
            .await
            .unwrap();
        assert_eq!(reply, json!({"status": "ok"}));
    }

    #[tokio::test(start_paused = true)]
    async fn test_garbage_and_removed_slots_change_nothing() {
        let medium = MemoryMedium::new();
        let a = spawn(&medium, "a");
        a.get_master().await.unwrap();
        let b = spawn(&medium, "b");
        b.get_master().await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let watched = [
            EventName::MasterUpdate,
            EventName::Master,
            EventName::MasterLose,
            EventName::PeerUpdate,
            EventName::Message,
        ];
        let seen: Vec<_> = [&a, &b]
            .into_iter()
            .flat_map(|t| watched.iter().map(move |&name| record(t, name)))
            .collect();
        // `master` replays to late subscribers on the leader.
        for events in &seen {
            events.lock().clear();
        }

        let outsider = medium.attach();
        let namespace = &a.shared.config.namespace;
        let master_key = slot_key(namespace, MASTER_SLOT);
        outsider.set(&master_key, "{not json".into()).unwrap();
        outsider
            .set(&slot_key(namespace, MESSAGE_SLOT), "{not json".into())
            .unwrap();
        outsider.remove(&master_key).unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert_eq!(a.shared.endpoint.master(), Some(a.current()));
        assert_eq!(b.shared.endpoint.master(), Some(a.current()));
        assert_eq!(a.get_peers().await.unwrap(), vec![b.current()]);
        assert_eq!(b.get_peers().await.unwrap(), vec![a.current()]);
        for events in &seen {
            assert!(events.lock().is_empty(), "unexpected events: {:?}", events.lock());
        }
    }
}
