//! Hub coordinator: membership, mastership and routing for attached clients.
//!
//! The coordinator is the single source of truth in hub mode. It keeps the
//! attached channels in attach order; the master is always the first
//! surviving channel at the time the previous master went away.

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use conclave_core::{EventKind, Peer, PeerId};

use crate::protocol::{HubEnvelope, InitialState, PeerDeclaration};

/// The hub's handle on one attachment.
#[derive(Debug, Clone)]
pub struct ChannelLink {
    pub id: i64,
    tx: mpsc::UnboundedSender<HubEnvelope>,
}

impl ChannelLink {
    pub fn new(id: i64, tx: mpsc::UnboundedSender<HubEnvelope>) -> Self {
        Self { id, tx }
    }

    fn deliver(&self, envelope: HubEnvelope) {
        if self.tx.send(envelope).is_err() {
            debug!("Channel {} is closed, dropping message", self.id);
        }
    }
}

#[derive(Debug)]
struct Channel {
    link: ChannelLink,
    name: Option<String>,
    /// Set by each heartbeat round, cleared by the channel's `PONG`.
    zombie: bool,
}

impl Channel {
    fn peer(&self) -> Peer {
        Peer::new(self.link.id, self.name.clone().unwrap_or_default())
    }
}

#[derive(Debug)]
struct HubState {
    channels: Vec<Channel>,
    master: Option<i64>,
    next_id: i64,
}

impl HubState {
    fn position(&self, id: i64) -> Option<usize> {
        self.channels.iter().position(|c| c.link.id == id)
    }

    fn channel(&self, id: i64) -> Option<&Channel> {
        self.channels.iter().find(|c| c.link.id == id)
    }

    fn channel_mut(&mut self, id: i64) -> Option<&mut Channel> {
        self.channels.iter_mut().find(|c| c.link.id == id)
    }

    fn master_peer(&self) -> Option<Peer> {
        self.master.and_then(|id| self.channel(id)).map(Channel::peer)
    }

    fn peers_excluding(&self, id: i64) -> Vec<Peer> {
        self.channels
            .iter()
            .filter(|c| c.link.id != id)
            .map(Channel::peer)
            .collect()
    }

    fn broadcast(&self, envelope: &HubEnvelope, except: Option<i64>) {
        for channel in self.channels.iter().filter(|c| Some(c.link.id) != except) {
            channel.link.deliver(envelope.clone());
        }
    }

    /// Appoint the first channel as master when there is none.
    fn check_master(&mut self) {
        if self.master.is_some() {
            return;
        }
        let Some(first) = self.channels.first() else {
            return;
        };
        let master = first.peer();
        self.master = Some(first.link.id);
        info!("Channel {master} is now master");

        first.link.deliver(HubEnvelope::control(EventKind::BecomeMaster));
        match HubEnvelope::control_with(EventKind::UpdateMaster, &master) {
            Ok(update) => self.broadcast(&update, None),
            Err(e) => warn!("Failed to encode master update: {e}"),
        }
    }

    /// Send every channel (except `skip`) its view of the membership.
    fn update_peers(&self, skip: Option<i64>) {
        for channel in self.channels.iter().filter(|c| Some(c.link.id) != skip) {
            let peers = self.peers_excluding(channel.link.id);
            match HubEnvelope::control_with(EventKind::UpdatePeers, &peers) {
                Ok(update) => channel.link.deliver(update),
                Err(e) => warn!("Failed to encode membership: {e}"),
            }
        }
    }

    fn remove_channel(&mut self, id: i64) -> bool {
        let Some(idx) = self.position(id) else {
            return false;
        };
        let channel = self.channels.remove(idx);
        if self.master == Some(id) {
            self.master = None;
        }
        info!("Channel {} removed", channel.peer());
        self.update_peers(None);
        self.check_master();
        true
    }

    fn route(&self, sender: i64, mut envelope: HubEnvelope) {
        if envelope.source.is_none() {
            envelope.source = self.channel(sender).map(Channel::peer);
        }
        match envelope.target.clone() {
            None => self.broadcast(&envelope, Some(sender)),
            Some(target) if target.is_broadcast() => self.broadcast(&envelope, Some(sender)),
            Some(target) if target.is_hub() => {
                debug!("{:?} addressed to the hub, not forwarding", envelope.kind());
            }
            Some(PeerId::Seq(id)) if id == sender => {
                debug!("Channel {id} addressed itself, dropping");
            }
            Some(PeerId::Seq(id)) => match self.channel(id) {
                Some(channel) => channel.link.deliver(envelope),
                None => debug!("No channel {id}, dropping {:?}", envelope.kind()),
            },
            Some(PeerId::Named(other)) => {
                debug!("Unknown target {other}, dropping {:?}", envelope.kind());
            }
        }
    }
}

/// Hub state plus the operations that mutate it.
#[derive(Debug)]
pub struct HubCoordinator {
    state: Mutex<HubState>,
}

impl Default for HubCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl HubCoordinator {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HubState {
                channels: Vec::new(),
                master: None,
                next_id: 1,
            }),
        }
    }

    /// Register a new channel, greet it with `CONNECTED`, and tell everyone
    /// else about it.
    pub fn attach(&self, tx: mpsc::UnboundedSender<HubEnvelope>) -> ChannelLink {
        let mut state = self.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        let link = ChannelLink::new(id, tx);

        let initial = InitialState {
            id: PeerId::Seq(id),
            peers: state.peers_excluding(id),
            master: state.master_peer().unwrap_or_else(|| Peer::new(id, "")),
        };
        state.channels.push(Channel {
            link: link.clone(),
            name: None,
            zombie: false,
        });
        debug!("Channel {id} attached");

        match HubEnvelope::control_with(EventKind::Connected, &initial) {
            Ok(connected) => link.deliver(connected),
            Err(e) => warn!("Failed to encode initial state: {e}"),
        }
        state.check_master();
        state.update_peers(Some(id));
        link
    }

    /// Process one envelope sent by `link`.
    pub fn handle(&self, link: &ChannelLink, envelope: HubEnvelope) {
        let mut state = self.state.lock();
        let id = link.id;

        if state.position(id).is_none() && envelope.kind() != EventKind::Destroy {
            // The hub lost this channel but the client kept it.
            info!("Re-registering channel {id}");
            let name = envelope
                .source
                .as_ref()
                .map(|p| p.name.clone())
                .filter(|n| !n.is_empty());
            state.channels.push(Channel {
                link: link.clone(),
                name,
                zombie: false,
            });
            state.check_master();
            state.update_peers(None);
            match state
                .master_peer()
                .map(|m| HubEnvelope::control_with(EventKind::UpdateMaster, &m))
            {
                Some(Ok(update)) => link.deliver(update),
                Some(Err(e)) => warn!("Failed to encode master update: {e}"),
                None => {}
            }
        }

        let kind = envelope.kind();
        if !kind.is_hub_control() {
            state.route(id, envelope);
            return;
        }
        match kind {
            EventKind::Pong => {
                if let Some(channel) = state.channel_mut(id) {
                    channel.zombie = false;
                }
            }
            EventKind::Destroy => {
                state.remove_channel(id);
            }
            EventKind::Initial => match envelope.envelope.decode::<PeerDeclaration>() {
                Ok(declaration) => {
                    if let Some(channel) = state.channel_mut(id) {
                        debug!("Channel {id} declared name '{}'", declaration.name);
                        channel.name = Some(declaration.name);
                    }
                    state.update_peers(Some(id));
                }
                Err(e) => warn!("Malformed INITIAL from channel {id}: {e}"),
            },
            other => debug!("Unhandled control kind {other:?} from channel {id}"),
        }
    }

    /// One presence round: evict channels that missed the previous ping,
    /// ping the rest.
    pub fn heartbeat(&self) {
        let mut state = self.state.lock();
        let mut idx = state.channels.len();
        while idx > 0 {
            idx -= 1;
            if state.channels[idx].zombie {
                let id = state.channels[idx].link.id;
                info!("Channel {id} missed a heartbeat, evicting");
                state.remove_channel(id);
            } else {
                state.channels[idx].zombie = true;
                state.channels[idx]
                    .link
                    .deliver(HubEnvelope::control(EventKind::Ping));
            }
        }
    }

    /// Forget a channel without waiting for heartbeats.
    pub fn detach(&self, id: i64) -> bool {
        self.state.lock().remove_channel(id)
    }

    /// Drop every channel. Clients observe their links closing.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.channels.clear();
        state.master = None;
    }

    pub fn peers(&self) -> Vec<Peer> {
        self.state.lock().channels.iter().map(Channel::peer).collect()
    }

    pub fn master(&self) -> Option<Peer> {
        self.state.lock().master_peer()
    }

    pub fn len(&self) -> usize {
        self.state.lock().channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
