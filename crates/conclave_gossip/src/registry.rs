//! Peer table: the local, gossip-replicated view of who is alive.

use std::time::Duration;

use tokio::time::Instant;

use conclave_core::{Peer, PeerId};

/// A known peer and the last time it gave a liveness signal.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub peer: Peer,
    pub last_seen: Instant,
}

/// Membership as observed by one context, in first-seen order.
#[derive(Debug, Default)]
pub struct PeerTable {
    records: Vec<PeerRecord>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or refresh `peer`. Returns `true` when membership changed
    /// content-wise (new peer, or a known id with a different name).
    pub fn touch(&mut self, peer: &Peer, now: Instant) -> bool {
        match self.records.iter_mut().find(|r| r.peer.id == peer.id) {
            Some(record) => {
                let dirty = record.peer != *peer;
                record.peer = peer.clone();
                record.last_seen = now;
                dirty
            }
            None => {
                self.records.push(PeerRecord {
                    peer: peer.clone(),
                    last_seen: now,
                });
                true
            }
        }
    }

    /// Remove a peer by ID.
    pub fn remove(&mut self, id: &PeerId) -> bool {
        let before = self.records.len();
        self.records.retain(|r| r.peer.id != *id);
        before != self.records.len()
    }

    /// Drop every record silent for longer than `threshold`.
    pub fn evict_stale(&mut self, now: Instant, threshold: Duration) -> Vec<Peer> {
        let mut evicted = Vec::new();
        self.records.retain(|r| {
            let stale = now.saturating_duration_since(r.last_seen) > threshold;
            if stale {
                evicted.push(r.peer.clone());
            }
            !stale
        });
        evicted
    }

    pub fn peers(&self) -> Vec<Peer> {
        self.records.iter().map(|r| r.peer.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }
}
