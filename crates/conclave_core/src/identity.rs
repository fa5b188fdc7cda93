//! Peer identity: who a context is and how it is addressed.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Wire id of the broadcast pseudo-peer.
pub const BROADCAST_ID: &str = "*";

/// Wire id of the hub itself. Messages addressed here are never forwarded.
pub const HUB_ID: i64 = -1;

/// Placeholder id of a hub client that has not yet been assigned one.
pub const UNASSIGNED_ID: i64 = 0;

/// Identifier of a peer context.
///
/// Gossip contexts generate their own UUID; hub clients receive a sequential
/// integer from the hub.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PeerId {
    /// Hub-assigned sequential id.
    Seq(i64),
    /// Self-generated id (or the broadcast marker `"*"`).
    Named(String),
}

impl PeerId {
    /// Generate a new random peer ID (UUID v4).
    pub fn generate() -> Self {
        Self::Named(uuid::Uuid::new_v4().to_string())
    }

    /// The "all peers" target.
    pub fn broadcast() -> Self {
        Self::Named(BROADCAST_ID.to_string())
    }

    /// The hub sentinel target.
    pub fn hub() -> Self {
        Self::Seq(HUB_ID)
    }

    pub fn is_broadcast(&self) -> bool {
        matches!(self, Self::Named(s) if s == BROADCAST_ID)
    }

    pub fn is_hub(&self) -> bool {
        matches!(self, Self::Seq(HUB_ID))
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Seq(n) => write!(f, "{n}"),
            Self::Named(s) => write!(f, "{s}"),
        }
    }
}

impl From<i64> for PeerId {
    fn from(n: i64) -> Self {
        Self::Seq(n)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self::Named(s.to_string())
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        Self::Named(s)
    }
}

/// An identified participant context.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Peer {
    pub id: PeerId,
    pub name: String,
}

impl Peer {
    pub fn new(id: impl Into<PeerId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }

    /// The broadcast pseudo-peer. Never a real participant.
    pub fn broadcast() -> Self {
        Self::new(PeerId::broadcast(), "broadcast")
    }

    /// The hub pseudo-peer used as a control-message target.
    pub fn hub() -> Self {
        Self::new(PeerId::hub(), "hub")
    }

    pub fn is_broadcast(&self) -> bool {
        self.id.is_broadcast()
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_generation() {
        let a = PeerId::generate();
        let b = PeerId::generate();
        assert_ne!(a, b);
        assert!(!a.is_broadcast());
    }

    #[test]
    fn test_peer_id_wire_shape() {
        assert_eq!(serde_json::to_string(&PeerId::Seq(3)).unwrap(), "3");
        assert_eq!(serde_json::to_string(&PeerId::broadcast()).unwrap(), "\"*\"");

        let seq: PeerId = serde_json::from_str("-1").unwrap();
        assert!(seq.is_hub());
        let named: PeerId = serde_json::from_str("\"abc\"").unwrap();
        assert_eq!(named, PeerId::from("abc"));
    }

    #[test]
    fn test_broadcast_and_hub_markers() {
        assert!(Peer::broadcast().is_broadcast());
        assert!(Peer::hub().id.is_hub());
        assert!(!PeerId::Seq(1).is_hub());
    }

    #[test]
    fn test_peers_differing_by_name_are_distinct() {
        let a = Peer::new(4, "left");
        let b = Peer::new(4, "renamed");
        assert_eq!(a.id, b.id);
        assert_ne!(a, b);
        assert_eq!(format!("{a}"), "left(4)");
    }
}
