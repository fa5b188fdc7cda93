//! Hub wire protocol: envelopes exchanged between a hub and its clients.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use conclave_core::{Envelope, EventKind, Peer, PeerId, Result};

/// An [`Envelope`] plus routing information.
///
/// Clients always fill both `target` and `source`; the hub's own control
/// messages carry neither.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HubEnvelope {
    #[serde(flatten)]
    pub envelope: Envelope,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<PeerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<Peer>,
}

impl HubEnvelope {
    /// A hub control message without routing fields.
    pub fn control(kind: EventKind) -> Self {
        Self {
            envelope: Envelope::new(kind),
            target: None,
            source: None,
        }
    }

    /// A hub control message carrying `data`.
    pub fn control_with<T: Serialize>(kind: EventKind, data: &T) -> Result<Self> {
        Ok(Self {
            envelope: Envelope::with_data(kind, data)?,
            target: None,
            source: None,
        })
    }

    /// A client message addressed to `target`.
    pub fn routed(source: &Peer, target: &Peer, envelope: Envelope) -> Self {
        Self {
            envelope,
            target: Some(target.id.clone()),
            source: Some(source.clone()),
        }
    }

    pub fn kind(&self) -> EventKind {
        self.envelope.kind
    }
}

/// Payload of `CONNECTED`: what a freshly attached client needs to know.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitialState {
    pub id: PeerId,
    /// Every other attached client.
    pub peers: Vec<Peer>,
    pub master: Peer,
}

/// Payload of `INITIAL`: the client's display name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerDeclaration {
    pub name: String,
}

/// A client's end of one attachment: a private, ordered, bidirectional
/// channel to a hub.
#[derive(Debug)]
pub struct HubLink {
    /// Client → hub.
    pub outbound: mpsc::UnboundedSender<HubEnvelope>,
    /// Hub → client. Yields `None` once the hub side is gone.
    pub inbound: mpsc::UnboundedReceiver<HubEnvelope>,
}
