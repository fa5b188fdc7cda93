//! Conclave core: identity, wire vocabulary and the shared state machine.
//!
//! Everything here is transport-agnostic: the gossip and hub transports both
//! build on [`Endpoint`] and implement [`Transport`].

pub mod bus;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod identity;
pub mod logging;
pub mod message;
pub mod transport;
pub mod util;

pub use bus::{Disposer, Event, EventBus, EventHandler, EventName, HandlerId, event_handler};
pub use config::CoordinationConfig;
pub use endpoint::{
    CallHandler, Endpoint, Lifecycle, MasterTransition, WeakEndpoint, Wire, call_handler,
};
pub use error::{ConclaveError, Result};
pub use identity::{BROADCAST_ID, HUB_ID, Peer, PeerId, UNASSIGNED_ID};
pub use message::{
    AliveStatus, CHECK_ALIVE, CallEnvelope, CallResponse, CheckAliveReply, Envelope, EventKind,
    Message, codes,
};
pub use transport::{Transport, TransportKind};
