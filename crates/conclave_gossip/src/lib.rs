//! Conclave gossip: leaderless coordination over a shared broadcast medium.
//!
//! Each context keeps its own peer table, elects a master through an
//! optimistic write to a shared slot, and checks that master for liveness.

pub mod election;
pub mod medium;
pub mod registry;
pub mod transport;

pub use election::Phase;
pub use medium::{Medium, MediumPort, MemoryMedium, SlotChange};
pub use registry::{PeerRecord, PeerTable};
pub use transport::{GossipPayload, GossipTransport};
