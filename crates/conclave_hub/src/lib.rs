//! Conclave hub: a singleton coordinator that arbitrates mastership and
//! routes all traffic, plus the client transport that attaches to it.
//!
//! A hub runs either inside the first process that needs one
//! ([`LocalHubSpawner`]) or as the standalone `conclave-hub` executable,
//! reached over WebSocket ([`WsHubConnector`]).

pub mod client;
pub mod config;
pub mod coordinator;
pub mod protocol;
pub mod server;
pub mod spawn;
pub mod ws;

pub use client::HubTransport;
pub use config::HubConfig;
pub use coordinator::{ChannelLink, HubCoordinator};
pub use protocol::{HubEnvelope, HubLink, InitialState, PeerDeclaration};
pub use server::{AttachHandler, HubProcess, attach_handler};
pub use spawn::{HubSpawner, LocalHubSpawner, hub_cache_key};
pub use ws::{WsHubConnector, serve, serve_listener};
