//! The contract both transports implement.

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

use crate::bus::{Disposer, EventHandler, EventName, HandlerId};
use crate::endpoint::{CallHandler, Endpoint};
use crate::error::{ConclaveError, Result};
use crate::identity::Peer;

/// Which realization of the protocol backs a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Gossip,
    Hub,
}

/// A coordinated context: leader election, membership and correlated calls.
///
/// Implementors supply the [`Endpoint`], membership and teardown; everything
/// else delegates to the shared state machine.
#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    fn endpoint(&self) -> &Endpoint;

    /// Tear the context down. Terminal and idempotent.
    fn destroy(&self);

    /// Current membership, excluding the local context. Waits for readiness.
    async fn get_peers(&self) -> Result<Vec<Peer>>;

    fn name(&self) -> String {
        self.endpoint().current().name
    }

    fn current(&self) -> Peer {
        self.endpoint().current()
    }

    fn is_ready(&self) -> bool {
        self.endpoint().is_ready()
    }

    fn is_destroyed(&self) -> bool {
        self.endpoint().is_destroyed()
    }

    fn set_call_timeout(&self, timeout: Duration) {
        self.endpoint().set_call_timeout(timeout);
    }

    fn on(&self, name: EventName, handler: EventHandler) -> Disposer {
        self.endpoint().on(name, handler)
    }

    fn off(&self, name: EventName, id: HandlerId) {
        self.endpoint().off(name, id);
    }

    /// Send to `target`, or to every other context when `None`.
    fn send(&self, data: Value, target: Option<Peer>) -> Result<()> {
        self.endpoint().send(data, target)
    }

    fn response(&self, name: &str, handler: CallHandler) -> Result<()> {
        self.endpoint().response(name, handler)
    }

    async fn call(&self, target: &Peer, name: &str, args: Vec<Value>) -> Result<Value> {
        self.endpoint().call(target, name, args).await
    }

    /// The current master, once the context is ready.
    async fn get_master(&self) -> Result<Peer> {
        let endpoint = self.endpoint();
        endpoint.ensure_alive()?;
        endpoint.wait_ready().await?;
        endpoint
            .master()
            .ok_or_else(|| ConclaveError::Transport("no master elected yet".into()))
    }

    async fn is_master(&self) -> Result<bool> {
        let endpoint = self.endpoint();
        endpoint.ensure_alive()?;
        endpoint.wait_ready().await?;
        Ok(endpoint.is_master_now())
    }
}
