//! Endpoint: the readiness and call state machine shared by both transports.
//!
//! An [`Endpoint`] owns everything a context needs regardless of how bytes
//! move: its identity, the event bus, the queue of sends issued before the
//! context was ready, the table of outstanding calls, and the registered
//! responders. Transports plug in through the [`Wire`] trait and feed
//! incoming calls and responses back through [`Endpoint::handle_call`] and
//! [`Endpoint::handle_call_response`].

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{oneshot, watch};
use tracing::{debug, trace, warn};

use crate::bus::{Disposer, Event, EventBus, EventHandler, EventName, HandlerId};
use crate::error::{ConclaveError, Result};
use crate::identity::{Peer, PeerId};
use crate::message::{CallEnvelope, CallResponse, Envelope, EventKind, Message, codes};

/// The transport-specific send primitive.
pub trait Wire: Send + Sync + 'static {
    /// Deliver `envelope` from `source` to `target`. Must not block, and
    /// must not call back into the endpoint: it runs under the state lock.
    fn post(&self, source: &Peer, target: &Peer, envelope: Envelope) -> Result<()>;
}

/// An async responder invoked with the caller and the call arguments.
pub type CallHandler =
    Arc<dyn Fn(Peer, Vec<Value>) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// Box a closure as a [`CallHandler`].
pub fn call_handler<F, Fut>(f: F) -> CallHandler
where
    F: Fn(Peer, Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    Arc::new(move |peer, args| f(peer, args).boxed())
}

/// Connecting → Ready → Destroyed. Never moves backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Connecting,
    Ready,
    Destroyed,
}

/// What changed when a new master pointer was observed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MasterTransition {
    pub previous: Option<Peer>,
    /// The pointer now names a different peer.
    pub changed: bool,
    /// The local context became master.
    pub gained: bool,
    /// The local context was master and no longer is.
    pub lost: bool,
}

struct PendingCall {
    name: String,
    settle: oneshot::Sender<Result<Value>>,
}

struct State {
    current: Peer,
    lifecycle: Lifecycle,
    master: Option<Peer>,
    outbox: VecDeque<(Peer, Value)>,
    calls: HashMap<u64, PendingCall>,
    responders: HashMap<String, CallHandler>,
    call_timeout: Duration,
}

struct Inner {
    wire: Arc<dyn Wire>,
    bus: Arc<EventBus>,
    state: Mutex<State>,
    /// Mirrors `State::lifecycle` so callers can await readiness.
    lifecycle: watch::Sender<Lifecycle>,
    next_call_id: AtomicU64,
}

/// Shared handle to one context's coordination state.
#[derive(Clone)]
pub struct Endpoint {
    inner: Arc<Inner>,
}

/// Non-owning handle, for responders that must not keep the endpoint alive.
#[derive(Clone)]
pub struct WeakEndpoint {
    inner: Weak<Inner>,
}

impl WeakEndpoint {
    pub fn upgrade(&self) -> Option<Endpoint> {
        self.inner.upgrade().map(|inner| Endpoint { inner })
    }
}

impl Endpoint {
    pub fn new(current: Peer, wire: Arc<dyn Wire>, call_timeout: Duration) -> Self {
        let (lifecycle, _) = watch::channel(Lifecycle::Connecting);
        Self {
            inner: Arc::new(Inner {
                wire,
                bus: Arc::new(EventBus::new()),
                state: Mutex::new(State {
                    current,
                    lifecycle: Lifecycle::Connecting,
                    master: None,
                    outbox: VecDeque::new(),
                    calls: HashMap::new(),
                    responders: HashMap::new(),
                    call_timeout,
                }),
                lifecycle,
                next_call_id: AtomicU64::new(0),
            }),
        }
    }

    pub fn downgrade(&self) -> WeakEndpoint {
        WeakEndpoint {
            inner: Arc::downgrade(&self.inner),
        }
    }

    // -----------------------------------------------------------------------
    // Identity & lifecycle
    // -----------------------------------------------------------------------

    pub fn current(&self) -> Peer {
        self.inner.state.lock().current.clone()
    }

    pub fn id(&self) -> PeerId {
        self.inner.state.lock().current.id.clone()
    }

    pub fn is_self(&self, id: &PeerId) -> bool {
        self.inner.state.lock().current.id == *id
    }

    /// Adopt the id handed out by a coordinating authority.
    pub fn assign_id(&self, id: PeerId) {
        let mut state = self.inner.state.lock();
        if state.current.id != id {
            debug!("Context '{}' assigned id {id}", state.current.name);
            state.current.id = id;
        }
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.inner.state.lock().lifecycle
    }

    pub fn is_ready(&self) -> bool {
        self.lifecycle() == Lifecycle::Ready
    }

    pub fn is_destroyed(&self) -> bool {
        self.lifecycle() == Lifecycle::Destroyed
    }

    /// Fail with [`ConclaveError::Destroyed`] once the context is gone.
    pub fn ensure_alive(&self) -> Result<()> {
        if self.is_destroyed() {
            Err(ConclaveError::Destroyed)
        } else {
            Ok(())
        }
    }

    /// Resolve once ready; fail if the context is destroyed first.
    pub async fn wait_ready(&self) -> Result<()> {
        let mut rx = self.inner.lifecycle.subscribe();
        let reached = rx
            .wait_for(|l| *l != Lifecycle::Connecting)
            .await
            .map(|l| *l)
            .map_err(|_| ConclaveError::Destroyed)?;
        match reached {
            Lifecycle::Ready => Ok(()),
            _ => Err(ConclaveError::Destroyed),
        }
    }

    /// Enter the ready state: flush queued sends in order, wake waiters,
    /// then emit `ready`. Returns `false` if the context was not connecting.
    pub fn mark_ready(&self) -> bool {
        {
            let mut state = self.inner.state.lock();
            if state.lifecycle != Lifecycle::Connecting {
                return false;
            }
            state.lifecycle = Lifecycle::Ready;
            let source = state.current.clone();
            let queued = std::mem::take(&mut state.outbox);
            if !queued.is_empty() {
                debug!("Flushing {} queued sends for '{}'", queued.len(), source.name);
            }
            for (target, data) in queued {
                if let Err(e) = self.transmit(&source, &target, data) {
                    warn!("Queued send to {target} failed: {e}");
                }
            }
        }
        self.inner.lifecycle.send_replace(Lifecycle::Ready);
        self.emit(Event::Ready);
        true
    }

    /// Terminal shutdown. Rejects every outstanding call with
    /// [`ConclaveError::Destroyed`]. Returns `false` if already destroyed.
    pub fn destroy(&self) -> bool {
        let calls = {
            let mut state = self.inner.state.lock();
            if state.lifecycle == Lifecycle::Destroyed {
                return false;
            }
            state.lifecycle = Lifecycle::Destroyed;
            state.outbox.clear();
            state.responders.clear();
            state.master = None;
            std::mem::take(&mut state.calls)
        };
        self.inner.lifecycle.send_replace(Lifecycle::Destroyed);
        for (_, pending) in calls {
            let _ = pending.settle.send(Err(ConclaveError::Destroyed));
        }
        self.emit(Event::Destroy);
        self.inner.bus.clear();
        true
    }

    // -----------------------------------------------------------------------
    // Events
    // -----------------------------------------------------------------------

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.inner.bus
    }

    /// Subscribe to `name`. `ready` and `master` replay immediately when
    /// their condition already holds.
    pub fn on(&self, name: EventName, handler: EventHandler) -> Disposer {
        let id = self.inner.bus.subscribe(name, Arc::clone(&handler));
        if name.is_level_triggered() && self.is_ready() {
            let replay = match name {
                EventName::Master => self.is_master_now().then_some(Event::Master),
                _ => Some(Event::Ready),
            };
            if let Some(event) = replay {
                handler(&event);
            }
        }
        Disposer::new(&self.inner.bus, name, id)
    }

    pub fn off(&self, name: EventName, id: HandlerId) {
        self.inner.bus.unsubscribe(name, id);
    }

    pub fn emit(&self, event: Event) {
        self.inner.bus.emit(&event);
    }

    // -----------------------------------------------------------------------
    // Master pointer
    // -----------------------------------------------------------------------

    pub fn master(&self) -> Option<Peer> {
        self.inner.state.lock().master.clone()
    }

    pub fn is_master_now(&self) -> bool {
        let state = self.inner.state.lock();
        state
            .master
            .as_ref()
            .is_some_and(|m| m.id == state.current.id)
    }

    /// Forget the master without emitting anything.
    pub fn clear_master(&self) -> Option<Peer> {
        self.inner.state.lock().master.take()
    }

    /// Replace the master pointer and emit `masterlose`, `master` and
    /// `masterupdate` as the transition requires, in that order.
    pub fn observe_master(&self, peer: Peer) -> MasterTransition {
        let transition = {
            let mut state = self.inner.state.lock();
            if state.lifecycle == Lifecycle::Destroyed {
                return MasterTransition::default();
            }
            let me = state.current.id.clone();
            let previous = state.master.replace(peer.clone());
            let was_self = previous.as_ref().is_some_and(|p| p.id == me);
            let is_self = peer.id == me;
            let changed = previous.as_ref().is_none_or(|p| p.id != peer.id);
            MasterTransition {
                previous,
                changed,
                gained: changed && is_self,
                lost: was_self && !is_self,
            }
        };

        if transition.lost {
            self.emit(Event::MasterLose);
        }
        if transition.gained {
            self.emit(Event::Master);
        }
        if transition.changed {
            self.emit(Event::MasterUpdate(peer));
        }
        transition
    }

    // -----------------------------------------------------------------------
    // Sending
    // -----------------------------------------------------------------------

    /// Post a raw envelope. Silently dropped after destruction or when
    /// addressed to the local context.
    pub fn post(&self, target: &Peer, envelope: Envelope) -> Result<()> {
        let source = {
            let state = self.inner.state.lock();
            if state.lifecycle == Lifecycle::Destroyed {
                return Ok(());
            }
            state.current.clone()
        };
        if source.id == target.id {
            debug!("Dropping {:?} addressed to self", envelope.kind);
            return Ok(());
        }
        self.inner.wire.post(&source, target, envelope)
    }

    /// Send application data to `target` (broadcast when `None`). Queued in
    /// order until the context is ready; afterwards a wire failure is
    /// returned to the caller.
    pub fn send(&self, data: Value, target: Option<Peer>) -> Result<()> {
        let target = target.unwrap_or_else(Peer::broadcast);
        let mut state = self.inner.state.lock();
        match state.lifecycle {
            Lifecycle::Destroyed => Err(ConclaveError::Destroyed),
            Lifecycle::Connecting => {
                state.outbox.push_back((target, data));
                Ok(())
            }
            Lifecycle::Ready => {
                let source = state.current.clone();
                self.transmit(&source, &target, data)
            }
        }
    }

    /// Wrap `data` as a MESSAGE and hand it to the wire. Called with the
    /// state lock held so sends leave in the order they were issued.
    fn transmit(&self, source: &Peer, target: &Peer, data: Value) -> Result<()> {
        if source.id == target.id {
            debug!("Dropping message addressed to self");
            return Ok(());
        }
        let message = Message {
            data,
            source: source.clone(),
        };
        let envelope = Envelope::with_data(EventKind::Message, &message)?;
        self.inner.wire.post(source, target, envelope)
    }

    // -----------------------------------------------------------------------
    // Calls
    // -----------------------------------------------------------------------

    pub fn call_timeout(&self) -> Duration {
        self.inner.state.lock().call_timeout
    }

    pub fn set_call_timeout(&self, timeout: Duration) {
        self.inner.state.lock().call_timeout = timeout;
    }

    /// Number of calls awaiting a response.
    pub fn pending_calls(&self) -> usize {
        self.inner.state.lock().calls.len()
    }

    /// Call `name` on `target` once ready, bounded by the default timeout.
    pub async fn call(&self, target: &Peer, name: &str, args: Vec<Value>) -> Result<Value> {
        self.ensure_alive()?;
        self.wait_ready().await?;
        let timeout = self.call_timeout();
        self.call_within(target, name, args, Some(timeout)).await
    }

    /// Call without waiting for readiness. `None` waits indefinitely.
    ///
    /// Settles at most once: whichever of response and timeout comes first
    /// wins, and a late response finds no pending entry.
    pub async fn call_within(
        &self,
        target: &Peer,
        name: &str,
        args: Vec<Value>,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        let id = self.inner.next_call_id.fetch_add(1, Ordering::Relaxed);
        let (settle, settled) = oneshot::channel();
        {
            let mut state = self.inner.state.lock();
            if state.lifecycle == Lifecycle::Destroyed {
                return Err(ConclaveError::Destroyed);
            }
            state.calls.insert(
                id,
                PendingCall {
                    name: name.to_string(),
                    settle,
                },
            );
        }

        let call = CallEnvelope {
            id,
            name: name.to_string(),
            args,
        };
        let posted = Envelope::with_data(EventKind::Call, &call)
            .and_then(|envelope| self.post(target, envelope));
        if let Err(e) = posted {
            self.inner.state.lock().calls.remove(&id);
            return Err(e);
        }

        let outcome = match timeout {
            Some(limit) => match tokio::time::timeout(limit, settled).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    self.inner.state.lock().calls.remove(&id);
                    trace!("Call {name}#{id} to {target} timed out");
                    return Err(ConclaveError::Timeout(limit));
                }
            },
            None => settled.await,
        };
        outcome.unwrap_or(Err(ConclaveError::Destroyed))
    }

    /// Register the single responder for `name`.
    pub fn response(&self, name: &str, handler: CallHandler) -> Result<()> {
        let mut state = self.inner.state.lock();
        if state.responders.contains_key(name) {
            return Err(ConclaveError::DuplicateResponder(name.to_string()));
        }
        state.responders.insert(name.to_string(), handler);
        Ok(())
    }

    /// Answer an incoming call. The responder runs on its own task; its
    /// result, its error message, or `NOT_FOUND` goes back to `source`.
    pub fn handle_call(&self, source: Peer, call: CallEnvelope) {
        let responder = {
            let state = self.inner.state.lock();
            if state.lifecycle == Lifecycle::Destroyed {
                return;
            }
            state.responders.get(&call.name).cloned()
        };

        let Some(responder) = responder else {
            debug!("No responder for {} (from {source})", call.name);
            self.reply(&source, CallResponse::failure(call.id, call.name, codes::NOT_FOUND));
            return;
        };

        let endpoint = self.clone();
        tokio::spawn(async move {
            let CallEnvelope { id, name, args } = call;
            let response = match responder(source.clone(), args).await {
                Ok(data) => CallResponse::success(id, name, data),
                Err(ConclaveError::Ignored) => {
                    trace!("Responder for {name} ignored call from {source}");
                    return;
                }
                Err(e) => CallResponse::failure(id, name, e.to_string()),
            };
            endpoint.reply(&source, response);
        });
    }

    fn reply(&self, target: &Peer, response: CallResponse) {
        let result = Envelope::with_data(EventKind::CallResponse, &response)
            .and_then(|envelope| self.post(target, envelope));
        if let Err(e) = result {
            warn!("Failed to answer {} from {target}: {e}", response.name);
        }
    }

    /// Settle the pending call matching `response.id`, if it is still pending.
    pub fn handle_call_response(&self, response: CallResponse) {
        // A declined call stays pending and runs into its deadline.
        if response.error.as_deref() == Some(codes::IGNORED) {
            trace!("Call {} ({}) was declined", response.id, response.name);
            return;
        }
        let pending = self.inner.state.lock().calls.remove(&response.id);
        let Some(pending) = pending else {
            debug!(
                "No pending call {} for id {} (already settled)",
                response.name, response.id
            );
            return;
        };

        let outcome = match response.error {
            Some(code) if code == codes::NOT_FOUND => Err(ConclaveError::NotFound(pending.name)),
            Some(message) => Err(ConclaveError::Remote(message)),
            None => Ok(response.data.unwrap_or(Value::Null)),
        };
        let _ = pending.settle.send(outcome);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
