//! Event bus: synchronous, in-order fan-out of coordination events.
//!
//! Dispatch iterates over a snapshot of the handlers taken at emit time, so
//! handlers added or removed while an event is in flight only affect later
//! emissions. Handlers are never invoked while the bus lock is held.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::identity::Peer;
use crate::message::Message;

/// The closed set of events a context can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventName {
    Ready,
    Master,
    MasterUpdate,
    MasterLose,
    PeerUpdate,
    Message,
    Destroy,
}

impl EventName {
    /// Level-triggered events replay to late subscribers when their condition holds.
    pub fn is_level_triggered(&self) -> bool {
        matches!(self, Self::Ready | Self::Master)
    }
}

/// An emitted event with its payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// The context finished connecting.
    Ready,
    /// The local context became master.
    Master,
    /// The master pointer changed.
    MasterUpdate(Peer),
    /// The local context was master and no longer is.
    MasterLose,
    /// Membership changed.
    PeerUpdate(Vec<Peer>),
    /// Application payload from another context.
    Message(Message),
    /// The context was destroyed.
    Destroy,
}

impl Event {
    pub fn name(&self) -> EventName {
        match self {
            Self::Ready => EventName::Ready,
            Self::Master => EventName::Master,
            Self::MasterUpdate(_) => EventName::MasterUpdate,
            Self::MasterLose => EventName::MasterLose,
            Self::PeerUpdate(_) => EventName::PeerUpdate,
            Self::Message(_) => EventName::Message,
            Self::Destroy => EventName::Destroy,
        }
    }
}

/// A subscriber callback.
pub type EventHandler = Arc<dyn Fn(&Event) + Send + Sync>;

/// Box a closure as an [`EventHandler`].
pub fn event_handler<F>(f: F) -> EventHandler
where
    F: Fn(&Event) + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Identifies one subscription for [`EventBus::unsubscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

#[derive(Default)]
pub struct EventBus {
    handlers: Mutex<HashMap<EventName, Vec<(HandlerId, EventHandler)>>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a handler for `name`.
    pub fn subscribe(&self, name: EventName, handler: EventHandler) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .lock()
            .entry(name)
            .or_default()
            .push((id, handler));
        id
    }

    /// Remove a handler. Returns `false` if it was not subscribed.
    pub fn unsubscribe(&self, name: EventName, id: HandlerId) -> bool {
        let mut handlers = self.handlers.lock();
        let Some(list) = handlers.get_mut(&name) else {
            return false;
        };
        let before = list.len();
        list.retain(|(hid, _)| *hid != id);
        before != list.len()
    }

    /// Deliver `event` to every handler subscribed when this call started.
    pub fn emit(&self, event: &Event) {
        let snapshot: Vec<EventHandler> = match self.handlers.lock().get(&event.name()) {
            Some(list) => list.iter().map(|(_, h)| Arc::clone(h)).collect(),
            None => return,
        };
        for handler in snapshot {
            handler(event);
        }
    }

    pub fn handler_count(&self, name: EventName) -> usize {
        self.handlers.lock().get(&name).map_or(0, Vec::len)
    }

    pub fn clear(&self) {
        self.handlers.lock().clear();
    }
}

/// Removes one subscription when [`dispose`](Disposer::dispose) is called.
#[derive(Clone)]
pub struct Disposer {
    bus: Weak<EventBus>,
    name: EventName,
    id: HandlerId,
}

impl Disposer {
    pub(crate) fn new(bus: &Arc<EventBus>, name: EventName, id: HandlerId) -> Self {
        Self {
            bus: Arc::downgrade(bus),
            name,
            id,
        }
    }

    pub fn id(&self) -> HandlerId {
        self.id
    }

    pub fn dispose(self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.name, self.id);
        }
    }
}
