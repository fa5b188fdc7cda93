//! Shared broadcast key-value medium.
//!
//! Every write made through one attachment is observed as a change
//! notification by every *other* attachment, never by the writer itself.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::StreamExt;
use futures::stream::BoxStream;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use conclave_core::Result;

/// A write observed on the medium. `new_value` is `None` for removals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotChange {
    pub key: String,
    pub new_value: Option<String>,
}

/// One context's attachment to a shared medium.
pub trait Medium: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;

    fn set(&self, key: &str, value: String) -> Result<()>;

    fn remove(&self, key: &str) -> Result<()>;

    /// Changes written by other attachments, in write order. Nothing is
    /// dropped however far the listener falls behind.
    fn subscribe(&self) -> BoxStream<'static, SlotChange>;
}

struct Subscriber {
    origin: u64,
    tx: mpsc::UnboundedSender<SlotChange>,
}

#[derive(Default)]
struct Slots {
    values: HashMap<String, String>,
    subscribers: Vec<Subscriber>,
}

impl Slots {
    /// Queue the change for every listener except the writer's own, and
    /// forget listeners whose stream was dropped.
    fn publish(&mut self, origin: u64, key: &str) {
        let change = SlotChange {
            key: key.to_string(),
            new_value: self.values.get(key).cloned(),
        };
        self.subscribers.retain(|sub| {
            if sub.origin == origin {
                !sub.tx.is_closed()
            } else {
                sub.tx.send(change.clone()).is_ok()
            }
        });
    }
}

struct Store {
    slots: Mutex<Slots>,
    next_origin: AtomicU64,
}

/// In-process medium shared by every context that attaches to it.
#[derive(Clone)]
pub struct MemoryMedium {
    store: Arc<Store>,
}

static GLOBAL: Lazy<MemoryMedium> = Lazy::new(MemoryMedium::new);

impl Default for MemoryMedium {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryMedium {
    pub fn new() -> Self {
        Self {
            store: Arc::new(Store {
                slots: Mutex::new(Slots::default()),
                next_origin: AtomicU64::new(1),
            }),
        }
    }

    /// The process-wide medium.
    pub fn global() -> MemoryMedium {
        GLOBAL.clone()
    }

    /// A new attachment with its own identity for self-write filtering.
    pub fn attach(&self) -> MediumPort {
        MediumPort {
            store: Arc::clone(&self.store),
            origin: self.store.next_origin.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Number of slots currently holding a value.
    pub fn len(&self) -> usize {
        self.store.slots.lock().values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// An attachment to a [`MemoryMedium`].
pub struct MediumPort {
    store: Arc<Store>,
    origin: u64,
}

impl Medium for MediumPort {
    fn get(&self, key: &str) -> Option<String> {
        self.store.slots.lock().values.get(key).cloned()
    }

    fn set(&self, key: &str, value: String) -> Result<()> {
        // Publish under the lock so notifications follow write order.
        let mut slots = self.store.slots.lock();
        slots.values.insert(key.to_string(), value);
        slots.publish(self.origin, key);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut slots = self.store.slots.lock();
        if slots.values.remove(key).is_some() {
            slots.publish(self.origin, key);
        }
        Ok(())
    }

    fn subscribe(&self) -> BoxStream<'static, SlotChange> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.store.slots.lock().subscribers.push(Subscriber {
            origin: self.origin,
            tx,
        });
        futures::stream::unfold(rx, |mut rx| async move {
            let change = rx.recv().await?;
            Some((change, rx))
        })
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_writer_does_not_observe_own_writes() {
        let medium = MemoryMedium::new();
        let a = medium.attach();
        let b = medium.attach();
        let mut a_changes = a.subscribe();
        let mut b_changes = b.subscribe();

        a.set("ns.master", "\"a\"".into()).unwrap();
        b.set("ns.master", "\"b\"".into()).unwrap();

        let seen_by_b = b_changes.next().await.unwrap();
        assert_eq!(seen_by_b.new_value.as_deref(), Some("\"a\""));
        let seen_by_a = a_changes.next().await.unwrap();
        assert_eq!(seen_by_a.new_value.as_deref(), Some("\"b\""));

        assert_eq!(a.get("ns.master").as_deref(), Some("\"b\""));
    }

    #[tokio::test]
    async fn test_every_write_is_notified_in_order() {
        let medium = MemoryMedium::new();
        let writer = medium.attach();
        let reader = medium.attach();
        let mut changes = reader.subscribe();

        for v in ["1", "1", "2"] {
            writer.set("ns.message", v.into()).unwrap();
        }
        writer.remove("ns.message").unwrap();

        let mut values = Vec::new();
        for _ in 0..4 {
            values.push(changes.next().await.unwrap().new_value);
        }
        assert_eq!(
            values,
            vec![Some("1".into()), Some("1".into()), Some("2".into()), None]
        );
        assert!(medium.is_empty());
    }

    #[tokio::test]
    async fn test_burst_larger_than_any_buffer_is_delivered_whole() {
        let medium = MemoryMedium::new();
        let writer = medium.attach();
        let reader = medium.attach();
        let mut changes = reader.subscribe();

        for n in 0..5000 {
            writer.set("ns.message", n.to_string()).unwrap();
        }

        for n in 0..5000 {
            let change = changes.next().await.unwrap();
            assert_eq!(change.new_value, Some(n.to_string()));
        }
    }

    #[test]
    fn test_dropped_listener_is_forgotten() {
        let medium = MemoryMedium::new();
        let writer = medium.attach();
        let reader = medium.attach();
        let changes = reader.subscribe();
        let _own = writer.subscribe();
        assert_eq!(medium.store.slots.lock().subscribers.len(), 2);

        drop(changes);
        writer.set("ns.master", "x".into()).unwrap();
        assert_eq!(medium.store.slots.lock().subscribers.len(), 1);
    }

    #[test]
    fn test_remove_missing_key_is_silent() {
        let medium = MemoryMedium::new();
        let port = medium.attach();
        port.remove("nothing").unwrap();
        assert_eq!(port.get("nothing"), None);
    }
}
