use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{Value, json};

use conclave::{
    CoordinationConfig, Event, EventName, GossipTransport, MemoryMedium, Transport, call_handler,
    event_handler,
};

fn join(medium: &MemoryMedium, name: &str) -> GossipTransport {
    GossipTransport::new(name, Arc::new(medium.attach()), CoordinationConfig::default()).unwrap()
}

fn record(t: &dyn Transport, name: EventName) -> Arc<Mutex<Vec<Event>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let s = Arc::clone(&seen);
    t.on(name, event_handler(move |e| s.lock().push(e.clone())));
    seen
}

#[tokio::test(start_paused = true)]
async fn three_contexts_agree_on_one_master() {
    let medium = MemoryMedium::new();
    let a = join(&medium, "a");
    a.get_master().await.unwrap();
    let b = join(&medium, "b");
    let c = join(&medium, "c");

    let master = a.current();
    assert_eq!(b.get_master().await.unwrap(), master);
    assert_eq!(c.get_master().await.unwrap(), master);
    assert!(a.is_master().await.unwrap());
    assert!(!b.is_master().await.unwrap());
    assert!(!c.is_master().await.unwrap());

    // Several heartbeat rounds later nothing has moved.
    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(b.get_master().await.unwrap(), master);
    assert_eq!(c.get_master().await.unwrap(), master);
    assert_eq!(a.get_peers().await.unwrap().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn survivors_elect_exactly_one_new_master() {
    let medium = MemoryMedium::new();
    let a = join(&medium, "a");
    a.get_master().await.unwrap();
    let b = join(&medium, "b");
    b.get_master().await.unwrap();
    let c = join(&medium, "c");
    c.get_master().await.unwrap();

    let b_updates = record(&b, EventName::MasterUpdate);
    a.destroy();
    tokio::time::sleep(Duration::from_secs(10)).await;

    let from_b = b.get_master().await.unwrap();
    let from_c = c.get_master().await.unwrap();
    assert_eq!(from_b, from_c);
    assert!(from_b == b.current() || from_b == c.current());
    assert_ne!(b.is_master().await.unwrap(), c.is_master().await.unwrap());
    assert!(
        b_updates
            .lock()
            .iter()
            .any(|e| matches!(e, Event::MasterUpdate(p) if *p == from_b))
    );

    assert_eq!(b.get_peers().await.unwrap(), vec![c.current()]);
}

#[tokio::test(start_paused = true)]
async fn sends_before_ready_arrive_in_order() {
    let medium = MemoryMedium::new();
    let a = join(&medium, "a");
    a.get_master().await.unwrap();
    let inbox = record(&a, EventName::Message);

    let b = join(&medium, "b");
    for n in 0..5 {
        b.send(json!(n), None).unwrap();
    }
    b.get_master().await.unwrap();
    tokio::time::sleep(Duration::from_millis(1)).await;

    let received: Vec<Value> = inbox
        .lock()
        .iter()
        .filter_map(|e| match e {
            Event::Message(m) => Some(m.data.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(received, (0..5).map(|n| json!(n)).collect::<Vec<_>>());
}

#[tokio::test(start_paused = true)]
async fn slow_responder_times_out_and_late_reply_is_dropped() {
    let medium = MemoryMedium::new();
    let a = join(&medium, "a");
    a.get_master().await.unwrap();
    let b = join(&medium, "b");
    b.response(
        "slow",
        call_handler(|_, _| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(json!("too late"))
        }),
    )
    .unwrap();
    b.get_master().await.unwrap();

    a.set_call_timeout(Duration::from_millis(200));
    let err = a.call(&b.current(), "slow", vec![]).await.unwrap_err();
    assert!(err.is_timeout());

    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(a.endpoint().pending_calls(), 0);
}
