use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use conclave::{
    ConclaveError, CoordinationConfig, Event, EventName, HubTransport, LocalHubSpawner, Peer,
    Transport, WsHubConnector, call_handler, event_handler,
};
use conclave_hub::{HubProcess, serve_listener};

fn join(spawner: &Arc<LocalHubSpawner>, name: &str) -> HubTransport {
    HubTransport::new(name, spawner.clone(), CoordinationConfig::default())
}

fn record(t: &dyn Transport, name: EventName) -> Arc<Mutex<Vec<Event>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let s = Arc::clone(&seen);
    t.on(name, event_handler(move |e| s.lock().push(e.clone())));
    seen
}

#[tokio::test(start_paused = true)]
async fn hub_keeps_attach_order_for_mastership() {
    let spawner = Arc::new(LocalHubSpawner::new(
        "it-hub-order",
        CoordinationConfig::default(),
    ));
    let a = join(&spawner, "a");
    a.get_master().await.unwrap();
    let b = join(&spawner, "b");
    b.get_master().await.unwrap();
    let c = join(&spawner, "c");
    c.get_master().await.unwrap();

    let c_lost = record(&c, EventName::MasterLose);
    let c_updates = record(&c, EventName::MasterUpdate);

    // Survives a few heartbeat rounds.
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(a.is_master().await.unwrap());
    assert_eq!(spawner.hub().coordinator().len(), 3);

    a.destroy();
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert!(b.is_master().await.unwrap());
    assert!(!c.is_master().await.unwrap());
    assert_eq!(c.get_master().await.unwrap().id, b.current().id);
    assert!(c_lost.lock().is_empty());
    assert_eq!(c_updates.lock().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn silent_channel_is_evicted_and_mastership_moves() {
    let spawner = Arc::new(LocalHubSpawner::new(
        "it-hub-silent",
        CoordinationConfig::default(),
    ));
    // A raw attachment that never answers heartbeats takes mastership first.
    let _silent = spawner.hub().attach();
    let client = join(&spawner, "client");
    let became = record(&client, EventName::Master);

    assert!(!client.is_master().await.unwrap());
    tokio::time::sleep(Duration::from_millis(1100)).await;

    assert!(client.is_master().await.unwrap());
    assert_eq!(became.lock().len(), 1);
    assert!(client.get_peers().await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn destroyed_context_rejects_everything() {
    let spawner = Arc::new(LocalHubSpawner::new(
        "it-hub-destroy",
        CoordinationConfig::default(),
    ));
    let a = join(&spawner, "a");
    let b = join(&spawner, "b");
    b.response(
        "never",
        call_handler(|_, _| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(json!(null))
        }),
    )
    .unwrap();
    b.get_master().await.unwrap();
    let target = b.current();

    let destroyed = record(&a, EventName::Destroy);
    let pending = {
        let endpoint = a.endpoint().clone();
        tokio::spawn(async move { endpoint.call(&target, "never", vec![]).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    a.destroy();
    a.destroy();

    assert!(matches!(pending.await.unwrap(), Err(ConclaveError::Destroyed)));
    assert_eq!(destroyed.lock().len(), 1);
    assert!(matches!(a.send(json!(1), None), Err(ConclaveError::Destroyed)));
    assert!(matches!(
        a.call(&b.current(), "never", vec![]).await,
        Err(ConclaveError::Destroyed)
    ));
    assert!(matches!(a.get_peers().await, Err(ConclaveError::Destroyed)));
}

#[tokio::test]
async fn clients_share_a_hub_over_websocket() {
    let hub = HubProcess::start(CoordinationConfig::default());
    let attached = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&attached);
    hub.on_attach(conclave_hub::attach_handler(move |id| seen.lock().push(id.clone())));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let (stop, stop_rx) = broadcast::channel(1);
    tokio::spawn(serve_listener(listener, Arc::clone(&hub), stop_rx));

    let config = CoordinationConfig::default();
    let a = HubTransport::new("a", Arc::new(WsHubConnector::new(&addr)), config.clone());
    a.get_master().await.unwrap();
    let b = HubTransport::new(
        "b",
        Arc::new(WsHubConnector::new(&format!("ws://{addr}"))),
        config,
    );
    assert_eq!(b.get_master().await.unwrap().id, a.current().id);

    b.response(
        "whoami",
        call_handler(|caller: Peer, _| async move { Ok(json!(caller.name)) }),
    )
    .unwrap();
    let reply = a.call(&b.current(), "whoami", vec![]).await.unwrap();
    assert_eq!(reply, json!("a"));
    assert_eq!(attached.lock().len(), 2);

    a.destroy();
    b.destroy();
    let _ = stop.send(());
    hub.stop();
}
