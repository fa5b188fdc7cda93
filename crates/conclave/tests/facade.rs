use std::sync::Arc;

use conclave::{CreateOptions, MemoryMedium, Transport, TransportKind, create};

#[tokio::test(start_paused = true)]
async fn create_hands_out_one_context_per_process() {
    let medium = MemoryMedium::new();
    let first = create("first", CreateOptions {
        use_storage: true,
        medium: Some(Arc::new(medium.attach())),
        ..CreateOptions::default()
    })
    .unwrap();
    assert_eq!(first.kind(), TransportKind::Gossip);
    first.get_master().await.unwrap();

    // Options of later calls are ignored while the instance lives.
    let again = create("second", CreateOptions {
        app_key: "facade-it".into(),
        ..CreateOptions::default()
    })
    .unwrap();
    assert!(Arc::ptr_eq(&first, &again));
    assert_eq!(again.name(), "first");

    first.destroy();
    let fresh = create("third", CreateOptions {
        app_key: "facade-it".into(),
        ..CreateOptions::default()
    })
    .unwrap();
    assert!(!Arc::ptr_eq(&first, &fresh));
    assert_eq!(fresh.kind(), TransportKind::Hub);
    assert_eq!(fresh.name(), "third");
    assert!(fresh.is_master().await.unwrap());
}
