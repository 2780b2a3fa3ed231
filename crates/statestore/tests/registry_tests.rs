//! Integration tests for the store registry, shared engines and periodic flushing

use statestore::{
    spawn_flush_task, CacheConfig, EngineProvider, InMemoryChangelog, SledEngineProvider,
    StateStore, StoreBuilder, StoreConfig, StoreError, StoreKind, StoreRegistry,
};
use std::sync::Arc;
use std::time::Duration;

#[test]
fn test_registry_lifecycle() {
    let registry = StoreRegistry::new();
    registry
        .build(StoreBuilder::new(StoreConfig::in_memory("counts")))
        .unwrap();
    registry
        .build(StoreBuilder::new(StoreConfig::lru("recent", 10)))
        .unwrap();
    registry
        .build(StoreBuilder::new(
            StoreConfig::window("clicks", Duration::from_secs(1), Duration::from_secs(60))
                .with_persistent(false),
        ))
        .unwrap();

    assert_eq!(registry.len(), 3);
    assert_eq!(registry.names(), vec!["clicks", "counts", "recent"]);
    assert_eq!(registry.get("recent").unwrap().kind(), StoreKind::KvLru);

    // Duplicate names are rejected
    let duplicate = registry.build(StoreBuilder::new(StoreConfig::in_memory("counts")));
    assert!(matches!(duplicate, Err(StoreError::Configuration { .. })));

    let counts = registry.get("counts").unwrap();
    counts.as_key_value().unwrap().put(b"a", b"1").unwrap();

    registry.close_all().unwrap();
    assert!(!counts.is_open());
    assert!(matches!(
        counts.as_key_value().unwrap().get(b"a"),
        Err(StoreError::NotOpen { .. })
    ));

    let removed = registry.remove("counts").unwrap();
    assert_eq!(removed.name(), "counts");
    assert_eq!(registry.len(), 2);
}

#[test]
fn test_config_from_json() {
    let json = r#"{
        "name": "sessions",
        "kind": "session",
        "retention-ms": 60000,
        "inactivity-gap-ms": 5000,
        "persistent": false,
        "cache": { "enabled": true, "max_entries": 64 }
    }"#;
    let config = StoreConfig::from_json(json).unwrap();
    let store = StoreBuilder::new(config).build().unwrap();
    assert!(store.as_session().is_some());
    assert!(!store.is_persistent());

    let invalid = r#"{ "name": "broken", "kind": "window", "retention-ms": 100 }"#;
    assert!(matches!(
        StoreConfig::from_json(invalid),
        Err(StoreError::Configuration { .. })
    ));
}

#[test]
fn test_stores_share_one_sled_database() {
    let dir = tempfile::tempdir().unwrap();
    let provider: Arc<dyn EngineProvider> = Arc::new(SledEngineProvider::open(dir.path()).unwrap());

    let accounts = StoreBuilder::new(StoreConfig::key_value("accounts"))
        .with_engine_provider(Arc::clone(&provider))
        .build()
        .unwrap();
    let clicks = StoreBuilder::new(StoreConfig::window(
        "clicks",
        Duration::from_millis(10),
        Duration::from_millis(1_000),
    ))
    .with_engine_provider(Arc::clone(&provider))
    .build()
    .unwrap();

    accounts.as_key_value().unwrap().put(b"a", b"1").unwrap();
    clicks.as_window().unwrap().put(b"a", b"2", 5).unwrap();

    // Window segments live in their own trees
    assert_eq!(accounts.as_key_value().unwrap().all().unwrap().count(), 1);
    assert_eq!(clicks.as_window().unwrap().all().unwrap().count(), 1);

    // A name that would read as a segment of "clicks" is refused
    let shadow = StoreBuilder::new(StoreConfig::key_value("clicks.7"))
        .with_engine_provider(Arc::clone(&provider))
        .build();
    assert!(matches!(shadow, Err(StoreError::Configuration { .. })));

    accounts.close().unwrap();
    clicks.close().unwrap();

    let reopened = StoreBuilder::new(StoreConfig::window(
        "clicks",
        Duration::from_millis(10),
        Duration::from_millis(1_000),
    ))
    .with_engine_provider(Arc::clone(&provider))
    .build()
    .unwrap();
    let ws = reopened.as_window().unwrap();
    assert_eq!(ws.stats().segments, 1);
    assert_eq!(ws.stats().stream_time, Some(5));
    assert_eq!(ws.fetch(b"a", 5).unwrap(), Some(b"2".to_vec()));
}

#[tokio::test(start_paused = true)]
async fn test_periodic_flush_reaches_changelog() {
    let sink = Arc::new(InMemoryChangelog::new());
    let registry = Arc::new(StoreRegistry::new());
    let config = StoreConfig::in_memory("buffered")
        .with_cache(CacheConfig::enabled(1_000))
        .with_changelog(true);
    let store = registry
        .build(StoreBuilder::new(config).with_changelog(sink.clone()))
        .unwrap();
    let handle = spawn_flush_task(Arc::clone(&registry), Duration::from_secs(1));

    let kv = store.as_key_value().unwrap();
    kv.put(b"a", b"1").unwrap();
    kv.put(b"a", b"2").unwrap();
    assert!(sink.is_empty());

    tokio::time::sleep(Duration::from_millis(1_500)).await;
    let records = sink.records_for("buffered");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].value, Some(b"2".to_vec()));

    handle.abort();
    registry.close_all().unwrap();
}
