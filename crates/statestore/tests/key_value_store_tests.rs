//! Integration tests for key-value stores

use statestore::{
    for_each_entry, CacheConfig, ChangelogSink, InMemoryChangelog, KeyValue, StateStore,
    StoreBuilder, StoreConfig, StoreError,
};
use std::ops::ControlFlow;
use std::sync::Arc;

fn keys(cursor: statestore::StoreCursor<KeyValue>) -> Vec<Vec<u8>> {
    cursor.map(|entry| entry.key).collect()
}

#[test]
fn test_in_memory_round_trip() {
    let store = StoreBuilder::new(StoreConfig::in_memory("counts"))
        .build()
        .unwrap();
    let kv = store.as_key_value().unwrap();

    kv.put(b"key1", b"value1").unwrap();
    assert_eq!(kv.get(b"key1").unwrap(), Some(b"value1".to_vec()));

    kv.put(b"key1", b"updated").unwrap();
    assert_eq!(kv.get(b"key1").unwrap(), Some(b"updated".to_vec()));

    kv.delete(b"key1").unwrap();
    assert_eq!(kv.get(b"key1").unwrap(), None);
}

#[test]
fn test_range_is_inclusive_from_exclusive_to() {
    let store = StoreBuilder::new(StoreConfig::in_memory("ranges"))
        .build()
        .unwrap();
    let kv = store.as_key_value().unwrap();
    for key in [b"a", b"b", b"c", b"d"] {
        kv.put(key, b"x").unwrap();
    }

    assert_eq!(
        keys(kv.range(b"b", b"d").unwrap()),
        vec![b"b".to_vec(), b"c".to_vec()]
    );
    assert!(keys(kv.range(b"c", b"c").unwrap()).is_empty());
    assert!(matches!(
        kv.range(b"d", b"a"),
        Err(StoreError::InvalidRange { .. })
    ));
    assert_eq!(keys(kv.all().unwrap()).len(), 4);
}

#[test]
fn test_cursor_snapshot_ignores_later_writes() {
    let store = StoreBuilder::new(StoreConfig::in_memory("snapshot"))
        .build()
        .unwrap();
    let kv = store.as_key_value().unwrap();
    kv.put(b"a", b"1").unwrap();

    let cursor = kv.all().unwrap();
    kv.put(b"b", b"2").unwrap();
    kv.delete(b"a").unwrap();

    assert_eq!(keys(cursor), vec![b"a".to_vec()]);
}

#[test]
fn test_cursor_close_tracks_open_count() {
    let store = StoreBuilder::new(StoreConfig::in_memory("cursors"))
        .build()
        .unwrap();
    let kv = store.as_key_value().unwrap();
    kv.put(b"a", b"1").unwrap();

    let mut first = kv.all().unwrap();
    let second = kv.all().unwrap();
    assert_eq!(store.open_cursors(), 2);

    first.close();
    first.close();
    assert_eq!(store.open_cursors(), 1);
    assert!(first.next().is_none());
    assert!(matches!(first.try_next(), Err(StoreError::CursorClosed)));

    drop(second);
    assert_eq!(store.open_cursors(), 0);
}

#[test]
fn test_for_each_entry_closes_on_error() {
    let store = StoreBuilder::new(StoreConfig::in_memory("visit"))
        .build()
        .unwrap();
    let kv = store.as_key_value().unwrap();
    kv.put_all([(b"a", b"1"), (b"b", b"2"), (b"c", b"3")])
        .unwrap();

    let result = for_each_entry(kv.all().unwrap(), |entry| {
        if entry.key == b"b" {
            Err(StoreError::Serialization("bad value".to_string()))
        } else {
            Ok(ControlFlow::Continue(()))
        }
    });
    assert!(result.is_err());
    assert_eq!(store.open_cursors(), 0);

    let visited = for_each_entry(kv.all().unwrap(), |_| Ok(ControlFlow::Break(()))).unwrap();
    assert_eq!(visited, 1);
    assert_eq!(store.open_cursors(), 0);
}

#[test]
fn test_closed_store() {
    let store = StoreBuilder::new(StoreConfig::in_memory("closing"))
        .build()
        .unwrap();
    let kv = store.as_key_value().unwrap();
    kv.put(b"a", b"1").unwrap();
    let mut cursor = kv.all().unwrap();

    store.close().unwrap();
    store.close().unwrap();

    assert!(!store.is_open());
    assert!(matches!(kv.get(b"a"), Err(StoreError::NotOpen { .. })));
    assert!(matches!(kv.all(), Err(StoreError::NotOpen { .. })));
    assert!(matches!(store.flush(), Err(StoreError::NotOpen { .. })));
    assert!(matches!(cursor.try_next(), Err(StoreError::NotOpen { .. })));
    assert_eq!(store.open_cursors(), 0);
}

#[test]
fn test_lru_evicts_least_recently_used() {
    let sink = Arc::new(InMemoryChangelog::new());
    let store = StoreBuilder::new(StoreConfig::lru("recent", 2).with_changelog(true))
        .with_changelog(sink.clone())
        .build()
        .unwrap();
    let kv = store.as_key_value().unwrap();

    kv.put(b"a", b"1").unwrap();
    kv.put(b"b", b"2").unwrap();
    // Refresh "a" so "b" becomes the eviction candidate
    kv.get(b"a").unwrap();
    kv.put(b"c", b"3").unwrap();

    assert_eq!(kv.get(b"a").unwrap(), Some(b"1".to_vec()));
    assert_eq!(kv.get(b"b").unwrap(), None);
    assert_eq!(kv.get(b"c").unwrap(), Some(b"3".to_vec()));
    assert_eq!(kv.approximate_count(), 2);

    let tombstones: Vec<_> = sink
        .records_for("recent")
        .into_iter()
        .filter(|r| r.is_tombstone())
        .collect();
    assert_eq!(tombstones.len(), 1);
    assert_eq!(tombstones[0].key, b"b".to_vec());
}

#[test]
fn test_lru_store_never_exceeds_capacity() {
    let cached = StoreBuilder::new(StoreConfig::lru("recent", 2).with_cache(CacheConfig::enabled(100)))
        .build();
    assert!(matches!(cached, Err(StoreError::Configuration { .. })));

    let store = StoreBuilder::new(StoreConfig::lru("recent", 2))
        .build()
        .unwrap();
    let kv = store.as_key_value().unwrap();
    for key in [b"a", b"b", b"c", b"d"] {
        kv.put(key, b"v").unwrap();
        assert!(keys(kv.all().unwrap()).len() <= 2);
    }
    assert_eq!(keys(kv.all().unwrap()), vec![b"c".to_vec(), b"d".to_vec()]);
}

#[test]
fn test_changelog_replay_rebuilds_store() {
    let sink = Arc::new(InMemoryChangelog::new());
    let source = StoreBuilder::new(StoreConfig::in_memory("users").with_changelog(true))
        .with_changelog(sink.clone())
        .build()
        .unwrap();
    let kv = source.as_key_value().unwrap();
    kv.put(b"alice", b"1").unwrap();
    kv.put(b"bob", b"2").unwrap();
    kv.put(b"alice", b"3").unwrap();
    kv.delete(b"bob").unwrap();

    // Records survive the wire format
    let records: Vec<_> = sink
        .records_for("users")
        .iter()
        .map(|r| statestore::ChangelogRecord::decode(&r.encode().unwrap()).unwrap())
        .collect();

    let replica_sink = Arc::new(InMemoryChangelog::new());
    let replica = StoreBuilder::new(StoreConfig::in_memory("users").with_changelog(true))
        .with_changelog(replica_sink.clone() as Arc<dyn ChangelogSink>)
        .build()
        .unwrap();
    let restored = replica.as_key_value().unwrap();
    assert_eq!(restored.restore(records).unwrap(), 4);

    assert_eq!(restored.get(b"alice").unwrap(), Some(b"3".to_vec()));
    assert_eq!(restored.get(b"bob").unwrap(), None);
    assert!(replica_sink.is_empty());
}

#[test]
fn test_cache_coalesces_until_flush() {
    let sink = Arc::new(InMemoryChangelog::new());
    let config = StoreConfig::in_memory("cached")
        .with_cache(CacheConfig::enabled(10))
        .with_changelog(true);
    let store = StoreBuilder::new(config)
        .with_changelog(sink.clone())
        .build()
        .unwrap();
    let kv = store.as_key_value().unwrap();

    for i in 0..5u8 {
        kv.put(b"k", &[i]).unwrap();
    }
    kv.put(b"other", b"x").unwrap();
    assert_eq!(kv.get(b"k").unwrap(), Some(vec![4]));
    assert_eq!(keys(kv.all().unwrap()), vec![b"k".to_vec(), b"other".to_vec()]);
    assert!(sink.is_empty());

    store.flush().unwrap();
    let records = sink.records_for("cached");
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].key, b"k".to_vec());
    assert_eq!(records[0].value, Some(vec![4]));

    let stats = kv.cache_stats().unwrap();
    assert_eq!(stats.coalesced_writes, 4);
    assert_eq!(stats.pending, 0);
}

#[test]
fn test_approximate_count_bounded_by_cache() {
    let config = StoreConfig::in_memory("approx").with_cache(CacheConfig::enabled(100));
    let store = StoreBuilder::new(config).build().unwrap();
    let kv = store.as_key_value().unwrap();

    kv.put(b"a", b"1").unwrap();
    store.flush().unwrap();
    kv.put(b"a", b"2").unwrap();

    // One key, counted once in the engine and once in the cache
    assert_eq!(kv.approximate_count(), 2);
    store.flush().unwrap();
    assert_eq!(kv.approximate_count(), 1);
}

#[test]
fn test_persistent_store_reopens_with_data() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store = StoreBuilder::new(StoreConfig::key_value("accounts").with_data_dir(dir.path()))
            .build()
            .unwrap();
        assert!(store.is_persistent());
        let kv = store.as_key_value().unwrap();
        kv.put(b"acct", b"42").unwrap();
        kv.put(b"acct", b"43").unwrap();
        kv.put(b"other", b"1").unwrap();
        kv.delete(b"other").unwrap();
        assert_eq!(kv.approximate_count(), 1);
        store.close().unwrap();
    }

    let store = StoreBuilder::new(StoreConfig::key_value("accounts").with_data_dir(dir.path()))
        .build()
        .unwrap();
    let kv = store.as_key_value().unwrap();
    assert_eq!(kv.get(b"acct").unwrap(), Some(b"43".to_vec()));
    assert_eq!(kv.approximate_count(), 1);
    kv.put(b"second", b"2").unwrap();
    assert_eq!(kv.approximate_count(), 2);
}
