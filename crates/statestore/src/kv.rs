//! Key-value stores
//!
//! One implementation serves the regular (sled), in-memory and LRU kinds;
//! they differ only in the engine underneath. Writes go to the write cache
//! when it is enabled and to the engine plus changelog otherwise.

use parking_lot::Mutex;
use std::fmt;
use std::ops::Bound;
use std::sync::Arc;
use tracing::{debug, instrument, trace};

use crate::cache::{CacheStats, WriteCache};
use crate::changelog::ChangelogRecord;
use crate::clock::Clock;
use crate::config::{StoreConfig, StoreKind};
use crate::cursor::{merge_sorted, StoreCursor};
use crate::engine::{EngineProvider, RawEntry, StorageEngine};
use crate::error::StoreResult;
use crate::lifecycle::{StateStore, StoreLifecycle};
use crate::query::check_key_range;

/// A key and its value
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyValue {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl From<RawEntry> for KeyValue {
    fn from((key, value): RawEntry) -> Self {
        Self { key, value }
    }
}

/// Ordered byte key-value store
pub struct KeyValueStore {
    lifecycle: StoreLifecycle,
    kind: StoreKind,
    engine: Arc<dyn StorageEngine>,
    provider: Option<Arc<dyn EngineProvider>>,
    cache: Option<Mutex<WriteCache>>,
    write_lock: Mutex<()>,
    clock: Arc<dyn Clock>,
}

impl KeyValueStore {
    pub(crate) fn new(
        config: &StoreConfig,
        lifecycle: StoreLifecycle,
        engine: Arc<dyn StorageEngine>,
        provider: Option<Arc<dyn EngineProvider>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let cache = config
            .cache
            .enabled
            .then(|| Mutex::new(WriteCache::new(config.cache.max_entries)));
        Self {
            lifecycle,
            kind: config.kind,
            engine,
            provider,
            cache,
            write_lock: Mutex::new(()),
            clock,
        }
    }

    pub fn kind(&self) -> StoreKind {
        self.kind
    }

    pub fn get(&self, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        self.lifecycle.ensure_open()?;
        trace!("Get from store {}: {:?}", self.lifecycle.name(), key);
        if let Some(cache) = &self.cache {
            if let Some(cached) = cache.lock().get(key) {
                return Ok(cached);
            }
        }
        self.engine.get(key)
    }

    pub fn put(&self, key: &[u8], value: &[u8]) -> StoreResult<()> {
        self.lifecycle.ensure_open()?;
        let _writer = self.write_lock.lock();
        self.write(key, Some(value))
    }

    /// Write `value` only if `key` is absent; returns the existing value otherwise
    pub fn put_if_absent(&self, key: &[u8], value: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        self.lifecycle.ensure_open()?;
        let _writer = self.write_lock.lock();
        if let Some(existing) = self.get(key)? {
            return Ok(Some(existing));
        }
        self.write(key, Some(value))?;
        Ok(None)
    }

    pub fn put_all<I, K, V>(&self, entries: I) -> StoreResult<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<[u8]>,
        V: AsRef<[u8]>,
    {
        self.lifecycle.ensure_open()?;
        let _writer = self.write_lock.lock();
        for (key, value) in entries {
            self.write(key.as_ref(), Some(value.as_ref()))?;
        }
        Ok(())
    }

    /// Remove `key`, returning its previous value
    pub fn delete(&self, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        self.lifecycle.ensure_open()?;
        let _writer = self.write_lock.lock();
        let previous = self.get(key)?;
        self.write(key, None)?;
        Ok(previous)
    }

    /// Entries with `from <= key < to`
    pub fn range(&self, from: &[u8], to: &[u8]) -> StoreResult<StoreCursor<KeyValue>> {
        check_key_range(from, to)?;
        self.scan(Bound::Included(from), Bound::Excluded(to))
    }

    pub fn all(&self) -> StoreResult<StoreCursor<KeyValue>> {
        self.scan(Bound::Unbounded, Bound::Unbounded)
    }

    /// Entries whose key starts with `prefix`
    pub fn prefix_scan(&self, prefix: &[u8]) -> StoreResult<StoreCursor<KeyValue>> {
        match prefix_upper_bound(prefix) {
            Some(upper) => self.scan(Bound::Included(prefix), Bound::Excluded(upper.as_slice())),
            None => self.scan(Bound::Included(prefix), Bound::Unbounded),
        }
    }

    /// Engine length plus pending cache entries
    pub fn approximate_count(&self) -> u64 {
        let pending = self.cache.as_ref().map_or(0, |cache| cache.lock().len());
        (self.engine.len() + pending) as u64
    }

    pub fn cache_stats(&self) -> Option<CacheStats> {
        self.cache.as_ref().map(|cache| cache.lock().stats())
    }

    /// Replay changelog records without logging them again
    pub fn restore<I>(&self, records: I) -> StoreResult<usize>
    where
        I: IntoIterator<Item = ChangelogRecord>,
    {
        self.lifecycle.ensure_open()?;
        let _writer = self.write_lock.lock();
        let mut restored = 0;
        for record in records {
            match &record.value {
                Some(value) => self.engine.put(&record.key, value)?,
                None => {
                    self.engine.delete(&record.key)?;
                }
            }
            restored += 1;
        }
        // Replay reproduces evictions already present in the changelog
        self.engine.take_evicted();
        debug!("Restored {} records into store {}", restored, self.lifecycle.name());
        Ok(restored)
    }

    fn scan(&self, from: Bound<&[u8]>, to: Bound<&[u8]>) -> StoreResult<StoreCursor<KeyValue>> {
        self.lifecycle.ensure_open()?;
        let snapshot = match &self.cache {
            Some(cache) => {
                let cache = cache.lock();
                merge_sorted(cache.range(from, to), self.engine.range(from, to)?)
            }
            None => self.engine.range(from, to)?,
        };
        trace!(
            "Opened cursor over {} entries of store {}",
            snapshot.len(),
            self.lifecycle.name()
        );
        Ok(self
            .lifecycle
            .cursor(snapshot, Box::new(|entry| Ok(Some(KeyValue::from(entry))))))
    }

    // Caller holds the write lock
    fn write(&self, key: &[u8], value: Option<&[u8]>) -> StoreResult<()> {
        let timestamp = self.clock.now_millis();
        let Some(cache) = &self.cache else {
            return self.apply(key.to_vec(), value.map(<[u8]>::to_vec), timestamp);
        };

        let mut cache = cache.lock();
        if cache.put(key.to_vec(), value.map(<[u8]>::to_vec), timestamp) {
            debug!(
                "Cache of store {} reached {} entries",
                self.lifecycle.name(),
                cache.len()
            );
            self.flush_cache(&mut cache)?;
        }
        Ok(())
    }

    fn apply(&self, key: Vec<u8>, value: Option<Vec<u8>>, timestamp: i64) -> StoreResult<()> {
        match &value {
            Some(value) => self.engine.put(&key, value)?,
            None => {
                self.engine.delete(&key)?;
            }
        }
        self.lifecycle.log(key, value, timestamp)?;

        for evicted in self.engine.take_evicted() {
            trace!("Logging eviction from store {}", self.lifecycle.name());
            self.lifecycle.log(evicted, None, timestamp)?;
        }
        Ok(())
    }

    fn flush_cache(&self, cache: &mut WriteCache) -> StoreResult<()> {
        let mut pending = cache.drain().into_iter();
        let count = pending.len();
        while let Some(write) = pending.next() {
            if let Err(e) = self.apply(write.key.clone(), write.value.clone(), write.timestamp) {
                let mut unapplied = vec![write];
                unapplied.extend(pending);
                cache.requeue(unapplied);
                return Err(e);
            }
        }
        if count > 0 {
            debug!("Flushed {} cached entries of store {}", count, self.lifecycle.name());
        }
        Ok(())
    }
}

impl StateStore for KeyValueStore {
    fn name(&self) -> &str {
        self.lifecycle.name()
    }

    fn is_open(&self) -> bool {
        self.lifecycle.is_open()
    }

    fn is_persistent(&self) -> bool {
        self.lifecycle.is_persistent()
    }

    #[instrument(skip(self), fields(store = %self.lifecycle.name()))]
    fn flush(&self) -> StoreResult<()> {
        self.lifecycle.ensure_open()?;
        let _writer = self.write_lock.lock();
        if let Some(cache) = &self.cache {
            self.flush_cache(&mut cache.lock())?;
        }
        self.engine.flush()?;
        if let Some(provider) = &self.provider {
            provider.flush()?;
        }
        Ok(())
    }

    fn close(&self) -> StoreResult<()> {
        if !self.lifecycle.is_open() {
            return Ok(());
        }
        let flushed = self.flush();
        self.lifecycle.mark_closed();
        flushed
    }

    fn open_cursors(&self) -> usize {
        self.lifecycle.open_cursors()
    }
}

impl fmt::Debug for KeyValueStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyValueStore")
            .field("lifecycle", &self.lifecycle)
            .field("kind", &self.kind)
            .field("engine", &self.engine.name())
            .field("cached", &self.cache.is_some())
            .finish()
    }
}

/// Smallest key greater than every key starting with `prefix`
fn prefix_upper_bound(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut upper = prefix.to_vec();
    while let Some(last) = upper.pop() {
        if last < u8::MAX {
            upper.push(last + 1);
            return Some(upper);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changelog::{ChangelogSink, InMemoryChangelog};
    use crate::clock::ManualClock;
    use crate::config::CacheConfig;
    use crate::engine::{LruEngine, MemoryEngine};
    use crate::error::StoreError;

    fn memory_store(config: StoreConfig, changelog: Option<Arc<InMemoryChangelog>>) -> KeyValueStore {
        let engine = Arc::new(MemoryEngine::new(config.name.clone()));
        let sink = changelog.map(|c| c as Arc<dyn ChangelogSink>);
        let lifecycle = StoreLifecycle::new(&config.name, false, sink);
        KeyValueStore::new(&config, lifecycle, engine, None, Arc::new(ManualClock::new(0)))
    }

    fn keys(cursor: StoreCursor<KeyValue>) -> Vec<Vec<u8>> {
        cursor.map(|kv| kv.key).collect()
    }

    #[test]
    fn test_prefix_upper_bound() {
        assert_eq!(prefix_upper_bound(b"ab"), Some(b"ac".to_vec()));
        assert_eq!(prefix_upper_bound(b"a\xFF"), Some(b"b".to_vec()));
        assert_eq!(prefix_upper_bound(b"\xFF\xFF"), None);
    }

    #[test]
    fn test_put_get_delete() {
        let store = memory_store(StoreConfig::in_memory("kv"), None);
        store.put(b"a", b"1").unwrap();
        assert_eq!(store.get(b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(store.delete(b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(store.get(b"a").unwrap(), None);
        assert_eq!(store.delete(b"a").unwrap(), None);
    }

    #[test]
    fn test_put_if_absent() {
        let store = memory_store(StoreConfig::in_memory("kv"), None);
        assert_eq!(store.put_if_absent(b"a", b"1").unwrap(), None);
        assert_eq!(store.put_if_absent(b"a", b"2").unwrap(), Some(b"1".to_vec()));
        assert_eq!(store.get(b"a").unwrap(), Some(b"1".to_vec()));
    }

    #[test]
    fn test_range_bounds() {
        let store = memory_store(StoreConfig::in_memory("kv"), None);
        store
            .put_all([(b"a", b"1"), (b"b", b"2"), (b"c", b"3")])
            .unwrap();

        assert_eq!(keys(store.range(b"a", b"c").unwrap()), vec![b"a".to_vec(), b"b".to_vec()]);
        assert!(keys(store.range(b"b", b"b").unwrap()).is_empty());
        assert!(matches!(
            store.range(b"c", b"a"),
            Err(StoreError::InvalidRange { .. })
        ));
    }

    #[test]
    fn test_prefix_scan() {
        let store = memory_store(StoreConfig::in_memory("kv"), None);
        store
            .put_all([
                (b"user:1".to_vec(), b"a".to_vec()),
                (b"user:2".to_vec(), b"b".to_vec()),
                (b"users".to_vec(), b"c".to_vec()),
            ])
            .unwrap();
        assert_eq!(store.prefix_scan(b"user:").unwrap().count(), 2);
    }

    #[test]
    fn test_cache_read_your_writes_and_coalescing() {
        let changelog = Arc::new(InMemoryChangelog::new());
        let config = StoreConfig::in_memory("cached").with_cache(CacheConfig::enabled(100));
        let store = memory_store(config, Some(changelog.clone()));

        store.put(b"k", b"1").unwrap();
        store.put(b"k", b"2").unwrap();
        store.put(b"k", b"3").unwrap();
        assert_eq!(store.get(b"k").unwrap(), Some(b"3".to_vec()));
        assert!(changelog.is_empty());
        assert_eq!(store.approximate_count(), 1);

        store.flush().unwrap();
        let records = changelog.records_for("cached");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].value, Some(b"3".to_vec()));
    }

    #[test]
    fn test_cache_flushes_at_capacity() {
        let changelog = Arc::new(InMemoryChangelog::new());
        let config = StoreConfig::in_memory("cached").with_cache(CacheConfig::enabled(2));
        let store = memory_store(config, Some(changelog.clone()));

        store.put(b"a", b"1").unwrap();
        assert!(changelog.is_empty());
        store.put(b"b", b"2").unwrap();
        assert_eq!(changelog.len(), 2);
        assert_eq!(store.cache_stats().unwrap().pending, 0);
    }

    #[test]
    fn test_cached_delete_hides_engine_value() {
        let config = StoreConfig::in_memory("cached").with_cache(CacheConfig::enabled(10));
        let store = memory_store(config, None);
        store.put(b"a", b"1").unwrap();
        store.flush().unwrap();

        store.delete(b"a").unwrap();
        assert_eq!(store.get(b"a").unwrap(), None);
        assert_eq!(store.all().unwrap().count(), 0);
    }

    #[test]
    fn test_lru_eviction_logged_as_tombstone() {
        let changelog = Arc::new(InMemoryChangelog::new());
        let config = StoreConfig::lru("recent", 2);
        let sink: Arc<dyn ChangelogSink> = changelog.clone();
        let lifecycle = StoreLifecycle::new("recent", false, Some(sink));
        let store = KeyValueStore::new(
            &config,
            lifecycle,
            Arc::new(LruEngine::new("recent", 2)),
            None,
            Arc::new(ManualClock::new(0)),
        );

        store.put(b"a", b"1").unwrap();
        store.put(b"b", b"2").unwrap();
        store.get(b"a").unwrap();
        store.put(b"c", b"3").unwrap();

        assert_eq!(store.get(b"b").unwrap(), None);
        let last = changelog.records_for("recent").pop().unwrap();
        assert_eq!(last.key, b"b".to_vec());
        assert!(last.is_tombstone());
    }

    #[test]
    fn test_closed_store_rejects_operations() {
        let store = memory_store(StoreConfig::in_memory("kv"), None);
        store.close().unwrap();
        store.close().unwrap();
        assert!(matches!(store.get(b"a"), Err(StoreError::NotOpen { .. })));
        assert!(matches!(store.put(b"a", b"1"), Err(StoreError::NotOpen { .. })));
    }
}
