//! In-memory storage engine
//!
//! An ordered `BTreeMap` behind a `parking_lot` read-write lock. Range scans
//! clone the matching entries while holding the read lock, so cursors built
//! on top never block the writer for longer than the copy.

use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

use super::{is_empty_range, EngineProvider, RawEntry, StorageEngine};
use crate::error::StoreResult;

/// Operation counters of a memory engine
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryEngineStats {
    /// Number of get operations
    pub get_count: u64,
    /// Number of put operations
    pub put_count: u64,
    /// Number of delete operations
    pub delete_count: u64,
    /// Number of gets that found a value
    pub hit_count: u64,
    /// Number of gets that found nothing
    pub miss_count: u64,
}

#[derive(Debug, Default)]
struct StatsCollector {
    get_count: AtomicU64,
    put_count: AtomicU64,
    delete_count: AtomicU64,
    hit_count: AtomicU64,
    miss_count: AtomicU64,
}

impl StatsCollector {
    fn snapshot(&self) -> MemoryEngineStats {
        MemoryEngineStats {
            get_count: self.get_count.load(Ordering::Relaxed),
            put_count: self.put_count.load(Ordering::Relaxed),
            delete_count: self.delete_count.load(Ordering::Relaxed),
            hit_count: self.hit_count.load(Ordering::Relaxed),
            miss_count: self.miss_count.load(Ordering::Relaxed),
        }
    }
}

/// Volatile ordered engine
#[derive(Debug)]
pub struct MemoryEngine {
    name: String,
    data: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
    stats: StatsCollector,
}

impl MemoryEngine {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data: RwLock::new(BTreeMap::new()),
            stats: StatsCollector::default(),
        }
    }

    /// Snapshot of the operation counters
    pub fn stats(&self) -> MemoryEngineStats {
        self.stats.snapshot()
    }

    /// Approximate memory usage of keys and values in bytes
    pub fn memory_usage(&self) -> usize {
        self.data
            .read()
            .iter()
            .map(|(k, v)| k.len() + v.len())
            .sum()
    }
}

impl StorageEngine for MemoryEngine {
    fn name(&self) -> &str {
        &self.name
    }

    fn get(&self, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        trace!("Getting key from {}: {:?}", self.name, key);
        self.stats.get_count.fetch_add(1, Ordering::Relaxed);

        let value = self.data.read().get(key).cloned();
        if value.is_some() {
            self.stats.hit_count.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.miss_count.fetch_add(1, Ordering::Relaxed);
        }
        Ok(value)
    }

    fn put(&self, key: &[u8], value: &[u8]) -> StoreResult<()> {
        trace!(
            "Putting key to {}: {:?}, value size: {} bytes",
            self.name,
            key,
            value.len()
        );
        self.stats.put_count.fetch_add(1, Ordering::Relaxed);
        self.data.write().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        trace!("Deleting key from {}: {:?}", self.name, key);
        self.stats.delete_count.fetch_add(1, Ordering::Relaxed);
        Ok(self.data.write().remove(key))
    }

    fn range(&self, from: Bound<&[u8]>, to: Bound<&[u8]>) -> StoreResult<Vec<RawEntry>> {
        if is_empty_range(from, to) {
            return Ok(Vec::new());
        }
        let data = self.data.read();
        Ok(data
            .range::<[u8], _>((from, to))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn len(&self) -> usize {
        self.data.read().len()
    }

    fn is_persistent(&self) -> bool {
        false
    }
}

/// Provider of named memory engines
#[derive(Debug, Default)]
pub struct MemoryEngineProvider {
    engines: Mutex<HashMap<String, Arc<MemoryEngine>>>,
}

impl MemoryEngineProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EngineProvider for MemoryEngineProvider {
    fn open(&self, name: &str) -> StoreResult<Arc<dyn StorageEngine>> {
        let engine = self
            .engines
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemoryEngine::new(name)))
            .clone();
        Ok(engine)
    }

    fn destroy(&self, name: &str) -> StoreResult<()> {
        if self.engines.lock().remove(name).is_some() {
            debug!("Destroyed memory engine {}", name);
        }
        Ok(())
    }

    fn existing(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let mut names: Vec<String> = self
            .engines
            .lock()
            .keys()
            .filter(|name| name.starts_with(prefix))
            .cloned()
            .collect();
        names.sort();
        Ok(names)
    }

    fn is_persistent(&self) -> bool {
        false
    }
}
