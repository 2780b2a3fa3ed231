//! Bounded in-memory engine with least-recently-used eviction
//!
//! Entries live in an ordered map so range scans stay sorted; a second map
//! from access tick to key orders entries by recency. Every `get` and `put`
//! moves the key to the most-recent position. Inserting a new key beyond
//! capacity evicts the entry with the smallest tick. Evicted keys are kept
//! until the owning store collects them with `take_evicted`.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::ops::Bound;
use tracing::{debug, trace};

use super::{is_empty_range, RawEntry, StorageEngine};
use crate::error::StoreResult;

#[derive(Debug, Default)]
struct LruState {
    entries: BTreeMap<Vec<u8>, (Vec<u8>, u64)>,
    recency: BTreeMap<u64, Vec<u8>>,
    tick: u64,
    evicted: Vec<Vec<u8>>,
}

impl LruState {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn touch(&mut self, key: &[u8]) {
        let tick = self.next_tick();
        if let Some((_, old_tick)) = self.entries.get_mut(key) {
            let previous = std::mem::replace(old_tick, tick);
            self.recency.remove(&previous);
            self.recency.insert(tick, key.to_vec());
        }
    }

    fn evict_overflow(&mut self, capacity: usize) {
        while self.entries.len() > capacity {
            let Some((_, key)) = self.recency.pop_first() else {
                break;
            };
            self.entries.remove(&key);
            debug!("LRU evicted key {:?}", key);
            self.evicted.push(key);
        }
    }
}

/// Volatile engine holding at most `capacity` keys
#[derive(Debug)]
pub struct LruEngine {
    name: String,
    capacity: usize,
    state: Mutex<LruState>,
}

impl LruEngine {
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        Self {
            name: name.into(),
            capacity,
            state: Mutex::new(LruState::default()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl StorageEngine for LruEngine {
    fn name(&self) -> &str {
        &self.name
    }

    fn get(&self, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        let mut state = self.state.lock();
        let value = state.entries.get(key).map(|(value, _)| value.clone());
        if value.is_some() {
            state.touch(key);
        }
        Ok(value)
    }

    fn put(&self, key: &[u8], value: &[u8]) -> StoreResult<()> {
        trace!("Putting key to LRU {}: {:?}", self.name, key);
        let mut state = self.state.lock();
        let tick = state.next_tick();
        if let Some((_, previous)) = state.entries.insert(key.to_vec(), (value.to_vec(), tick)) {
            state.recency.remove(&previous);
        }
        state.recency.insert(tick, key.to_vec());
        state.evict_overflow(self.capacity);
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        let mut state = self.state.lock();
        Ok(state.entries.remove(key).map(|(value, tick)| {
            state.recency.remove(&tick);
            value
        }))
    }

    fn range(&self, from: Bound<&[u8]>, to: Bound<&[u8]>) -> StoreResult<Vec<RawEntry>> {
        if is_empty_range(from, to) {
            return Ok(Vec::new());
        }
        let state = self.state.lock();
        Ok(state
            .entries
            .range::<[u8], _>((from, to))
            .map(|(k, (v, _))| (k.clone(), v.clone()))
            .collect())
    }

    fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    fn is_persistent(&self) -> bool {
        false
    }

    fn take_evicted(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.state.lock().evicted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tests::{check_engine_basic_ops, check_engine_range};

    #[test]
    fn test_lru_engine_basic() {
        check_engine_basic_ops(&LruEngine::new("test", 10));
    }

    #[test]
    fn test_lru_engine_range() {
        check_engine_range(&LruEngine::new("test", 10));
    }

    #[test]
    fn test_evicts_least_recently_used() {
        let engine = LruEngine::new("test", 3);
        engine.put(b"a", b"1").unwrap();
        engine.put(b"b", b"2").unwrap();
        engine.put(b"c", b"3").unwrap();

        // Refresh "a" so "b" becomes the oldest
        engine.get(b"a").unwrap();
        engine.put(b"d", b"4").unwrap();

        assert_eq!(engine.len(), 3);
        assert_eq!(engine.get(b"b").unwrap(), None);
        assert_eq!(engine.take_evicted(), vec![b"b".to_vec()]);
        assert!(engine.take_evicted().is_empty());
    }

    #[test]
    fn test_overwrite_does_not_evict() {
        let engine = LruEngine::new("test", 2);
        engine.put(b"a", b"1").unwrap();
        engine.put(b"b", b"2").unwrap();
        engine.put(b"a", b"3").unwrap();

        assert_eq!(engine.len(), 2);
        assert!(engine.take_evicted().is_empty());

        engine.put(b"c", b"4").unwrap();
        assert_eq!(engine.take_evicted(), vec![b"b".to_vec()]);
    }

    #[test]
    fn test_delete_frees_capacity() {
        let engine = LruEngine::new("test", 2);
        engine.put(b"a", b"1").unwrap();
        engine.put(b"b", b"2").unwrap();
        engine.delete(b"a").unwrap();
        engine.put(b"c", b"3").unwrap();

        assert!(engine.take_evicted().is_empty());
        assert_eq!(engine.len(), 2);
    }
}
