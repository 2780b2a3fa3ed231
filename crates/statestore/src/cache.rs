//! Write cache in front of a store's engine
//!
//! Dirty entries are coalesced per raw key and held in key order until a
//! flush. The cache reports when `max_entries` dirty keys are pending; the
//! owning store then flushes every pending entry to the engine, in key
//! order, offering each to the changelog. Only the latest value of a key
//! reaches the engine, so repeated writes to one key between flushes
//! produce a single changelog record.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::Bound;

/// Write cache statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Writes accepted by the cache
    pub writes: u64,
    /// Writes that replaced a pending entry of the same key
    pub coalesced_writes: u64,
    pub flushes: u64,
    /// Entries written to the engine by all flushes
    pub flushed_entries: u64,
    /// Dirty keys currently pending
    pub pending: u64,
    pub capacity: u64,
    pub hit_rate: f64,
}

impl CacheStats {
    fn calculate_rates(&mut self) {
        let total = self.hits + self.misses;
        self.hit_rate = if total > 0 {
            self.hits as f64 / total as f64
        } else {
            0.0
        };
    }
}

/// One pending write; `value: None` is a pending delete
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PendingWrite {
    pub key: Vec<u8>,
    pub value: Option<Vec<u8>>,
    pub timestamp: i64,
}

#[derive(Debug, Clone)]
struct DirtyEntry {
    value: Option<Vec<u8>>,
    timestamp: i64,
}

/// Key-ordered, coalescing buffer of dirty entries
#[derive(Debug)]
pub(crate) struct WriteCache {
    entries: BTreeMap<Vec<u8>, DirtyEntry>,
    max_entries: usize,
    stats: CacheStats,
}

impl WriteCache {
    pub(crate) fn new(max_entries: usize) -> Self {
        Self {
            entries: BTreeMap::new(),
            max_entries,
            stats: CacheStats::default(),
        }
    }

    /// `Some(None)` for a pending delete, `None` when the key is not cached
    pub(crate) fn get(&mut self, key: &[u8]) -> Option<Option<Vec<u8>>> {
        match self.entries.get(key) {
            Some(entry) => {
                self.stats.hits += 1;
                Some(entry.value.clone())
            }
            None => {
                self.stats.misses += 1;
                None
            }
        }
    }

    /// Buffer a write; returns `true` once the cache must be flushed
    pub(crate) fn put(&mut self, key: Vec<u8>, value: Option<Vec<u8>>, timestamp: i64) -> bool {
        self.stats.writes += 1;
        if self
            .entries
            .insert(key, DirtyEntry { value, timestamp })
            .is_some()
        {
            self.stats.coalesced_writes += 1;
        }
        self.entries.len() >= self.max_entries
    }

    /// Pending entries within the bounds, in key order
    pub(crate) fn range(
        &self,
        from: Bound<&[u8]>,
        to: Bound<&[u8]>,
    ) -> Vec<(Vec<u8>, Option<Vec<u8>>)> {
        if crate::engine::is_empty_range(from, to) {
            return Vec::new();
        }
        self.entries
            .range::<[u8], _>((from, to))
            .map(|(k, entry)| (k.clone(), entry.value.clone()))
            .collect()
    }

    /// Take every pending write, in key order
    pub(crate) fn drain(&mut self) -> Vec<PendingWrite> {
        let entries = std::mem::take(&mut self.entries);
        if !entries.is_empty() {
            self.stats.flushes += 1;
            self.stats.flushed_entries += entries.len() as u64;
        }
        entries
            .into_iter()
            .map(|(key, entry)| PendingWrite {
                key,
                value: entry.value,
                timestamp: entry.timestamp,
            })
            .collect()
    }

    /// Put back writes a failed flush did not apply; newer pending writes win
    pub(crate) fn requeue(&mut self, writes: Vec<PendingWrite>) {
        self.stats.flushed_entries = self
            .stats
            .flushed_entries
            .saturating_sub(writes.len() as u64);
        for write in writes {
            self.entries.entry(write.key).or_insert(DirtyEntry {
                value: write.value,
                timestamp: write.timestamp,
            });
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn stats(&self) -> CacheStats {
        let mut stats = self.stats.clone();
        stats.pending = self.entries.len() as u64;
        stats.capacity = self.max_entries as u64;
        stats.calculate_rates();
        stats
    }
}
