//! Storage engines underneath the logical stores
//!
//! A [`StorageEngine`] is an ordered byte-key map. Stores never interpret
//! engine keys beyond their byte order, so any engine that keeps keys
//! sorted lexicographically can back any store kind:
//!
//! - [`MemoryEngine`]: `BTreeMap` behind a lock, volatile
//! - [`LruEngine`]: bounded in-memory map with least-recently-used eviction
//! - [`SledEngine`]: a tree of an embedded sled database, persistent
//!
//! Window and session stores need one engine per time segment. They obtain
//! engines by name from an [`EngineProvider`] and destroy whole engines when
//! a segment expires.

pub mod lru;
pub mod memory;
pub mod persistent;

pub use lru::LruEngine;
pub use memory::{MemoryEngine, MemoryEngineProvider, MemoryEngineStats};
pub use persistent::{SledEngine, SledEngineProvider};

use std::fmt;
use std::ops::Bound;
use std::sync::Arc;

use crate::error::StoreResult;

/// A raw `(key, value)` pair as stored in an engine
pub type RawEntry = (Vec<u8>, Vec<u8>);

/// Ordered byte-oriented key-value engine
///
/// Implementations must be safe to share between the writing task and
/// concurrent readers. `range` returns a snapshot: later writes do not
/// affect an already returned vector.
pub trait StorageEngine: Send + Sync + fmt::Debug {
    /// Engine name (tree or segment name)
    fn name(&self) -> &str;

    /// Look up a key
    fn get(&self, key: &[u8]) -> StoreResult<Option<Vec<u8>>>;

    /// Insert or overwrite a key
    fn put(&self, key: &[u8], value: &[u8]) -> StoreResult<()>;

    /// Remove a key, returning its previous value
    fn delete(&self, key: &[u8]) -> StoreResult<Option<Vec<u8>>>;

    /// Snapshot of all entries within the bounds, in key order
    fn range(&self, from: Bound<&[u8]>, to: Bound<&[u8]>) -> StoreResult<Vec<RawEntry>>;

    /// Number of entries, in constant time
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Make prior writes durable; a no-op for volatile engines
    fn flush(&self) -> StoreResult<()> {
        Ok(())
    }

    /// Whether the engine's data survives a restart
    fn is_persistent(&self) -> bool;

    /// Keys evicted by the engine itself since the last call
    fn take_evicted(&self) -> Vec<Vec<u8>> {
        Vec::new()
    }
}

/// Factory of named engines, used for time segments
pub trait EngineProvider: Send + Sync + fmt::Debug {
    /// Open (or create) the engine with the given name
    fn open(&self, name: &str) -> StoreResult<Arc<dyn StorageEngine>>;

    /// Drop the engine and all of its data
    fn destroy(&self, name: &str) -> StoreResult<()>;

    /// Names of existing engines starting with `prefix`
    fn existing(&self, prefix: &str) -> StoreResult<Vec<String>>;

    /// Make all engines durable
    fn flush(&self) -> StoreResult<()> {
        Ok(())
    }

    fn is_persistent(&self) -> bool;
}

/// Whether a range is empty or inverted and must not reach the engine
pub(crate) fn is_empty_range(from: Bound<&[u8]>, to: Bound<&[u8]>) -> bool {
    match (from, to) {
        (Bound::Included(a), Bound::Included(b)) => a > b,
        (Bound::Included(a), Bound::Excluded(b))
        | (Bound::Excluded(a), Bound::Included(b))
        | (Bound::Excluded(a), Bound::Excluded(b)) => a >= b,
        _ => false,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    // Behaviour every engine must share
    pub fn check_engine_basic_ops(engine: &dyn StorageEngine) {
        engine.put(b"b", b"2").unwrap();
        engine.put(b"a", b"1").unwrap();
        engine.put(b"c", b"3").unwrap();

        assert_eq!(engine.get(b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(engine.get(b"missing").unwrap(), None);
        assert_eq!(engine.len(), 3);

        engine.put(b"a", b"one").unwrap();
        assert_eq!(engine.get(b"a").unwrap(), Some(b"one".to_vec()));
        assert_eq!(engine.len(), 3);

        assert_eq!(engine.delete(b"b").unwrap(), Some(b"2".to_vec()));
        assert_eq!(engine.delete(b"b").unwrap(), None);
        assert_eq!(engine.len(), 2);
    }

    pub fn check_engine_range(engine: &dyn StorageEngine) {
        for key in [b"d", b"a", b"c", b"b"] {
            engine.put(key, key).unwrap();
        }

        let keys: Vec<Vec<u8>> = engine
            .range(Bound::Included(&b"a"[..]), Bound::Excluded(&b"c"[..]))
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec()]);

        let all = engine.range(Bound::Unbounded, Bound::Unbounded).unwrap();
        assert_eq!(all.len(), 4);

        assert!(engine
            .range(Bound::Included(&b"c"[..]), Bound::Excluded(&b"a"[..]))
            .unwrap()
            .is_empty());
        assert!(engine
            .range(Bound::Included(&b"b"[..]), Bound::Excluded(&b"b"[..]))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_is_empty_range() {
        assert!(is_empty_range(Bound::Included(&b"b"[..]), Bound::Excluded(&b"b"[..])));
        assert!(is_empty_range(Bound::Included(&b"c"[..]), Bound::Included(&b"b"[..])));
        assert!(!is_empty_range(Bound::Included(&b"b"[..]), Bound::Included(&b"b"[..])));
        assert!(!is_empty_range(Bound::Unbounded, Bound::Excluded(&b"a"[..])));
    }
}
