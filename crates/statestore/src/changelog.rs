//! Changelog write-through interface
//!
//! Stores offer every committed write, and every flushed cache entry, to a
//! [`ChangelogSink`] as an ordered `(key, value | tombstone)` record. The
//! sink owns replication and durability; replaying its records through a
//! store's `restore` rebuilds the store, deletions included.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::StoreResult;

/// One changelog record; `value: None` is a tombstone
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangelogRecord {
    /// Name of the store that produced the record
    pub store: String,
    /// Raw store key (composite for window and session stores)
    pub key: Vec<u8>,
    /// New value, or `None` for a deletion
    pub value: Option<Vec<u8>>,
    /// Record timestamp in epoch milliseconds
    pub timestamp: i64,
}

impl ChangelogRecord {
    pub fn put(store: &str, key: Vec<u8>, value: Vec<u8>, timestamp: i64) -> Self {
        Self {
            store: store.to_string(),
            key,
            value: Some(value),
            timestamp,
        }
    }

    pub fn tombstone(store: &str, key: Vec<u8>, timestamp: i64) -> Self {
        Self {
            store: store.to_string(),
            key,
            value: None,
            timestamp,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }

    /// Binary form handed to the durability layer
    pub fn encode(&self) -> StoreResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> StoreResult<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Destination of changelog records
pub trait ChangelogSink: Send + Sync + fmt::Debug {
    /// Append one record; records of one store arrive in commit order
    fn append(&self, record: ChangelogRecord) -> StoreResult<()>;
}

/// Sink that keeps records in memory
#[derive(Debug, Default)]
pub struct InMemoryChangelog {
    records: Mutex<Vec<ChangelogRecord>>,
}

impl InMemoryChangelog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every record appended so far
    pub fn records(&self) -> Vec<ChangelogRecord> {
        self.records.lock().clone()
    }

    /// Records of one store, in append order
    pub fn records_for(&self, store: &str) -> Vec<ChangelogRecord> {
        self.records
            .lock()
            .iter()
            .filter(|r| r.store == store)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    pub fn clear(&self) {
        self.records.lock().clear();
    }
}

impl ChangelogSink for InMemoryChangelog {
    fn append(&self, record: ChangelogRecord) -> StoreResult<()> {
        self.records.lock().push(record);
        Ok(())
    }
}
