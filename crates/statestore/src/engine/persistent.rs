//! Sled-based persistent storage engine
//!
//! Each engine is one tree of a shared sled database. Window and session
//! stores map every time segment to its own tree, so dropping an expired
//! segment is a single `drop_tree`.

use sled::{Db, Tree};
use std::ops::Bound;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info, trace};

use super::{is_empty_range, EngineProvider, RawEntry, StorageEngine};
use crate::error::{StoreError, StoreResult};

fn storage_error(details: String) -> StoreError {
    StoreError::Storage {
        backend_type: "sled".to_string(),
        details,
    }
}

/// Persistent engine backed by a sled tree
///
/// `Tree::len` walks the whole tree, so the entry count is taken once on
/// open and kept up to date from the previous values returned by writes.
/// Writes to the tree must go through this engine for the count to hold.
#[derive(Debug, Clone)]
pub struct SledEngine {
    name: String,
    tree: Tree,
    entries: Arc<AtomicUsize>,
}

impl SledEngine {
    pub fn new(name: impl Into<String>, tree: Tree) -> Self {
        let entries = tree.len();
        Self {
            name: name.into(),
            tree,
            entries: Arc::new(AtomicUsize::new(entries)),
        }
    }
}

impl StorageEngine for SledEngine {
    fn name(&self) -> &str {
        &self.name
    }

    fn get(&self, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        trace!("Getting key from sled tree {}: {:?}", self.name, key);
        let value = self
            .tree
            .get(key)
            .map_err(|e| storage_error(format!("Get failed: {}", e)))?;
        Ok(value.map(|v| v.to_vec()))
    }

    fn put(&self, key: &[u8], value: &[u8]) -> StoreResult<()> {
        trace!(
            "Putting key to sled tree {}: {:?}, value size: {} bytes",
            self.name,
            key,
            value.len()
        );
        let previous = self
            .tree
            .insert(key, value)
            .map_err(|e| storage_error(format!("Put failed: {}", e)))?;
        if previous.is_none() {
            self.entries.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        trace!("Deleting key from sled tree {}: {:?}", self.name, key);
        let previous = self
            .tree
            .remove(key)
            .map_err(|e| storage_error(format!("Delete failed: {}", e)))?;
        if previous.is_some() {
            self.entries.fetch_sub(1, Ordering::Relaxed);
        }
        Ok(previous.map(|v| v.to_vec()))
    }

    fn range(&self, from: Bound<&[u8]>, to: Bound<&[u8]>) -> StoreResult<Vec<RawEntry>> {
        if is_empty_range(from, to) {
            return Ok(Vec::new());
        }
        self.tree
            .range::<&[u8], _>((from, to))
            .map(|result| {
                result
                    .map(|(k, v)| (k.to_vec(), v.to_vec()))
                    .map_err(|e| storage_error(format!("Range iteration failed: {}", e)))
            })
            .collect()
    }

    fn len(&self) -> usize {
        self.entries.load(Ordering::Relaxed)
    }

    fn flush(&self) -> StoreResult<()> {
        let flushed = self
            .tree
            .flush()
            .map_err(|e| storage_error(format!("Flush failed: {}", e)))?;
        trace!("Flushed {} bytes of sled tree {}", flushed, self.name);
        Ok(())
    }

    fn is_persistent(&self) -> bool {
        true
    }
}

/// Provider of sled trees within one database
#[derive(Debug, Clone)]
pub struct SledEngineProvider {
    db: Arc<Db>,
}

impl SledEngineProvider {
    /// Open (or create) the database at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let path = path.as_ref();
        info!("Opening sled database at {:?}", path);

        std::fs::create_dir_all(path)
            .map_err(|e| storage_error(format!("Failed to create directory: {}", e)))?;

        let db = sled::Config::new()
            .path(path)
            .open()
            .map_err(|e| storage_error(format!("Failed to open database: {}", e)))?;

        info!("Sled database opened, {} trees", db.tree_names().len());
        Ok(Self { db: Arc::new(db) })
    }

    /// Database that is removed when the last handle is dropped
    pub fn temporary() -> StoreResult<Self> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|e| storage_error(format!("Failed to open temporary database: {}", e)))?;
        Ok(Self { db: Arc::new(db) })
    }
}

impl EngineProvider for SledEngineProvider {
    fn open(&self, name: &str) -> StoreResult<Arc<dyn StorageEngine>> {
        let tree = self
            .db
            .open_tree(name)
            .map_err(|e| storage_error(format!("Failed to open tree {}: {}", name, e)))?;
        Ok(Arc::new(SledEngine::new(name, tree)))
    }

    fn destroy(&self, name: &str) -> StoreResult<()> {
        let dropped = self
            .db
            .drop_tree(name)
            .map_err(|e| storage_error(format!("Failed to drop tree {}: {}", name, e)))?;
        if dropped {
            debug!("Dropped sled tree {}", name);
        }
        Ok(())
    }

    fn existing(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let mut names: Vec<String> = self
            .db
            .tree_names()
            .into_iter()
            .filter_map(|raw| String::from_utf8(raw.to_vec()).ok())
            .filter(|name| name.starts_with(prefix))
            .collect();
        names.sort();
        Ok(names)
    }

    fn flush(&self) -> StoreResult<()> {
        self.db
            .flush()
            .map_err(|e| storage_error(format!("Flush failed: {}", e)))?;
        Ok(())
    }

    fn is_persistent(&self) -> bool {
        true
    }
}
