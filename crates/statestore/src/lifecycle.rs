//! Store lifecycle shared by every store kind
//!
//! Each store composes a [`StoreLifecycle`]: the open flag, the open-cursor
//! count and the optional changelog sink. Operations on a closed store fail
//! with `StoreError::NotOpen`.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::changelog::{ChangelogRecord, ChangelogSink};
use crate::cursor::{Decoder, StoreCursor};
use crate::engine::RawEntry;
use crate::error::{StoreError, StoreResult};

/// Operations shared by all stores
pub trait StateStore: Send + Sync {
    /// Store name
    fn name(&self) -> &str;

    /// Whether the store accepts operations
    fn is_open(&self) -> bool;

    /// Whether the store's data survives a restart
    fn is_persistent(&self) -> bool;

    /// Push cached writes to the engine and the changelog, then make them durable
    fn flush(&self) -> StoreResult<()>;

    /// Flush and close; closing twice is a no-op
    fn close(&self) -> StoreResult<()>;

    /// Number of cursors opened and not yet closed
    fn open_cursors(&self) -> usize;
}

/// Open state observed by a store and its cursors
#[derive(Debug)]
pub struct LifecycleState {
    name: String,
    open: AtomicBool,
    open_cursors: AtomicUsize,
}

impl LifecycleState {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub fn open_cursors(&self) -> usize {
        self.open_cursors.load(Ordering::Acquire)
    }

    pub(crate) fn cursor_opened(&self) {
        self.open_cursors.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn cursor_closed(&self) {
        let _ = self
            .open_cursors
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }
}

/// Lifecycle and changelog plumbing composed into each store
pub(crate) struct StoreLifecycle {
    state: Arc<LifecycleState>,
    persistent: bool,
    changelog: Option<Arc<dyn ChangelogSink>>,
}

impl StoreLifecycle {
    pub(crate) fn new(
        name: &str,
        persistent: bool,
        changelog: Option<Arc<dyn ChangelogSink>>,
    ) -> Self {
        info!(
            "Opening store {} (persistent: {}, changelog: {})",
            name,
            persistent,
            changelog.is_some()
        );
        Self {
            state: Arc::new(LifecycleState {
                name: name.to_string(),
                open: AtomicBool::new(true),
                open_cursors: AtomicUsize::new(0),
            }),
            persistent,
            changelog,
        }
    }

    pub(crate) fn name(&self) -> &str {
        self.state.name()
    }

    pub(crate) fn is_open(&self) -> bool {
        self.state.is_open()
    }

    pub(crate) fn is_persistent(&self) -> bool {
        self.persistent
    }

    pub(crate) fn open_cursors(&self) -> usize {
        self.state.open_cursors()
    }

    pub(crate) fn ensure_open(&self) -> StoreResult<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(StoreError::not_open(self.name()))
        }
    }

    /// Flip the store to closed; `false` if it was already closed
    pub(crate) fn mark_closed(&self) -> bool {
        let was_open = self.state.open.swap(false, Ordering::AcqRel);
        if was_open {
            let cursors = self.open_cursors();
            if cursors > 0 {
                warn!(
                    "Store {} closed with {} open cursors; they are now invalid",
                    self.name(),
                    cursors
                );
            }
            info!("Closed store {}", self.name());
        } else {
            debug!("Store {} already closed", self.name());
        }
        was_open
    }

    /// Cursor over `snapshot` tied to this store
    pub(crate) fn cursor<T>(&self, snapshot: Vec<RawEntry>, decode: Decoder<T>) -> StoreCursor<T> {
        StoreCursor::open(Arc::clone(&self.state), snapshot, decode)
    }

    /// Offer a write to the changelog sink, if one is attached
    pub(crate) fn log(&self, key: Vec<u8>, value: Option<Vec<u8>>, timestamp: i64) -> StoreResult<()> {
        let Some(sink) = &self.changelog else {
            return Ok(());
        };
        let record = match value {
            Some(value) => ChangelogRecord::put(self.name(), key, value, timestamp),
            None => ChangelogRecord::tombstone(self.name(), key, timestamp),
        };
        sink.append(record)
    }
}

impl fmt::Debug for StoreLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreLifecycle")
            .field("name", &self.name())
            .field("open", &self.is_open())
            .field("open_cursors", &self.open_cursors())
            .field("persistent", &self.persistent)
            .field("changelog", &self.changelog.is_some())
            .finish()
    }
}
