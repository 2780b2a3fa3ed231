//! Closeable cursors over store entries
//!
//! A [`StoreCursor`] is a forward-only, finite iteration over a snapshot of
//! raw engine entries taken when the cursor was opened. Writes made after
//! that point are never observed (snapshot-at-open consistency). Raw entries
//! are decoded, and filtered, one at a time as the cursor advances.
//!
//! A cursor holds its snapshot until it is closed. `close` is idempotent and
//! also runs on drop, so a cursor can never leak past its scope. The owning
//! store counts open cursors; closing the store invalidates its cursors.
//!
//! ```rust
//! use statestore::{StoreBuilder, StoreConfig};
//!
//! # fn main() -> statestore::StoreResult<()> {
//! let store = StoreBuilder::new(StoreConfig::in_memory("counts")).build()?;
//! let kv = store.as_key_value().expect("key-value store");
//! kv.put(b"a", b"1")?;
//! kv.put(b"b", b"2")?;
//!
//! let mut cursor = kv.all()?;
//! while let Some(entry) = cursor.try_next()? {
//!     println!("{:?} = {:?}", entry.key, entry.value);
//! }
//! cursor.close();
//! # Ok(())
//! # }
//! ```

use std::cmp::Ordering;
use std::fmt;
use std::ops::ControlFlow;
use std::sync::Arc;
use tracing::{trace, warn};

use crate::engine::RawEntry;
use crate::error::{StoreError, StoreResult};
use crate::lifecycle::LifecycleState;

/// Decodes one raw entry; `Ok(None)` skips the entry
pub type Decoder<T> = Box<dyn FnMut(RawEntry) -> StoreResult<Option<T>> + Send>;

/// Forward-only cursor over a snapshot of store entries
pub struct StoreCursor<T> {
    raw: std::vec::IntoIter<RawEntry>,
    decode: Decoder<T>,
    peeked: Option<T>,
    owner: Option<Arc<LifecycleState>>,
    closed: bool,
}

impl<T> StoreCursor<T> {
    /// Cursor registered with its owning store
    pub(crate) fn open(
        owner: Arc<LifecycleState>,
        snapshot: Vec<RawEntry>,
        decode: Decoder<T>,
    ) -> Self {
        owner.cursor_opened();
        Self {
            raw: snapshot.into_iter(),
            decode,
            peeked: None,
            owner: Some(owner),
            closed: false,
        }
    }

    /// Cursor not tracked by any store
    pub fn detached(snapshot: Vec<RawEntry>, decode: Decoder<T>) -> Self {
        Self {
            raw: snapshot.into_iter(),
            decode,
            peeked: None,
            owner: None,
            closed: false,
        }
    }

    fn ensure_usable(&mut self) -> StoreResult<()> {
        if self.closed {
            return Err(StoreError::CursorClosed);
        }
        let closed_store = self
            .owner
            .as_ref()
            .filter(|owner| !owner.is_open())
            .map(|owner| owner.name().to_string());
        if let Some(store) = closed_store {
            self.close();
            return Err(StoreError::NotOpen { store });
        }
        Ok(())
    }

    fn fill_peeked(&mut self) -> StoreResult<()> {
        while self.peeked.is_none() {
            let Some(raw) = self.raw.next() else {
                break;
            };
            self.peeked = (self.decode)(raw)?;
        }
        Ok(())
    }

    /// Next entry, `Ok(None)` at the end of the sequence
    pub fn try_next(&mut self) -> StoreResult<Option<T>> {
        self.ensure_usable()?;
        self.fill_peeked()?;
        Ok(self.peeked.take())
    }

    /// Whether another entry is available
    pub fn has_next(&mut self) -> bool {
        self.peek_next().is_some()
    }

    /// Next entry without consuming it
    pub fn peek_next(&mut self) -> Option<&T> {
        if self.ensure_usable().is_err() {
            return None;
        }
        if let Err(e) = self.fill_peeked() {
            warn!("Cursor decode failed: {}", e);
            return None;
        }
        self.peeked.as_ref()
    }

    /// Release the snapshot; calling it again has no effect
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.peeked = None;
        self.raw = Vec::new().into_iter();
        if let Some(owner) = &self.owner {
            owner.cursor_closed();
            trace!("Closed cursor of store {}", owner.name());
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl<T> Iterator for StoreCursor<T> {
    type Item = T;

    /// Yields `None` at the end, after close, and after a decode failure;
    /// use [`StoreCursor::try_next`] to observe failures.
    fn next(&mut self) -> Option<T> {
        match self.try_next() {
            Ok(item) => item,
            Err(StoreError::CursorClosed) => None,
            Err(e) => {
                warn!("Cursor stopped: {}", e);
                self.close();
                None
            }
        }
    }
}

impl<T> Drop for StoreCursor<T> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<T> fmt::Debug for StoreCursor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreCursor")
            .field("remaining_raw", &self.raw.len())
            .field("closed", &self.closed)
            .finish()
    }
}

/// Visit every entry of `cursor`, closing it on every exit path
///
/// Stops early when `f` returns `ControlFlow::Break` or an error. Returns
/// the number of entries passed to `f`.
pub fn for_each_entry<T, F>(mut cursor: StoreCursor<T>, mut f: F) -> StoreResult<usize>
where
    F: FnMut(T) -> StoreResult<ControlFlow<()>>,
{
    let mut visited = 0;
    let result = loop {
        match cursor.try_next() {
            Ok(Some(entry)) => {
                visited += 1;
                match f(entry) {
                    Ok(ControlFlow::Continue(())) => continue,
                    Ok(ControlFlow::Break(())) => break Ok(visited),
                    Err(e) => break Err(e),
                }
            }
            Ok(None) => break Ok(visited),
            Err(e) => break Err(e),
        }
    };
    cursor.close();
    result
}

/// Merge sorted pending cache entries over a sorted engine snapshot
///
/// Cache entries shadow engine entries with the same key; a cached `None`
/// hides the key entirely.
pub(crate) fn merge_sorted(
    cached: Vec<(Vec<u8>, Option<Vec<u8>>)>,
    engine: Vec<RawEntry>,
) -> Vec<RawEntry> {
    let mut merged = Vec::with_capacity(cached.len() + engine.len());
    let mut cached = cached.into_iter().peekable();
    let mut engine = engine.into_iter().peekable();

    loop {
        let order = match (cached.peek(), engine.peek()) {
            (None, None) => break,
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (Some((ck, _)), Some((ek, _))) => ck.cmp(ek),
        };

        match order {
            Ordering::Greater => {
                if let Some(entry) = engine.next() {
                    merged.push(entry);
                }
            }
            Ordering::Equal | Ordering::Less => {
                if order == Ordering::Equal {
                    engine.next();
                }
                if let Some((key, Some(value))) = cached.next() {
                    merged.push((key, value));
                }
            }
        }
    }

    merged
}
