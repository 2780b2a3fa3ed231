//! Embeddable state stores for stream processing
//!
//! This crate keeps the local state of a stream-processing node in three
//! shapes:
//!
//! - **Key-value stores**: persistent (sled), in-memory, or bounded by LRU eviction
//! - **Window stores**: values per key and fixed-size time window, evicted by retention
//! - **Session stores**: gap-merged activity intervals per key
//!
//! Stores are byte-oriented and synchronous. Every write can pass through a
//! coalescing write cache and is offered to a [`ChangelogSink`] so that a
//! store can be rebuilt with `restore`. Reads return values or closeable
//! [`StoreCursor`]s over a snapshot taken when the cursor was opened.
//!
//! ```rust
//! use statestore::{StateStore, StoreBuilder, StoreConfig};
//! use std::time::Duration;
//!
//! # fn main() -> statestore::StoreResult<()> {
//! let config = StoreConfig::window("clicks", Duration::from_secs(60), Duration::from_secs(3600))
//!     .with_persistent(false);
//! let store = StoreBuilder::new(config).build()?;
//! let clicks = store.as_window().expect("window store");
//!
//! clicks.put(b"user-1", b"3", 125_000)?;
//! assert_eq!(clicks.fetch(b"user-1", 179_999)?, Some(b"3".to_vec()));
//!
//! for entry in clicks.fetch_range(b"user-1", 0, 600_000)? {
//!     println!("{} {:?}", entry.window, entry.value);
//! }
//! store.close()?;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod changelog;
pub mod clock;
pub mod config;
pub mod cursor;
pub mod engine;
pub mod error;
pub mod flusher;
pub mod keys;
pub mod kv;
pub mod lifecycle;
pub mod query;
pub mod segments;
pub mod session;
pub mod store;
pub mod window;

pub use cache::CacheStats;
pub use changelog::{ChangelogRecord, ChangelogSink, InMemoryChangelog};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{CacheConfig, LateRecordPolicy, StoreConfig, StoreKind};
pub use cursor::{for_each_entry, StoreCursor};
pub use engine::{EngineProvider, MemoryEngineProvider, SledEngineProvider, StorageEngine};
pub use error::{StoreError, StoreResult};
pub use flusher::{spawn_configured_flush_task, spawn_flush_task, spawn_store_flush_task};
pub use kv::{KeyValue, KeyValueStore};
pub use lifecycle::StateStore;
pub use query::QueryOptions;
pub use segments::SegmentedStoreStats;
pub use session::{LastWriteWins, Session, SessionCombiner, SessionStore};
pub use store::{Store, StoreBuilder, StoreRegistry};
pub use window::{Window, WindowStore, WindowedEntry};
