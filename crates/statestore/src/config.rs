//! Store configuration
//!
//! A [`StoreConfig`] is captured once when a store is created and never
//! changes afterwards. It can be built in code with the `with_*` setters or
//! deserialized from JSON.

use crate::error::{StoreError, StoreResult};
use crate::segments::SEGMENT_SEPARATOR;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Kind of state store
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum StoreKind {
    /// Persistent ordered key-value store (sled)
    KvRegular,
    /// Volatile ordered key-value store
    KvInMemory,
    /// Volatile key-value store bounded by least-recently-used eviction
    KvLru,
    /// Fixed-size time windows per key
    Window,
    /// Gap-merged activity sessions per key
    Session,
}

impl StoreKind {
    /// Whether the kind carries a retention horizon and a segment table
    pub fn is_time_segmented(&self) -> bool {
        matches!(self, StoreKind::Window | StoreKind::Session)
    }
}

/// What a window or session store does with writes older than its retention floor
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LateRecordPolicy {
    /// Discard the write and count it in the store stats
    #[default]
    Drop,
    /// Fail the write with `StoreError::RetentionViolation`
    Reject,
}

/// Write cache configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheConfig {
    /// Whether writes are buffered in the cache before reaching the engine
    #[serde(default)]
    pub enabled: bool,

    /// Number of dirty keys that triggers an automatic flush
    #[serde(default = "default_cache_max_entries")]
    pub max_entries: usize,

    /// Interval for the periodic flush task, if any
    #[serde(default)]
    pub flush_interval_ms: Option<u64>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_entries: default_cache_max_entries(),
            flush_interval_ms: None,
        }
    }
}

impl CacheConfig {
    /// Enabled cache flushing after `max_entries` dirty keys
    pub fn enabled(max_entries: usize) -> Self {
        Self {
            enabled: true,
            max_entries,
            flush_interval_ms: None,
        }
    }

    /// Periodic flush interval as a `Duration`
    pub fn flush_interval(&self) -> Option<Duration> {
        self.flush_interval_ms.map(Duration::from_millis)
    }
}

/// Immutable configuration of a single store
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct StoreConfig {
    /// Store name, unique within a registry
    pub name: String,

    /// Store kind
    pub kind: StoreKind,

    /// Retention horizon in milliseconds (window and session stores)
    #[serde(default)]
    pub retention_ms: Option<u64>,

    /// Window size in milliseconds (window stores)
    #[serde(default)]
    pub interval_ms: Option<u64>,

    /// Inactivity gap in milliseconds (session stores)
    #[serde(default)]
    pub inactivity_gap_ms: Option<u64>,

    /// Maximum number of keys (LRU stores)
    #[serde(default)]
    pub lru_size: Option<usize>,

    /// Write cache settings
    #[serde(default)]
    pub cache: CacheConfig,

    /// Whether committed writes are offered to the changelog sink
    #[serde(default)]
    pub changelog_enabled: bool,

    /// Number of live time segments (window and session stores)
    #[serde(default = "default_segments")]
    pub segments: u32,

    /// Keep every put to the same key and window instead of overwriting
    #[serde(default)]
    pub retain_duplicates: bool,

    /// Handling of writes older than the retention floor
    #[serde(default)]
    pub late_record_policy: LateRecordPolicy,

    /// Use the sled engine for window and session stores
    #[serde(default = "default_true")]
    pub persistent: bool,

    /// Directory of the sled database; a temporary database is used when absent
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

impl StoreConfig {
    fn base(name: impl Into<String>, kind: StoreKind) -> Self {
        Self {
            name: name.into(),
            kind,
            retention_ms: None,
            interval_ms: None,
            inactivity_gap_ms: None,
            lru_size: None,
            cache: CacheConfig::default(),
            changelog_enabled: false,
            segments: default_segments(),
            retain_duplicates: false,
            late_record_policy: LateRecordPolicy::default(),
            persistent: true,
            data_dir: None,
        }
    }

    /// Persistent key-value store
    pub fn key_value(name: impl Into<String>) -> Self {
        Self::base(name, StoreKind::KvRegular)
    }

    /// In-memory key-value store
    pub fn in_memory(name: impl Into<String>) -> Self {
        Self::base(name, StoreKind::KvInMemory)
    }

    /// LRU-bounded key-value store
    pub fn lru(name: impl Into<String>, lru_size: usize) -> Self {
        Self {
            lru_size: Some(lru_size),
            ..Self::base(name, StoreKind::KvLru)
        }
    }

    /// Window store with the given window size and retention
    pub fn window(name: impl Into<String>, interval: Duration, retention: Duration) -> Self {
        Self {
            interval_ms: Some(interval.as_millis() as u64),
            retention_ms: Some(retention.as_millis() as u64),
            ..Self::base(name, StoreKind::Window)
        }
    }

    /// Session store with the given inactivity gap and retention
    pub fn session(name: impl Into<String>, inactivity_gap: Duration, retention: Duration) -> Self {
        Self {
            inactivity_gap_ms: Some(inactivity_gap.as_millis() as u64),
            retention_ms: Some(retention.as_millis() as u64),
            ..Self::base(name, StoreKind::Session)
        }
    }

    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_changelog(mut self, enabled: bool) -> Self {
        self.changelog_enabled = enabled;
        self
    }

    pub fn with_segments(mut self, segments: u32) -> Self {
        self.segments = segments;
        self
    }

    pub fn with_retain_duplicates(mut self, retain: bool) -> Self {
        self.retain_duplicates = retain;
        self
    }

    pub fn with_late_record_policy(mut self, policy: LateRecordPolicy) -> Self {
        self.late_record_policy = policy;
        self
    }

    pub fn with_persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    /// Parse and validate a JSON configuration
    pub fn from_json(json: &str) -> StoreResult<Self> {
        let config: StoreConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Whether stores built from this configuration survive a restart
    pub fn is_persistent(&self) -> bool {
        match self.kind {
            StoreKind::KvRegular => true,
            StoreKind::KvInMemory | StoreKind::KvLru => false,
            StoreKind::Window | StoreKind::Session => self.persistent,
        }
    }

    /// Validate the configuration for its kind
    pub fn validate(&self) -> StoreResult<()> {
        if self.name.is_empty() {
            return Err(StoreError::configuration("store name must not be empty"));
        }
        // Engine names of segments and stream time are `<store>.<suffix>`
        if self.name.contains(SEGMENT_SEPARATOR) {
            return Err(StoreError::configuration(format!(
                "store name '{}' must not contain '{}'",
                self.name, SEGMENT_SEPARATOR
            )));
        }

        if self.cache.enabled && self.cache.max_entries == 0 {
            return Err(StoreError::configuration(
                "cache max_entries must be greater than 0",
            ));
        }

        if self.retain_duplicates && self.kind != StoreKind::Window {
            return Err(StoreError::configuration(
                "retain-duplicates is only supported by window stores",
            ));
        }

        match self.kind {
            StoreKind::KvRegular | StoreKind::KvInMemory => {}
            StoreKind::KvLru => {
                match self.lru_size {
                    None => {
                        return Err(StoreError::configuration("lru-size missing for LRU store"))
                    }
                    Some(0) => {
                        return Err(StoreError::configuration(
                            "lru-size must be greater than 0",
                        ))
                    }
                    Some(_) => {}
                }
                // Cached keys would sit outside the LRU bound until a flush
                if self.cache.enabled {
                    return Err(StoreError::configuration(
                        "caching cannot be combined with an LRU store",
                    ));
                }
            }
            StoreKind::Window => {
                let interval = match self.interval_ms {
                    None => {
                        return Err(StoreError::configuration(
                            "interval missing for window store",
                        ))
                    }
                    Some(0) => {
                        return Err(StoreError::configuration(
                            "interval must be greater than 0",
                        ))
                    }
                    Some(interval) => interval,
                };
                let retention = self.require_retention()?;
                if retention < interval {
                    return Err(StoreError::configuration(format!(
                        "retention {}ms must not be smaller than interval {}ms",
                        retention, interval
                    )));
                }
                if self.retain_duplicates && self.cache.enabled {
                    return Err(StoreError::configuration(
                        "caching cannot be combined with retain-duplicates",
                    ));
                }
                self.require_segments()?;
            }
            StoreKind::Session => {
                let gap = self.inactivity_gap_ms.ok_or_else(|| {
                    StoreError::configuration("inactivity-gap missing for session store")
                })?;
                let retention = self.require_retention()?;
                if retention < gap {
                    return Err(StoreError::configuration(format!(
                        "retention {}ms must not be smaller than inactivity gap {}ms",
                        retention, gap
                    )));
                }
                self.require_segments()?;
            }
        }

        Ok(())
    }

    fn require_retention(&self) -> StoreResult<u64> {
        match self.retention_ms {
            None => Err(StoreError::configuration(format!(
                "retention missing for {:?} store",
                self.kind
            ))),
            Some(0) => Err(StoreError::configuration(
                "retention must be greater than 0",
            )),
            Some(retention) => Ok(retention),
        }
    }

    fn require_segments(&self) -> StoreResult<()> {
        if self.segments < 2 {
            return Err(StoreError::configuration(format!(
                "segments must be at least 2, got {}",
                self.segments
            )));
        }
        Ok(())
    }

    pub(crate) fn retention(&self) -> i64 {
        self.retention_ms.unwrap_or(0) as i64
    }

    pub(crate) fn interval(&self) -> i64 {
        self.interval_ms.unwrap_or(1) as i64
    }

    pub(crate) fn inactivity_gap(&self) -> i64 {
        self.inactivity_gap_ms.unwrap_or(0) as i64
    }
}

fn default_cache_max_entries() -> usize {
    1_000
}

fn default_segments() -> u32 {
    3
}

fn default_true() -> bool {
    true
}
