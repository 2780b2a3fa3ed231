//! Window store
//!
//! Values are stored per key and fixed-size time window. A timestamp `t`
//! belongs to the window starting at `floor(t / interval) * interval`.
//! Windows are kept in time segments by window start; a window is live
//! while `end + retention >= stream_time` and expired windows are hidden
//! from every read until their segment is dropped.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Bound;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, instrument, trace};

use crate::cache::{CacheStats, WriteCache};
use crate::changelog::ChangelogRecord;
use crate::clock::Clock;
use crate::config::{LateRecordPolicy, StoreConfig};
use crate::cursor::StoreCursor;
use crate::engine::{EngineProvider, RawEntry};
use crate::error::{StoreError, StoreResult};
use crate::keys::{encode_key, WindowKey};
use crate::lifecycle::{StateStore, StoreLifecycle};
use crate::query::{check_key_range, check_time_range, QueryOptions};
use crate::segments::{SegmentedStoreStats, Segments};

/// Half-open time window `[start, end)` in epoch milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Window {
    pub start: i64,
    pub end: i64,
}

impl Window {
    pub fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }

    /// Window of size `interval` containing `timestamp`
    pub fn containing(timestamp: i64, interval: i64) -> Self {
        let start = window_start(timestamp, interval);
        Self {
            start,
            end: start.saturating_add(interval),
        }
    }

    pub fn contains(&self, timestamp: i64) -> bool {
        timestamp >= self.start && timestamp < self.end
    }

    /// Whether the window intersects `[from, to)`
    pub fn overlaps(&self, from: i64, to: i64) -> bool {
        self.start < to && self.end > from
    }

    pub fn duration_ms(&self) -> i64 {
        self.end - self.start
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let format = |millis: i64| match DateTime::<Utc>::from_timestamp_millis(millis) {
            Some(time) => time.format("%Y-%m-%d %H:%M:%S%.3f").to_string(),
            None => millis.to_string(),
        };
        write!(f, "[{} - {})", format(self.start), format(self.end))
    }
}

/// One stored window value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowedEntry {
    pub key: Vec<u8>,
    pub window: Window,
    pub value: Vec<u8>,
    /// Insertion sequence; always 0 unless duplicates are retained
    pub seq: u32,
}

fn window_start(timestamp: i64, interval: i64) -> i64 {
    timestamp.div_euclid(interval) * interval
}

/// Key × time window → value store
pub struct WindowStore {
    lifecycle: StoreLifecycle,
    segments: RwLock<Segments>,
    cache: Option<Mutex<WriteCache>>,
    interval: i64,
    retain_duplicates: bool,
    late_record_policy: LateRecordPolicy,
    next_seq: AtomicU32,
    dropped_late_records: AtomicU64,
    clock: Arc<dyn Clock>,
}

impl WindowStore {
    pub(crate) fn new(
        config: &StoreConfig,
        lifecycle: StoreLifecycle,
        provider: Arc<dyn EngineProvider>,
        clock: Arc<dyn Clock>,
    ) -> StoreResult<Self> {
        let interval = config.interval();
        let mut segments = Segments::new(
            &config.name,
            provider,
            config.retention(),
            interval,
            config.segments,
        );
        segments.recover(|raw| WindowKey::decode(raw).ok().map(|key| key.start))?;

        let next_seq = if config.retain_duplicates {
            segments
                .snapshot(None, Bound::Unbounded, Bound::Unbounded, i64::MIN, i64::MAX)?
                .iter()
                .filter_map(|(raw, _)| WindowKey::decode(raw).ok())
                .map(|key| key.seq.saturating_add(1))
                .max()
                .unwrap_or(0)
        } else {
            0
        };

        let cache = config
            .cache
            .enabled
            .then(|| Mutex::new(WriteCache::new(config.cache.max_entries)));

        Ok(Self {
            lifecycle,
            segments: RwLock::new(segments),
            cache,
            interval,
            retain_duplicates: config.retain_duplicates,
            late_record_policy: config.late_record_policy,
            next_seq: AtomicU32::new(next_seq),
            dropped_late_records: AtomicU64::new(0),
            clock,
        })
    }

    pub fn interval_ms(&self) -> i64 {
        self.interval
    }

    /// Store `value` in the window containing `timestamp`
    pub fn put(&self, key: &[u8], value: &[u8], timestamp: i64) -> StoreResult<()> {
        self.lifecycle.ensure_open()?;
        let mut segments = self.segments.write();
        if !segments.admit(self.late_record_policy, timestamp)? {
            self.dropped_late_records.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }
        let seq = if self.retain_duplicates {
            self.allocate_seq()?
        } else {
            0
        };
        segments.observe(timestamp)?;

        let start = window_start(timestamp, self.interval);
        trace!(
            "Put to store {} window {} seq {}",
            self.lifecycle.name(),
            start,
            seq
        );
        let raw = WindowKey::encode_parts(key, start, seq);
        self.write(&mut segments, raw, start, Some(value.to_vec()), timestamp)
    }

    /// Store `value` in the window containing the clock's current time
    pub fn put_now(&self, key: &[u8], value: &[u8]) -> StoreResult<()> {
        self.put(key, value, self.clock.now_millis())
    }

    /// Delete the window of `key` starting at `window_start`, duplicates included
    pub fn remove(&self, key: &[u8], window_start: i64) -> StoreResult<()> {
        self.lifecycle.ensure_open()?;
        let mut segments = self.segments.write();
        let timestamp = segments.stream_time().unwrap_or(window_start);
        let raw_keys = if self.retain_duplicates {
            let from = WindowKey::encode_parts(key, window_start, 0);
            let to = WindowKey::encode_parts(key, window_start, u32::MAX);
            segments
                .snapshot(
                    self.cache.as_ref(),
                    Bound::Included(from.as_slice()),
                    Bound::Included(to.as_slice()),
                    window_start,
                    window_start,
                )?
                .into_iter()
                .map(|(raw, _)| raw)
                .collect()
        } else {
            vec![WindowKey::encode_parts(key, window_start, 0)]
        };

        for raw in raw_keys {
            self.write(&mut segments, raw, window_start, None, timestamp)?;
        }
        Ok(())
    }

    /// Value of the window containing `timestamp`; the latest duplicate wins
    pub fn fetch(&self, key: &[u8], timestamp: i64) -> StoreResult<Option<Vec<u8>>> {
        self.lifecycle.ensure_open()?;
        let start = window_start(timestamp, self.interval);
        let segments = self.segments.read();
        if !segments.is_live(start.saturating_add(self.interval)) {
            return Ok(None);
        }

        if self.retain_duplicates {
            let from = WindowKey::encode_parts(key, start, 0);
            let to = WindowKey::encode_parts(key, start, u32::MAX);
            let entries = segments.snapshot(
                self.cache.as_ref(),
                Bound::Included(from.as_slice()),
                Bound::Included(to.as_slice()),
                start,
                start,
            )?;
            return Ok(entries.into_iter().last().map(|(_, value)| value));
        }

        let raw = WindowKey::encode_parts(key, start, 0);
        if let Some(cache) = &self.cache {
            if let Some(cached) = cache.lock().get(&raw) {
                return Ok(cached);
            }
        }
        segments.get(start, &raw)
    }

    /// Windows of `key` intersecting `[time_from, time_to)`, by start time
    pub fn fetch_range(
        &self,
        key: &[u8],
        time_from: i64,
        time_to: i64,
    ) -> StoreResult<StoreCursor<WindowedEntry>> {
        check_time_range(time_from, time_to)?;
        let (lo, hi) = self.start_bounds(time_from, time_to);
        let from = WindowKey::encode_parts(key, lo, 0);
        let to = WindowKey::encode_parts(key, hi, u32::MAX);
        self.scan(Bound::Included(from.as_slice()), Bound::Included(to.as_slice()), lo, hi)
    }

    /// Windows of keys in `[from_key, to_key)` intersecting `[time_from, time_to)`
    pub fn fetch_key_range(
        &self,
        from_key: &[u8],
        to_key: &[u8],
        time_from: i64,
        time_to: i64,
    ) -> StoreResult<StoreCursor<WindowedEntry>> {
        check_key_range(from_key, to_key)?;
        check_time_range(time_from, time_to)?;
        let (lo, hi) = self.start_bounds(time_from, time_to);
        let from = encode_key(from_key);
        let to = encode_key(to_key);
        self.scan(Bound::Included(from.as_slice()), Bound::Excluded(to.as_slice()), lo, hi)
    }

    /// Windows of every key intersecting `[time_from, time_to)`, by key then start
    pub fn fetch_all(&self, time_from: i64, time_to: i64) -> StoreResult<StoreCursor<WindowedEntry>> {
        check_time_range(time_from, time_to)?;
        let (lo, hi) = self.start_bounds(time_from, time_to);
        self.scan(Bound::Unbounded, Bound::Unbounded, lo, hi)
    }

    /// Every live window
    pub fn all(&self) -> StoreResult<StoreCursor<WindowedEntry>> {
        self.scan(Bound::Unbounded, Bound::Unbounded, i64::MIN, i64::MAX)
    }

    pub fn fetch_with_options(
        &self,
        key: &[u8],
        options: &QueryOptions,
    ) -> StoreResult<StoreCursor<WindowedEntry>> {
        let (from, to) = options.resolve(self.clock.as_ref())?;
        self.fetch_range(key, from, to)
    }

    pub fn fetch_all_with_options(
        &self,
        options: &QueryOptions,
    ) -> StoreResult<StoreCursor<WindowedEntry>> {
        let (from, to) = options.resolve(self.clock.as_ref())?;
        self.fetch_all(from, to)
    }

    /// Replay changelog records without logging them again
    pub fn restore<I>(&self, records: I) -> StoreResult<usize>
    where
        I: IntoIterator<Item = ChangelogRecord>,
    {
        self.lifecycle.ensure_open()?;
        let mut segments = self.segments.write();
        let mut restored = 0;
        for record in records {
            let window_key = WindowKey::decode(&record.key)?;
            segments.observe(record.timestamp)?;
            segments.write(window_key.start, &record.key, record.value.as_deref())?;
            if self.retain_duplicates {
                self.next_seq
                    .fetch_max(window_key.seq.saturating_add(1), Ordering::Relaxed);
            }
            restored += 1;
        }
        debug!("Restored {} records into store {}", restored, self.lifecycle.name());
        Ok(restored)
    }

    pub fn stats(&self) -> SegmentedStoreStats {
        self.segments
            .read()
            .stats(self.dropped_late_records.load(Ordering::Relaxed))
    }

    pub fn cache_stats(&self) -> Option<CacheStats> {
        self.cache.as_ref().map(|cache| cache.lock().stats())
    }

    /// Next duplicate sequence number; `u32::MAX` is never handed out
    fn allocate_seq(&self) -> StoreResult<u32> {
        self.next_seq
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |seq| seq.checked_add(1))
            .map_err(|_| StoreError::SequenceExhausted {
                store: self.lifecycle.name().to_string(),
            })
    }

    /// Smallest and largest window start intersecting `[time_from, time_to)`
    fn start_bounds(&self, time_from: i64, time_to: i64) -> (i64, i64) {
        if time_from >= time_to {
            return (1, 0);
        }
        (
            time_from.saturating_sub(self.interval).saturating_add(1),
            time_to.saturating_sub(1),
        )
    }

    fn scan(
        &self,
        from: Bound<&[u8]>,
        to: Bound<&[u8]>,
        min_start: i64,
        max_start: i64,
    ) -> StoreResult<StoreCursor<WindowedEntry>> {
        self.lifecycle.ensure_open()?;
        let segments = self.segments.read();
        let snapshot = if min_start <= max_start {
            segments.snapshot(self.cache.as_ref(), from, to, min_start, max_start)?
        } else {
            Vec::new()
        };
        let live_from = segments.retention_floor();
        drop(segments);

        let interval = self.interval;
        let decode = move |(raw, value): RawEntry| -> StoreResult<Option<WindowedEntry>> {
            let key = WindowKey::decode(&raw)?;
            let end = key.start.saturating_add(interval);
            let live = live_from.map_or(true, |floor| end >= floor);
            if !live || key.start < min_start || key.start > max_start {
                return Ok(None);
            }
            Ok(Some(WindowedEntry {
                key: key.key,
                window: Window::new(key.start, end),
                value,
                seq: key.seq,
            }))
        };
        Ok(self.lifecycle.cursor(snapshot, Box::new(decode)))
    }

    fn write(
        &self,
        segments: &mut Segments,
        raw: Vec<u8>,
        start: i64,
        value: Option<Vec<u8>>,
        timestamp: i64,
    ) -> StoreResult<()> {
        let Some(cache) = &self.cache else {
            return segments.apply(&self.lifecycle, start, raw, value, timestamp);
        };
        let mut cache = cache.lock();
        if cache.put(raw, value, timestamp) {
            segments.flush_cache(&self.lifecycle, &mut cache, segment_timestamp)?;
        }
        Ok(())
    }
}

fn segment_timestamp(raw: &[u8]) -> StoreResult<i64> {
    WindowKey::decode(raw).map(|key| key.start)
}

impl StateStore for WindowStore {
    fn name(&self) -> &str {
        self.lifecycle.name()
    }

    fn is_open(&self) -> bool {
        self.lifecycle.is_open()
    }

    fn is_persistent(&self) -> bool {
        self.lifecycle.is_persistent()
    }

    #[instrument(skip(self), fields(store = %self.lifecycle.name()))]
    fn flush(&self) -> StoreResult<()> {
        self.lifecycle.ensure_open()?;
        let mut segments = self.segments.write();
        if let Some(cache) = &self.cache {
            segments.flush_cache(&self.lifecycle, &mut cache.lock(), segment_timestamp)?;
        }
        segments.flush()
    }

    fn close(&self) -> StoreResult<()> {
        if !self.lifecycle.is_open() {
            return Ok(());
        }
        let flushed = self.flush();
        self.lifecycle.mark_closed();
        flushed
    }

    fn open_cursors(&self) -> usize {
        self.lifecycle.open_cursors()
    }
}

impl fmt::Debug for WindowStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WindowStore")
            .field("lifecycle", &self.lifecycle)
            .field("interval", &self.interval)
            .field("retain_duplicates", &self.retain_duplicates)
            .field("segments", &*self.segments.read())
            .finish()
    }
}
