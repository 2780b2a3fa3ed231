//! Time segments of window and session stores
//!
//! Entries are partitioned by a segment timestamp (window start or session
//! end) into segments of `segment_interval` milliseconds, one engine per
//! segment. Stream time is the largest timestamp observed by the store.
//! A segment is dropped wholesale once the latest end any of its entries can
//! have plus the retention falls behind stream time, so expiry never deletes
//! keys one at a time.
//!
//! The segment interval is chosen so that at most `segments` segments are
//! ever live.
//!
//! Segment engines are named `<store>.<segment id>`. Stream time is written
//! to the `<store>.meta` engine on flush so a reopened store resumes from it.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::ops::Bound;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::cache::WriteCache;
use crate::cursor::merge_sorted;
use crate::config::LateRecordPolicy;
use crate::engine::{EngineProvider, RawEntry, StorageEngine};
use crate::error::{StoreError, StoreResult};
use crate::lifecycle::StoreLifecycle;

/// Separator between the store name and the segment id in engine names
pub(crate) const SEGMENT_SEPARATOR: char = '.';

const META_SUFFIX: &str = "meta";
const STREAM_TIME_KEY: &[u8] = b"stream-time";

/// Retention statistics of a window or session store
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentedStoreStats {
    /// Largest timestamp observed, `None` before the first write
    pub stream_time: Option<i64>,
    /// Live segments
    pub segments: usize,
    /// Segments dropped because they fell out of retention
    pub dropped_segments: u64,
    /// Writes discarded for being older than the retention floor
    pub dropped_late_records: u64,
    /// Entries across live segments, expired ones not yet dropped included
    pub entries: usize,
}

/// Segment table of one store
pub(crate) struct Segments {
    store: String,
    provider: Arc<dyn EngineProvider>,
    segment_interval: i64,
    retention: i64,
    // Distance from the segment timestamp to the entry end
    extent: i64,
    segments: BTreeMap<i64, Arc<dyn StorageEngine>>,
    // Holds the persisted stream time, opened on first flush or on recovery
    meta: Option<Arc<dyn StorageEngine>>,
    stream_time: Option<i64>,
    dropped_segments: u64,
}

impl Segments {
    /// `extent` is the span an entry may reach past its segment timestamp
    pub(crate) fn new(
        store: &str,
        provider: Arc<dyn EngineProvider>,
        retention: i64,
        extent: i64,
        num_segments: u32,
    ) -> Self {
        let span = retention.saturating_add(extent);
        let divisor = i64::from(num_segments.max(2) - 1);
        let segment_interval = ((span + divisor - 1) / divisor).max(1);
        debug!(
            "Store {} uses {} segments of {}ms",
            store, num_segments, segment_interval
        );
        Self {
            store: store.to_string(),
            provider,
            segment_interval,
            retention,
            extent,
            segments: BTreeMap::new(),
            meta: None,
            stream_time: None,
            dropped_segments: 0,
        }
    }

    #[cfg(test)]
    pub(crate) fn segment_interval(&self) -> i64 {
        self.segment_interval
    }

    pub(crate) fn segment_id(&self, timestamp: i64) -> i64 {
        timestamp.div_euclid(self.segment_interval)
    }

    fn segment_name(&self, id: i64) -> String {
        format!("{}{}{}", self.store, SEGMENT_SEPARATOR, id)
    }

    fn meta_name(&self) -> String {
        format!("{}{}{}", self.store, SEGMENT_SEPARATOR, META_SUFFIX)
    }

    fn prefix(&self) -> String {
        format!("{}{}", self.store, SEGMENT_SEPARATOR)
    }

    pub(crate) fn stream_time(&self) -> Option<i64> {
        self.stream_time
    }

    /// Oldest timestamp still accepted by the store
    pub(crate) fn retention_floor(&self) -> Option<i64> {
        self.stream_time.map(|t| t.saturating_sub(self.retention))
    }

    /// Whether an entry ending at `end` is within retention
    pub(crate) fn is_live(&self, end: i64) -> bool {
        self.stream_time
            .map_or(true, |t| end.saturating_add(self.retention) >= t)
    }

    fn is_expired(&self, id: i64) -> bool {
        let latest_end = id
            .saturating_add(1)
            .saturating_mul(self.segment_interval)
            .saturating_sub(1)
            .saturating_add(self.extent);
        !self.is_live(latest_end)
    }

    /// Check a write timestamp against the retention floor
    ///
    /// Returns `Ok(false)` when the write must be dropped.
    pub(crate) fn admit(&self, policy: LateRecordPolicy, timestamp: i64) -> StoreResult<bool> {
        let Some(floor) = self.retention_floor() else {
            return Ok(true);
        };
        if timestamp >= floor {
            return Ok(true);
        }
        match policy {
            LateRecordPolicy::Drop => {
                debug!(
                    "Dropping late write to store {}: timestamp {} below floor {}",
                    self.store, timestamp, floor
                );
                Ok(false)
            }
            LateRecordPolicy::Reject => {
                warn!(
                    "Rejecting late write to store {}: timestamp {} below floor {}",
                    self.store, timestamp, floor
                );
                Err(StoreError::RetentionViolation {
                    store: self.store.clone(),
                    timestamp,
                    floor,
                })
            }
        }
    }

    /// Advance stream time to `timestamp` and drop segments that expired
    pub(crate) fn observe(&mut self, timestamp: i64) -> StoreResult<()> {
        if self.stream_time.map_or(true, |t| timestamp > t) {
            self.stream_time = Some(timestamp);
            self.drop_expired()?;
        }
        Ok(())
    }

    fn drop_expired(&mut self) -> StoreResult<()> {
        let expired: Vec<i64> = self
            .segments
            .keys()
            .copied()
            .take_while(|id| self.is_expired(*id))
            .collect();

        for id in expired {
            let name = self.segment_name(id);
            self.segments.remove(&id);
            self.provider.destroy(&name)?;
            self.dropped_segments += 1;
            info!(
                "Dropped expired segment {} (stream time {:?})",
                name, self.stream_time
            );
        }
        Ok(())
    }

    fn get_or_create(&mut self, id: i64) -> StoreResult<Option<Arc<dyn StorageEngine>>> {
        if self.is_expired(id) {
            return Ok(None);
        }
        if let Some(engine) = self.segments.get(&id) {
            return Ok(Some(Arc::clone(engine)));
        }
        let engine = self.provider.open(&self.segment_name(id))?;
        debug!("Created segment {}", engine.name());
        self.segments.insert(id, Arc::clone(&engine));
        Ok(Some(engine))
    }

    /// Apply one raw write to the segment of `segment_timestamp`
    ///
    /// Returns `false` when the segment already expired and the write was
    /// discarded.
    pub(crate) fn write(
        &mut self,
        segment_timestamp: i64,
        raw_key: &[u8],
        value: Option<&[u8]>,
    ) -> StoreResult<bool> {
        let id = self.segment_id(segment_timestamp);
        match value {
            Some(value) => match self.get_or_create(id)? {
                Some(engine) => {
                    engine.put(raw_key, value)?;
                    Ok(true)
                }
                None => Ok(false),
            },
            None => {
                if let Some(engine) = self.segments.get(&id) {
                    engine.delete(raw_key)?;
                }
                Ok(true)
            }
        }
    }

    /// Apply a write and offer it to the changelog
    ///
    /// A write aimed at an expired segment is discarded and not logged.
    pub(crate) fn apply(
        &mut self,
        lifecycle: &StoreLifecycle,
        segment_timestamp: i64,
        raw_key: Vec<u8>,
        value: Option<Vec<u8>>,
        timestamp: i64,
    ) -> StoreResult<()> {
        if self.write(segment_timestamp, &raw_key, value.as_deref())? {
            lifecycle.log(raw_key, value, timestamp)
        } else {
            debug!(
                "Discarded write to expired segment {} of store {}",
                self.segment_id(segment_timestamp),
                self.store
            );
            Ok(())
        }
    }

    /// Drain `cache` into the segments in key order
    ///
    /// `segment_timestamp` extracts the segment timestamp of a raw key.
    /// Writes not applied because of an error go back into the cache.
    pub(crate) fn flush_cache<F>(
        &mut self,
        lifecycle: &StoreLifecycle,
        cache: &mut WriteCache,
        segment_timestamp: F,
    ) -> StoreResult<usize>
    where
        F: Fn(&[u8]) -> StoreResult<i64>,
    {
        let mut pending = cache.drain().into_iter();
        let count = pending.len();
        while let Some(write) = pending.next() {
            let applied = segment_timestamp(&write.key).and_then(|segment_ts| {
                self.apply(
                    lifecycle,
                    segment_ts,
                    write.key.clone(),
                    write.value.clone(),
                    write.timestamp,
                )
            });
            if let Err(e) = applied {
                let mut unapplied = vec![write];
                unapplied.extend(pending);
                cache.requeue(unapplied);
                return Err(e);
            }
        }
        if count > 0 {
            debug!("Flushed {} cached entries of store {}", count, self.store);
        }
        Ok(count)
    }

    /// Look up a raw key in the segment of `segment_timestamp`
    pub(crate) fn get(&self, segment_timestamp: i64, raw_key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        match self.segments.get(&self.segment_id(segment_timestamp)) {
            Some(engine) => engine.get(raw_key),
            None => Ok(None),
        }
    }

    /// Snapshot of raw entries within the bounds, searching the segments of
    /// timestamps `min_timestamp..=max_timestamp` and the pending cache
    pub(crate) fn snapshot(
        &self,
        cache: Option<&Mutex<WriteCache>>,
        from: Bound<&[u8]>,
        to: Bound<&[u8]>,
        min_timestamp: i64,
        max_timestamp: i64,
    ) -> StoreResult<Vec<RawEntry>> {
        let (lo, hi) = (self.segment_id(min_timestamp), self.segment_id(max_timestamp));
        let cached = cache.map(|cache| cache.lock());

        let mut entries = Vec::new();
        if lo <= hi {
            for engine in self.segments.range(lo..=hi).map(|(_, engine)| engine) {
                entries.extend(engine.range(from, to)?);
            }
        }
        // Segment ranges interleave once more than one logical key is scanned
        entries.sort_unstable_by(|a, b| a.0.cmp(&b.0));

        Ok(match cached {
            Some(cache) => merge_sorted(cache.range(from, to), entries),
            None => entries,
        })
    }

    /// Reattach segments left by an earlier run and recover stream time
    ///
    /// Stream time is the one persisted by the last flush, or the largest
    /// segment timestamp found if that is later. `segment_timestamp`
    /// extracts the segment timestamp of a raw key.
    pub(crate) fn recover<F>(&mut self, segment_timestamp: F) -> StoreResult<()>
    where
        F: Fn(&[u8]) -> Option<i64>,
    {
        let prefix = self.prefix();
        let meta_name = self.meta_name();
        let mut persisted = None;
        for name in self.provider.existing(&prefix)? {
            if name == meta_name {
                let meta = self.provider.open(&name)?;
                persisted = meta
                    .get(STREAM_TIME_KEY)?
                    .and_then(|raw| <[u8; 8]>::try_from(raw.as_slice()).ok())
                    .map(i64::from_be_bytes);
                self.meta = Some(meta);
                continue;
            }
            match name[prefix.len()..].parse::<i64>() {
                Ok(id) => {
                    let engine = self.provider.open(&name)?;
                    self.segments.insert(id, engine);
                }
                Err(_) => warn!("Ignoring engine {} with unparseable segment id", name),
            }
        }

        let mut derived = None;
        for engine in self.segments.values().rev() {
            derived = engine
                .range(Bound::Unbounded, Bound::Unbounded)?
                .iter()
                .filter_map(|(key, _)| segment_timestamp(key))
                .max();
            if derived.is_some() {
                break;
            }
        }
        self.stream_time = persisted.max(derived);

        if !self.segments.is_empty() {
            info!(
                "Recovered {} segments of store {}, stream time {:?}",
                self.segments.len(),
                self.store,
                self.stream_time
            );
        }
        self.drop_expired()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.segments.len()
    }

    #[cfg(test)]
    pub(crate) fn dropped_segments(&self) -> u64 {
        self.dropped_segments
    }

    /// Entries across all segments
    pub(crate) fn entry_count(&self) -> usize {
        self.segments.values().map(|engine| engine.len()).sum()
    }

    pub(crate) fn stats(&self, dropped_late_records: u64) -> SegmentedStoreStats {
        SegmentedStoreStats {
            stream_time: self.stream_time,
            segments: self.segments.len(),
            dropped_segments: self.dropped_segments,
            dropped_late_records,
            entries: self.entry_count(),
        }
    }

    pub(crate) fn flush(&mut self) -> StoreResult<()> {
        self.persist_stream_time()?;
        for engine in self.segments.values() {
            engine.flush()?;
        }
        self.provider.flush()
    }

    fn persist_stream_time(&mut self) -> StoreResult<()> {
        let Some(stream_time) = self.stream_time else {
            return Ok(());
        };
        let meta = match &self.meta {
            Some(meta) => Arc::clone(meta),
            None => {
                let meta = self.provider.open(&self.meta_name())?;
                self.meta = Some(Arc::clone(&meta));
                meta
            }
        };
        meta.put(STREAM_TIME_KEY, &stream_time.to_be_bytes())?;
        meta.flush()
    }
}

impl fmt::Debug for Segments {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Segments")
            .field("store", &self.store)
            .field("segment_interval", &self.segment_interval)
            .field("retention", &self.retention)
            .field("segments", &self.segments.keys().collect::<Vec<_>>())
            .field("stream_time", &self.stream_time)
            .finish()
    }
}
