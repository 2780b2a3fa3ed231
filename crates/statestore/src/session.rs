//! Session store
//!
//! A session is a closed interval `[start, end]` of activity for one key.
//! Recording an event merges it with every session of the key that lies
//! within the inactivity gap, repeating until no further session qualifies,
//! so one late event can bridge several sessions into one. Sessions are
//! kept in time segments by session end.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, instrument, trace};

use crate::cache::{CacheStats, WriteCache};
use crate::changelog::ChangelogRecord;
use crate::clock::Clock;
use crate::config::{LateRecordPolicy, StoreConfig};
use crate::cursor::StoreCursor;
use crate::engine::{EngineProvider, RawEntry};
use crate::error::StoreResult;
use crate::keys::{encode_key, SessionKey};
use crate::lifecycle::{StateStore, StoreLifecycle};
use crate::query::{check_key_range, check_time_range, QueryOptions};
use crate::segments::{SegmentedStoreStats, Segments};

/// Activity interval of one key
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Session {
    pub key: Vec<u8>,
    pub start: i64,
    pub end: i64,
    pub value: Vec<u8>,
}

impl Session {
    pub fn new(key: &[u8], start: i64, end: i64, value: &[u8]) -> Self {
        Self {
            key: key.to_vec(),
            start,
            end,
            value: value.to_vec(),
        }
    }

    pub fn duration_ms(&self) -> i64 {
        self.end - self.start
    }

    /// Whether `[start, end]` lies within `gap` of this session
    pub fn is_within_gap(&self, start: i64, end: i64, gap: i64) -> bool {
        self.end >= start.saturating_sub(gap) && self.start <= end.saturating_add(gap)
    }

    fn raw_key(&self) -> Vec<u8> {
        SessionKey::encode_parts(&self.key, self.end, self.start)
    }
}

/// Folds the values of merged sessions into one
pub trait SessionCombiner: Send + Sync {
    /// Combine the accumulated value with the next value in time order
    fn combine(&self, current: &[u8], incoming: &[u8]) -> Vec<u8>;
}

/// Keeps the incoming value
#[derive(Debug, Default, Clone, Copy)]
pub struct LastWriteWins;

impl SessionCombiner for LastWriteWins {
    fn combine(&self, _current: &[u8], incoming: &[u8]) -> Vec<u8> {
        incoming.to_vec()
    }
}

impl<F> SessionCombiner for F
where
    F: Fn(&[u8], &[u8]) -> Vec<u8> + Send + Sync,
{
    fn combine(&self, current: &[u8], incoming: &[u8]) -> Vec<u8> {
        self(current, incoming)
    }
}

/// Gap-merged session store
pub struct SessionStore {
    lifecycle: StoreLifecycle,
    segments: RwLock<Segments>,
    cache: Option<Mutex<WriteCache>>,
    inactivity_gap: i64,
    late_record_policy: LateRecordPolicy,
    combiner: Arc<dyn SessionCombiner>,
    dropped_late_records: AtomicU64,
    clock: Arc<dyn Clock>,
}

impl SessionStore {
    pub(crate) fn new(
        config: &StoreConfig,
        lifecycle: StoreLifecycle,
        provider: Arc<dyn EngineProvider>,
        combiner: Arc<dyn SessionCombiner>,
        clock: Arc<dyn Clock>,
    ) -> StoreResult<Self> {
        let mut segments = Segments::new(
            &config.name,
            provider,
            config.retention(),
            0,
            config.segments,
        );
        segments.recover(|raw| SessionKey::decode(raw).ok().map(|key| key.end))?;

        let cache = config
            .cache
            .enabled
            .then(|| Mutex::new(WriteCache::new(config.cache.max_entries)));

        Ok(Self {
            lifecycle,
            segments: RwLock::new(segments),
            cache,
            inactivity_gap: config.inactivity_gap(),
            late_record_policy: config.late_record_policy,
            combiner,
            dropped_late_records: AtomicU64::new(0),
            clock,
        })
    }

    pub fn inactivity_gap_ms(&self) -> i64 {
        self.inactivity_gap
    }

    /// Record an event and merge it into the sessions of `key`
    ///
    /// Returns the resulting session, or `None` when the event was dropped
    /// for being older than the retention floor.
    pub fn record(&self, key: &[u8], timestamp: i64, value: &[u8]) -> StoreResult<Option<Session>> {
        self.lifecycle.ensure_open()?;
        let mut segments = self.segments.write();
        if !segments.admit(self.late_record_policy, timestamp)? {
            self.dropped_late_records.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        }
        segments.observe(timestamp)?;

        let (mut start, mut end) = (timestamp, timestamp);
        let mut merged: Vec<Session> = Vec::new();
        loop {
            let neighbors = self.neighbors(&segments, key, start, end)?;
            let mut grew = false;
            for session in neighbors {
                if merged
                    .iter()
                    .any(|m| m.start == session.start && m.end == session.end)
                {
                    continue;
                }
                start = start.min(session.start);
                end = end.max(session.end);
                merged.push(session);
                grew = true;
            }
            if !grew {
                break;
            }
        }

        merged.sort_by_key(|session| (session.start, session.end));
        let folded = merged
            .iter()
            .map(|session| session.value.as_slice())
            .chain(std::iter::once(value))
            .fold(None::<Vec<u8>>, |acc, next| match acc {
                None => Some(next.to_vec()),
                Some(acc) => Some(self.combiner.combine(&acc, next)),
            })
            .unwrap_or_else(|| value.to_vec());

        for old in merged.iter().filter(|m| (m.start, m.end) != (start, end)) {
            self.write(&mut segments, old.raw_key(), old.end, None, timestamp)?;
        }
        let session = Session::new(key, start, end, &folded);
        trace!(
            "Recorded event at {} into session [{}, {}] of store {} ({} merged)",
            timestamp,
            start,
            end,
            self.lifecycle.name(),
            merged.len()
        );
        self.write(&mut segments, session.raw_key(), end, Some(folded), timestamp)?;
        Ok(Some(session))
    }

    /// Write a session as-is, without merging
    pub fn put(&self, session: &Session) -> StoreResult<()> {
        self.lifecycle.ensure_open()?;
        let mut segments = self.segments.write();
        if !segments.admit(self.late_record_policy, session.end)? {
            self.dropped_late_records.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }
        segments.observe(session.end)?;
        self.write(
            &mut segments,
            session.raw_key(),
            session.end,
            Some(session.value.clone()),
            session.end,
        )
    }

    /// Delete the session `[start, end]` of `key`
    pub fn remove(&self, key: &[u8], start: i64, end: i64) -> StoreResult<()> {
        self.lifecycle.ensure_open()?;
        let mut segments = self.segments.write();
        let timestamp = segments.stream_time().unwrap_or(end);
        let raw = SessionKey::encode_parts(key, end, start);
        self.write(&mut segments, raw, end, None, timestamp)
    }

    /// Value of the session `[start, end]` of `key`
    pub fn fetch_session(&self, key: &[u8], start: i64, end: i64) -> StoreResult<Option<Vec<u8>>> {
        self.lifecycle.ensure_open()?;
        let segments = self.segments.read();
        if !segments.is_live(end) {
            return Ok(None);
        }
        let raw = SessionKey::encode_parts(key, end, start);
        if let Some(cache) = &self.cache {
            if let Some(cached) = cache.lock().get(&raw) {
                return Ok(cached);
            }
        }
        segments.get(end, &raw)
    }

    /// Every live session of `key`
    pub fn fetch(&self, key: &[u8]) -> StoreResult<StoreCursor<Session>> {
        self.find_sessions(key, i64::MIN, i64::MAX)
    }

    /// Sessions of `key` with `end >= time_from` and `start <= time_to`
    pub fn find_sessions(
        &self,
        key: &[u8],
        time_from: i64,
        time_to: i64,
    ) -> StoreResult<StoreCursor<Session>> {
        check_time_range(time_from, time_to)?;
        let from = SessionKey::encode_parts(key, time_from, i64::MIN);
        let to = SessionKey::encode_parts(key, i64::MAX, i64::MAX);
        self.scan(
            Bound::Included(from.as_slice()),
            Bound::Included(to.as_slice()),
            time_from,
            time_to,
        )
    }

    /// Sessions of keys in `[from_key, to_key)` with `end >= time_from` and `start <= time_to`
    pub fn find_sessions_range(
        &self,
        from_key: &[u8],
        to_key: &[u8],
        time_from: i64,
        time_to: i64,
    ) -> StoreResult<StoreCursor<Session>> {
        check_key_range(from_key, to_key)?;
        check_time_range(time_from, time_to)?;
        let from = encode_key(from_key);
        let to = encode_key(to_key);
        self.scan(
            Bound::Included(from.as_slice()),
            Bound::Excluded(to.as_slice()),
            time_from,
            time_to,
        )
    }

    pub fn find_sessions_with_options(
        &self,
        key: &[u8],
        options: &QueryOptions,
    ) -> StoreResult<StoreCursor<Session>> {
        let (from, to) = options.resolve(self.clock.as_ref())?;
        self.find_sessions(key, from, to)
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
            let session_key = SessionKey::decode(&record.key)?;
            segments.observe(record.timestamp)?;
            segments.write(session_key.end, &record.key, record.value.as_deref())?;
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

    // Live sessions of `key` within the gap of `[start, end]`
    fn neighbors(
        &self,
        segments: &Segments,
        key: &[u8],
        start: i64,
        end: i64,
    ) -> StoreResult<Vec<Session>> {
        let earliest_end = start.saturating_sub(self.inactivity_gap);
        let latest_start = end.saturating_add(self.inactivity_gap);
        let from = SessionKey::encode_parts(key, earliest_end, i64::MIN);
        let to = SessionKey::encode_parts(key, i64::MAX, i64::MAX);

        let mut sessions = Vec::new();
        for (raw, value) in segments.snapshot(
            self.cache.as_ref(),
            Bound::Included(from.as_slice()),
            Bound::Included(to.as_slice()),
            earliest_end,
            i64::MAX,
        )? {
            let session_key = SessionKey::decode(&raw)?;
            if session_key.start <= latest_start && segments.is_live(session_key.end) {
                sessions.push(Session {
                    key: session_key.key,
                    start: session_key.start,
                    end: session_key.end,
                    value,
                });
            }
        }
        Ok(sessions)
    }

    fn scan(
        &self,
        from: Bound<&[u8]>,
        to: Bound<&[u8]>,
        min_end: i64,
        max_start: i64,
    ) -> StoreResult<StoreCursor<Session>> {
        self.lifecycle.ensure_open()?;
        let segments = self.segments.read();
        let snapshot = segments.snapshot(self.cache.as_ref(), from, to, min_end, i64::MAX)?;
        let live_from = segments.retention_floor();
        drop(segments);

        let decode = move |(raw, value): RawEntry| -> StoreResult<Option<Session>> {
            let key = SessionKey::decode(&raw)?;
            let live = live_from.map_or(true, |floor| key.end >= floor);
            if !live || key.end < min_end || key.start > max_start {
                return Ok(None);
            }
            Ok(Some(Session {
                key: key.key,
                start: key.start,
                end: key.end,
                value,
            }))
        };
        Ok(self.lifecycle.cursor(snapshot, Box::new(decode)))
    }

    fn write(
        &self,
        segments: &mut Segments,
        raw: Vec<u8>,
        end: i64,
        value: Option<Vec<u8>>,
        timestamp: i64,
    ) -> StoreResult<()> {
        let Some(cache) = &self.cache else {
            return segments.apply(&self.lifecycle, end, raw, value, timestamp);
        };
        let mut cache = cache.lock();
        if cache.put(raw, value, timestamp) {
            segments.flush_cache(&self.lifecycle, &mut cache, segment_timestamp)?;
        }
        Ok(())
    }
}

fn segment_timestamp(raw: &[u8]) -> StoreResult<i64> {
    SessionKey::decode(raw).map(|key| key.end)
}

impl StateStore for SessionStore {
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

impl fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionStore")
            .field("lifecycle", &self.lifecycle)
            .field("inactivity_gap", &self.inactivity_gap)
            .field("segments", &*self.segments.read())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::engine::MemoryEngineProvider;
    use std::time::Duration;

    fn store_with(combiner: Arc<dyn SessionCombiner>) -> SessionStore {
        let config = StoreConfig::session("visits", Duration::from_millis(5), Duration::from_millis(100))
            .with_persistent(false);
        let lifecycle = StoreLifecycle::new(&config.name, false, None);
        SessionStore::new(
            &config,
            lifecycle,
            Arc::new(MemoryEngineProvider::new()),
            combiner,
            Arc::new(ManualClock::new(0)),
        )
        .unwrap()
    }

    fn bounds(store: &SessionStore, key: &[u8]) -> Vec<(i64, i64)> {
        store.fetch(key).unwrap().map(|s| (s.start, s.end)).collect()
    }

    #[test]
    fn test_within_gap() {
        let session = Session::new(b"u", 10, 12, b"");
        assert!(session.is_within_gap(17, 17, 5));
        assert!(!session.is_within_gap(18, 18, 5));
        assert!(session.is_within_gap(5, 5, 5));
    }

    #[test]
    fn test_merge_bridges_sessions() {
        let store = store_with(Arc::new(LastWriteWins));
        store.record(b"u", 10, b"a").unwrap();
        store.record(b"u", 12, b"b").unwrap();
        store.record(b"u", 20, b"c").unwrap();
        assert_eq!(bounds(&store, b"u"), vec![(10, 12), (20, 20)]);

        let merged = store.record(b"u", 16, b"d").unwrap().unwrap();
        assert_eq!((merged.start, merged.end), (10, 20));
        assert_eq!(merged.value, b"d".to_vec());
        assert_eq!(bounds(&store, b"u"), vec![(10, 20)]);
    }

    #[test]
    fn test_combiner_folds_in_time_order() {
        let concat = |current: &[u8], incoming: &[u8]| [current, incoming].concat();
        let store = store_with(Arc::new(concat));
        store.record(b"u", 20, b"c").unwrap();
        store.record(b"u", 10, b"a").unwrap();
        let merged = store.record(b"u", 15, b"b").unwrap().unwrap();
        assert_eq!(merged.value, b"acb".to_vec());
    }

    #[test]
    fn test_keys_do_not_merge() {
        let store = store_with(Arc::new(LastWriteWins));
        store.record(b"u", 10, b"a").unwrap();
        store.record(b"v", 11, b"b").unwrap();
        assert_eq!(bounds(&store, b"u"), vec![(10, 10)]);
        assert_eq!(bounds(&store, b"v"), vec![(11, 11)]);
    }

    #[test]
    fn test_find_sessions_overlap() {
        let store = store_with(Arc::new(LastWriteWins));
        store.record(b"u", 10, b"a").unwrap();
        store.record(b"u", 30, b"b").unwrap();
        store.record(b"u", 50, b"c").unwrap();

        let found: Vec<_> = store
            .find_sessions(b"u", 25, 35)
            .unwrap()
            .map(|s| s.start)
            .collect();
        assert_eq!(found, vec![30]);
    }

    #[test]
    fn test_fetch_session_and_remove() {
        let store = store_with(Arc::new(LastWriteWins));
        store.put(&Session::new(b"u", 1, 4, b"x")).unwrap();
        assert_eq!(store.fetch_session(b"u", 1, 4).unwrap(), Some(b"x".to_vec()));
        store.remove(b"u", 1, 4).unwrap();
        assert_eq!(store.fetch_session(b"u", 1, 4).unwrap(), None);
    }
}
