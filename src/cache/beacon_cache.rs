//! Volatile, concurrent cache of serialized beacon records.
//!
//! Records are grouped per session (beacon id). Callers on arbitrary
//! application threads append; the eviction thread trims; the sending thread
//! pulls chunks and acknowledges or releases them.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use log::{debug, log_enabled, Level};

use super::record::{BeaconCacheEntry, BeaconCacheRecord};
use super::signal::RecordAddedSignal;
use crate::util::{lock, read, write};

type EntryHandle = Arc<Mutex<BeaconCacheEntry>>;

#[derive(Debug, Default)]
pub struct BeaconCache {
    entries:      RwLock<HashMap<i32, EntryHandle>>,
    bytes:        AtomicI64,
    record_added: Arc<RecordAddedSignal>,
}

impl BeaconCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal raised on every append; the evictor parks on it.
    pub fn record_added_signal(&self) -> Arc<RecordAddedSignal> {
        Arc::clone(&self.record_added)
    }

    // ── Writers ───────────────────────────────────────────────────────────────

    /// Append `data` to the tail of the session's records.
    ///
    /// The session entry is created on first write.
    pub fn add_record(&self, beacon_id: i32, timestamp: i64, data: impl Into<String>) {
        let record = BeaconCacheRecord::new(timestamp, data);
        let size = record.size();

        // A concurrent delete may retire the entry between lookup and lock;
        // in that case look it up again so the record lands in a live entry.
        let mut record = Some(record);
        while let Some(rec) = record.take() {
            let entry = self.get_or_create(beacon_id);
            let mut guard = lock(&entry);
            if guard.deleted {
                record = Some(rec);
                continue;
            }
            guard.push(rec);
            self.bytes.fetch_add(size, Ordering::SeqCst);
        }

        // entry lock is released before waking the evictor
        self.record_added.notify();
    }

    pub fn add_event_data(&self, beacon_id: i32, timestamp: i64, data: impl Into<String>) {
        if log_enabled!(Level::Debug) {
            debug!("BeaconCache add event data: beacon={beacon_id} ts={timestamp}");
        }
        self.add_record(beacon_id, timestamp, data);
    }

    pub fn add_action_data(&self, beacon_id: i32, timestamp: i64, data: impl Into<String>) {
        if log_enabled!(Level::Debug) {
            debug!("BeaconCache add action data: beacon={beacon_id} ts={timestamp}");
        }
        self.add_record(beacon_id, timestamp, data);
    }

    /// Remove the whole session entry. No-op for unknown ids.
    pub fn delete_entry(&self, beacon_id: i32) {
        let removed = write(&self.entries).remove(&beacon_id);
        if let Some(entry) = removed {
            let mut guard = lock(&entry);
            guard.deleted = true;
            self.bytes.fetch_sub(guard.total_bytes(), Ordering::SeqCst);
            debug!("BeaconCache deleted entry for beacon {beacon_id}");
        }
    }

    // ── Sender side ───────────────────────────────────────────────────────────

    /// Build the next chunk for `beacon_id`.
    ///
    /// Returns `None` if the id is unknown (never written or deleted),
    /// `Some("")` if there is nothing left to send, otherwise
    /// `prefix<delimiter>record<delimiter>record...`. Included records are
    /// marked as chunked until [`acknowledge_chunk`](Self::acknowledge_chunk)
    /// or [`release_chunk`](Self::release_chunk) is called.
    ///
    /// Must only be called from the sending thread.
    pub fn next_chunk(
        &self,
        beacon_id: i32,
        prefix:    &str,
        max_size:  usize,
        delimiter: char,
    ) -> Option<String> {
        let entry = self.get(beacon_id)?;
        let mut guard = lock(&entry);
        if guard.deleted {
            return None;
        }
        Some(guard.next_chunk(prefix, max_size, delimiter))
    }

    /// Permanently drop every chunked record after a successful send.
    pub fn acknowledge_chunk(&self, beacon_id: i32) {
        if let Some(entry) = self.get(beacon_id) {
            let mut guard = lock(&entry);
            if !guard.deleted {
                let freed = guard.remove_chunked();
                self.bytes.fetch_sub(freed, Ordering::SeqCst);
            }
        }
    }

    /// Put chunked records back so the next chunk contains them again.
    pub fn release_chunk(&self, beacon_id: i32) {
        if let Some(entry) = self.get(beacon_id) {
            lock(&entry).reset_chunked();
        }
    }

    // ── Eviction ──────────────────────────────────────────────────────────────

    /// Remove unchunked records with a timestamp below `min_timestamp`.
    /// Returns the number of records removed (0 for unknown ids).
    pub fn evict_by_age(&self, beacon_id: i32, min_timestamp: i64) -> usize {
        self.evict_with(beacon_id, |e| e.evict_by_age(min_timestamp))
    }

    /// Remove up to `count` of the oldest unchunked records.
    /// Returns the number actually removed.
    pub fn evict_by_count(&self, beacon_id: i32, count: usize) -> usize {
        self.evict_with(beacon_id, |e| e.evict_by_count(count))
    }

    fn evict_with<F>(&self, beacon_id: i32, evict: F) -> usize
    where
        F: FnOnce(&mut BeaconCacheEntry) -> (usize, i64),
    {
        let Some(entry) = self.get(beacon_id) else {
            return 0;
        };
        let mut guard = lock(&entry);
        if guard.deleted {
            return 0;
        }
        let (removed, freed) = evict(&mut *guard);
        self.bytes.fetch_sub(freed, Ordering::SeqCst);
        removed
    }

    // ── Queries ───────────────────────────────────────────────────────────────

    /// `true` if the session holds no records at all (unknown ids are empty).
    pub fn is_empty(&self, beacon_id: i32) -> bool {
        self.get(beacon_id).map_or(true, |e| lock(&e).is_empty())
    }

    /// Snapshot of the currently known beacon ids, in ascending order.
    pub fn beacon_ids(&self) -> BTreeSet<i32> {
        read(&self.entries).keys().copied().collect()
    }

    /// Total bytes across all sessions, chunked records included.
    pub fn num_bytes(&self) -> i64 {
        self.bytes.load(Ordering::SeqCst)
    }

    /// Timestamp of the oldest record still eligible for eviction.
    pub fn oldest_unchunked_timestamp(&self, beacon_id: i32) -> Option<i64> {
        self.get(beacon_id).and_then(|e| lock(&e).oldest_unchunked_timestamp())
    }

    fn get(&self, beacon_id: i32) -> Option<EntryHandle> {
        read(&self.entries).get(&beacon_id).cloned()
    }

    fn get_or_create(&self, beacon_id: i32) -> EntryHandle {
        if let Some(entry) = self.get(beacon_id) {
            return entry;
        }
        Arc::clone(write(&self.entries).entry(beacon_id).or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache_with(records: &[(i32, i64, &str)]) -> BeaconCache {
        let cache = BeaconCache::new();
        for (id, ts, data) in records {
            cache.add_record(*id, *ts, *data);
        }
        cache
    }

    #[test]
    fn aggregate_bytes_track_every_append() {
        let cache = cache_with(&[(1, 1, "abc"), (1, 2, "de"), (2, 3, "fghij")]);
        assert_eq!(cache.num_bytes(), 10);
        assert_eq!(cache.beacon_ids().into_iter().collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn unknown_id_is_distinct_from_empty() {
        let cache = cache_with(&[(1, 1, "abc")]);
        assert_eq!(cache.next_chunk(99, "p", 100, '&'), None);

        assert_eq!(cache.next_chunk(1, "p", 100, '&').as_deref(), Some("p&abc"));
        cache.acknowledge_chunk(1);
        assert_eq!(cache.next_chunk(1, "p", 100, '&').as_deref(), Some(""));

        cache.delete_entry(1);
        assert_eq!(cache.next_chunk(1, "p", 100, '&'), None);
    }

    #[test]
    fn chunks_follow_insertion_order_and_are_not_repeated() {
        let cache = cache_with(&[(1, 1, "a"), (1, 2, "b"), (1, 3, "c")]);
        assert_eq!(cache.next_chunk(1, "p", 4, '&').as_deref(), Some("p&a&b"));
        // chunked records are not handed out twice
        assert_eq!(cache.next_chunk(1, "p", 4, '&').as_deref(), Some("p&c"));
        assert_eq!(cache.next_chunk(1, "p", 4, '&').as_deref(), Some(""));
    }

    #[test]
    fn acknowledged_records_never_come_back() {
        let cache = cache_with(&[(1, 1, "a"), (1, 2, "b")]);
        assert_eq!(cache.next_chunk(1, "p", 1, '&').as_deref(), Some("p&a"));
        cache.acknowledge_chunk(1);
        assert_eq!(cache.num_bytes(), 1);
        cache.add_record(1, 3, "c");
        assert_eq!(cache.next_chunk(1, "p", 100, '&').as_deref(), Some("p&b&c"));
    }

    #[test]
    fn released_records_come_back_in_order() {
        let cache = cache_with(&[(1, 1, "a"), (1, 2, "b")]);
        assert_eq!(cache.next_chunk(1, "p", 100, '&').as_deref(), Some("p&a&b"));
        cache.add_record(1, 3, "c");
        cache.release_chunk(1);
        assert_eq!(cache.num_bytes(), 3);
        assert_eq!(cache.next_chunk(1, "p", 100, '&').as_deref(), Some("p&a&b&c"));
    }

    #[test]
    fn evict_by_age_removes_exactly_older_unchunked_records() {
        let cache = cache_with(&[(1, 1, "a"), (1, 5, "b"), (1, 8, "c"), (1, 10, "d")]);
        // "a" is chunked and therefore protected
        cache.next_chunk(1, "", 1, '&');
        assert_eq!(cache.evict_by_age(1, 9), 2);
        assert_eq!(cache.num_bytes(), 2);
        cache.release_chunk(1);
        assert_eq!(cache.next_chunk(1, "p", 100, '&').as_deref(), Some("p&a&d"));
        assert_eq!(cache.evict_by_age(42, 100), 0);
    }

    #[test]
    fn evict_by_count_reports_actual_removals() {
        let cache = cache_with(&[(1, 1, "a"), (1, 2, "b")]);
        assert_eq!(cache.evict_by_count(1, 5), 2);
        assert_eq!(cache.num_bytes(), 0);
        assert!(cache.is_empty(1));
        // the entry itself survives eviction
        assert_eq!(cache.next_chunk(1, "p", 10, '&').as_deref(), Some(""));
    }

    #[test]
    fn delete_releases_bytes_including_chunked_records() {
        let cache = cache_with(&[(1, 1, "abc"), (2, 1, "de")]);
        cache.next_chunk(1, "", 100, '&');
        cache.delete_entry(1);
        cache.delete_entry(1);
        assert_eq!(cache.num_bytes(), 2);
        assert!(cache.is_empty(1));
        assert!(!cache.is_empty(2));
    }

    #[test]
    fn concurrent_writers_keep_byte_total_consistent() {
        let cache = Arc::new(BeaconCache::new());
        let writers: Vec<_> = (0..4)
            .map(|t| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    for i in 0..250 {
                        cache.add_record(t % 2, i, "0123456789");
                        if i % 50 == 0 {
                            cache.evict_by_count(t % 2, 1);
                        }
                    }
                })
            })
            .collect();
        for w in writers {
            w.join().unwrap();
        }

        let mut remaining = 0;
        for id in cache.beacon_ids() {
            if let Some(chunk) = cache.next_chunk(id, "", usize::MAX, '&') {
                remaining += chunk.matches("0123456789").count() as i64 * 10;
            }
        }
        assert_eq!(cache.num_bytes(), remaining);
    }

    fn remaining_bytes(cache: &BeaconCache) -> i64 {
        cache
            .beacon_ids()
            .into_iter()
            .filter_map(|id| cache.next_chunk(id, "", usize::MAX, '&'))
            .map(|chunk| chunk.matches("0123456789").count() as i64 * 10)
            .sum()
    }

    #[test]
    fn delete_racing_with_writers_and_eviction_keeps_byte_total_consistent() {
        use std::sync::atomic::AtomicBool;
        use std::thread;

        let cache = Arc::new(BeaconCache::new());
        let stop  = Arc::new(AtomicBool::new(false));

        let writers: Vec<_> = (0..3)
            .map(|t| {
                let cache = Arc::clone(&cache);
                thread::spawn(move || {
                    for i in 0..2_000 {
                        cache.add_record(1 + t % 2, i, "0123456789");
                    }
                })
            })
            .collect();

        let evictor = {
            let cache = Arc::clone(&cache);
            let stop  = Arc::clone(&stop);
            thread::spawn(move || {
                while !stop.load(Ordering::SeqCst) {
                    cache.evict_by_count(1, 3);
                    cache.evict_by_age(1, 100);
                    cache.evict_by_age(2, 100);
                }
            })
        };

        let deleter = {
            let cache = Arc::clone(&cache);
            let stop  = Arc::clone(&stop);
            thread::spawn(move || {
                while !stop.load(Ordering::SeqCst) {
                    cache.delete_entry(1);
                    thread::yield_now();
                }
            })
        };

        for w in writers {
            w.join().unwrap();
        }
        stop.store(true, Ordering::SeqCst);
        evictor.join().unwrap();
        deleter.join().unwrap();

        assert!(cache.num_bytes() >= 0);
        assert_eq!(cache.num_bytes(), remaining_bytes(&cache));

        cache.delete_entry(1);
        cache.delete_entry(2);
        assert_eq!(cache.num_bytes(), 0);
    }
}
