//! Cached beacon records and the per-session record sequence.

use std::collections::VecDeque;

/// One serialized event or action, as appended by the session layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BeaconCacheRecord {
    timestamp: i64,
    data:      String,
    chunked:   bool,
}

impl BeaconCacheRecord {
    pub fn new(timestamp: i64, data: impl Into<String>) -> Self {
        BeaconCacheRecord { timestamp, data: data.into(), chunked: false }
    }

    pub fn timestamp(&self) -> i64 { self.timestamp }

    /// Size in bytes this record contributes to the cache total.
    pub fn size(&self) -> i64 { self.data.len() as i64 }
}

/// Ordered records of a single session.
///
/// Insertion order is temporal order and is never changed. Records marked as
/// chunked are skipped by eviction and by further chunk building until they
/// are either removed or reset.
#[derive(Debug, Default)]
pub(crate) struct BeaconCacheEntry {
    records: VecDeque<BeaconCacheRecord>,
    /// Set once the entry was removed from the cache map. Writers holding a
    /// stale handle must not touch it anymore.
    pub(crate) deleted: bool,
}

impl BeaconCacheEntry {
    pub fn push(&mut self, record: BeaconCacheRecord) {
        self.records.push_back(record);
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn total_bytes(&self) -> i64 {
        self.records.iter().map(BeaconCacheRecord::size).sum()
    }

    pub fn oldest_unchunked_timestamp(&self) -> Option<i64> {
        self.records.iter().find(|r| !r.chunked).map(BeaconCacheRecord::timestamp)
    }

    /// Build the next chunk from unchunked records, oldest first, and mark
    /// every included record as chunked.
    ///
    /// Records are appended until the chunk length reaches `max_size`; the
    /// record crossing the limit is still included, and at least one record
    /// is always included. Returns an empty string if nothing is left.
    pub fn next_chunk(&mut self, prefix: &str, max_size: usize, delimiter: char) -> String {
        let mut chunk = String::new();
        let mut included = 0usize;

        for record in self.records.iter_mut().filter(|r| !r.chunked) {
            if included == 0 {
                chunk.push_str(prefix);
            } else if chunk.len() >= max_size {
                break;
            }
            chunk.push(delimiter);
            chunk.push_str(&record.data);
            record.chunked = true;
            included += 1;
        }

        chunk
    }

    /// Drop all chunked records. Returns the number of bytes released.
    pub fn remove_chunked(&mut self) -> i64 {
        let mut freed = 0;
        self.records.retain(|r| {
            if r.chunked {
                freed += r.size();
                false
            } else {
                true
            }
        });
        freed
    }

    /// Clear the chunked marker so the records are sent again.
    pub fn reset_chunked(&mut self) {
        for record in self.records.iter_mut() {
            record.chunked = false;
        }
    }

    /// Remove unchunked records older than `min_timestamp`.
    ///
    /// Returns `(records removed, bytes released)`.
    pub fn evict_by_age(&mut self, min_timestamp: i64) -> (usize, i64) {
        let mut removed = 0usize;
        let mut freed = 0i64;
        self.records.retain(|r| {
            if !r.chunked && r.timestamp < min_timestamp {
                removed += 1;
                freed += r.size();
                false
            } else {
                true
            }
        });
        (removed, freed)
    }

    /// Remove up to `count` of the oldest unchunked records.
    ///
    /// Walks from the front and stops as soon as `count` records are gone, so
    /// the cost depends on the chunked records passed over, not on the length
    /// of the session. Returns `(records removed, bytes released)`.
    pub fn evict_by_count(&mut self, count: usize) -> (usize, i64) {
        let mut removed = 0usize;
        let mut freed = 0i64;
        let mut i = 0usize;
        while removed < count && i < self.records.len() {
            if self.records[i].chunked {
                i += 1;
                continue;
            }
            if let Some(record) = self.records.remove(i) {
                removed += 1;
                freed += record.size();
            }
        }
        (removed, freed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(records: &[(i64, &str)]) -> BeaconCacheEntry {
        let mut e = BeaconCacheEntry::default();
        for (ts, data) in records {
            e.push(BeaconCacheRecord::new(*ts, *data));
        }
        e
    }

    #[test]
    fn chunk_includes_the_record_crossing_the_limit() {
        let mut e = entry(&[(1, "aaaa"), (2, "bbbb"), (3, "cccc")]);
        // "p&aaaa" is 6 bytes < 8, so "bbbb" is appended and crosses the limit.
        assert_eq!(e.next_chunk("p", 8, '&'), "p&aaaa&bbbb");
        assert_eq!(e.next_chunk("p", 8, '&'), "p&cccc");
        assert_eq!(e.next_chunk("p", 8, '&'), "");
    }

    #[test]
    fn chunk_always_carries_one_record() {
        let mut e = entry(&[(1, "aaaa"), (2, "bbbb")]);
        assert_eq!(e.next_chunk("a-very-long-prefix", 4, '&'), "a-very-long-prefix&aaaa");
    }

    #[test]
    fn eviction_skips_chunked_records() {
        let mut e = entry(&[(1, "a"), (2, "b"), (3, "c")]);
        e.next_chunk("", 1, '&');
        assert_eq!(e.evict_by_age(10), (2, 2));
        assert_eq!(e.total_bytes(), 1);
        assert_eq!(e.evict_by_count(5), (0, 0));
    }

    #[test]
    fn evict_by_count_takes_oldest_first() {
        let mut e = entry(&[(1, "a"), (2, "bb"), (3, "ccc")]);
        assert_eq!(e.evict_by_count(2), (2, 3));
        assert_eq!(e.oldest_unchunked_timestamp(), Some(3));
    }

    #[test]
    fn evict_by_count_stops_after_the_requested_records() {
        let mut e = entry(&[(1, "a"), (2, "b")]);
        for ts in 3..50_003 {
            e.push(BeaconCacheRecord::new(ts, "x"));
        }
        // the two oldest records are in flight
        assert_eq!(e.next_chunk("", 3, '&'), "&a&b");

        assert_eq!(e.evict_by_count(3), (3, 3));
        assert_eq!(e.oldest_unchunked_timestamp(), Some(6));
        assert_eq!(e.total_bytes(), 2 + 49_997);

        e.reset_chunked();
        assert_eq!(e.next_chunk("", 6, '&'), "&a&b&x");
        assert_eq!(e.records.back().map(BeaconCacheRecord::timestamp), Some(50_002));
    }
}
