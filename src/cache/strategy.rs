//! Eviction strategies keeping the beacon cache within its configured bounds.
//!
//! Strategies are run by the [`CacheEvictor`](super::evictor::CacheEvictor)
//! after records were added. Both only ever remove unchunked records.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use log::{debug, log_enabled, Level};

use super::beacon_cache::BeaconCache;
use crate::config::CacheConfig;
use crate::timing::TimingProvider;

/// A policy removing excess records from the cache.
pub trait EvictionStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Run one eviction pass. `is_shutdown` is polled between sessions and
    /// aborts the pass early; partial progress is kept.
    fn execute(&self, is_shutdown: &dyn Fn() -> bool);
}

// ── Time based ────────────────────────────────────────────────────────────────

/// Removes records older than the configured maximum record age.
///
/// Runs at most once per `time_eviction_interval`, measured from the first
/// time it was executed.
pub struct TimeEvictionStrategy {
    cache:    Arc<BeaconCache>,
    config:   CacheConfig,
    timing:   Arc<dyn TimingProvider>,
    last_run: AtomicI64,
}

impl TimeEvictionStrategy {
    pub fn new(
        cache:  Arc<BeaconCache>,
        config: CacheConfig,
        timing: Arc<dyn TimingProvider>,
    ) -> Self {
        TimeEvictionStrategy { cache, config, timing, last_run: AtomicI64::new(-1) }
    }

    fn should_run(&self, now: i64) -> bool {
        if self.last_run.load(Ordering::SeqCst) < 0 {
            self.last_run.store(now, Ordering::SeqCst);
        }
        now - self.last_run.load(Ordering::SeqCst) >= self.config.time_eviction_interval
    }

    fn evict(&self, now: i64, is_shutdown: &dyn Fn() -> bool) {
        let min_timestamp = now - self.config.max_record_age;

        for beacon_id in self.cache.beacon_ids() {
            if is_shutdown() {
                break;
            }
            // sessions deleted meanwhile simply report no timestamp
            match self.cache.oldest_unchunked_timestamp(beacon_id) {
                Some(oldest) if oldest < min_timestamp => {
                    let removed = self.cache.evict_by_age(beacon_id, min_timestamp);
                    if log_enabled!(Level::Debug) {
                        debug!(
                            "TimeEvictionStrategy removed {removed} records from beacon {beacon_id}"
                        );
                    }
                }
                _ => {}
            }
        }

        self.last_run.store(now, Ordering::SeqCst);
    }
}

impl EvictionStrategy for TimeEvictionStrategy {
    fn name(&self) -> &'static str { "TimeEvictionStrategy" }

    fn execute(&self, is_shutdown: &dyn Fn() -> bool) {
        if !self.config.time_eviction_enabled() {
            debug!("TimeEvictionStrategy is disabled");
            return;
        }
        let now = self.timing.current_timestamp();
        if self.should_run(now) {
            self.evict(now, is_shutdown);
        }
    }
}

// ── Space based ───────────────────────────────────────────────────────────────

/// Trims the cache once it grows beyond the upper bound, until it is back at
/// or below the lower bound.
///
/// Sessions are visited round-robin in ascending id order, removing the
/// oldest unchunked record of each per round, so every session gives up
/// data at the same rate.
pub struct SpaceEvictionStrategy {
    cache:  Arc<BeaconCache>,
    config: CacheConfig,
}

impl SpaceEvictionStrategy {
    pub fn new(cache: Arc<BeaconCache>, config: CacheConfig) -> Self {
        SpaceEvictionStrategy { cache, config }
    }

    fn above_lower_bound(&self) -> bool {
        self.cache.num_bytes() > self.config.lower_bound
    }
}

impl EvictionStrategy for SpaceEvictionStrategy {
    fn name(&self) -> &'static str { "SpaceEvictionStrategy" }

    fn execute(&self, is_shutdown: &dyn Fn() -> bool) {
        if !self.config.space_eviction_enabled() {
            debug!("SpaceEvictionStrategy is disabled");
            return;
        }
        if self.cache.num_bytes() <= self.config.upper_bound {
            return;
        }

        let mut removed: BTreeMap<i32, usize> = BTreeMap::new();
        while !is_shutdown() && self.above_lower_bound() {
            let mut removed_this_round = 0;
            for beacon_id in self.cache.beacon_ids() {
                if is_shutdown() || !self.above_lower_bound() {
                    break;
                }
                let n = self.cache.evict_by_count(beacon_id, 1);
                if n > 0 {
                    *removed.entry(beacon_id).or_default() += n;
                    removed_this_round += n;
                }
            }
            if removed_this_round == 0 {
                // everything left is currently being sent
                break;
            }
        }

        if log_enabled!(Level::Debug) {
            for (beacon_id, n) in removed {
                debug!("SpaceEvictionStrategy removed {n} records from beacon {beacon_id}");
            }
        }
    }
}
