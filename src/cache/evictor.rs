//! Background thread keeping the beacon cache within its bounds.
//!
//! The thread parks on the cache's [`RecordAddedSignal`] and runs every
//! configured [`EvictionStrategy`] once per wake-up, time before space.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, info, log_enabled, warn, Level};

use super::beacon_cache::BeaconCache;
use super::signal::RecordAddedSignal;
use super::strategy::{EvictionStrategy, SpaceEvictionStrategy, TimeEvictionStrategy};
use crate::config::CacheConfig;
use crate::error::Result;
use crate::timing::TimingProvider;
use crate::util::lock;

/// Default time to wait for the eviction thread on [`CacheEvictor::stop`].
pub const EVICTION_THREAD_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictorState {
    NotStarted,
    Running,
    Stopped,
}

struct Worker {
    handle: JoinHandle<()>,
    /// Disconnects when the thread exits; lets `stop` wait with a timeout.
    done:   Receiver<()>,
}

pub struct CacheEvictor {
    signal:     Arc<RecordAddedSignal>,
    strategies: Arc<Vec<Box<dyn EvictionStrategy>>>,
    shutdown:   Arc<AtomicBool>,
    state:      Mutex<(EvictorState, Option<Worker>)>,
}

impl CacheEvictor {
    /// Evictor running the default time and space strategies.
    pub fn new(
        cache:  Arc<BeaconCache>,
        config: CacheConfig,
        timing: Arc<dyn TimingProvider>,
    ) -> Self {
        let strategies: Vec<Box<dyn EvictionStrategy>> = vec![
            Box::new(TimeEvictionStrategy::new(Arc::clone(&cache), config, timing)),
            Box::new(SpaceEvictionStrategy::new(Arc::clone(&cache), config)),
        ];
        Self::with_strategies(&cache, strategies)
    }

    pub fn with_strategies(
        cache:      &BeaconCache,
        strategies: Vec<Box<dyn EvictionStrategy>>,
    ) -> Self {
        CacheEvictor {
            signal:     cache.record_added_signal(),
            strategies: Arc::new(strategies),
            shutdown:   Arc::new(AtomicBool::new(false)),
            state:      Mutex::new((EvictorState::NotStarted, None)),
        }
    }

    pub fn state(&self) -> EvictorState {
        lock(&self.state).0
    }

    pub fn is_alive(&self) -> bool {
        self.state() == EvictorState::Running
    }

    /// Spawn the eviction thread.
    ///
    /// Returns `Ok(false)` if it is already running or was stopped before.
    pub fn start(&self) -> Result<bool> {
        let mut state = lock(&self.state);
        if state.0 != EvictorState::NotStarted {
            debug!("Not starting BeaconCacheEviction thread, state is {:?}", state.0);
            return Ok(false);
        }

        let (done_tx, done_rx) = mpsc::channel::<()>();
        let signal     = Arc::clone(&self.signal);
        let strategies = Arc::clone(&self.strategies);
        let shutdown   = Arc::clone(&self.shutdown);

        let handle = thread::Builder::new()
            .name("BeaconCacheEvictor".into())
            .spawn(move || {
                run_eviction_loop(&signal, &strategies, &shutdown);
                drop(done_tx);
            })?;

        *state = (EvictorState::Running, Some(Worker { handle, done: done_rx }));
        debug!("BeaconCacheEviction thread started");
        Ok(true)
    }

    /// Stop with the default join timeout.
    pub fn stop(&self) -> bool {
        self.stop_with_timeout(EVICTION_THREAD_JOIN_TIMEOUT)
    }

    /// Request shutdown, wake the thread and wait up to `timeout` for it.
    ///
    /// Returns `true` if the thread terminated in time, `false` if it was not
    /// running or is still busy.
    pub fn stop_with_timeout(&self, timeout: Duration) -> bool {
        let mut state = lock(&self.state);
        let Some(worker) = state.1.take() else {
            debug!("Not stopping BeaconCacheEviction thread, since it's not alive");
            return false;
        };

        debug!("Stopping BeaconCacheEviction thread");
        self.shutdown.store(true, Ordering::SeqCst);
        self.signal.wake();

        match worker.done.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if worker.handle.join().is_err() {
                    warn!("BeaconCacheEviction thread panicked");
                }
                state.0 = EvictorState::Stopped;
                true
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!("BeaconCacheEviction thread did not stop within {timeout:?}");
                state.1 = Some(worker);
                false
            }
        }
    }
}

impl Drop for CacheEvictor {
    fn drop(&mut self) {
        if self.is_alive() {
            self.stop();
        }
    }
}

fn run_eviction_loop(
    signal:     &RecordAddedSignal,
    strategies: &[Box<dyn EvictionStrategy>],
    shutdown:   &AtomicBool,
) {
    let is_shutdown = || shutdown.load(Ordering::SeqCst);

    while !is_shutdown() {
        signal.wait(shutdown);
        if is_shutdown() {
            break;
        }
        for strategy in strategies {
            if log_enabled!(Level::Debug) {
                debug!("BeaconCacheEviction running {}", strategy.name());
            }
            strategy.execute(&is_shutdown);
        }
    }

    info!("BeaconCacheEviction thread is stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    struct Counting {
        name:  &'static str,
        runs:  Arc<AtomicUsize>,
        order: Arc<Mutex<Vec<&'static str>>>,
    }

    impl EvictionStrategy for Counting {
        fn name(&self) -> &'static str { self.name }

        fn execute(&self, _is_shutdown: &dyn Fn() -> bool) {
            self.runs.fetch_add(1, Ordering::SeqCst);
            lock(&self.order).push(self.name);
        }
    }

    fn counting_evictor(cache: &BeaconCache) -> (CacheEvictor, Arc<AtomicUsize>, Arc<Mutex<Vec<&'static str>>>) {
        let runs  = Arc::new(AtomicUsize::new(0));
        let order = Arc::new(Mutex::new(Vec::new()));
        let strategies: Vec<Box<dyn EvictionStrategy>> = vec![
            Box::new(Counting { name: "time",  runs: Arc::clone(&runs), order: Arc::clone(&order) }),
            Box::new(Counting { name: "space", runs: Arc::clone(&runs), order: Arc::clone(&order) }),
        ];
        (CacheEvictor::with_strategies(cache, strategies), runs, order)
    }

    fn wait_until(cond: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn start_is_idempotent_and_stop_is_prompt() {
        let cache = BeaconCache::new();
        let (evictor, runs, _) = counting_evictor(&cache);
        assert_eq!(evictor.state(), EvictorState::NotStarted);
        assert!(!evictor.stop());

        assert!(evictor.start().unwrap());
        assert!(!evictor.start().unwrap());
        assert!(evictor.is_alive());

        let started = Instant::now();
        assert!(evictor.stop_with_timeout(Duration::from_secs(2)));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(evictor.state(), EvictorState::Stopped);
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        // a stopped evictor stays stopped
        assert!(!evictor.start().unwrap());
        assert!(!evictor.stop());
    }

    #[test]
    fn record_added_runs_strategies_in_order() {
        let cache = BeaconCache::new();
        let (evictor, runs, order) = counting_evictor(&cache);
        evictor.start().unwrap();

        cache.add_record(1, 0, "data");
        assert!(wait_until(|| runs.load(Ordering::SeqCst) >= 2));
        assert!(evictor.stop());

        let order = lock(&order);
        assert_eq!(&order[..2], &["time", "space"]);
        assert_eq!(order.len() % 2, 0);
    }

    #[test]
    fn evictor_keeps_cache_within_bounds() {
        let cache = Arc::new(BeaconCache::new());
        let timing = Arc::new(crate::testing::ManualTiming::new(0));
        let evictor = CacheEvictor::new(Arc::clone(&cache), CacheConfig::new(0, 20, 40), timing);
        evictor.start().unwrap();

        for ts in 0..10 {
            cache.add_record(1, ts, "0123456789");
        }
        assert!(wait_until(|| cache.num_bytes() <= 40));
        assert!(evictor.stop());
        assert!(cache.num_bytes() <= 40);
    }
}
