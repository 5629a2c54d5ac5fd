//! Beacon record cache and its background eviction.

pub mod beacon_cache;
pub mod evictor;
pub mod record;
pub mod signal;
pub mod strategy;

pub use beacon_cache::BeaconCache;
pub use evictor::{CacheEvictor, EvictorState};
pub use record::BeaconCacheRecord;
pub use strategy::{EvictionStrategy, SpaceEvictionStrategy, TimeEvictionStrategy};
