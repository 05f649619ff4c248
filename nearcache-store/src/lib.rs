//! Near Cache Store - Local Storage Layer
//!
//! The leaf components of the near cache:
//!
//! - [`CacheStore`]: bounded key/value store with LRU/LFU/random eviction,
//!   time-to-live and idle expiry, and lifetime statistics.
//! - [`KeyStateMarker`]: fixed slot array of tri-state marks used to detect an
//!   invalidation racing an in-flight remote read.
//! - [`GuardedCacheStore`]: the two composed, so that populates and
//!   invalidations for the same key are linearized.

pub mod guarded;
pub mod marker;
pub mod stats;
pub mod store;

pub use guarded::GuardedCacheStore;
pub use marker::{AlwaysSucceedingMarker, KeyState, KeyStateMarker, StripedKeyStateMarker};
pub use stats::CacheStatistics;
pub use store::{CacheKey, CacheLookup, CacheStore, CacheValue};
