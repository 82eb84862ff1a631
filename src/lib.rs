//! Expiry Cache - A concurrent read-through cache with per-entry TTL
//!
//! Values are produced on demand by a user-supplied loader, kept in
//! insertion order, evicted oldest-first when over capacity and removed by
//! a background tokio task once their time-to-live elapses.

pub mod cache;
pub mod config;
pub mod error;
pub mod lock;
mod tasks;

pub use cache::{CacheEvent, CacheStats, EventKind, ExpiryCache, Listener};
pub use config::{CacheConfig, ETERNITY};
pub use error::{CacheError, Result};
pub use lock::{LockState, UpgradableRwLock};
