//! Cache Module
//!
//! Provides the read-through cache with per-entry TTL expiration, FIFO
//! capacity eviction and event listeners.

mod entry;
mod listener;
mod stats;
mod store;


// Re-export public types
pub use listener::{CacheEvent, EventKind, Listener};
pub use stats::CacheStats;
pub use store::ExpiryCache;
