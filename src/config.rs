//! Configuration Module
//!
//! Capacity and time-to-live settings for an [`ExpiryCache`](crate::ExpiryCache),
//! optionally loaded from environment variables.

use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// TTL value at which entries never expire.
pub const ETERNITY: Duration = Duration::MAX;

/// Cache configuration parameters.
///
/// Both values are fixed once the cache is started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum number of entries, `None` for unbounded
    pub max_capacity: Option<usize>,
    /// Time-to-live of every entry, [`ETERNITY`] to never expire
    pub ttl: Duration,
}

impl CacheConfig {
    /// Creates a new CacheConfig by loading values from environment variables.
    ///
    /// # Environment Variables
    /// - `EXPIRY_CACHE_MAX_CAPACITY` - Maximum entries, negative for unbounded (default: unbounded)
    /// - `EXPIRY_CACHE_TTL_MS` - Entry TTL in milliseconds (default: never expire)
    pub fn from_env() -> Self {
        let max_capacity = env::var("EXPIRY_CACHE_MAX_CAPACITY")
            .ok()
            .and_then(|v| v.parse::<i64>().ok())
            .and_then(|v| usize::try_from(v).ok());
        let ttl = env::var("EXPIRY_CACHE_TTL_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(ETERNITY);

        Self { max_capacity, ttl }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_capacity: None,
            ttl: ETERNITY,
        }
    }
}
