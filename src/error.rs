//! Error types for the expiry cache
//!
//! Loader failures are the only recoverable errors. Lifecycle misuse
//! (double start, use after discard) panics instead.

use thiserror::Error;

// == Cache Error Enum ==
/// Error returned by [`ExpiryCache::get`](crate::ExpiryCache::get).
#[derive(Error, Debug)]
pub enum CacheError {
    /// No loader was configured for the cache
    #[error("loader not defined")]
    LoaderNotDefined,

    /// The configured loader failed to produce a value
    #[error("failed to load value: {0}")]
    Load(#[source] anyhow::Error),
}

impl From<anyhow::Error> for CacheError {
    fn from(err: anyhow::Error) -> Self {
        CacheError::Load(err)
    }
}

// == Result Type Alias ==
/// Convenience Result type for cache operations.
pub type Result<T> = std::result::Result<T, CacheError>;
