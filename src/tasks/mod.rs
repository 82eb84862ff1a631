//! Background Tasks Module
//!
//! Contains the background task that owns TTL-driven eviction.
//!
//! # Tasks
//! - Expiry worker: removes entries whose timers have fired

mod expiry;

pub(crate) use expiry::{spawn_expiry_worker, Expiration, ExpiryScheduler, ExpirySink};
