//! Cache Entry Module
//!
//! A cached value bound to its single-shot expiry timer.

use std::time::{Duration, Instant};

use tokio::task::AbortHandle;

// == Expiry Timer ==
/// Expiry schedule of one cache entry.
///
/// The `ticket` identifies the insertion that created the timer, so an
/// expiration signal can be matched against the entry currently stored
/// under the same key. Dropping the timer aborts its scheduled task.
#[derive(Debug)]
pub(crate) struct ExpiryTimer {
    ticket: u64,
    /// None when the TTL is too large to be represented (never expires)
    deadline: Option<Instant>,
    task: Option<AbortHandle>,
}

impl ExpiryTimer {
    // == Constructor ==
    /// Creates an unarmed timer expiring `ttl` from now.
    pub fn new(ticket: u64, ttl: Duration) -> Self {
        Self {
            ticket,
            deadline: Instant::now().checked_add(ttl),
            task: None,
        }
    }

    pub fn ticket(&self) -> u64 {
        self.ticket
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Returns remaining time before expiry, or None if the entry never expires.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    // == Arm ==
    /// Attaches the scheduled expiry task, aborting any previous one.
    pub fn arm(&mut self, task: AbortHandle) {
        self.disarm();
        self.task = Some(task);
    }

    // == Disarm ==
    /// Aborts the scheduled task, keeping the deadline.
    pub fn disarm(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    pub fn is_armed(&self) -> bool {
        self.task.is_some()
    }
}

impl Drop for ExpiryTimer {
    fn drop(&mut self) {
        self.disarm();
    }
}

// == Cache Entry ==
/// A stored value and its expiry timer.
#[derive(Debug)]
pub(crate) struct Entry<V> {
    pub value: V,
    pub timer: ExpiryTimer,
}

impl<V> Entry<V> {
    pub fn new(value: V, timer: ExpiryTimer) -> Self {
        Self { value, timer }
    }
}
