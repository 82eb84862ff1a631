//! Listener Module
//!
//! Cache events and the registry of subscribers notified about them.
//!
//! Listeners are invoked synchronously, in registration order, while the
//! cache lock is held. A listener must not call back into the cache that
//! notified it, or it deadlocks.

use std::fmt;
use std::sync::Arc;

use crate::error::CacheError;

// == Event Kind ==
/// Kinds of cache events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// A loaded value was inserted
    Added,
    /// Reserved; TTL-driven removals are reported as [`EventKind::Removed`]
    Expired,
    /// An entry was removed (explicitly, by capacity or by TTL)
    Removed,
    /// An existing entry was returned by `get` or `peek`
    Requested,
    /// `peek` found no entry
    Missed,
    /// An entry's value was replaced
    Replaced,
    /// The loader failed
    Failed,
}

// == Cache Event ==
/// A single notification delivered to listeners.
#[derive(Debug)]
pub struct CacheEvent<'a, K, V> {
    pub kind: EventKind,
    pub key: &'a K,
    /// The value involved, None for `Missed` and `Failed`
    pub value: Option<&'a V>,
    /// The loader error, only for `Failed`
    pub error: Option<&'a CacheError>,
}

// == Listener ==
/// Subscriber to cache events.
///
/// Implemented for every `Fn(&CacheEvent<K, V>)` closure.
pub trait Listener<K, V>: Send + Sync {
    fn on_event(&self, event: &CacheEvent<'_, K, V>);
}

impl<K, V, F> Listener<K, V> for F
where
    F: Fn(&CacheEvent<'_, K, V>) + Send + Sync,
{
    fn on_event(&self, event: &CacheEvent<'_, K, V>) {
        self(event)
    }
}

// == Listener Registry ==
/// Ordered set of listeners, deduplicated by `Arc` identity.
pub(crate) struct ListenerRegistry<K, V> {
    listeners: Vec<Arc<dyn Listener<K, V>>>,
}

impl<K, V> ListenerRegistry<K, V> {
    pub fn new() -> Self {
        Self {
            listeners: Vec::new(),
        }
    }

    /// Registers a listener. Returns false if the same instance is already registered.
    pub fn add(&mut self, listener: Arc<dyn Listener<K, V>>) -> bool {
        if self.contains(&listener) {
            return false;
        }
        self.listeners.push(listener);
        true
    }

    /// Unregisters a listener. Returns false if it was not registered.
    pub fn remove(&mut self, listener: &Arc<dyn Listener<K, V>>) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|l| !same_listener(l, listener));
        self.listeners.len() != before
    }

    pub fn contains(&self, listener: &Arc<dyn Listener<K, V>>) -> bool {
        self.listeners.iter().any(|l| same_listener(l, listener))
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn notify(&self, event: &CacheEvent<'_, K, V>) {
        for listener in &self.listeners {
            listener.on_event(event);
        }
    }
}

impl<K, V> fmt::Debug for ListenerRegistry<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("len", &self.listeners.len())
            .finish()
    }
}

// Compares data pointers only, vtable pointers of the same type may differ.
fn same_listener<K, V>(a: &Arc<dyn Listener<K, V>>, b: &Arc<dyn Listener<K, V>>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}
