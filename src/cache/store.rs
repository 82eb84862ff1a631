//! Cache Store Module
//!
//! Read-through cache engine combining an insertion-ordered store with
//! per-entry expiry timers, FIFO capacity eviction and synchronous
//! listener notification, all under one upgradable lock.

use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};

use crate::cache::entry::{Entry, ExpiryTimer};
use crate::cache::listener::{CacheEvent, EventKind, Listener, ListenerRegistry};
use crate::cache::stats::{CacheStats, StatsRecorder};
use crate::config::CacheConfig;
use crate::error::{CacheError, Result};
use crate::lock::UpgradableRwLock;
use crate::tasks::{spawn_expiry_worker, Expiration, ExpiryScheduler, ExpirySink};

type Loader<K, V> = Box<dyn Fn(&K) -> anyhow::Result<V> + Send + Sync>;

// == Cache State ==
/// Everything guarded by the cache lock.
struct CacheState<K, V> {
    /// Entries in insertion order, oldest first
    entries: IndexMap<K, Entry<V>>,
    max_capacity: Option<usize>,
    ttl: Duration,
    loader: Option<Loader<K, V>>,
    listeners: ListenerRegistry<K, V>,
    /// Present while the expiry worker runs
    scheduler: Option<ExpiryScheduler<K>>,
    next_ticket: u64,
}

impl<K, V> CacheState<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Clone,
{
    fn new(config: &CacheConfig) -> Self {
        Self {
            entries: IndexMap::new(),
            max_capacity: config.max_capacity,
            ttl: config.ttl,
            loader: None,
            listeners: ListenerRegistry::new(),
            scheduler: None,
            next_ticket: 0,
        }
    }

    fn notify(&self, kind: EventKind, key: &K, value: Option<&V>, error: Option<&CacheError>) {
        self.listeners.notify(&CacheEvent {
            kind,
            key,
            value,
            error,
        });
    }

    // == Timers ==
    /// Creates the timer for a new entry, armed if the worker runs.
    fn new_timer(&mut self, key: &K) -> ExpiryTimer {
        self.next_ticket += 1;
        let mut timer = ExpiryTimer::new(self.next_ticket, self.ttl);
        if let (Some(scheduler), Some(deadline)) = (&self.scheduler, timer.deadline()) {
            timer.arm(scheduler.schedule(key.clone(), timer.ticket(), deadline));
            debug!(ticket = timer.ticket(), "Armed expiry timer");
        }
        timer
    }

    /// Arms the timers of entries inserted while the worker was not running.
    fn arm_timers(&mut self) {
        let Some(scheduler) = &self.scheduler else {
            return;
        };
        for (key, entry) in self.entries.iter_mut() {
            if entry.timer.is_armed() {
                continue;
            }
            if let Some(deadline) = entry.timer.deadline() {
                let ticket = entry.timer.ticket();
                entry.timer.arm(scheduler.schedule(key.clone(), ticket, deadline));
                debug!(ticket, remaining = ?entry.timer.remaining(), "Armed pending expiry timer");
            }
        }
    }

    /// Drops the scheduler and cancels every timer. Returns false if it was not running.
    fn halt(&mut self) -> bool {
        if self.scheduler.take().is_none() {
            return false;
        }
        for entry in self.entries.values_mut() {
            entry.timer.disarm();
        }
        true
    }

    // == Eviction ==
    /// Evicts the oldest entries until at most `limit` remain.
    fn shrink_to(&mut self, limit: usize, stats: &StatsRecorder) {
        while self.entries.len() > limit {
            let Some((key, entry)) = self.entries.shift_remove_index(0) else {
                break;
            };
            stats.record_eviction();
            debug!(ticket = entry.timer.ticket(), "Evicted oldest entry to stay within capacity");
            self.notify(EventKind::Removed, &key, Some(&entry.value), None);
        }
    }

    // == Load ==
    /// Loads a missing key and inserts it. Caller holds exclusive access.
    fn load(&mut self, key: &K, stats: &StatsRecorder) -> Result<V> {
        let loaded = match &self.loader {
            Some(loader) => loader(key).map_err(CacheError::from),
            None => Err(CacheError::LoaderNotDefined),
        };

        match loaded {
            Ok(value) => {
                stats.record_load();
                self.insert(key.clone(), value.clone(), stats);
                Ok(value)
            }
            Err(err) => {
                stats.record_load_failure();
                warn!("Cache loader failed: {}", err);
                self.notify(EventKind::Failed, key, None, Some(&err));
                Err(err)
            }
        }
    }

    fn insert(&mut self, key: K, value: V, stats: &StatsRecorder) {
        match self.max_capacity {
            Some(0) => {
                debug!("Zero capacity, loaded value is not retained");
                return;
            }
            Some(capacity) => self.shrink_to(capacity - 1, stats),
            None => {}
        }

        let timer = self.new_timer(&key);
        let (index, _) = self.entries.insert_full(key, Entry::new(value, timer));
        if let Some((key, entry)) = self.entries.get_index(index) {
            self.notify(EventKind::Added, key, Some(&entry.value), None);
        }
    }

    // == Replace ==
    /// Overwrites the value in place, keeping its timer and position.
    fn replace(&mut self, key: &K, value: V) -> bool {
        match self.entries.get_mut(key) {
            Some(entry) => entry.value = value,
            None => return false,
        }
        if let Some(entry) = self.entries.get(key) {
            self.notify(EventKind::Replaced, key, Some(&entry.value), None);
        }
        true
    }

    // == Remove ==
    /// Removes an entry, dropping (and so cancelling) its timer.
    fn remove_entry(&mut self, key: &K) -> bool {
        match self.entries.shift_remove(key) {
            Some(entry) => {
                self.notify(EventKind::Removed, key, Some(&entry.value), None);
                true
            }
            None => false,
        }
    }

    fn clear(&mut self, stats: &StatsRecorder) {
        for (key, entry) in std::mem::take(&mut self.entries) {
            stats.record_removal();
            self.notify(EventKind::Removed, &key, Some(&entry.value), None);
        }
    }
}

// == Shared ==
struct Shared<K, V> {
    state: UpgradableRwLock<CacheState<K, V>>,
    started: AtomicBool,
    discarded: AtomicBool,
    shutdown: Arc<Notify>,
    stats: StatsRecorder,
}

impl<K, V> Shared<K, V> {
    fn assert_usable(&self) {
        assert!(
            !self.discarded.load(Ordering::SeqCst),
            "ExpiryCache used after discard"
        );
    }
}

impl<K, V> ExpirySink<K> for Shared<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn expire(&self, expiration: Expiration<K>) {
        if self.discarded.load(Ordering::SeqCst) {
            return;
        }
        self.state.write_section(|state| {
            let current = state
                .entries
                .get(&expiration.key)
                .map(|entry| entry.timer.ticket());
            if current != Some(expiration.ticket) {
                debug!(ticket = expiration.ticket, "Ignoring stale expiration");
                return;
            }
            state.remove_entry(&expiration.key);
            self.stats.record_expiration();
            debug!(ticket = expiration.ticket, "Removed expired entry");
        });
    }
}

impl<K, V> Drop for Shared<K, V> {
    fn drop(&mut self) {
        self.shutdown.notify_one();
    }
}

// == Expiry Cache ==
/// Concurrent read-through cache with per-entry TTL and FIFO capacity eviction.
///
/// Cloning yields another handle to the same cache.
///
/// All operations serialize through one [`UpgradableRwLock`]. `get` checks
/// for the key under the upgradable read slot and upgrades to exclusive
/// access only on a miss, so check-load-insert is atomic. The loader and
/// the listeners run inside that section: a slow loader blocks every other
/// caller, and a listener must not call back into the cache.
///
/// # Panics
/// Lifecycle misuse is fatal: starting twice, configuring after start, or
/// calling anything but the read-only accessors after [`discard`](Self::discard).
pub struct ExpiryCache<K, V> {
    shared: Arc<Shared<K, V>>,
}

impl<K, V> Clone for ExpiryCache<K, V> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<K, V> ExpiryCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    // == Constructors ==
    /// Creates an unbounded cache whose entries never expire and without loader.
    pub fn new() -> Self {
        Self::from_config(&CacheConfig::default())
    }

    /// Creates a cache with the capacity and TTL of `config`, without loader.
    ///
    /// # Arguments
    /// * `config` - Capacity bound and time-to-live
    pub fn from_config(config: &CacheConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: UpgradableRwLock::new(CacheState::new(config)),
                started: AtomicBool::new(false),
                discarded: AtomicBool::new(false),
                shutdown: Arc::new(Notify::new()),
                stats: StatsRecorder::default(),
            }),
        }
    }

    // == Configuration ==
    fn configure(&self, f: impl FnOnce(&mut CacheState<K, V>, &StatsRecorder)) {
        let shared = &*self.shared;
        shared.state.write_section(|state| {
            shared.assert_usable();
            assert!(
                !shared.started.load(Ordering::SeqCst),
                "ExpiryCache configuration is immutable once started"
            );
            f(state, &shared.stats);
        });
    }

    /// Sets the maximum number of entries, `None` for unbounded.
    ///
    /// Inserting beyond capacity evicts the oldest entry. Entries already
    /// above the new bound are evicted right away.
    ///
    /// # Arguments
    /// * `max_capacity` - Entry bound, or `None`
    pub fn with_max_capacity(self, max_capacity: impl Into<Option<usize>>) -> Self {
        let max_capacity = max_capacity.into();
        self.configure(|state, stats| {
            state.max_capacity = max_capacity;
            if let Some(capacity) = max_capacity {
                state.shrink_to(capacity, stats);
            }
        });
        self
    }

    /// Sets the time-to-live of entries inserted from now on.
    ///
    /// [`ETERNITY`](crate::ETERNITY), or any duration too large to add to
    /// the current instant, means entries never expire.
    ///
    /// # Arguments
    /// * `ttl` - Time-to-live measured from insertion
    pub fn expire_after(self, ttl: Duration) -> Self {
        self.configure(|state, _| state.ttl = ttl);
        self
    }

    /// Sets the loader invoked by [`get`](Self::get) for missing keys.
    ///
    /// # Arguments
    /// * `loader` - Produces the value of a key, its error is wrapped in [`CacheError::Load`]
    pub fn with_loader<F>(self, loader: F) -> Self
    where
        F: Fn(&K) -> anyhow::Result<V> + Send + Sync + 'static,
    {
        self.configure(|state, _| state.loader = Some(Box::new(loader)));
        self
    }

    /// Registers a listener before the cache is started.
    ///
    /// Once started, use [`add_listener`](Self::add_listener) instead.
    ///
    /// # Arguments
    /// * `listener` - Subscriber, identified by its `Arc` pointer
    pub fn with_listener(self, listener: Arc<dyn Listener<K, V>>) -> Self {
        self.configure(|state, _| {
            state.listeners.add(listener);
        });
        self
    }

    // == Listeners ==
    /// Registers a listener. Returns false if this instance is already registered.
    ///
    /// Allowed at any time until the cache is discarded.
    ///
    /// # Arguments
    /// * `listener` - Subscriber, identified by its `Arc` pointer
    pub fn add_listener(&self, listener: Arc<dyn Listener<K, V>>) -> bool {
        let shared = &*self.shared;
        shared.state.write_section(|state| {
            shared.assert_usable();
            state.listeners.add(listener)
        })
    }

    /// Unregisters a listener. Returns false if it was not registered.
    ///
    /// # Arguments
    /// * `listener` - The same `Arc` that was registered
    pub fn remove_listener(&self, listener: &Arc<dyn Listener<K, V>>) -> bool {
        let shared = &*self.shared;
        shared.state.write_section(|state| {
            shared.assert_usable();
            state.listeners.remove(listener)
        })
    }

    /// Returns the number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.shared.state.read_section(|state| state.listeners.len())
    }

    // == Get ==
    /// Returns the value for `key`, loading and inserting it if absent.
    ///
    /// A hit emits `Requested`. A miss calls the loader under exclusive
    /// access: on success the oldest entries are evicted as needed, the
    /// value is inserted with a fresh timer and `Added` is emitted; on
    /// failure `Failed` is emitted and nothing is inserted.
    ///
    /// # Arguments
    /// * `key` - The key to look up or load
    ///
    /// # Returns
    /// The cached or loaded value, or the loader's error
    pub fn get(&self, key: &K) -> Result<V> {
        let shared = &*self.shared;
        shared.state.maybe_write_section(|guard| {
            shared.assert_usable();
            if let Some(entry) = guard.entries.get(key) {
                let value = entry.value.clone();
                shared.stats.record_hit();
                guard.notify(EventKind::Requested, key, Some(&value), None);
                return Ok(value);
            }

            shared.stats.record_miss();
            // Exclusive from here on, so the key is still absent.
            guard.upgrade().load(key, &shared.stats)
        })
    }

    // == Peek ==
    /// Returns the value for `key` without loading it.
    ///
    /// Emits `Requested` on a hit and `Missed` otherwise.
    ///
    /// # Arguments
    /// * `key` - The key to look up
    pub fn peek(&self, key: &K) -> Option<V> {
        let shared = &*self.shared;
        shared.state.read_section(|state| {
            shared.assert_usable();
            match state.entries.get(key) {
                Some(entry) => {
                    shared.stats.record_hit();
                    state.notify(EventKind::Requested, key, Some(&entry.value), None);
                    Some(entry.value.clone())
                }
                None => {
                    shared.stats.record_miss();
                    state.notify(EventKind::Missed, key, None, None);
                    None
                }
            }
        })
    }

    /// Checks whether `key` is present, without loading or emitting events.
    ///
    /// # Arguments
    /// * `key` - The key to check
    pub fn contains_key(&self, key: &K) -> bool {
        let shared = &*self.shared;
        shared.state.read_section(|state| {
            shared.assert_usable();
            state.entries.contains_key(key)
        })
    }

    // == Replace ==
    /// Replaces the value of an existing entry.
    ///
    /// The entry keeps its original expiry deadline. Returns false, without
    /// taking exclusive access, if the key is absent.
    ///
    /// # Arguments
    /// * `key` - The key of the entry to update
    /// * `value` - The new value
    pub fn replace(&self, key: &K, value: V) -> bool {
        let shared = &*self.shared;
        shared.state.maybe_write_section(|guard| {
            shared.assert_usable();
            if !guard.entries.contains_key(key) {
                return false;
            }
            guard.upgrade().replace(key, value)
        })
    }

    // == Remove ==
    /// Removes an entry and cancels its timer. Returns false if absent.
    ///
    /// # Arguments
    /// * `key` - The key to remove
    pub fn remove(&self, key: &K) -> bool {
        let shared = &*self.shared;
        shared.state.write_section(|state| {
            shared.assert_usable();
            let removed = state.remove_entry(key);
            if removed {
                shared.stats.record_removal();
            }
            removed
        })
    }

    /// Removes every entry, emitting `Removed` for each in insertion order.
    pub fn clear(&self) {
        let shared = &*self.shared;
        shared.state.write_section(|state| {
            shared.assert_usable();
            state.clear(&shared.stats);
        });
    }

    // == Lifecycle ==
    /// Starts the expiry worker on the current tokio runtime.
    ///
    /// # Panics
    /// If called twice, after discard, or outside a tokio runtime.
    pub fn start(&self) {
        self.start_on(&Handle::current());
    }

    /// Starts the expiry worker on the given runtime.
    ///
    /// Timers of entries inserted before the start are armed with their
    /// original deadlines.
    ///
    /// # Arguments
    /// * `runtime` - Runtime hosting the worker and the timer tasks
    ///
    /// # Panics
    /// If called twice or after discard.
    pub fn start_on(&self, runtime: &Handle) {
        let shared = &self.shared;
        let (sender, receiver) = mpsc::unbounded_channel();
        shared.state.write_section(|state| {
            shared.assert_usable();
            assert!(
                !shared.started.swap(true, Ordering::SeqCst),
                "ExpiryCache already started"
            );
            state.scheduler = Some(ExpiryScheduler::new(runtime.clone(), sender));
            state.arm_timers();
        });
        spawn_expiry_worker(
            Arc::downgrade(shared),
            receiver,
            Arc::clone(&shared.shutdown),
            runtime,
        );
        info!("Expiry cache started");
    }

    /// Stops the expiry worker. Entries are kept and no longer expire.
    pub fn stop(&self) {
        let shared = &*self.shared;
        let was_running = shared.state.write_section(|state| {
            shared.assert_usable();
            state.halt()
        });
        if was_running {
            shared.shutdown.notify_one();
            info!("Expiry cache stopped");
        }
    }

    /// Clears the cache, stops the worker and makes this cache unusable.
    pub fn discard(&self) {
        let shared = &*self.shared;
        let was_running = shared.state.write_section(|state| {
            shared.assert_usable();
            state.clear(&shared.stats);
            let was_running = state.halt();
            shared.discarded.store(true, Ordering::SeqCst);
            was_running
        });
        if was_running {
            shared.shutdown.notify_one();
        }
        info!("Expiry cache discarded");
    }

    // == Accessors ==
    /// Returns the maximum number of entries, `None` if unbounded.
    pub fn capacity(&self) -> Option<usize> {
        self.shared.state.read_section(|state| state.max_capacity)
    }

    /// Returns the time-to-live applied to new entries.
    pub fn expire_time(&self) -> Duration {
        self.shared.state.read_section(|state| state.ttl)
    }

    /// Returns the current number of entries in the cache.
    pub fn len(&self) -> usize {
        self.shared.state.read_section(|state| state.entries.len())
    }

    /// Returns true if the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns current cache statistics.
    pub fn stats(&self) -> CacheStats {
        self.shared.stats.snapshot(self.len())
    }

    /// True once `start` has been called, even after `stop`.
    pub fn is_started(&self) -> bool {
        self.shared.started.load(Ordering::SeqCst)
    }

    /// True between `start` and `stop` (or `discard`).
    pub fn is_running(&self) -> bool {
        self.shared
            .state
            .read_section(|state| state.scheduler.is_some())
    }

    /// True once `discard` has been called.
    pub fn is_discarded(&self) -> bool {
        self.shared.discarded.load(Ordering::SeqCst)
    }
}

impl<K, V> Default for ExpiryCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> fmt::Debug for ExpiryCache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExpiryCache")
            .field("started", &self.shared.started.load(Ordering::SeqCst))
            .field("discarded", &self.shared.discarded.load(Ordering::SeqCst))
            .field("lock", &self.shared.state)
            .finish_non_exhaustive()
    }
}
