//! Upgradable Lock Module
//!
//! A reader/writer lock whose single upgradable reader can promote itself
//! to an exclusive writer without ever releasing the lock. This makes
//! "check presence, then load and insert" one critical section.
//!
//! [`UpgradableRwLock`] owns its data and hands out RAII guards.
//! [`RawUpgradableLock`] is the underlying data-less state machine.

mod raw;

pub use raw::{LockState, RawUpgradableLock};

use std::cell::UnsafeCell;
use std::fmt;
use std::ops::{Deref, DerefMut};

// == Upgradable RwLock ==
/// Reader/writer lock protecting a `T`, with an upgradable read mode.
///
/// Any number of [`ReadGuard`]s may coexist with one [`UpgradableGuard`].
/// Once the upgradable guard calls [`UpgradableGuard::upgrade`] it waits
/// for the admitted readers to leave and then has exclusive access.
pub struct UpgradableRwLock<T> {
    raw: RawUpgradableLock,
    data: UnsafeCell<T>,
}

// SAFETY: access to `data` is mediated by `raw`, which hands out either
// shared access or a single exclusive access, like `std::sync::RwLock`.
unsafe impl<T: Send> Send for UpgradableRwLock<T> {}
unsafe impl<T: Send + Sync> Sync for UpgradableRwLock<T> {}

impl<T> UpgradableRwLock<T> {
    /// Creates an unlocked lock protecting `value`.
    ///
    /// # Arguments
    /// * `value` - The data to protect
    pub const fn new(value: T) -> Self {
        Self {
            raw: RawUpgradableLock::new(),
            data: UnsafeCell::new(value),
        }
    }

    // == Guards ==
    /// Acquires shared read access.
    pub fn read(&self) -> ReadGuard<'_, T> {
        self.raw.read_lock();
        ReadGuard { lock: self }
    }

    /// Acquires exclusive write access.
    pub fn write(&self) -> WriteGuard<'_, T> {
        self.raw.lock();
        WriteGuard { lock: self }
    }

    /// Acquires the upgradable read slot.
    pub fn upgradable_read(&self) -> UpgradableGuard<'_, T> {
        self.raw.upgradable_read_lock();
        UpgradableGuard {
            lock: self,
            upgraded: false,
        }
    }

    // == Sections ==
    /// Runs `f` with shared access.
    pub fn read_section<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        let guard = self.read();
        f(&guard)
    }

    /// Runs `f` with exclusive access.
    pub fn write_section<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut guard = self.write();
        f(&mut guard)
    }

    /// Runs `f` holding the upgradable read slot.
    ///
    /// `f` may call [`UpgradableGuard::upgrade`] to become the exclusive
    /// writer partway through; nothing can interleave between what `f`
    /// observed before the upgrade and what it writes after.
    pub fn maybe_write_section<R>(&self, f: impl FnOnce(&mut UpgradableGuard<'_, T>) -> R) -> R {
        let mut guard = self.upgradable_read();
        f(&mut guard)
    }

    /// Returns a snapshot of the lock state.
    pub fn state(&self) -> LockState {
        self.raw.lock_state()
    }

    /// Consumes the lock and returns the protected data.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: Default> Default for UpgradableRwLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> fmt::Debug for UpgradableRwLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpgradableRwLock")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

// == Read Guard ==
/// Shared access to the data of an [`UpgradableRwLock`].
pub struct ReadGuard<'a, T> {
    lock: &'a UpgradableRwLock<T>,
}

impl<T> Deref for ReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: a read lock is held, no writer can be active.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> Drop for ReadGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.raw.read_unlock();
    }
}

// == Write Guard ==
/// Exclusive access to the data of an [`UpgradableRwLock`].
pub struct WriteGuard<'a, T> {
    lock: &'a UpgradableRwLock<T>,
}

impl<T> Deref for WriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the exclusive lock is held.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for WriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the exclusive lock is held.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for WriteGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.raw.unlock();
    }
}

// == Upgradable Guard ==
/// Upgradable read access to the data of an [`UpgradableRwLock`].
///
/// Dereferences to `&T` at all times. Mutable access is only available
/// after [`upgrade`](Self::upgrade); `DerefMut` panics before that.
pub struct UpgradableGuard<'a, T> {
    lock: &'a UpgradableRwLock<T>,
    upgraded: bool,
}

impl<'a, T> UpgradableGuard<'a, T> {
    /// Promotes this guard to exclusive access, waiting for readers to drain.
    ///
    /// Calling it again after a successful upgrade is a no-op.
    pub fn upgrade(&mut self) -> &mut T {
        if !self.upgraded {
            self.lock.raw.upgrade_to_write();
            self.upgraded = true;
        }
        // SAFETY: upgraded, readers have drained and none are admitted.
        unsafe { &mut *self.lock.data.get() }
    }

    /// Returns true once [`upgrade`](Self::upgrade) has succeeded.
    pub fn is_upgraded(&self) -> bool {
        self.upgraded
    }
}

impl<T> Deref for UpgradableGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: no writer can be active while the upgradable slot is held,
        // and after an upgrade this guard is the only accessor.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for UpgradableGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        assert!(
            self.upgraded,
            "UpgradableGuard must be upgraded before mutable access"
        );
        // SAFETY: see `upgrade`.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for UpgradableGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.raw.upgradable_unlock();
    }
}
