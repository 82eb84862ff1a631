//! Raw Upgradable Lock
//!
//! Data-less reader/writer state machine with an upgradable read slot,
//! built on a `Mutex` guarded state and a single `Condvar`.
//!
//! The writer slot is shared between plain writers and the upgradable
//! reader, so holding it excludes every other writer. Readers are turned
//! away only once a writer has *announced* itself, which happens
//! immediately for plain writers and on `upgrade_to_write` for the
//! upgradable holder. An announced writer then waits for admitted
//! readers to drain.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

// == Writer Slot ==
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Free,
    Writer,
    Upgradable,
}

#[derive(Debug)]
struct State {
    /// Admitted plain readers (the upgradable holder is not counted)
    readers: usize,
    slot: Slot,
    /// A writer is draining readers or already exclusive
    writer_announced: bool,
}

// == Lock State ==
/// Observable state of an upgradable lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    /// Nobody holds the lock
    Unlocked,
    /// `n` plain readers hold the lock
    Shared(usize),
    /// The upgradable slot is held without upgrade, alongside `readers` readers
    UpgradePending { readers: usize },
    /// A writer (plain or upgraded) owns the lock or is draining readers
    Exclusive,
}

// == Raw Upgradable Lock ==
/// Reader/writer lock supporting promotion of an upgradable read to an
/// exclusive write without releasing the lock in between.
///
/// The lock is not reentrant. A thread that holds a read lock and then
/// upgrades, or that calls back into the lock from inside a section,
/// deadlocks.
#[derive(Debug)]
pub struct RawUpgradableLock {
    state: Mutex<State>,
    changed: Condvar,
}

impl RawUpgradableLock {
    /// Creates an unlocked lock with no readers.
    pub const fn new() -> Self {
        Self {
            state: Mutex::new(State {
                readers: 0,
                slot: Slot::Free,
                writer_announced: false,
            }),
            changed: Condvar::new(),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        // Nothing panics while the state mutex is held.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait_while<'a>(
        &self,
        guard: MutexGuard<'a, State>,
        condition: impl FnMut(&mut State) -> bool,
    ) -> MutexGuard<'a, State> {
        self.changed
            .wait_while(guard, condition)
            .unwrap_or_else(PoisonError::into_inner)
    }

    // == Shared Access ==
    /// Acquires shared access, blocking while a writer is announced.
    pub fn read_lock(&self) {
        let state = self.state();
        let mut state = self.wait_while(state, |s| s.writer_announced);
        state.readers += 1;
    }

    /// Releases one shared access.
    pub fn read_unlock(&self) {
        let mut state = self.state();
        debug_assert!(state.readers > 0, "read_unlock without read_lock");
        state.readers -= 1;
        if state.readers == 0 && state.writer_announced {
            self.changed.notify_all();
        }
    }

    // == Exclusive Access ==
    /// Acquires exclusive access.
    ///
    /// Waits for the writer slot (held by another writer or by an
    /// upgradable reader), announces itself and waits for readers to drain.
    pub fn lock(&self) {
        let state = self.state();
        let mut state = self.wait_while(state, |s| s.slot != Slot::Free);
        state.slot = Slot::Writer;
        state.writer_announced = true;
        let _state = self.wait_while(state, |s| s.readers > 0);
    }

    /// Releases exclusive access.
    pub fn unlock(&self) {
        let mut state = self.state();
        debug_assert_eq!(state.slot, Slot::Writer, "unlock without lock");
        state.slot = Slot::Free;
        state.writer_announced = false;
        self.changed.notify_all();
    }

    // == Upgradable Access ==
    /// Acquires the single upgradable read slot.
    ///
    /// Plain writers are blocked from now on, new readers are still admitted.
    pub fn upgradable_read_lock(&self) {
        let state = self.state();
        let mut state = self.wait_while(state, |s| s.slot != Slot::Free);
        state.slot = Slot::Upgradable;
    }

    /// Promotes the upgradable slot to exclusive access.
    ///
    /// Must only be called by the current upgradable holder, at most once.
    pub fn upgrade_to_write(&self) {
        let mut state = self.state();
        debug_assert_eq!(state.slot, Slot::Upgradable, "upgrade without upgradable slot");
        debug_assert!(!state.writer_announced, "upgrade called twice");
        state.writer_announced = true;
        let _state = self.wait_while(state, |s| s.readers > 0);
    }

    /// Releases the upgradable slot, upgraded or not.
    pub fn upgradable_unlock(&self) {
        let mut state = self.state();
        debug_assert_eq!(state.slot, Slot::Upgradable, "upgradable_unlock without slot");
        state.slot = Slot::Free;
        state.writer_announced = false;
        self.changed.notify_all();
    }

    // == Introspection ==
    /// Returns a snapshot of the current lock state.
    pub fn lock_state(&self) -> LockState {
        let state = self.state();
        match (state.slot, state.writer_announced) {
            (_, true) => LockState::Exclusive,
            (Slot::Upgradable, false) => LockState::UpgradePending {
                readers: state.readers,
            },
            _ if state.readers > 0 => LockState::Shared(state.readers),
            _ => LockState::Unlocked,
        }
    }
}

impl Default for RawUpgradableLock {
    fn default() -> Self {
        Self::new()
    }
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    const ITERS: usize = 10;
    const SETTLE: Duration = Duration::from_millis(50);

    #[test]
    fn test_new_lock_is_unlocked() {
        let rw = RawUpgradableLock::new();
        assert_eq!(rw.lock_state(), LockState::Unlocked);
    }

    #[test]
    fn test_state_transitions() {
        let rw = RawUpgradableLock::new();

        rw.read_lock();
        rw.read_lock();
        assert_eq!(rw.lock_state(), LockState::Shared(2));

        rw.read_unlock();
        rw.read_unlock();
        rw.upgradable_read_lock();
        assert_eq!(rw.lock_state(), LockState::UpgradePending { readers: 0 });

        rw.read_lock();
        assert_eq!(rw.lock_state(), LockState::UpgradePending { readers: 1 });
        rw.read_unlock();

        rw.upgrade_to_write();
        assert_eq!(rw.lock_state(), LockState::Exclusive);

        rw.upgradable_unlock();
        assert_eq!(rw.lock_state(), LockState::Unlocked);

        rw.lock();
        assert_eq!(rw.lock_state(), LockState::Exclusive);
        rw.unlock();
        assert_eq!(rw.lock_state(), LockState::Unlocked);
    }

    #[test]
    fn test_no_upgrade_with_write_lock() {
        let rw = RawUpgradableLock::new();
        let acquired = AtomicUsize::new(0);

        rw.lock();
        thread::scope(|s| {
            s.spawn(|| {
                rw.upgradable_read_lock();
                acquired.fetch_add(1, Ordering::SeqCst);
                rw.upgradable_unlock();
            });
            thread::sleep(SETTLE);
            assert_eq!(acquired.load(Ordering::SeqCst), 0);
            rw.unlock();
        });
        assert_eq!(acquired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_no_write_lock_while_upgradable_held() {
        let rw = RawUpgradableLock::new();
        let acquired = AtomicUsize::new(0);

        rw.upgradable_read_lock();
        thread::scope(|s| {
            s.spawn(|| {
                rw.lock();
                acquired.fetch_add(1, Ordering::SeqCst);
                rw.unlock();
            });
            thread::sleep(SETTLE);
            assert_eq!(acquired.load(Ordering::SeqCst), 0);

            rw.upgrade_to_write();
            thread::sleep(SETTLE);
            assert_eq!(acquired.load(Ordering::SeqCst), 0);
            rw.upgradable_unlock();
        });
        assert_eq!(acquired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_multiple_readers_before_upgradable_read() {
        let rw = RawUpgradableLock::new();
        let (done_tx, done_rx) = mpsc::channel();

        thread::scope(|s| {
            s.spawn(|| {
                rw.read_lock();
                rw.read_lock();
                rw.upgradable_read_lock();
                rw.upgradable_unlock();
                rw.read_unlock();
                rw.read_unlock();
                done_tx.send(()).unwrap();
            });
            done_rx
                .recv_timeout(SETTLE)
                .expect("readers must not block the upgradable slot");
        });
    }

    #[test]
    fn test_multiple_readers_after_upgradable_read() {
        let rw = RawUpgradableLock::new();
        let admitted = AtomicUsize::new(0);

        rw.upgradable_read_lock();
        thread::scope(|s| {
            for _ in 0..ITERS {
                s.spawn(|| {
                    rw.read_lock();
                    admitted.fetch_add(1, Ordering::SeqCst);
                    rw.read_unlock();
                });
            }
        });
        assert_eq!(admitted.load(Ordering::SeqCst), ITERS);
        rw.upgradable_unlock();
    }

    #[test]
    fn test_no_reads_after_upgrade() {
        let rw = RawUpgradableLock::new();
        let admitted = AtomicUsize::new(0);

        rw.upgradable_read_lock();
        rw.upgrade_to_write();
        thread::scope(|s| {
            s.spawn(|| {
                rw.read_lock();
                admitted.fetch_add(1, Ordering::SeqCst);
                rw.read_unlock();
            });
            thread::sleep(SETTLE);
            assert_eq!(admitted.load(Ordering::SeqCst), 0);
            rw.upgradable_unlock();
        });
        assert_eq!(admitted.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_upgrade_waits_for_admitted_readers() {
        let rw = RawUpgradableLock::new();
        let upgraded = AtomicUsize::new(0);

        rw.read_lock();
        rw.upgradable_read_lock();
        thread::scope(|s| {
            s.spawn(|| {
                rw.upgrade_to_write();
                upgraded.fetch_add(1, Ordering::SeqCst);
                rw.upgradable_unlock();
            });
            thread::sleep(SETTLE);
            assert_eq!(upgraded.load(Ordering::SeqCst), 0);
            assert_eq!(rw.lock_state(), LockState::Exclusive);
            rw.read_unlock();
        });
        assert_eq!(upgraded.load(Ordering::SeqCst), 1);
        assert_eq!(rw.lock_state(), LockState::Unlocked);
    }

    #[test]
    fn test_no_double_upgradable_slot() {
        let rw = RawUpgradableLock::new();
        let acquired = AtomicUsize::new(0);

        rw.read_lock();
        rw.read_lock();
        rw.upgradable_read_lock();
        thread::scope(|s| {
            s.spawn(|| {
                rw.upgradable_read_lock();
                acquired.fetch_add(1, Ordering::SeqCst);
                rw.upgradable_unlock();
            });
            thread::sleep(SETTLE);
            assert_eq!(acquired.load(Ordering::SeqCst), 0);
            rw.upgradable_unlock();
        });
        assert_eq!(acquired.load(Ordering::SeqCst), 1);
        rw.read_unlock();
        rw.read_unlock();
    }

    #[test]
    fn test_writer_waits_for_readers() {
        let rw = RawUpgradableLock::new();
        let acquired = AtomicUsize::new(0);

        rw.read_lock();
        thread::scope(|s| {
            s.spawn(|| {
                rw.lock();
                acquired.fetch_add(1, Ordering::SeqCst);
                rw.unlock();
            });
            thread::sleep(SETTLE);
            assert_eq!(acquired.load(Ordering::SeqCst), 0);
            rw.read_unlock();
        });
        assert_eq!(acquired.load(Ordering::SeqCst), 1);
    }
}
