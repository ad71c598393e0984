//! The fat lock: a recursive, GC-aware monitor.
//!
//! State is a single packed word mutated only by compare-exchange: bit 0 is
//! the held flag, the remaining bits count registered waiters. Ownership and
//! recursion live in side fields written only by the thread that won the
//! CAS, so they never race. This is a barging lock: releasing signals one
//! parked waiter but does not hand off ownership, and the woken thread
//! competes with fresh arrivals.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use once_cell::sync::OnceCell;

use crate::error::{Result, SyncError};
use crate::sync::Event;
use crate::thread::{GcSafeScope, Thread};

const LOCKED: u32 = 1;
const WAITER_SHIFT: u32 = 1;
const WAITER: u32 = 1 << WAITER_SHIFT;

/// A woken waiter spins this many iterations before parking again so it can
/// compete with barging acquirers instead of immediately losing its turn.
const WAKE_SPIN: u32 = 16;

/// Upper bound on a single park when no finite deadline applies; each slice
/// re-checks whether the recorded owner is still a live thread.
const ORPHAN_POLL: Duration = Duration::from_millis(250);

#[inline]
fn spin_wait(iteration: u32) {
    if iteration < 10 {
        for _ in 0..(4u32 << iteration.min(6)) {
            std::hint::spin_loop();
        }
    } else {
        std::thread::yield_now();
    }
}

pub struct MonitorLock {
    state: AtomicU32,
    owner: AtomicU32,
    recursion: AtomicU32,
    event: OnceCell<Event>,
}

impl MonitorLock {
    pub const fn new() -> Self {
        Self {
            state: AtomicU32::new(0),
            owner: AtomicU32::new(0),
            recursion: AtomicU32::new(0),
            event: OnceCell::new(),
        }
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        self.state.load(Ordering::Relaxed) & LOCKED != 0
    }

    /// Thin id of the current owner, 0 when unheld.
    #[inline]
    pub fn owner_thin_id(&self) -> u32 {
        self.owner.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn owned_by(&self, thread: &Thread) -> bool {
        self.is_locked() && self.owner_thin_id() == thread.thin_id()
    }

    #[inline]
    pub fn recursion_level(&self) -> u32 {
        self.recursion.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn waiter_count(&self) -> u32 {
        self.state.load(Ordering::Relaxed) >> WAITER_SHIFT
    }

    /// Seed ownership from a thin lock being inflated. Runs before the block
    /// is published, under the header spin lock, so plain stores suffice.
    pub(crate) fn migrate_thin_lock(&self, owner: u32, recursion: u32) {
        debug_assert!(owner != 0 && recursion >= 1);
        debug_assert!(!self.is_locked());
        self.owner.store(owner, Ordering::Relaxed);
        self.recursion.store(recursion, Ordering::Relaxed);
        self.state.store(LOCKED, Ordering::Release);
    }

    /// Block until the monitor is acquired.
    pub fn enter(&self, thread: &Thread) {
        let entered = self.acquire(thread, None);
        debug_assert!(entered);
    }

    /// Acquire with a timeout. `Some(ZERO)` fails immediately on contention;
    /// `None` never gives up. Returns whether the monitor was acquired.
    pub fn try_enter(&self, thread: &Thread, timeout: Option<Duration>) -> bool {
        self.acquire(thread, timeout)
    }

    fn acquire(&self, thread: &Thread, timeout: Option<Duration>) -> bool {
        // Reentrancy: owner is only ever our own store while we hold it.
        if self.state.load(Ordering::Relaxed) & LOCKED != 0
            && self.owner.load(Ordering::Relaxed) == thread.thin_id()
        {
            let r = self.recursion.load(Ordering::Relaxed);
            self.recursion.store(r + 1, Ordering::Relaxed);
            return true;
        }
        if self.try_lock() {
            self.take_ownership(thread);
            return true;
        }
        if let Some(t) = timeout {
            if t.is_zero() {
                return false;
            }
        }
        self.enter_slow(thread, timeout)
    }

    #[inline]
    fn try_lock(&self) -> bool {
        let mut state = self.state.load(Ordering::Relaxed);
        while state & LOCKED == 0 {
            match self.state.compare_exchange_weak(
                state,
                state | LOCKED,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(observed) => state = observed,
            }
        }
        false
    }

    /// Take the lock and retract our waiter registration in one CAS, so a
    /// timeout racing with a wake can never double-retract.
    fn try_lock_and_unregister(&self) -> bool {
        let mut state = self.state.load(Ordering::Relaxed);
        loop {
            if state & LOCKED != 0 {
                return false;
            }
            debug_assert!(state >> WAITER_SHIFT > 0);
            match self.state.compare_exchange_weak(
                state,
                (state - WAITER) | LOCKED,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(observed) => state = observed,
            }
        }
    }

    #[inline]
    fn take_ownership(&self, thread: &Thread) {
        self.owner.store(thread.thin_id(), Ordering::Relaxed);
        self.recursion.store(1, Ordering::Relaxed);
        thread.inc_lock_count();
    }

    #[cold]
    fn enter_slow(&self, thread: &Thread, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);

        if num_cpus::get() > 1 {
            let spin_count = crate::cache::options().monitor_spin_count;
            for iteration in 0..spin_count {
                if self.try_lock() {
                    self.take_ownership(thread);
                    return true;
                }
                if self.waiter_count() != 0 {
                    // Parked waiters already queue behind this lock; stop
                    // spinning rather than starve them.
                    break;
                }
                spin_wait(iteration);
            }
        }

        self.state.fetch_add(WAITER, Ordering::AcqRel);
        loop {
            if self.try_lock_and_unregister() {
                self.take_ownership(thread);
                return true;
            }
            if self.try_reclaim_orphan(thread) {
                return true;
            }

            let event = self.event.get_or_init(Event::new);
            let mut slice = ORPHAN_POLL;
            if let Some(deadline) = deadline {
                let now = Instant::now();
                if deadline <= now {
                    self.state.fetch_sub(WAITER, Ordering::AcqRel);
                    return false;
                }
                slice = slice.min(deadline - now);
            }

            let signaled = {
                let _safe = GcSafeScope::new(thread);
                event.wait(Some(slice))
            };
            if signaled {
                for iteration in 0..WAKE_SPIN {
                    if self.try_lock_and_unregister() {
                        self.take_ownership(thread);
                        return true;
                    }
                    spin_wait(iteration);
                }
                // Lost the race to a barging acquirer; the next release will
                // signal again because our registration is still counted.
            }
        }
    }

    /// Forcibly adopt a monitor whose recorded owner has terminated. The
    /// dead thread can never release, so a registered waiter must seize
    /// ownership itself.
    fn try_reclaim_orphan(&self, thread: &Thread) -> bool {
        if self.state.load(Ordering::Acquire) & LOCKED == 0 {
            return false;
        }
        let owner = self.owner.load(Ordering::Acquire);
        if owner == 0 || crate::thread::is_thread_live(owner) {
            return false;
        }
        if self
            .owner
            .compare_exchange(owner, thread.thin_id(), Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            self.recursion.store(1, Ordering::Relaxed);
            thread.inc_lock_count();
            self.state.fetch_sub(WAITER, Ordering::AcqRel);
            log::warn!(
                target: "sync",
                "monitor orphaned by dead thread {} reclaimed by thread {}",
                owner,
                thread.thin_id()
            );
            return true;
        }
        false
    }

    /// Release one level of recursion; fully releases at level 1. Returns
    /// whether a parked waiter was signaled.
    pub fn leave(&self, thread: &Thread) -> Result<bool> {
        if !self.owned_by(thread) {
            return Err(SyncError::UsageViolation(
                "monitor released by a thread that does not own it",
            ));
        }
        let recursion = self.recursion.load(Ordering::Relaxed);
        debug_assert!(recursion >= 1);
        if recursion > 1 {
            self.recursion.store(recursion - 1, Ordering::Relaxed);
            return Ok(false);
        }

        self.recursion.store(0, Ordering::Relaxed);
        self.owner.store(0, Ordering::Relaxed);
        thread.dec_lock_count();
        let prev = self.state.fetch_sub(LOCKED, Ordering::Release);
        debug_assert!(prev & LOCKED != 0);
        if prev >> WAITER_SHIFT != 0 {
            self.event.get_or_init(Event::new).set();
            return Ok(true);
        }
        Ok(false)
    }

    /// Fully release a (possibly recursive) hold, returning the recursion
    /// depth so `wait` can restore it on re-entry.
    pub(crate) fn leave_completely(&self, thread: &Thread) -> Result<u32> {
        if !self.owned_by(thread) {
            return Err(SyncError::UsageViolation(
                "monitor released by a thread that does not own it",
            ));
        }
        let depth = self.recursion.load(Ordering::Relaxed);
        self.recursion.store(1, Ordering::Relaxed);
        self.leave(thread)?;
        Ok(depth)
    }

    /// Re-acquire after a wait and restore the saved recursion depth.
    pub(crate) fn reenter(&self, thread: &Thread, depth: u32) {
        debug_assert!(depth >= 1);
        self.enter(thread);
        self.recursion.store(depth, Ordering::Relaxed);
    }
}

impl Default for MonitorLock {
    fn default() -> Self {
        Self::new()
    }
}
