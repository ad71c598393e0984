//! Per-thread runtime state for the monitor subsystem.
//!
//! Every thread that touches a monitor is lazily assigned a small nonzero
//! "thin id" used both in thin-lock header words and as the fat-lock owner
//! field. The registry tracks which ids belong to live threads so a
//! contended `enter` can detect an orphaned lock. An id is recycled when its
//! thread exits, unless the thread died still holding monitors; such ids are
//! leaked forever so an orphaned owner can never alias a freshly started
//! thread.

use std::cell::UnsafeCell;
use std::collections::HashSet;
use std::sync::atomic::{AtomicI8, AtomicU32, Ordering};

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::sync::Event;

// gc_state = 1 means the thread is blocked waiting for the collector.
pub const GC_STATE_WAITING: i8 = 1;
// gc_state = 2 means the thread is in code the collector need not stop
// (parked on an event, running foreign code).
pub const GC_STATE_SAFE: i8 = 2;

struct Registry {
    live: HashSet<u32>,
    free: Vec<u32>,
    next: u32,
}

static REGISTRY: Lazy<Mutex<Registry>> = Lazy::new(|| {
    Mutex::new(Registry {
        live: HashSet::new(),
        free: Vec::new(),
        next: 1,
    })
});

/// True if `thin_id` currently names a live registered thread.
pub fn is_thread_live(thin_id: u32) -> bool {
    thin_id != 0 && REGISTRY.lock().live.contains(&thin_id)
}

fn dispense_id() -> u32 {
    let mut reg = REGISTRY.lock();
    let id = reg.free.pop().unwrap_or_else(|| {
        let id = reg.next;
        reg.next += 1;
        id
    });
    reg.live.insert(id);
    id
}

fn retire_id(thin_id: u32, still_holding_locks: bool) {
    let mut reg = REGISTRY.lock();
    reg.live.remove(&thin_id);
    if still_holding_locks {
        // The id stays burned so the orphan it left behind is detectable.
        log::warn!(target: "sync", "thread {} exited holding monitors; id leaked", thin_id);
    } else {
        reg.free.push(thin_id);
    }
}

/// Monitor-side view of a mutator thread.
pub struct Thread {
    thin_id: u32,
    gc_state: AtomicI8,
    lock_count: AtomicU32,
    wait_event: Event,
}

impl Thread {
    #[inline]
    pub fn thin_id(&self) -> u32 {
        self.thin_id
    }

    /// Reusable per-thread event the wait queue parks on.
    #[inline]
    pub(crate) fn wait_event(&self) -> &Event {
        &self.wait_event
    }

    /// Number of monitors this thread currently holds (thin or fat).
    #[inline]
    pub fn held_monitor_count(&self) -> u32 {
        self.lock_count.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn inc_lock_count(&self) {
        self.lock_count.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn dec_lock_count(&self) {
        let prev = self.lock_count.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(prev != 0);
    }

    pub fn gc_state(&self) -> i8 {
        self.gc_state.load(Ordering::Acquire)
    }

    pub(crate) fn gc_state_set(&self, state: i8) -> i8 {
        self.gc_state.swap(state, Ordering::AcqRel)
    }
}

struct ThreadTls(Thread);

impl Drop for ThreadTls {
    fn drop(&mut self) {
        let holding = self.0.lock_count.load(Ordering::Relaxed) != 0;
        retire_id(self.0.thin_id, holding);
    }
}

thread_local! {
    static THREAD: UnsafeCell<ThreadTls> = UnsafeCell::new(ThreadTls(Thread {
        thin_id: dispense_id(),
        gc_state: AtomicI8::new(0),
        lock_count: AtomicU32::new(0),
        wait_event: Event::new(),
    }));
}

/// Get the calling thread's [Thread], registering it on first use.
///
/// The reference is valid for the life of the calling thread; callers must
/// not stash it somewhere another thread could dereference it after exit.
pub fn thread() -> &'static Thread {
    THREAD.with(|tls| unsafe { &(*tls.get()).0 })
}

/// Bracket for code the collector does not need to stop: event waits, spin
/// parking. Restores the previous state on drop. Must never be entered while
/// the header spin lock or the cache lock is held.
pub struct GcSafeScope<'a> {
    state: i8,
    thread: &'a Thread,
}

impl<'a> GcSafeScope<'a> {
    pub fn new(thread: &'a Thread) -> Self {
        Self {
            state: thread.gc_state_set(GC_STATE_SAFE),
            thread,
        }
    }
}

impl<'a> Drop for GcSafeScope<'a> {
    fn drop(&mut self) {
        self.thread.gc_state_set(self.state);
    }
}
