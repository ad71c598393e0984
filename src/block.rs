//! The per-object extension record: one monitor, one wait queue, and the
//! out-of-line metadata that does not fit in the header word.
//!
//! Sync blocks are created lazily by the cache, live in arena storage, and
//! are only ever destroyed by the cache's GC cleanup path. The wait queue is
//! an intrusive singly linked FIFO of stack-allocated nodes; all queue
//! mutation happens under the global cache lock, which is cheap because
//! wait/pulse are rare next to plain enter/leave.

use std::cell::{Cell, UnsafeCell};
use std::ptr::null_mut;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, Ordering};
use std::time::Duration;

use crate::cache::SyncBlockCache;
use crate::error::{Result, SyncError};
use crate::monitor::MonitorLock;
use crate::sync::Event;
use crate::thread::{GcSafeScope, Thread};

/// Out-of-line metadata attached to a sync block by an external collaborator
/// (interop wrappers, edit-and-continue bookkeeping). Teardown may block or
/// allocate, so it only ever runs on the deferred cleanup path, never on the
/// GC scan thread.
pub trait ExternalMetadata: Send {
    fn teardown(&mut self);
}

// Thin cell so the fat trait object can sit behind an AtomicPtr.
struct ExternalCell(Box<dyn ExternalMetadata>);

pub(crate) struct WaitNode {
    event: *const Event,
    pub(crate) thread_id: u32,
    next: Cell<*mut WaitNode>,
}

pub struct SyncBlock {
    monitor: MonitorLock,
    /// Head of the waiter FIFO; guarded by the global cache lock.
    wait_head: UnsafeCell<*mut WaitNode>,
    index: u32,
    domain_tag: AtomicU32,
    hash_code: AtomicU32,
    /// Once set, the block is never returned to the free pool while its
    /// object is alive (it carries unreplayable state).
    precious: AtomicBool,
    /// Set by external collaborators to request teardown even while the
    /// owning object is still reachable.
    disposable: AtomicBool,
    /// Count of threads currently parked on this block's monitor or wait
    /// queue; the GC defers reclamation while nonzero.
    transient_precious: AtomicU32,
    external: AtomicPtr<ExternalCell>,
}

unsafe impl Send for SyncBlock {}
unsafe impl Sync for SyncBlock {}

impl SyncBlock {
    pub(crate) fn new(index: u32) -> Self {
        Self {
            monitor: MonitorLock::new(),
            wait_head: UnsafeCell::new(null_mut()),
            index,
            domain_tag: AtomicU32::new(0),
            hash_code: AtomicU32::new(0),
            precious: AtomicBool::new(false),
            disposable: AtomicBool::new(false),
            transient_precious: AtomicU32::new(0),
            external: AtomicPtr::new(null_mut()),
        }
    }

    #[inline]
    pub fn monitor(&self) -> &MonitorLock {
        &self.monitor
    }

    /// 1-based slot this block occupies in the sync table.
    #[inline]
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn set_precious(&self) {
        self.precious.store(true, Ordering::Release);
    }

    pub fn is_precious(&self) -> bool {
        self.precious.load(Ordering::Acquire)
    }

    pub fn set_disposable(&self) {
        self.disposable.store(true, Ordering::Release);
    }

    pub fn is_disposable(&self) -> bool {
        self.disposable.load(Ordering::Acquire)
    }

    pub(crate) fn is_transiently_precious(&self) -> bool {
        self.transient_precious.load(Ordering::Acquire) != 0
    }

    /// True when the block can be destructed inline during a GC scan:
    /// nothing parked on it and no external metadata needing slow teardown.
    pub(crate) fn can_dispose_inline(&self) -> bool {
        !self.is_transiently_precious() && !self.has_external_metadata()
    }

    pub fn domain_tag(&self) -> u32 {
        self.domain_tag.load(Ordering::Acquire)
    }

    pub fn set_domain_tag(&self, tag: u32) {
        self.domain_tag.store(tag, Ordering::Release);
    }

    /// Hash stored out of line once the header bits are claimed by a lock.
    /// First caller's value wins; all callers observe the same hash.
    pub fn get_or_assign_hash(&self, hash: u32) -> u32 {
        debug_assert!(hash != 0);
        self.set_precious();
        match self
            .hash_code
            .compare_exchange(0, hash, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => hash,
            Err(existing) => existing,
        }
    }

    pub fn hash_code(&self) -> u32 {
        self.hash_code.load(Ordering::Acquire)
    }

    /// Attach external metadata; fails (dropping the argument) if some other
    /// collaborator already attached one.
    pub fn set_external_metadata(&self, metadata: Box<dyn ExternalMetadata>) -> bool {
        self.set_precious();
        let cell = Box::into_raw(Box::new(ExternalCell(metadata)));
        if self
            .external
            .compare_exchange(null_mut(), cell, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            true
        } else {
            drop(unsafe { Box::from_raw(cell) });
            false
        }
    }

    pub fn has_external_metadata(&self) -> bool {
        !self.external.load(Ordering::Acquire).is_null()
    }

    pub(crate) fn take_external_metadata(&self) -> Option<Box<dyn ExternalMetadata>> {
        let cell = self.external.swap(null_mut(), Ordering::AcqRel);
        if cell.is_null() {
            None
        } else {
            Some(unsafe { Box::from_raw(cell) }.0)
        }
    }

    // ---- monitor entry points -------------------------------------------

    pub fn enter_monitor(&self, thread: &Thread) {
        let entered = self.try_enter_monitor(thread, None);
        debug_assert!(entered);
    }

    pub fn try_enter_monitor(&self, thread: &Thread, timeout: Option<Duration>) -> bool {
        if self.monitor.try_enter(thread, Some(Duration::ZERO)) {
            return true;
        }
        if let Some(t) = timeout {
            if t.is_zero() {
                return false;
            }
        }
        // Contended path: the monitor may allocate its event and the caller
        // is about to park on this block, so escalate before blocking.
        self.set_precious();
        self.transient_precious.fetch_add(1, Ordering::AcqRel);
        let entered = self.monitor.try_enter(thread, timeout);
        self.transient_precious.fetch_sub(1, Ordering::AcqRel);
        entered
    }

    pub fn leave_monitor(&self, thread: &Thread) -> Result<()> {
        self.monitor.leave(thread).map(|_| ())
    }

    // ---- wait / pulse ---------------------------------------------------

    /// Release the monitor (recording its recursion depth), park until
    /// pulsed or timed out, then re-acquire to the same depth. Returns
    /// `true` when woken by a pulse.
    pub fn wait(&self, thread: &Thread, timeout: Option<Duration>) -> Result<bool> {
        if !self.monitor.owned_by(thread) {
            return Err(SyncError::UsageViolation(
                "wait requires the monitor to be held",
            ));
        }
        // A wait event is unreplayable state; this block can never be
        // recycled while its object lives.
        self.set_precious();
        self.transient_precious.fetch_add(1, Ordering::AcqRel);

        let event = thread.wait_event();
        event.reset();
        let mut node = WaitNode {
            event,
            thread_id: thread.thin_id(),
            next: Cell::new(null_mut()),
        };
        unsafe { self.enqueue_waiter(&mut node) };

        let depth = self.monitor.leave_completely(thread)?;

        let signaled = {
            let _safe = GcSafeScope::new(thread);
            event.wait(timeout)
        };
        let woken = if signaled {
            true
        } else {
            // Timed out. If a pulse dequeued us in the meantime the pulse is
            // consumed as a wake rather than lost.
            !unsafe { self.unlink_waiter(&mut node) }
        };

        self.monitor.reenter(thread, depth);
        self.transient_precious.fetch_sub(1, Ordering::AcqRel);
        Ok(woken)
    }

    /// Wake the longest-waiting thread, if any.
    pub fn pulse(&self, thread: &Thread) -> Result<()> {
        if !self.monitor.owned_by(thread) {
            return Err(SyncError::UsageViolation(
                "pulse requires the monitor to be held",
            ));
        }
        let node = unsafe { self.dequeue_waiter() };
        if !node.is_null() {
            log::trace!(target: "sync", "pulse wakes thread {}", unsafe { (*node).thread_id });
            unsafe { &*(*node).event }.set();
        }
        Ok(())
    }

    /// Wake every queued waiter.
    pub fn pulse_all(&self, thread: &Thread) -> Result<()> {
        if !self.monitor.owned_by(thread) {
            return Err(SyncError::UsageViolation(
                "pulse requires the monitor to be held",
            ));
        }
        loop {
            let node = unsafe { self.dequeue_waiter() };
            if node.is_null() {
                return Ok(());
            }
            unsafe { &*(*node).event }.set();
        }
    }

    /// Number of threads currently queued in `wait`.
    pub fn queued_waiter_count(&self) -> usize {
        let _lh = SyncBlockCache::global().lock_cache();
        let mut count = 0;
        unsafe {
            let mut cursor = *self.wait_head.get();
            while !cursor.is_null() {
                count += 1;
                cursor = (*cursor).next.get();
            }
        }
        count
    }

    // Queue nodes live on the waiting threads' stacks and stay pinned until
    // dequeued or unlinked; every mutation below holds the cache lock.

    unsafe fn enqueue_waiter(&self, node: *mut WaitNode) {
        let _lh = SyncBlockCache::global().lock_cache();
        let head = self.wait_head.get();
        if (*head).is_null() {
            *head = node;
            return;
        }
        let mut cursor = *head;
        while !(*cursor).next.get().is_null() {
            cursor = (*cursor).next.get();
        }
        (*cursor).next.set(node);
    }

    unsafe fn dequeue_waiter(&self) -> *mut WaitNode {
        let _lh = SyncBlockCache::global().lock_cache();
        let head = self.wait_head.get();
        let node = *head;
        if !node.is_null() {
            *head = (*node).next.get();
            (*node).next.set(null_mut());
        }
        node
    }

    /// Unlink an abandoned wait. Returns `false` if the node was already
    /// dequeued by a pulse.
    unsafe fn unlink_waiter(&self, node: *mut WaitNode) -> bool {
        let _lh = SyncBlockCache::global().lock_cache();
        let head = self.wait_head.get();
        if *head == node {
            *head = (*node).next.get();
            (*node).next.set(null_mut());
            return true;
        }
        let mut cursor = *head;
        while !cursor.is_null() {
            if (*cursor).next.get() == node {
                (*cursor).next.set((*node).next.get());
                (*node).next.set(null_mut());
                return true;
            }
            cursor = (*cursor).next.get();
        }
        false
    }
}

impl Drop for SyncBlock {
    fn drop(&mut self) {
        debug_assert!(unsafe { (*self.wait_head.get()).is_null() });
        // Teardown, if needed, already ran on the cleanup path; just free.
        drop(self.take_external_metadata());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::thread;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn spawn_waiter(
        block: &Arc<SyncBlock>,
        order: &Arc<Mutex<Vec<u32>>>,
        tag: u32,
    ) -> std::thread::JoinHandle<bool> {
        let block = block.clone();
        let order = order.clone();
        std::thread::spawn(move || {
            let th = thread();
            block.enter_monitor(th);
            let woken = block.wait(th, Some(Duration::from_secs(20))).unwrap();
            order.lock().push(tag);
            block.leave_monitor(th).unwrap();
            woken
        })
    }

    #[test]
    fn pulse_wakes_in_fifo_order() {
        let block = Arc::new(SyncBlock::new(1));
        let order = Arc::new(Mutex::new(Vec::new()));
        let th = thread();

        let mut handles = Vec::new();
        for tag in 1..=3u32 {
            let handle = spawn_waiter(&block, &order, tag);
            // A waiter is queued once it has taken the monitor, enqueued,
            // and released; queue length makes that observable.
            while block.queued_waiter_count() < tag as usize {
                std::thread::yield_now();
            }
            handles.push(handle);
        }

        for expected_len in 1..=3usize {
            block.enter_monitor(th);
            block.pulse(th).unwrap();
            block.leave_monitor(th).unwrap();
            while order.lock().len() < expected_len {
                std::thread::yield_now();
            }
        }

        for handle in handles {
            assert!(handle.join().unwrap());
        }
        assert_eq!(*order.lock(), vec![1, 2, 3]);
        assert_eq!(block.queued_waiter_count(), 0);
    }

    #[test]
    fn pulse_all_wakes_everyone() {
        let block = Arc::new(SyncBlock::new(1));
        let order = Arc::new(Mutex::new(Vec::new()));
        let th = thread();

        let mut handles = Vec::new();
        for tag in 1..=4u32 {
            let handle = spawn_waiter(&block, &order, tag);
            while block.queued_waiter_count() < tag as usize {
                std::thread::yield_now();
            }
            handles.push(handle);
        }

        block.enter_monitor(th);
        block.pulse_all(th).unwrap();
        block.leave_monitor(th).unwrap();

        for handle in handles {
            assert!(handle.join().unwrap());
        }
        assert_eq!(order.lock().len(), 4);
    }

    #[test]
    fn wait_timeout_reports_false_and_unlinks() {
        let block = SyncBlock::new(1);
        let th = thread();
        block.enter_monitor(th);
        let woken = block.wait(th, Some(Duration::from_millis(30))).unwrap();
        assert!(!woken);
        assert_eq!(block.queued_waiter_count(), 0);
        // The monitor was restored to the pre-wait depth.
        assert!(block.monitor().owned_by(th));
        block.leave_monitor(th).unwrap();
    }

    #[test]
    fn pulse_consumed_by_a_timed_out_waiter_counts_as_wake() {
        let block = Arc::new(SyncBlock::new(1));
        let th = thread();

        let waiter = {
            let block = block.clone();
            std::thread::spawn(move || {
                let th = thread();
                block.enter_monitor(th);
                let woken = block.wait(th, Some(Duration::from_millis(100))).unwrap();
                block.leave_monitor(th).unwrap();
                woken
            })
        };
        while block.queued_waiter_count() < 1 {
            std::thread::yield_now();
        }

        // Replay a pulse in two halves with the waiter's deadline expiring
        // in between: dequeued before the timeout, signaled only after the
        // waiter has already given up waiting. Holding the monitor keeps
        // the waiter parked in re-entry, so its queue node stays pinned.
        block.enter_monitor(th);
        let node = unsafe { block.dequeue_waiter() };
        assert!(!node.is_null());
        std::thread::sleep(Duration::from_millis(300));
        unsafe { &*(*node).event }.set();
        block.leave_monitor(th).unwrap();

        // Dequeued by a pulse means woken, even though the timer fired first.
        assert!(waiter.join().unwrap());
        assert_eq!(block.queued_waiter_count(), 0);
    }

    #[test]
    fn wait_preserves_recursion_depth() {
        let block = SyncBlock::new(1);
        let th = thread();
        block.enter_monitor(th);
        block.enter_monitor(th);
        block.enter_monitor(th);
        let woken = block.wait(th, Some(Duration::from_millis(10))).unwrap();
        assert!(!woken);
        assert_eq!(block.monitor().recursion_level(), 3);
        for _ in 0..3 {
            block.leave_monitor(th).unwrap();
        }
        assert!(!block.monitor().is_locked());
    }

    #[test]
    fn wait_and_pulse_require_ownership() {
        let block = SyncBlock::new(1);
        let th = thread();
        assert!(matches!(
            block.wait(th, None),
            Err(SyncError::UsageViolation(_))
        ));
        assert!(matches!(block.pulse(th), Err(SyncError::UsageViolation(_))));
        assert!(matches!(
            block.pulse_all(th),
            Err(SyncError::UsageViolation(_))
        ));
    }

    struct Marker(Arc<AtomicUsize>);
    impl ExternalMetadata for Marker {
        fn teardown(&mut self) {
            self.0.fetch_add(1, Ordering::AcqRel);
        }
    }

    #[test]
    fn external_metadata_attaches_once() {
        let block = SyncBlock::new(1);
        let hits = Arc::new(AtomicUsize::new(0));
        assert!(block.set_external_metadata(Box::new(Marker(hits.clone()))));
        assert!(!block.set_external_metadata(Box::new(Marker(hits.clone()))));
        assert!(block.has_external_metadata());
        assert!(block.is_precious());
        let mut taken = block.take_external_metadata().unwrap();
        taken.teardown();
        assert_eq!(hits.load(Ordering::Acquire), 1);
        assert!(!block.has_external_metadata());
    }
}
