//! The per-object header word.
//!
//! A single 32-bit atomic carries, in order of escalation: nothing, a thin
//! lock (owner id + recursion) and optionally a small domain tag, an
//! identity hash, or a sync table index. The two high flag bits say which
//! interpretation of the low 26 payload bits applies:
//!
//! ```text
//! 31..29  reserved for the collector, always preserved
//! 28      header spin lock, taken only for inflation
//! 27      payload is a hash or a table index
//! 26      with bit 27: payload is a hash, not an index
//! 25..0   payload (hash or index), or:
//! 26..16      domain tag        (thin representation only)
//! 15..10      thin recursion, depth - 1
//!  9..0       thin owner id
//! ```
//!
//! Everything stays in the header until it no longer fits: contention, a
//! deep recursion, a wide thread id, or a second piece of state forces
//! inflation, which moves the header's contents into a [`SyncBlock`] and
//! leaves only the table index behind.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use rand::Rng;

use crate::block::SyncBlock;
use crate::cache::{options, SyncBlockCache};
use crate::error::{Result, SyncError};
use crate::thread::{is_thread_live, thread, Thread};
use crate::utils::bitfield::BitField;

pub const BIT_SPIN_LOCK: u32 = 1 << 28;
pub const BIT_IS_HASH_OR_INDEX: u32 = 1 << 27;
pub const BIT_IS_HASHCODE: u32 = 1 << 26;
/// Low bits shared by the hash and the sync table index.
pub const MASK_SYNC_PAYLOAD: u32 = (1 << 26) - 1;

// Bits 31..29 belong to the collector and survive every transition.
const PRESERVED_BITS: u32 = !(BIT_SPIN_LOCK | BIT_IS_HASH_OR_INDEX | BIT_IS_HASHCODE | MASK_SYNC_PAYLOAD);

pub(crate) type ThinThreadId = BitField<10, 0>;
/// Stored as depth minus one: a freshly taken thin lock encodes zero.
pub(crate) type ThinRecursion = BitField<6, 10>;
pub(crate) type HeaderDomainTag = BitField<11, 16>;

const MAX_THIN_TID: u32 = ThinThreadId::mask();
const MAX_THIN_RECURSION: u32 = ThinRecursion::mask();

const NOT_OWNER: SyncError =
    SyncError::UsageViolation("monitor released by a thread that does not own it");

fn identity_hash() -> u32 {
    loop {
        let hash = rand::thread_rng().gen::<u32>() & MASK_SYNC_PAYLOAD;
        if hash != 0 {
            return hash;
        }
    }
}

pub struct ObjectHeader {
    bits: AtomicU32,
}

impl ObjectHeader {
    pub const fn new() -> Self {
        Self {
            bits: AtomicU32::new(0),
        }
    }

    pub(crate) fn raw(&self) -> u32 {
        self.bits.load(Ordering::Acquire)
    }

    pub(crate) fn set_raw(&self, bits: u32) {
        self.bits.store(bits, Ordering::Release);
    }

    #[inline]
    fn cas(&self, old: u32, new: u32) -> bool {
        self.bits
            .compare_exchange_weak(old, new, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// The sync table index, if this header has been inflated.
    #[inline]
    pub fn try_get_sync_index(&self) -> Option<u32> {
        let bits = self.bits.load(Ordering::Acquire);
        if bits & (BIT_IS_HASH_OR_INDEX | BIT_IS_HASHCODE) == BIT_IS_HASH_OR_INDEX {
            Some(bits & MASK_SYNC_PAYLOAD)
        } else {
            None
        }
    }

    /// The sync block for this object, inflating on first use.
    pub fn get_sync_block(&self) -> Result<&'static SyncBlock> {
        SyncBlockCache::global().get_sync_block(self)
    }

    /// Reserve a table index without entering the monitor. See
    /// [`SyncBlockCache::get_or_create_sync_index`].
    pub fn get_or_create_sync_index(&self, held: bool) -> Result<u32> {
        SyncBlockCache::global().get_or_create_sync_index(self, held)
    }

    pub fn enter_monitor(&self) -> Result<()> {
        self.try_enter_monitor(None).map(|_| ())
    }

    /// Acquire the monitor, thin if possible. `None` waits forever; a zero
    /// timeout never blocks and never inflates on contention.
    pub fn try_enter_monitor(&self, timeout: Option<Duration>) -> Result<bool> {
        let th = thread();
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut spins = 0u32;
        loop {
            let bits = self.bits.load(Ordering::Acquire);
            if bits & BIT_SPIN_LOCK != 0 {
                std::thread::yield_now();
                continue;
            }
            if bits & BIT_IS_HASH_OR_INDEX != 0 {
                return self.inflate_and_enter(th, deadline);
            }

            let tid = ThinThreadId::decode(bits);
            if tid == 0 {
                if th.thin_id() > MAX_THIN_TID {
                    return self.inflate_and_enter(th, deadline);
                }
                if self.cas(bits, bits | th.thin_id()) {
                    th.inc_lock_count();
                    return Ok(true);
                }
                continue;
            }
            if tid == th.thin_id() {
                if ThinRecursion::decode(bits) == MAX_THIN_RECURSION {
                    return self.inflate_and_enter(th, deadline);
                }
                if self.cas(bits, bits + (1 << ThinRecursion::shift())) {
                    return Ok(true);
                }
                continue;
            }

            // Contended. A dead owner forfeits the lock to us.
            if !is_thread_live(tid) {
                let new = ThinRecursion::update(0, ThinThreadId::update(th.thin_id(), bits));
                if self.cas(bits, new) {
                    log::warn!(target: "sync", "thin lock abandoned by dead thread {}, taken over", tid);
                    th.inc_lock_count();
                    return Ok(true);
                }
                continue;
            }
            if matches!(timeout, Some(t) if t.is_zero()) {
                return Ok(false);
            }
            if spins < options().thin_lock_spin_count {
                spins += 1;
                std::hint::spin_loop();
                continue;
            }
            return self.inflate_and_enter(th, deadline);
        }
    }

    #[cold]
    fn inflate_and_enter(&self, th: &Thread, deadline: Option<Instant>) -> Result<bool> {
        let block = self.get_sync_block()?;
        // Time already burnt spinning on the thin lock counts against the
        // caller's budget.
        let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
        Ok(block.try_enter_monitor(th, remaining))
    }

    pub fn leave_monitor(&self) -> Result<()> {
        let th = thread();
        loop {
            let bits = self.bits.load(Ordering::Acquire);
            if bits & BIT_SPIN_LOCK != 0 {
                std::thread::yield_now();
                continue;
            }
            if bits & BIT_IS_HASH_OR_INDEX != 0 {
                if bits & BIT_IS_HASHCODE != 0 {
                    return Err(NOT_OWNER);
                }
                return self.get_sync_block()?.leave_monitor(th);
            }
            if ThinThreadId::decode(bits) != th.thin_id() {
                return Err(NOT_OWNER);
            }
            let recursion = ThinRecursion::decode(bits);
            let new = if recursion > 0 {
                bits - (1 << ThinRecursion::shift())
            } else {
                ThinThreadId::update(0, bits)
            };
            if self.cas(bits, new) {
                if recursion == 0 {
                    th.dec_lock_count();
                }
                return Ok(());
            }
        }
    }

    /// Release the monitor, park until pulsed or timed out, re-acquire.
    /// Forces inflation: the wait queue lives in the sync block.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<bool> {
        let th = thread();
        if self.owning_thread() != Some(th.thin_id()) {
            return Err(SyncError::UsageViolation(
                "wait requires the monitor to be held",
            ));
        }
        self.get_sync_block()?.wait(th, timeout)
    }

    pub fn pulse(&self) -> Result<()> {
        let th = thread();
        if self.try_get_sync_index().is_some() {
            return self.get_sync_block()?.pulse(th);
        }
        // A thin-held monitor has never had a waiter.
        self.require_thin_owner(th)
    }

    pub fn pulse_all(&self) -> Result<()> {
        let th = thread();
        if self.try_get_sync_index().is_some() {
            return self.get_sync_block()?.pulse_all(th);
        }
        self.require_thin_owner(th)
    }

    fn require_thin_owner(&self, th: &Thread) -> Result<()> {
        let bits = self.bits.load(Ordering::Acquire);
        if bits & BIT_IS_HASH_OR_INDEX == 0 && ThinThreadId::decode(bits) == th.thin_id() {
            Ok(())
        } else {
            Err(SyncError::UsageViolation(
                "pulse requires the monitor to be held",
            ))
        }
    }

    /// Stable identity hash, assigned on first request. Lives in the header
    /// until the payload bits are needed for something else.
    pub fn get_hash_code(&self) -> Result<u32> {
        loop {
            let bits = self.bits.load(Ordering::Acquire);
            if bits & BIT_SPIN_LOCK != 0 {
                std::thread::yield_now();
                continue;
            }
            if bits & BIT_IS_HASH_OR_INDEX != 0 {
                if bits & BIT_IS_HASHCODE != 0 {
                    return Ok(bits & MASK_SYNC_PAYLOAD);
                }
                let block = self.get_sync_block()?;
                let existing = block.hash_code();
                if existing != 0 {
                    return Ok(existing);
                }
                return Ok(block.get_or_assign_hash(identity_hash()));
            }
            if bits & MASK_SYNC_PAYLOAD == 0 {
                let hash = identity_hash();
                if self.cas(bits, bits | BIT_IS_HASH_OR_INDEX | BIT_IS_HASHCODE | hash) {
                    return Ok(hash);
                }
                continue;
            }
            // The payload bits already hold a thin lock or domain tag.
            return Ok(self.get_sync_block()?.get_or_assign_hash(identity_hash()));
        }
    }

    pub fn domain_tag(&self) -> u32 {
        let bits = self.bits.load(Ordering::Acquire);
        if bits & BIT_IS_HASH_OR_INDEX == 0 {
            return HeaderDomainTag::decode(bits);
        }
        if bits & BIT_IS_HASHCODE != 0 {
            return 0;
        }
        self.get_sync_block().map(|b| b.domain_tag()).unwrap_or(0)
    }

    pub fn set_domain_tag(&self, tag: u32) -> Result<()> {
        loop {
            let bits = self.bits.load(Ordering::Acquire);
            if bits & BIT_SPIN_LOCK != 0 {
                std::thread::yield_now();
                continue;
            }
            if bits & BIT_IS_HASH_OR_INDEX == 0 && HeaderDomainTag::is_valid(tag) {
                if self.cas(bits, HeaderDomainTag::update(tag, bits)) {
                    return Ok(());
                }
                continue;
            }
            self.get_sync_block()?.set_domain_tag(tag);
            return Ok(());
        }
    }

    /// Current acquisition depth of this object's monitor, from whichever
    /// representation holds it. Zero when unheld.
    pub fn lock_depth(&self) -> u32 {
        let bits = self.bits.load(Ordering::Acquire);
        if bits & BIT_IS_HASH_OR_INDEX == 0 {
            if ThinThreadId::decode(bits) == 0 {
                return 0;
            }
            return ThinRecursion::decode(bits) + 1;
        }
        if bits & BIT_IS_HASHCODE != 0 {
            return 0;
        }
        self.get_sync_block()
            .map(|b| b.monitor().recursion_level())
            .unwrap_or(0)
    }

    /// Thin id of the thread holding this object's monitor, if any.
    pub fn owning_thread(&self) -> Option<u32> {
        let bits = self.bits.load(Ordering::Acquire);
        if bits & BIT_IS_HASH_OR_INDEX == 0 {
            let tid = ThinThreadId::decode(bits);
            return if tid != 0 { Some(tid) } else { None };
        }
        if bits & BIT_IS_HASHCODE != 0 {
            return None;
        }
        let owner = self.get_sync_block().ok()?.monitor().owner_thin_id();
        if owner != 0 {
            Some(owner)
        } else {
            None
        }
    }

    // ---- inflation internals --------------------------------------------

    /// Move this header's contents into `block` and leave `index` behind.
    /// Called by the cache with the slot fully formed; the header spin lock
    /// freezes the word so a racing thin enter/leave cannot slip between
    /// the read and the final store.
    pub(crate) fn migrate_into_block(&self, block: &SyncBlock, index: u32) {
        let bits = self.acquire_spin_lock();
        if bits & BIT_IS_HASH_OR_INDEX != 0 {
            // Only a hash can be here; an index is published by this very
            // function, under the cache lock.
            debug_assert!(bits & BIT_IS_HASHCODE != 0);
            block.get_or_assign_hash(bits & MASK_SYNC_PAYLOAD);
        } else {
            let tid = ThinThreadId::decode(bits);
            if tid != 0 {
                // Held-count accounting moved with the thin lock; the
                // monitor inherits owner and depth as-is.
                block
                    .monitor()
                    .migrate_thin_lock(tid, ThinRecursion::decode(bits) + 1);
            }
            let tag = HeaderDomainTag::decode(bits);
            if tag != 0 {
                block.set_domain_tag(tag);
            }
        }
        // Releases the spin lock and publishes the index in one store.
        self.bits.store(
            (bits & PRESERVED_BITS) | BIT_IS_HASH_OR_INDEX | index,
            Ordering::Release,
        );
    }

    /// Detach this header from its freed slot. GC scan context only, with
    /// mutators stopped.
    pub(crate) fn clear_sync_index(&self) {
        let bits = self.bits.load(Ordering::Relaxed);
        self.bits.store(bits & PRESERVED_BITS, Ordering::Relaxed);
    }

    fn acquire_spin_lock(&self) -> u32 {
        let mut iteration = 0u32;
        loop {
            let bits = self.bits.load(Ordering::Acquire);
            if bits & BIT_SPIN_LOCK == 0
                && self.cas(bits, bits | BIT_SPIN_LOCK)
            {
                return bits;
            }
            if iteration < 64 {
                std::hint::spin_loop();
            } else {
                std::thread::yield_now();
            }
            iteration += 1;
        }
    }
}

impl Default for ObjectHeader {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ObjectHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let bits = self.bits.load(Ordering::Relaxed);
        let mut s = f.debug_struct("ObjectHeader");
        if bits & (BIT_IS_HASH_OR_INDEX | BIT_IS_HASHCODE) == BIT_IS_HASH_OR_INDEX {
            s.field("sync_index", &(bits & MASK_SYNC_PAYLOAD));
        } else if bits & BIT_IS_HASHCODE != 0 {
            s.field("hash", &(bits & MASK_SYNC_PAYLOAD));
        } else {
            s.field("thin_owner", &ThinThreadId::decode(bits))
                .field("thin_recursion", &ThinRecursion::decode(bits))
                .field("domain_tag", &HeaderDomainTag::decode(bits));
        }
        s.finish()
    }
}
