//! The sync block cache: a process-wide table mapping header indices to
//! sync blocks, plus the allocator behind it.
//!
//! The table is an array of slots indexed by the 26-bit payload a header
//! carries once it has been inflated. Slot 0 is reserved so that a zero
//! payload never names a block. Readers walk header index -> table slot ->
//! block pointer without any lock; all mutation (allocation, growth, GC
//! scanning, wait queue surgery) happens under one [`parking_lot::Mutex`].
//!
//! Growth never invalidates readers: a new, larger table is populated under
//! the lock and published with a single release store, and the old table is
//! retained until the next GC scan proves no reader can still hold it.

use std::mem::MaybeUninit;
use std::ptr::null_mut;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use once_cell::sync::{Lazy, OnceCell};
use parking_lot::{Mutex, MutexGuard};

use crate::block::SyncBlock;
use crate::error::{Result, SyncError};
use crate::header::{ObjectHeader, MASK_SYNC_PAYLOAD};

/// Slots per dirty card. A card marks a run of table slots that may hold
/// ephemeral objects, so partial GC scans can skip the rest.
pub(crate) const CARD_SIZE: u32 = 32;
/// Cards per bitmap word.
pub(crate) const CARD_WORD_WIDTH: u32 = 32;

const SLOTS_PER_CARD_WORD: u32 = CARD_SIZE * CARD_WORD_WIDTH;

/// Block storage is carved from fixed-size chunks rather than allocated
/// one block at a time.
const ARENA_BYTES: usize = 4096;

/// Tunables fixed at first use of the global cache.
#[derive(Debug, Clone, Copy)]
pub struct SyncOptions {
    /// Slot count of the initial sync table (slot 0 included).
    pub initial_table_size: u32,
    /// Spin iterations a contended monitor burns before parking.
    pub monitor_spin_count: u32,
    /// Spin iterations a contended thin lock burns before inflating.
    pub thin_lock_spin_count: u32,
}

impl Default for SyncOptions {
    fn default() -> Self {
        let multicore = num_cpus::get() > 1;
        Self {
            initial_table_size: 250,
            monitor_spin_count: if multicore { 32 } else { 0 },
            thin_lock_spin_count: if multicore { 32 } else { 0 },
        }
    }
}

static OPTIONS: OnceCell<SyncOptions> = OnceCell::new();

/// Install non-default options. Returns `false` if the options were already
/// fixed by an earlier call or by first use.
pub fn configure(options: SyncOptions) -> bool {
    OPTIONS.set(options).is_ok()
}

pub fn options() -> &'static SyncOptions {
    OPTIONS.get_or_init(SyncOptions::default)
}

/// One table slot. `object` is either a tagged free-list link (LSB set,
/// payload is the next free index) or the address of the owning object's
/// header (always even). `block` is null exactly when the slot is free.
pub(crate) struct SyncTableEntry {
    object: AtomicUsize,
    block: AtomicPtr<SyncBlock>,
}

pub(crate) enum SlotState {
    Free { next_free: u32 },
    InUse { object: *mut ObjectHeader },
}

impl SyncTableEntry {
    fn new() -> Self {
        Self {
            object: AtomicUsize::new(1),
            block: AtomicPtr::new(null_mut()),
        }
    }

    pub(crate) fn state(&self) -> SlotState {
        let raw = self.object.load(Ordering::Acquire);
        if raw & 1 != 0 {
            SlotState::Free {
                next_free: (raw >> 1) as u32,
            }
        } else {
            SlotState::InUse {
                object: raw as *mut ObjectHeader,
            }
        }
    }

    pub(crate) fn block_ptr(&self) -> *mut SyncBlock {
        self.block.load(Ordering::Acquire)
    }

    pub(crate) fn set_in_use(&self, object: usize) {
        debug_assert!(object & 1 == 0);
        self.object.store(object, Ordering::Release);
    }

    pub(crate) fn set_free(&self, next_free: u32) {
        self.block.store(null_mut(), Ordering::Release);
        self.object
            .store(((next_free as usize) << 1) | 1, Ordering::Release);
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    pub capacity: u32,
    pub active: u32,
    pub free: u32,
    pub grow_count: u32,
    /// Superseded tables still retained pending the next GC scan.
    pub retired_tables: u32,
}

type Arena = Box<[MaybeUninit<SyncBlock>]>;

pub(crate) struct CacheState {
    pub(crate) capacity: u32,
    /// High-water mark: slots below this have been handed out at least once.
    pub(crate) next_unused: u32,
    /// Head of the intra-table free list threaded through tagged slots.
    pub(crate) free_list_head: u32,
    /// Dirty card bitmap over table slots.
    pub(crate) cards: Vec<u32>,
    /// Tables superseded by growth, freed at the next GC scan.
    pub(crate) old_tables: Vec<(*mut SyncTableEntry, u32)>,
    arenas: Vec<Arena>,
    arena_cursor: usize,
    free_blocks: Vec<*mut SyncBlock>,
    pub(crate) active_count: u32,
    pub(crate) free_count: u32,
    pub(crate) grow_count: u32,
}

unsafe impl Send for CacheState {}

impl CacheState {
    pub(crate) fn dirty_card(&mut self, index: u32) {
        let card = index / CARD_SIZE;
        self.cards[(card / CARD_WORD_WIDTH) as usize] |= 1 << (card % CARD_WORD_WIDTH);
    }

    fn card_words_for(capacity: u32) -> usize {
        ((capacity + SLOTS_PER_CARD_WORD - 1) / SLOTS_PER_CARD_WORD) as usize
    }

    fn allocate_block_storage(&mut self) -> *mut SyncBlock {
        if let Some(block) = self.free_blocks.pop() {
            return block;
        }
        let blocks_per_arena = (ARENA_BYTES / std::mem::size_of::<SyncBlock>()).max(1);
        if self
            .arenas
            .last()
            .map_or(true, |arena| self.arena_cursor == arena.len())
        {
            let arena: Arena = (0..blocks_per_arena).map(|_| MaybeUninit::uninit()).collect();
            self.arenas.push(arena);
            self.arena_cursor = 0;
        }
        let arena = self.arenas.last_mut().unwrap();
        let block = arena[self.arena_cursor].as_mut_ptr();
        self.arena_cursor += 1;
        block
    }

    /// Run the destructor and return the storage to the block pool. The
    /// caller guarantees nothing references the block anymore.
    pub(crate) fn recycle_block(&mut self, block: *mut SyncBlock) {
        unsafe { std::ptr::drop_in_place(block) };
        self.free_blocks.push(block);
    }

    /// Return a slot to the free list. Does not touch the block.
    pub(crate) fn free_slot(&mut self, entry: &SyncTableEntry, index: u32) {
        entry.set_free(self.free_list_head);
        self.free_list_head = index;
        self.free_count += 1;
        self.active_count -= 1;
    }
}

pub struct SyncBlockCache {
    table: AtomicPtr<SyncTableEntry>,
    state: Mutex<CacheState>,
    /// Blocks whose slot was reclaimed but whose teardown must run off the
    /// GC scan path.
    pub(crate) deferred: crossbeam_queue::SegQueue<*mut SyncBlock>,
}

unsafe impl Send for SyncBlockCache {}
unsafe impl Sync for SyncBlockCache {}

static GLOBAL: Lazy<SyncBlockCache> = Lazy::new(SyncBlockCache::new);

fn alloc_table(capacity: u32) -> *mut SyncTableEntry {
    let mut entries = Vec::with_capacity(capacity as usize);
    entries.resize_with(capacity as usize, SyncTableEntry::new);
    Box::into_raw(entries.into_boxed_slice()) as *mut SyncTableEntry
}

pub(crate) unsafe fn free_table(table: *mut SyncTableEntry, capacity: u32) {
    drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(
        table,
        capacity as usize,
    )));
}

impl SyncBlockCache {
    pub fn new() -> Self {
        let capacity = options().initial_table_size.max(2);
        Self {
            table: AtomicPtr::new(alloc_table(capacity)),
            state: Mutex::new(CacheState {
                capacity,
                next_unused: 1,
                free_list_head: 0,
                cards: vec![0; CacheState::card_words_for(capacity)],
                old_tables: Vec::new(),
                arenas: Vec::new(),
                arena_cursor: 0,
                free_blocks: Vec::new(),
                active_count: 0,
                free_count: 0,
                grow_count: 0,
            }),
            deferred: crossbeam_queue::SegQueue::new(),
        }
    }

    pub fn global() -> &'static SyncBlockCache {
        &GLOBAL
    }

    pub(crate) fn lock_cache(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock()
    }

    /// Lock-free slot lookup. The index must have been published by this
    /// cache; the release store of the table pointer at growth time makes
    /// every published slot visible.
    pub(crate) fn entry(&self, index: u32) -> &SyncTableEntry {
        debug_assert!(index != 0);
        unsafe { &*self.table.load(Ordering::Acquire).add(index as usize) }
    }

    /// Block for an already-inflated header, or lazily inflate it.
    pub fn get_sync_block(&self, header: &ObjectHeader) -> Result<&SyncBlock> {
        if let Some(index) = header.try_get_sync_index() {
            let block = self.entry(index).block_ptr();
            debug_assert!(!block.is_null());
            return Ok(unsafe { &*block });
        }
        self.create_sync_block(header)
    }

    /// Reserve a table index without entering the monitor. When `held` the
    /// caller keeps the raw index past the next GC, so the block is pinned.
    pub fn get_or_create_sync_index(&self, header: &ObjectHeader, held: bool) -> Result<u32> {
        let block = self.get_sync_block(header)?;
        if held {
            block.set_precious();
        }
        Ok(block.index())
    }

    #[cold]
    fn create_sync_block(&self, header: &ObjectHeader) -> Result<&SyncBlock> {
        let mut state = self.lock_cache();
        // Another thread may have inflated this header while we queued.
        if let Some(index) = header.try_get_sync_index() {
            return Ok(unsafe { &*self.entry(index).block_ptr() });
        }
        let index = self.allocate_slot(&mut state)?;
        let storage = state.allocate_block_storage();
        unsafe { storage.write(SyncBlock::new(index)) };

        let entry = self.entry(index);
        entry.block.store(storage, Ordering::Release);
        entry.set_in_use(header as *const ObjectHeader as usize);
        state.dirty_card(index);
        state.active_count += 1;

        let block = unsafe { &*storage };
        // Publishing the index in the header is the linearization point;
        // the slot above is fully formed before this store.
        header.migrate_into_block(block, index);
        log::trace!(target: "sync", "inflated header {:p} -> slot {}", header, index);
        Ok(block)
    }

    fn allocate_slot(&self, state: &mut CacheState) -> Result<u32> {
        if state.free_list_head != 0 {
            let index = state.free_list_head;
            match self.entry(index).state() {
                SlotState::Free { next_free } => state.free_list_head = next_free,
                SlotState::InUse { .. } => unreachable!("corrupt sync table free list"),
            }
            state.free_count -= 1;
            return Ok(index);
        }
        if state.next_unused == state.capacity {
            self.grow_table(state)?;
        }
        let index = state.next_unused;
        state.next_unused += 1;
        Ok(index)
    }

    /// Double the table, capped at the largest index a header can encode.
    fn grow_table(&self, state: &mut CacheState) -> Result<()> {
        const MAX_SLOTS: u32 = MASK_SYNC_PAYLOAD;
        if state.capacity >= MAX_SLOTS {
            return Err(SyncError::ResourceExhausted(MAX_SLOTS));
        }
        let new_capacity = (state.capacity * 2).min(MAX_SLOTS);
        let new_table = alloc_table(new_capacity);
        let old_table = self.table.load(Ordering::Relaxed);
        for i in 0..state.capacity as usize {
            unsafe {
                let old = &*old_table.add(i);
                let new = &*new_table.add(i);
                new.object
                    .store(old.object.load(Ordering::Relaxed), Ordering::Relaxed);
                new.block
                    .store(old.block.load(Ordering::Relaxed), Ordering::Relaxed);
            }
        }
        // Readers racing this store keep using the old table, which stays
        // valid until the next GC scan frees it.
        self.table.store(new_table, Ordering::Release);
        state.old_tables.push((old_table, state.capacity));
        state.capacity = new_capacity;
        state
            .cards
            .resize(CacheState::card_words_for(new_capacity), 0);
        state.grow_count += 1;
        log::trace!(target: "sync", "sync table grown to {} slots", new_capacity);
        Ok(())
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.lock_cache();
        CacheStats {
            capacity: state.capacity,
            active: state.active_count,
            free: state.free_count,
            grow_count: state.grow_count,
            retired_tables: state.old_tables.len() as u32,
        }
    }

    /// Exhaustive consistency walk. Diagnostic builds only; compiles to a
    /// no-op in release.
    pub fn verify_sync_table(&self) {
        #[cfg(debug_assertions)]
        {
            let state = self.lock_cache();
            let mut free_seen = 0u32;
            for index in 1..state.next_unused {
                match self.entry(index).state() {
                    SlotState::Free { next_free } => {
                        assert!(self.entry(index).block_ptr().is_null());
                        assert!(next_free < state.next_unused);
                        free_seen += 1;
                    }
                    SlotState::InUse { object } => {
                        let block = self.entry(index).block_ptr();
                        assert!(!block.is_null());
                        assert_eq!(unsafe { &*block }.index(), index);
                        let header = unsafe { &*object };
                        assert_eq!(header.try_get_sync_index(), Some(index));
                    }
                }
            }
            assert_eq!(free_seen, state.free_count);
            assert_eq!(
                state.active_count + state.free_count,
                state.next_unused - 1
            );
            // The free list itself must thread through exactly the free slots.
            let mut cursor = state.free_list_head;
            let mut walked = 0u32;
            while cursor != 0 {
                match self.entry(cursor).state() {
                    SlotState::Free { next_free } => cursor = next_free,
                    SlotState::InUse { .. } => panic!("in-use slot on free list"),
                }
                walked += 1;
                assert!(walked <= state.free_count);
            }
            assert_eq!(walked, state.free_count);
        }
    }
}

impl Default for SyncBlockCache {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SyncBlockCache {
    fn drop(&mut self) {
        let next_unused = self.state.get_mut().next_unused;
        let table = *self.table.get_mut();
        for index in 1..next_unused {
            let block = unsafe { (*table.add(index as usize)).block_ptr() };
            if !block.is_null() {
                unsafe { std::ptr::drop_in_place(block) };
            }
        }
        while let Some(block) = self.deferred.pop() {
            unsafe { std::ptr::drop_in_place(block) };
        }
        let state = self.state.get_mut();
        unsafe { free_table(table, state.capacity) };
        for (table, capacity) in state.old_tables.drain(..) {
            unsafe { free_table(table, capacity) };
        }
    }
}
