//! GC integration: the sync table holds the only non-owning references to
//! objects in the process, so the collector drives a weak scan over it at
//! the end of each collection.
//!
//! The scan runs with mutators stopped, under the cache lock. Dead objects
//! give their slot back to the free list; their block is destructed inline
//! unless something still references it, in which case teardown is deferred
//! to [`SyncBlockCache::cleanup_sync_blocks`], which a finalizer-style
//! worker runs outside the stop-the-world window.

use crate::cache::{free_table, SlotState, SyncBlockCache, CARD_SIZE, CARD_WORD_WIDTH};
use crate::header::ObjectHeader;

/// What the cache needs to know about the collector. `scan_weak` is the
/// moral equivalent of a weak handle scan: it reports liveness and may
/// rewrite the slot when the object moved.
pub trait CollectorBridge {
    fn condemned_generation(&self) -> u32;
    fn max_generation(&self) -> u32;

    /// True for a partial collection: only ephemeral generations are being
    /// condemned, so only dirty cards need scanning.
    fn is_ephemeral(&self) -> bool {
        self.condemned_generation() < self.max_generation()
    }

    /// Generation the object at `object` lives in after this collection.
    fn generation_of(&self, object: usize) -> u32;

    /// Returns `false` if the object is dead. For survivors of a moving
    /// collection, updates `slot` to the relocated address.
    fn scan_weak(&mut self, slot: &mut usize) -> bool;
}

impl SyncBlockCache {
    /// Weak-scan every slot the collection can affect. Ephemeral
    /// collections walk only dirty cards; full collections walk the whole
    /// table and rebuild the card state from scratch.
    pub fn gc_weak_scan(&self, bridge: &mut dyn CollectorBridge) {
        let mut state = self.lock_cache();

        // Tables superseded before this safepoint can no longer be read by
        // any mutator.
        for (table, capacity) in state.old_tables.drain(..).collect::<Vec<_>>() {
            unsafe { free_table(table, capacity) };
        }

        let next_unused = state.next_unused;
        let active_before = state.active_count;
        if bridge.is_ephemeral() {
            for word_index in 0..state.cards.len() {
                let word = state.cards[word_index];
                if word == 0 {
                    continue;
                }
                state.cards[word_index] = 0;
                for bit in 0..CARD_WORD_WIDTH {
                    if word & (1 << bit) == 0 {
                        continue;
                    }
                    let card = word_index as u32 * CARD_WORD_WIDTH + bit;
                    let first = (card * CARD_SIZE).max(1);
                    let last = ((card + 1) * CARD_SIZE).min(next_unused);
                    for index in first..last {
                        if self.scan_slot(&mut state, bridge, index) {
                            state.dirty_card(index);
                        }
                    }
                }
            }
        } else {
            for word in state.cards.iter_mut() {
                *word = 0;
            }
            for index in 1..next_unused {
                if self.scan_slot(&mut state, bridge, index) {
                    state.dirty_card(index);
                }
            }
        }
        log::debug!(
            target: "sync",
            "weak scan (gen {}): {} slots reclaimed, {} active",
            bridge.condemned_generation(),
            active_before - state.active_count,
            state.active_count
        );
    }

    /// Scan one slot. Returns `true` when the slot survives with an object
    /// the next ephemeral collection could move, i.e. its card must stay
    /// dirty.
    fn scan_slot(
        &self,
        state: &mut crate::cache::CacheState,
        bridge: &mut dyn CollectorBridge,
        index: u32,
    ) -> bool {
        let entry = self.entry(index);
        let object = match entry.state() {
            SlotState::Free { .. } => return false,
            SlotState::InUse { object } => object,
        };
        let block = entry.block_ptr();
        debug_assert!(!block.is_null());

        let mut address = object as usize;
        if !bridge.scan_weak(&mut address) {
            state.free_slot(entry, index);
            self.dispose_block(state, block);
            return false;
        }
        if address != object as usize {
            entry.set_in_use(address);
        }

        let sync_block = unsafe { &*block };
        if sync_block.is_disposable() && !sync_block.is_precious() {
            // The object lives on without a block; drop the index so the
            // next inflation starts fresh.
            unsafe { &*(address as *const ObjectHeader) }.clear_sync_index();
            state.free_slot(entry, index);
            self.dispose_block(state, block);
            return false;
        }

        bridge.generation_of(address) < bridge.max_generation()
    }

    fn dispose_block(
        &self,
        state: &mut crate::cache::CacheState,
        block: *mut crate::block::SyncBlock,
    ) {
        let sync_block = unsafe { &*block };
        if sync_block.can_dispose_inline() {
            state.recycle_block(block);
        } else {
            log::trace!(target: "sync", "deferring teardown of slot {} block", sync_block.index());
            self.deferred.push(block);
        }
    }

    /// Called after the heap has settled. A compacting collection can
    /// demote survivors into younger generations; their cards must be
    /// re-dirtied or the next ephemeral scan would miss them.
    pub fn gc_done(&self, demoting: bool, bridge: &dyn CollectorBridge) {
        if !demoting {
            return;
        }
        let mut state = self.lock_cache();
        for index in 1..state.next_unused {
            if let SlotState::InUse { object } = self.entry(index).state() {
                if bridge.generation_of(object as usize) < bridge.max_generation() {
                    state.dirty_card(index);
                }
            }
        }
    }

    /// Drain the deferred teardown queue. Teardown runs outside the cache
    /// lock; blocks that still have threads parked on them are requeued.
    pub fn cleanup_sync_blocks(&self) {
        let mut requeued = Vec::new();
        while let Some(block) = self.deferred.pop() {
            let sync_block = unsafe { &*block };
            if sync_block.is_transiently_precious() {
                requeued.push(block);
                continue;
            }
            if let Some(mut metadata) = sync_block.take_external_metadata() {
                metadata.teardown();
            }
            self.lock_cache().recycle_block(block);
        }
        for block in requeued {
            self.deferred.push(block);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::ExternalMetadata;
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct TestBridge {
        condemned: u32,
        dead: HashSet<usize>,
        relocations: HashMap<usize, usize>,
        young: HashSet<usize>,
    }

    impl TestBridge {
        fn full() -> Self {
            Self {
                condemned: 2,
                dead: HashSet::new(),
                relocations: HashMap::new(),
                young: HashSet::new(),
            }
        }

        fn ephemeral() -> Self {
            Self {
                condemned: 0,
                ..Self::full()
            }
        }
    }

    impl CollectorBridge for TestBridge {
        fn condemned_generation(&self) -> u32 {
            self.condemned
        }

        fn max_generation(&self) -> u32 {
            2
        }

        fn generation_of(&self, object: usize) -> u32 {
            if self.young.contains(&object) {
                0
            } else {
                2
            }
        }

        fn scan_weak(&mut self, slot: &mut usize) -> bool {
            if self.dead.contains(slot) {
                return false;
            }
            if let Some(&to) = self.relocations.get(slot) {
                *slot = to;
            }
            true
        }
    }

    fn addr(header: &ObjectHeader) -> usize {
        header as *const ObjectHeader as usize
    }

    #[test]
    fn dead_objects_release_their_slots() {
        let cache = SyncBlockCache::new();
        let headers: Vec<ObjectHeader> = (0..10).map(|_| ObjectHeader::new()).collect();
        for header in &headers {
            cache.get_or_create_sync_index(header, false).unwrap();
        }

        let mut bridge = TestBridge::full();
        for header in headers.iter().take(5) {
            bridge.dead.insert(addr(header));
        }
        cache.gc_weak_scan(&mut bridge);

        let stats = cache.stats();
        assert_eq!(stats.active, 5);
        assert_eq!(stats.free, 5);
        cache.verify_sync_table();

        // Freed slots are handed out again before the table grows further.
        let replacement = ObjectHeader::new();
        let index = cache.get_or_create_sync_index(&replacement, false).unwrap();
        assert!(index < 11);
        assert_eq!(cache.stats().free, 4);
    }

    #[test]
    fn survivors_follow_relocation() {
        let cache = SyncBlockCache::new();
        let old_place = ObjectHeader::new();
        let index = cache.get_or_create_sync_index(&old_place, false).unwrap();

        let new_place = ObjectHeader::new();
        new_place.set_raw(old_place.raw());

        let mut bridge = TestBridge::full();
        bridge.relocations.insert(addr(&old_place), addr(&new_place));
        cache.gc_weak_scan(&mut bridge);

        assert_eq!(cache.get_sync_block(&new_place).unwrap().index(), index);
        cache.verify_sync_table();
    }

    #[test]
    fn disposable_blocks_detach_from_live_objects() {
        let cache = SyncBlockCache::new();
        let header = ObjectHeader::new();
        cache.get_or_create_sync_index(&header, false).unwrap();
        cache.get_sync_block(&header).unwrap().set_disposable();

        let mut bridge = TestBridge::full();
        cache.gc_weak_scan(&mut bridge);

        assert_eq!(header.try_get_sync_index(), None);
        assert_eq!(cache.stats().active, 0);
        cache.verify_sync_table();
    }

    #[test]
    fn precious_blocks_survive_disposal_requests() {
        let cache = SyncBlockCache::new();
        let header = ObjectHeader::new();
        let index = cache.get_or_create_sync_index(&header, true).unwrap();
        cache.get_sync_block(&header).unwrap().set_disposable();

        let mut bridge = TestBridge::full();
        cache.gc_weak_scan(&mut bridge);

        assert_eq!(header.try_get_sync_index(), Some(index));
        assert_eq!(cache.stats().active, 1);
    }

    struct Teardown(Arc<AtomicUsize>);
    impl ExternalMetadata for Teardown {
        fn teardown(&mut self) {
            self.0.fetch_add(1, Ordering::AcqRel);
        }
    }

    #[test]
    fn external_metadata_defers_to_cleanup() {
        let cache = SyncBlockCache::new();
        let header = ObjectHeader::new();
        cache.get_or_create_sync_index(&header, false).unwrap();
        let torn_down = Arc::new(AtomicUsize::new(0));
        assert!(cache
            .get_sync_block(&header)
            .unwrap()
            .set_external_metadata(Box::new(Teardown(torn_down.clone()))));

        let mut bridge = TestBridge::full();
        bridge.dead.insert(addr(&header));
        cache.gc_weak_scan(&mut bridge);

        // Slot reclaimed immediately, teardown only on the cleanup pass.
        assert_eq!(cache.stats().active, 0);
        assert_eq!(torn_down.load(Ordering::Acquire), 0);
        cache.cleanup_sync_blocks();
        assert_eq!(torn_down.load(Ordering::Acquire), 1);
        cache.verify_sync_table();
    }

    #[test]
    fn ephemeral_scans_skip_clean_cards() {
        let cache = SyncBlockCache::new();
        let header = ObjectHeader::new();
        cache.get_or_create_sync_index(&header, false).unwrap();

        // A full scan of an old-generation survivor leaves its card clean.
        cache.gc_weak_scan(&mut TestBridge::full());

        let mut bridge = TestBridge::ephemeral();
        bridge.dead.insert(addr(&header));
        cache.gc_weak_scan(&mut bridge);
        assert_eq!(cache.stats().active, 1);

        // The full scan still sees it.
        let mut bridge = TestBridge::full();
        bridge.dead.insert(addr(&header));
        cache.gc_weak_scan(&mut bridge);
        assert_eq!(cache.stats().active, 0);
    }

    #[test]
    fn demotion_re_dirties_cards() {
        let cache = SyncBlockCache::new();
        let header = ObjectHeader::new();
        cache.get_or_create_sync_index(&header, false).unwrap();
        cache.gc_weak_scan(&mut TestBridge::full());

        // The object was demoted into the young generation after the scan.
        let mut bridge = TestBridge::ephemeral();
        bridge.young.insert(addr(&header));
        cache.gc_done(true, &bridge);

        bridge.dead.insert(addr(&header));
        cache.gc_weak_scan(&mut bridge);
        assert_eq!(cache.stats().active, 0);
    }

    #[test]
    fn growth_retires_old_tables_until_scan() {
        let cache = SyncBlockCache::new();
        let total = (crate::cache::options().initial_table_size + 1) as usize;
        let headers: Vec<ObjectHeader> = (0..total).map(|_| ObjectHeader::new()).collect();
        for header in &headers {
            cache.get_or_create_sync_index(header, false).unwrap();
        }
        assert_eq!(cache.stats().retired_tables, 1);

        cache.gc_weak_scan(&mut TestBridge::full());
        assert_eq!(cache.stats().retired_tables, 0);
        cache.verify_sync_table();
    }
}
