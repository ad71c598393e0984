//! End-to-end exercises of the public surface: thin locks escalating under
//! real contention, wait/pulse as a condition variable, and a full table
//! lifecycle against a private cache.

use std::cell::UnsafeCell;
use std::collections::HashSet;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use rsmon::{CollectorBridge, ObjectHeader, SyncBlockCache};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

struct Guarded {
    header: ObjectHeader,
    value: UnsafeCell<u64>,
}

unsafe impl Sync for Guarded {}

#[test]
fn contended_counters_stay_consistent() {
    init_logging();
    const THREADS: usize = 8;
    const OBJECTS: usize = 16;
    const ROUNDS: u64 = 2_000;

    let objects: Arc<Vec<Guarded>> = Arc::new(
        (0..OBJECTS)
            .map(|_| Guarded {
                header: ObjectHeader::new(),
                value: UnsafeCell::new(0),
            })
            .collect(),
    );

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let objects = objects.clone();
            std::thread::spawn(move || {
                for round in 0..ROUNDS {
                    let obj = &objects[(t as u64 + round) as usize % OBJECTS];
                    obj.header.enter_monitor().unwrap();
                    unsafe { *obj.value.get() += 1 };
                    obj.header.leave_monitor().unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    for obj in objects.iter() {
        assert_eq!(unsafe { *obj.value.get() }, THREADS as u64 * ROUNDS / OBJECTS as u64);
        assert_eq!(obj.header.owning_thread(), None);
    }
}

struct Channel {
    header: ObjectHeader,
    queue: UnsafeCell<VecDeque<u64>>,
}

unsafe impl Sync for Channel {}

#[test]
fn wait_pulse_works_as_a_condition_variable() {
    init_logging();
    const ITEMS: u64 = 500;

    let channel = Arc::new(Channel {
        header: ObjectHeader::new(),
        queue: UnsafeCell::new(VecDeque::new()),
    });

    let consumer = {
        let channel = channel.clone();
        std::thread::spawn(move || {
            let mut received = Vec::new();
            channel.header.enter_monitor().unwrap();
            while received.len() < ITEMS as usize {
                let item = unsafe { (*channel.queue.get()).pop_front() };
                match item {
                    Some(item) => received.push(item),
                    None => {
                        let woken = channel.header.wait(Some(Duration::from_secs(30))).unwrap();
                        assert!(woken, "producer stalled");
                    }
                }
            }
            channel.header.leave_monitor().unwrap();
            received
        })
    };

    for item in 0..ITEMS {
        channel.header.enter_monitor().unwrap();
        unsafe { (*channel.queue.get()).push_back(item) };
        channel.header.pulse().unwrap();
        channel.header.leave_monitor().unwrap();
    }

    let received = consumer.join().unwrap();
    assert_eq!(received, (0..ITEMS).collect::<Vec<_>>());
}

#[test]
fn hash_codes_are_unique_enough_and_stable() {
    init_logging();
    let headers: Vec<ObjectHeader> = (0..64).map(|_| ObjectHeader::new()).collect();
    let hashes: Vec<u32> = headers.iter().map(|h| h.get_hash_code().unwrap()).collect();
    for (header, &hash) in headers.iter().zip(&hashes) {
        assert_eq!(header.get_hash_code().unwrap(), hash);
    }
    let distinct: HashSet<u32> = hashes.iter().copied().collect();
    // 64 draws from a 26-bit space; a collision here means a broken
    // generator, not bad luck.
    assert!(distinct.len() >= 63);
}

struct Sweeper {
    dead: HashSet<usize>,
}

impl CollectorBridge for Sweeper {
    fn condemned_generation(&self) -> u32 {
        2
    }

    fn max_generation(&self) -> u32 {
        2
    }

    fn generation_of(&self, _object: usize) -> u32 {
        2
    }

    fn scan_weak(&mut self, slot: &mut usize) -> bool {
        !self.dead.contains(slot)
    }
}

#[test]
fn table_lifecycle_through_growth_and_collection() {
    init_logging();
    let cache = SyncBlockCache::new();
    let total = 600usize;
    let headers: Vec<ObjectHeader> = (0..total).map(|_| ObjectHeader::new()).collect();
    for header in &headers {
        cache.get_or_create_sync_index(header, false).unwrap();
    }

    let before = cache.stats();
    assert_eq!(before.active, total as u32);
    assert!(before.grow_count >= 1);
    assert!(before.retired_tables >= 1);

    // First half of the objects die.
    let mut sweeper = Sweeper {
        dead: headers
            .iter()
            .take(total / 2)
            .map(|h| h as *const ObjectHeader as usize)
            .collect(),
    };
    cache.gc_weak_scan(&mut sweeper);
    cache.verify_sync_table();

    let after = cache.stats();
    assert_eq!(after.active, (total / 2) as u32);
    assert_eq!(after.free, (total / 2) as u32);
    assert_eq!(after.retired_tables, 0);

    // New arrivals refill the freed slots before any further growth.
    let newcomers: Vec<ObjectHeader> = (0..total / 2).map(|_| ObjectHeader::new()).collect();
    for header in &newcomers {
        cache.get_or_create_sync_index(header, false).unwrap();
    }
    let refilled = cache.stats();
    assert_eq!(refilled.free, 0);
    assert_eq!(refilled.grow_count, before.grow_count);
    cache.verify_sync_table();
}
