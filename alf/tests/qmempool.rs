//! Behaviour of [`alf::qmempool::Pool`] against counting object sources.

#![cfg(not(feature = "loom"))]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::thread;

use alf::qmempool::{BoxSource, ObjectSource, Pool, PoolConfig, PoolError};

static INIT_TRACING: Once = Once::new();

/// Initialize tracing for tests (only once).
fn init_test_tracing() {
    INIT_TRACING.call_once(|| {
        alf::init_tracing();
    });
}

/// Source that hands out at most `limit` live objects and tracks how many
/// are outstanding.
struct Bounded {
    limit: usize,
    outstanding: AtomicUsize,
    allocs: AtomicUsize,
}

impl Bounded {
    fn new(limit: usize) -> Self {
        Self {
            limit,
            outstanding: AtomicUsize::new(0),
            allocs: AtomicUsize::new(0),
        }
    }

    fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }
}

impl ObjectSource for Bounded {
    type Object = Box<u64>;

    fn alloc(&self) -> Option<Box<u64>> {
        let mut current = self.outstanding.load(Ordering::SeqCst);
        loop {
            if current >= self.limit {
                return None;
            }
            match self.outstanding.compare_exchange_weak(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        let n = self.allocs.fetch_add(1, Ordering::SeqCst);
        Some(Box::new(n as u64))
    }

    fn free(&self, object: Box<u64>) {
        drop(object);
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
    }
}

fn small_config(workers: usize) -> PoolConfig {
    PoolConfig {
        workers,
        local_capacity: 32,
        shared_capacity: 128,
        prealloc: 0,
        ..PoolConfig::default()
    }
}

#[test]
fn local_cache_never_fills_completely() {
    init_test_tracing();
    let source = Arc::new(Bounded::new(usize::MAX));
    let pool = Pool::new(small_config(1), Arc::clone(&source)).unwrap();
    let capacity = pool.config().local_capacity;
    let mut worker = pool.worker(0).unwrap();

    let mut held = Vec::new();
    for round in 0..5 {
        for _ in 0..(40 + round * 13) {
            held.push(worker.alloc().unwrap());
            assert!(worker.local_count() < capacity);
        }
        for object in held.drain(..) {
            worker.free(object);
            assert!(worker.local_count() < capacity);
        }
    }
}

#[test]
fn alloc_after_free_is_a_cache_hit() {
    init_test_tracing();
    let pool = Pool::new(
        PoolConfig { prealloc: 64, ..small_config(1) },
        BoxSource::<u64>::new(),
    )
    .unwrap();
    let mut worker = pool.worker(0).unwrap();

    let object = worker.alloc().unwrap();
    let before = worker.stats();
    worker.free(object);
    let again = worker.alloc().unwrap();
    let after = worker.stats();

    assert_eq!(after.cache_hits, before.cache_hits + 1);
    assert_eq!(after.shared_ops(), before.shared_ops());
    assert_eq!(after.source_allocs, before.source_allocs);
    worker.free(again);
}

#[test]
fn free_into_empty_cache_returns_same_object() {
    init_test_tracing();
    let pool = Pool::new(small_config(1), Bounded::new(1)).unwrap();
    let mut worker = pool.worker(0).unwrap();

    let object = worker.alloc().unwrap();
    let address: *const u64 = &*object;
    assert_eq!(worker.local_count(), 0);

    worker.free(object);
    let again = worker.alloc().unwrap();
    assert!(std::ptr::eq(address, &*again));
    worker.free(again);
}

#[test]
fn exhaustion_returns_none_exactly_at_limit() {
    init_test_tracing();
    const LIMIT: usize = 100;
    let source = Arc::new(Bounded::new(LIMIT));
    let pool = Pool::new(small_config(2), Arc::clone(&source)).unwrap();
    let mut worker = pool.worker(0).unwrap();

    let mut held = Vec::new();
    while let Some(object) = worker.alloc() {
        held.push(object);
        assert!(held.len() <= LIMIT);
    }
    assert_eq!(held.len(), LIMIT);
    assert_eq!(source.outstanding(), LIMIT);
    assert_eq!(worker.stats().alloc_failures, 1);

    // Still none on retry, and nothing panics.
    assert!(worker.alloc().is_none());

    for object in held.drain(..) {
        worker.free(object);
    }
    drop(worker);
    pool.destroy();
    assert_eq!(source.outstanding(), 0);
}

#[test]
fn spills_overflow_back_to_source() {
    init_test_tracing();
    let source = Arc::new(Bounded::new(usize::MAX));
    let config = PoolConfig {
        workers: 1,
        local_capacity: 16,
        shared_capacity: 32,
        prealloc: 0,
        ..PoolConfig::default()
    };
    let pool = Pool::new(config, Arc::clone(&source)).unwrap();
    let mut worker = pool.worker(0).unwrap();

    let held: Vec<_> = (0..200).map(|_| worker.alloc().unwrap()).collect();
    for object in held {
        worker.free(object);
    }

    // Shared ring full; everything it rejected went back to the source.
    let local = worker.local_count();
    assert!(local < 16);
    assert_eq!(pool.shared_count(), 31);
    assert_eq!(source.outstanding(), (local + 31) as usize);
    assert!(worker.stats().source_frees > 0);
}

#[test]
fn worker_tokens_are_exclusive() {
    init_test_tracing();
    let pool = Pool::new(small_config(2), BoxSource::<u64>::new()).unwrap();

    let w0 = pool.worker(0).unwrap();
    assert!(matches!(pool.worker(0), Err(PoolError::WorkerBusy { id: 0 })));
    assert!(matches!(
        pool.worker(5),
        Err(PoolError::UnknownWorker { id: 5, workers: 2 })
    ));

    // A token can move to another thread and comes back free once dropped.
    thread::scope(|s| {
        s.spawn(move || {
            let mut w0 = w0;
            let object = w0.alloc().unwrap();
            w0.free(object);
        });
    });
    let w0 = pool.worker(0).unwrap();
    assert_eq!(w0.local_count(), 1);
    assert_eq!(pool.shared_count(), 32);
    let stats = pool.worker_stats(0).unwrap();
    assert_eq!(stats.shared_refills, 0);
    assert_eq!(stats.source_allocs, 33);
}

#[test]
fn concurrent_workers_conserve_objects() {
    init_test_tracing();
    const WORKERS: usize = 4;
    let source = Arc::new(Bounded::new(usize::MAX));
    let pool = Pool::new(
        PoolConfig { prealloc: 64, ..small_config(WORKERS) },
        Arc::clone(&source),
    )
    .unwrap();

    thread::scope(|s| {
        for id in 0..WORKERS {
            let pool = &pool;
            s.spawn(move || {
                let mut worker = pool.worker(id).unwrap();
                let mut held = Vec::new();
                for round in 0..200 {
                    for _ in 0..(round % 50) {
                        held.push(worker.alloc().unwrap());
                    }
                    for object in held.drain(..) {
                        worker.free(object);
                    }
                }
                worker.flush();
                assert_eq!(worker.local_count(), 0);
            });
        }
    });

    let in_pool = pool.shared_count() as usize
        + (0..WORKERS)
            .map(|id| pool.local_count(id).unwrap() as usize)
            .sum::<usize>();
    assert_eq!(in_pool, source.outstanding());

    let released = pool.destroy();
    assert_eq!(released, in_pool);
    assert_eq!(source.outstanding(), 0);
}

#[test]
fn failed_prealloc_returns_partial_objects() {
    init_test_tracing();
    let source = Arc::new(Bounded::new(10));
    let result = Pool::new(
        PoolConfig { prealloc: 50, ..small_config(1) },
        Arc::clone(&source),
    );
    assert!(matches!(
        result,
        Err(PoolError::Prealloc { requested: 50, obtained: 10 })
    ));
    assert_eq!(source.outstanding(), 0);
}

#[test]
fn spill_into_full_shared_ring_goes_to_source() {
    init_test_tracing();
    let source = Arc::new(Bounded::new(usize::MAX));
    let config = PoolConfig {
        workers: 1,
        local_capacity: 16,
        shared_capacity: 32,
        prealloc: 32,
        ..PoolConfig::default()
    };
    let pool = Pool::new(config, Arc::clone(&source)).unwrap();
    assert_eq!(pool.shared_count(), 31);
    let mut worker = pool.worker(0).unwrap();

    for _ in 0..15 {
        worker.free(source.alloc().unwrap());
    }
    assert_eq!(worker.local_count(), 15);
    let before = worker.stats();

    worker.free(source.alloc().unwrap());
    let after = worker.stats();

    // The shared ring refused the whole bulk without reserving anything.
    assert_eq!(pool.shared_count(), 31);
    assert_eq!(worker.local_count(), 1);
    assert_eq!(after.shared_spills, before.shared_spills);
    assert_eq!(after.shared_ops(), before.shared_ops());
    assert_eq!(after.source_frees, before.source_frees + 15);
    assert_eq!(source.outstanding(), 31 + 1);
}

#[test]
fn partial_source_burst_still_reaches_shared_ring() {
    init_test_tracing();
    let source = Arc::new(Bounded::new(20));
    let pool = Pool::new(small_config(1), Arc::clone(&source)).unwrap();
    let mut worker = pool.worker(0).unwrap();

    let object = worker.alloc();
    assert!(object.is_some());
    // One for the caller, 19 of the requested 32 into the shared ring.
    assert_eq!(pool.shared_count(), 19);
    assert_eq!(worker.local_count(), 0);
    assert_eq!(source.outstanding(), 20);

    let stats = worker.stats();
    assert_eq!(stats.source_allocs, 20);
    assert_eq!(stats.source_frees, 0);
    assert_eq!(stats.alloc_failures, 0);
}
