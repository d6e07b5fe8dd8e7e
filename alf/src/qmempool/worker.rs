//! Per-worker cache slots and the exclusive `Worker` guard.

use std::cell::Cell;
use std::fmt;
use std::marker::PhantomData;

use super::{ObjectSource, Pool};
use crate::ring::{Ring, RingBuilder, RingError, TransferPolicy};
use crate::shim::atomic::{AtomicBool, AtomicU64, Ordering};
use crate::trace::{debug, trace};

/// Marker type to opt-out of `Sync` while remaining `Send`.
type PhantomUnsync = PhantomData<Cell<&'static ()>>;

/// Snapshot of one worker's counters.
///
/// `shared_refills + shared_spills` is the number of reservations the worker
/// made on the shared ring, which is the contention the two-tier design is
/// meant to keep low.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    /// Allocations served from the local cache.
    pub cache_hits: u64,
    /// Allocations that pulled a bulk from the shared ring.
    pub shared_refills: u64,
    /// Frees that pushed a bulk to the shared ring.
    pub shared_spills: u64,
    /// Objects obtained from the source.
    pub source_allocs: u64,
    /// Objects handed back to the source because the shared ring was full.
    pub source_frees: u64,
    /// Allocations that returned `None`.
    pub alloc_failures: u64,
}

impl WorkerStats {
    /// Reservations made on the shared ring.
    #[inline]
    #[must_use]
    pub const fn shared_ops(&self) -> u64 {
        self.shared_refills + self.shared_spills
    }
}

/// Counters written only by the slot's current owner.
struct Counters {
    cache_hits: AtomicU64,
    shared_refills: AtomicU64,
    shared_spills: AtomicU64,
    source_allocs: AtomicU64,
    source_frees: AtomicU64,
    alloc_failures: AtomicU64,
}

impl Counters {
    fn new() -> Self {
        Self {
            cache_hits: AtomicU64::new(0),
            shared_refills: AtomicU64::new(0),
            shared_spills: AtomicU64::new(0),
            source_allocs: AtomicU64::new(0),
            source_frees: AtomicU64::new(0),
            alloc_failures: AtomicU64::new(0),
        }
    }

    /// Single writer, so load + store instead of a read-modify-write.
    #[inline]
    fn add(counter: &AtomicU64, n: u64) {
        counter.store(counter.load(Ordering::Relaxed) + n, Ordering::Relaxed);
    }

    fn snapshot(&self) -> WorkerStats {
        WorkerStats {
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            shared_refills: self.shared_refills.load(Ordering::Relaxed),
            shared_spills: self.shared_spills.load(Ordering::Relaxed),
            source_allocs: self.source_allocs.load(Ordering::Relaxed),
            source_frees: self.source_frees.load(Ordering::Relaxed),
            alloc_failures: self.alloc_failures.load(Ordering::Relaxed),
        }
    }
}

/// One worker's local cache plus its ownership flag.
#[repr(align(64))]
pub(super) struct WorkerSlot<T> {
    claimed: AtomicBool,
    pub(super) cache: Ring<T>,
    counters: Counters,
}

impl<T> WorkerSlot<T> {
    pub(super) fn new(capacity: u32) -> Result<Self, RingError> {
        Ok(Self {
            claimed: AtomicBool::new(false),
            cache: RingBuilder::new(capacity)
                .policy(TransferPolicy::Burst)
                .build()?,
            counters: Counters::new(),
        })
    }

    /// Acquire pairs with the release in `Worker::drop`, so a new owner sees
    /// every cache write made by the previous one.
    pub(super) fn try_claim(&self) -> bool {
        self.claimed
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    pub(super) fn stats(&self) -> WorkerStats {
        self.counters.snapshot()
    }
}

/// Exclusive handle on one worker's cache, obtained from
/// [`Pool::worker`](super::Pool::worker).
///
/// The guard is the execution-unit token: while it is alive no other guard
/// for the same id can exist, which is what makes single-producer and
/// single-consumer access to the local cache sound. `Worker` is [`Send`] but
/// not [`Sync`]; move it to the thread that does the allocating.
pub struct Worker<'a, S: ObjectSource> {
    pool: &'a Pool<S>,
    slot: &'a WorkerSlot<S::Object>,
    id: usize,
    /// Staging area for bulk transfers; empty between calls.
    scratch: Vec<S::Object>,
    _unsync: PhantomUnsync,
}

impl<'a, S: ObjectSource> Worker<'a, S> {
    pub(super) fn new(pool: &'a Pool<S>, slot: &'a WorkerSlot<S::Object>, id: usize) -> Self {
        let config = pool.config();
        Self {
            pool,
            slot,
            id,
            scratch: Vec::with_capacity(config.refill_burst().max(config.bulk_size) as usize),
            _unsync: PhantomData,
        }
    }

    /// This worker's id.
    #[inline]
    #[must_use]
    pub const fn id(&self) -> usize {
        self.id
    }

    /// Objects currently in the local cache.
    #[inline]
    #[must_use]
    pub fn local_count(&self) -> u32 {
        self.slot.cache.count()
    }

    #[must_use]
    pub fn stats(&self) -> WorkerStats {
        self.slot.stats()
    }

    /// Takes an object: local cache, then the shared ring, then the source.
    ///
    /// Returns `None` only if both tiers are empty and the source fails.
    pub fn alloc(&mut self) -> Option<S::Object> {
        // SAFETY: This guard is the only consumer of the local cache.
        if let Some(object) = unsafe { self.slot.cache.dequeue_sc() } {
            Counters::add(&self.slot.counters.cache_hits, 1);
            return Some(object);
        }
        self.refill_from_shared()
            .or_else(|| self.alloc_from_source())
    }

    /// Returns an object: local cache, spilling a bulk to the shared ring
    /// (and past it, to the source) when the cache is full.
    ///
    /// # Panics
    ///
    /// Panics if the local cache is still full right after a spill, which
    /// means its single-producer/single-consumer discipline was broken.
    pub fn free(&mut self, object: S::Object) {
        // SAFETY: This guard is the only producer of the local cache.
        let object = match unsafe { self.slot.cache.enqueue_sp(object) } {
            Ok(()) => return,
            Err(object) => object,
        };

        self.spill(self.pool.config().bulk_size);

        // SAFETY: As above.
        if unsafe { self.slot.cache.enqueue_sp(object) }.is_err() {
            panic!("worker {} cache still full after spilling a bulk", self.id);
        }
    }

    /// Moves the whole local cache to the shared ring, overflowing to the
    /// source. Use before retiring a worker whose cache will not be reused.
    pub fn flush(&mut self) {
        let bulk = self.pool.config().bulk_size;
        while !self.slot.cache.is_empty() {
            self.spill(bulk);
        }
    }

    /// Bulk from the shared ring: the first object goes to the caller, the
    /// rest into the (empty) local cache.
    fn refill_from_shared(&mut self) -> Option<S::Object> {
        let bulk = self.pool.config().bulk_size;
        if self.pool.shared.dequeue_bulk(&mut self.scratch, bulk) == 0 {
            return None;
        }
        Counters::add(&self.slot.counters.shared_refills, 1);
        trace!(worker = self.id, moved = self.scratch.len(), "refilled from shared pool");

        let object = self.scratch.remove(0);
        // SAFETY: This guard is the only producer of the local cache.
        let stored = unsafe { self.slot.cache.enqueue_bulk_sp(&mut self.scratch) };
        // The cache was empty and holds at least `bulk_size - 1` objects.
        debug_assert!(stored.is_ok() && self.scratch.is_empty());
        self.release_scratch();
        Some(object)
    }

    /// Both tiers are empty: one object for the caller, then a burst into the
    /// shared ring so the next misses on any worker find something.
    fn alloc_from_source(&mut self) -> Option<S::Object> {
        let source = self.pool.source();
        let Some(object) = source.alloc() else {
            Counters::add(&self.slot.counters.alloc_failures, 1);
            debug!(worker = self.id, "object source exhausted");
            return None;
        };

        let shared = &self.pool.shared;
        let burst = self.pool.config().refill_burst().min(shared.avail_space());
        for _ in 0..burst {
            match source.alloc() {
                Some(extra) => self.scratch.push(extra),
                None => break,
            }
        }
        let obtained = self.scratch.len() as u64;
        Counters::add(&self.slot.counters.source_allocs, obtained + 1);

        // Burst policy never errors; a partial fit leaves the rest in scratch.
        let stored = shared.enqueue_bulk(&mut self.scratch).unwrap_or_default();
        debug_assert_eq!(u64::from(stored.count) + self.scratch.len() as u64, obtained);
        trace!(
            worker = self.id,
            obtained,
            stored = stored.count,
            requested = burst,
            "refilled shared pool from source"
        );
        self.release_scratch();
        Some(object)
    }

    /// Moves up to `bulk` objects from the local cache to the shared ring.
    fn spill(&mut self, bulk: u32) {
        // SAFETY: This guard is the only consumer of the local cache.
        let moved = unsafe { self.slot.cache.dequeue_bulk_sc(&mut self.scratch, bulk) };
        if moved == 0 {
            return;
        }
        let stored = self.pool.shared.enqueue_bulk(&mut self.scratch).unwrap_or_default();
        // A full shared ring refuses before reserving anything.
        if stored.count > 0 {
            Counters::add(&self.slot.counters.shared_spills, 1);
        }
        trace!(worker = self.id, moved, stored = stored.count, "spilled to shared pool");
        self.release_scratch();
    }

    /// Hands whatever the shared ring rejected back to the source.
    fn release_scratch(&mut self) {
        if self.scratch.is_empty() {
            return;
        }
        let rejected = self.scratch.len() as u64;
        let source = self.pool.source();
        for object in self.scratch.drain(..) {
            source.free(object);
        }
        Counters::add(&self.slot.counters.source_frees, rejected);
        debug!(worker = self.id, rejected, "shared pool full, returned objects to source");
    }
}

impl<S: ObjectSource> Drop for Worker<'_, S> {
    fn drop(&mut self) {
        // Release pairs with the acquire in `WorkerSlot::try_claim`.
        self.slot.claimed.store(false, Ordering::Release);
    }
}

impl<S: ObjectSource> fmt::Debug for Worker<'_, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("local_count", &self.local_count())
            .finish_non_exhaustive()
    }
}
