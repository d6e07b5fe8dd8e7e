//! Two-tier object pool on top of [`Ring`].
//!
//! Objects come from an [`ObjectSource`] and are cached in two tiers:
//!
//! ```text
//!   Worker 0        Worker 1        Worker N-1
//!  [local ring]    [local ring]    [local ring]     SP/SC, no contention
//!        \              |              /
//!         +------ [shared ring] ------+             MP/MC, one CAS per bulk
//!                       |
//!                 [ObjectSource]                    only on double miss/overflow
//! ```
//!
//! Each worker owns a small single-producer/single-consumer cache. Only when
//! it runs dry (or full) does the worker touch the shared ring, and then in
//! bulks of [`PoolConfig::bulk_size`], so the shared ring sees one
//! reservation per bulk rather than per object. The source is reached only
//! when the shared ring is empty too, and is asked for a whole burst of
//! `bulk_size * refill_multiplier` objects.
//!
//! # Worker tokens
//!
//! Local caches are only safe to use from one thread at a time. That
//! exclusivity is a value: [`Pool::worker`] hands out a [`Worker`] guard per
//! id, at most one alive at a time, and the cache is released when the guard
//! drops.
//!
//! # Example
//!
//! ```
//! use alf::qmempool::{BoxSource, Pool, PoolConfig};
//!
//! let config = PoolConfig { workers: 2, prealloc: 32, ..PoolConfig::default() };
//! let pool = Pool::new(config, BoxSource::<[u8; 32]>::new()).unwrap();
//!
//! let mut worker = pool.worker(0).unwrap();
//! let buf = worker.alloc().unwrap();
//! worker.free(buf);
//! assert_eq!(worker.alloc().map(|b| b.len()), Some(32));
//! ```

mod config;
mod source;
mod worker;

pub use config::{BULK_SIZE, ConfigError, PoolConfig, REFILL_MULTIPLIER};
pub use source::{BoxSource, ObjectSource};
pub use worker::{Worker, WorkerStats};

use std::fmt;

use thiserror::Error;

use crate::ring::{Ring, RingBuilder, TransferPolicy};
use crate::trace::{debug, info, warn};
use worker::WorkerSlot;

/// Errors from [`Pool`] construction and worker claims.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("invalid pool configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("object source produced {obtained} of {requested} preallocated objects")]
    Prealloc { requested: u32, obtained: u32 },

    #[error("worker {id} out of range (pool has {workers} workers)")]
    UnknownWorker { id: usize, workers: usize },

    #[error("worker {id} is already claimed")]
    WorkerBusy { id: usize },
}

/// A pool of recyclable objects with per-worker caches.
pub struct Pool<S: ObjectSource> {
    config: PoolConfig,
    shared: Ring<S::Object>,
    workers: Box<[WorkerSlot<S::Object>]>,
    source: S,
}

impl<S: ObjectSource> Pool<S> {
    /// Builds the rings and preallocates `config.prealloc` objects (clamped
    /// to the shared ring's usable capacity) into the shared ring.
    ///
    /// # Errors
    ///
    /// - [`PoolError::Config`] if the configuration is invalid.
    /// - [`PoolError::Prealloc`] if the source failed during preallocation.
    ///   Objects obtained so far are returned to the source.
    pub fn new(config: PoolConfig, source: S) -> Result<Self, PoolError> {
        config.validate()?;

        let shared = RingBuilder::new(config.shared_capacity)
            .policy(TransferPolicy::Burst)
            .build()
            .map_err(ConfigError::SharedRing)?;
        let workers = (0..config.workers)
            .map(|_| WorkerSlot::new(config.local_capacity))
            .collect::<Result<Vec<_>, _>>()
            .map_err(ConfigError::LocalRing)?
            .into_boxed_slice();

        let pool = Self {
            config,
            shared,
            workers,
            source,
        };

        let requested = config.prealloc.min(pool.shared.usable_capacity());
        let mut objects = Vec::with_capacity(requested as usize);
        for _ in 0..requested {
            match pool.source.alloc() {
                Some(object) => objects.push(object),
                None => break,
            }
        }
        let obtained = objects.len() as u32;
        // Fits: at most the usable capacity of an empty ring.
        let enqueued = pool.shared.enqueue_bulk(&mut objects).unwrap_or_default();
        debug_assert_eq!(enqueued.count, obtained);

        if obtained < requested {
            warn!(requested, obtained, "object source exhausted during prealloc");
            // Dropping the pool hands the partial prealloc back to the source.
            return Err(PoolError::Prealloc {
                requested,
                obtained,
            });
        }

        info!(
            workers = config.workers,
            local_capacity = config.local_capacity,
            shared_capacity = config.shared_capacity,
            prealloc = obtained,
            bulk_size = config.bulk_size,
            "pool created"
        );
        Ok(pool)
    }

    /// Claims worker `id`'s cache.
    ///
    /// # Errors
    ///
    /// - [`PoolError::UnknownWorker`] if `id >= config().workers`.
    /// - [`PoolError::WorkerBusy`] if another guard for `id` is alive.
    pub fn worker(&self, id: usize) -> Result<Worker<'_, S>, PoolError> {
        let slot = self.workers.get(id).ok_or(PoolError::UnknownWorker {
            id,
            workers: self.workers.len(),
        })?;
        if !slot.try_claim() {
            return Err(PoolError::WorkerBusy { id });
        }
        Ok(Worker::new(self, slot, id))
    }

    #[inline]
    #[must_use]
    pub const fn config(&self) -> &PoolConfig {
        &self.config
    }

    #[inline]
    #[must_use]
    pub const fn source(&self) -> &S {
        &self.source
    }

    #[inline]
    #[must_use]
    pub fn workers(&self) -> usize {
        self.workers.len()
    }

    /// Objects currently in the shared ring.
    #[inline]
    #[must_use]
    pub fn shared_count(&self) -> u32 {
        self.shared.count()
    }

    /// Objects currently in worker `id`'s cache.
    #[must_use]
    pub fn local_count(&self, id: usize) -> Option<u32> {
        self.workers.get(id).map(|slot| slot.cache.count())
    }

    /// Counter snapshot for worker `id`. May lag behind a worker that is
    /// running on another thread.
    #[must_use]
    pub fn worker_stats(&self, id: usize) -> Option<WorkerStats> {
        self.workers.get(id).map(WorkerSlot::stats)
    }

    /// Drains every cache back to the source and drops the pool.
    ///
    /// Returns the number of objects returned to the source. Dropping the
    /// pool does the same thing.
    pub fn destroy(mut self) -> usize {
        self.drain()
    }

    fn drain(&mut self) -> usize {
        let mut released = 0;
        for slot in &*self.workers {
            while let Some(object) = slot.cache.dequeue() {
                self.source.free(object);
                released += 1;
            }
        }
        while let Some(object) = self.shared.dequeue() {
            self.source.free(object);
            released += 1;
        }
        released
    }
}

impl<S: ObjectSource> Drop for Pool<S> {
    fn drop(&mut self) {
        let released = self.drain();
        if released > 0 {
            info!(released, "pool destroyed");
        } else {
            debug!("pool destroyed");
        }
    }
}

impl<S: ObjectSource> fmt::Debug for Pool<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("config", &self.config)
            .field("shared_count", &self.shared_count())
            .finish_non_exhaustive()
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

    /// Hands out numbered objects and tracks how many are outstanding.
    #[derive(Default)]
    struct Counting {
        next: AtomicU32,
        outstanding: AtomicUsize,
    }

    impl ObjectSource for Counting {
        type Object = u32;

        fn alloc(&self) -> Option<u32> {
            self.outstanding.fetch_add(1, Ordering::Relaxed);
            Some(self.next.fetch_add(1, Ordering::Relaxed))
        }

        fn free(&self, _object: u32) {
            self.outstanding.fetch_sub(1, Ordering::Relaxed);
        }
    }

    fn config() -> PoolConfig {
        PoolConfig {
            workers: 2,
            local_capacity: 32,
            shared_capacity: 64,
            prealloc: 0,
            ..PoolConfig::default()
        }
    }

    #[test]
    fn test_prealloc_fills_shared_ring() {
        let source = Arc::new(Counting::default());
        let pool = Pool::new(PoolConfig { prealloc: 40, ..config() }, Arc::clone(&source)).unwrap();
        assert_eq!(pool.shared_count(), 40);
        assert_eq!(pool.local_count(0), Some(0));
        assert_eq!(source.outstanding.load(Ordering::Relaxed), 40);

        assert_eq!(pool.destroy(), 40);
        assert_eq!(source.outstanding.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_prealloc_clamped_to_usable_capacity() {
        let pool = Pool::new(PoolConfig { prealloc: 64, ..config() }, Counting::default()).unwrap();
        assert_eq!(pool.shared_count(), 63);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let err = Pool::new(PoolConfig { workers: 0, ..config() }, Counting::default()).unwrap_err();
        assert_eq!(err, PoolError::Config(ConfigError::NoWorkers));
    }

    #[test]
    fn test_miss_pulls_bulk_from_shared() {
        let pool = Pool::new(PoolConfig { prealloc: 40, ..config() }, Counting::default()).unwrap();
        let mut worker = pool.worker(0).unwrap();

        let first = worker.alloc().unwrap();
        assert_eq!(first, 0);
        assert_eq!(worker.local_count(), 15);
        assert_eq!(pool.shared_count(), 24);

        // Next 15 come from the cache in FIFO order.
        for expected in 1..16 {
            assert_eq!(worker.alloc(), Some(expected));
        }
        let stats = worker.stats();
        assert_eq!(stats.shared_refills, 1);
        assert_eq!(stats.cache_hits, 15);
        assert_eq!(stats.source_allocs, 0);
    }

    #[test]
    fn test_empty_pool_refills_from_source() {
        let source = Arc::new(Counting::default());
        let pool = Pool::new(config(), Arc::clone(&source)).unwrap();
        let mut worker = pool.worker(1).unwrap();

        assert!(worker.alloc().is_some());
        // One for the caller plus a burst of 32 into the shared ring.
        assert_eq!(source.outstanding.load(Ordering::Relaxed), 33);
        assert_eq!(pool.shared_count(), 32);
        assert_eq!(worker.local_count(), 0);
        assert_eq!(worker.stats().source_allocs, 33);
    }

    #[test]
    fn test_free_spills_when_cache_full() {
        let pool = Pool::new(config(), Counting::default()).unwrap();
        let mut worker = pool.worker(0).unwrap();

        for object in 0..31 {
            worker.free(object);
        }
        assert_eq!(worker.local_count(), 31);
        assert_eq!(pool.shared_count(), 0);

        worker.free(31);
        assert_eq!(worker.local_count(), 16);
        assert_eq!(pool.shared_count(), 16);
        assert_eq!(worker.stats().shared_spills, 1);
    }

    #[test]
    fn test_flush_empties_local_cache() {
        let pool = Pool::new(PoolConfig { prealloc: 20, ..config() }, Counting::default()).unwrap();
        let mut worker = pool.worker(0).unwrap();
        let object = worker.alloc().unwrap();
        worker.free(object);
        assert_eq!(worker.local_count(), 16);

        worker.flush();
        assert_eq!(worker.local_count(), 0);
        assert_eq!(pool.shared_count(), 20);
    }

    #[test]
    fn test_worker_claims() {
        let pool = Pool::new(config(), Counting::default()).unwrap();
        let w0 = pool.worker(0).unwrap();
        assert_eq!(w0.id(), 0);
        assert_eq!(pool.worker(0).unwrap_err(), PoolError::WorkerBusy { id: 0 });
        assert_eq!(
            pool.worker(2).unwrap_err(),
            PoolError::UnknownWorker { id: 2, workers: 2 }
        );
        let _w1 = pool.worker(1).unwrap();

        drop(w0);
        assert!(pool.worker(0).is_ok());
    }

    #[test]
    fn test_drop_returns_cached_objects() {
        let source = Arc::new(Counting::default());
        {
            let pool = Pool::new(PoolConfig { prealloc: 10, ..config() }, Arc::clone(&source)).unwrap();
            let mut worker = pool.worker(0).unwrap();
            let held = worker.alloc().unwrap();
            worker.free(held);
            assert!(worker.local_count() > 0);
        }
        assert_eq!(source.outstanding.load(Ordering::Relaxed), 0);
    }
}
