//! Pool sizing and its validation.

use thiserror::Error;

use crate::ring::{self, RingError};

/// Batch size for transfers between a worker cache and the shared pool.
pub const BULK_SIZE: u32 = 16;

/// How many bulks the shared pool is refilled with from the object source
/// when it runs dry.
pub const REFILL_MULTIPLIER: u32 = 2;

/// Configuration for a [`Pool`](super::Pool).
///
/// # Sizing
///
/// - `local_capacity`: per-worker cache ring. Must hold at least one bulk so
///   a single spill always makes room.
/// - `shared_capacity`: the shared ring. Must hold at least one refill burst
///   (`bulk_size * refill_multiplier`).
/// - `prealloc`: objects moved from the source into the shared ring at
///   construction. Anything beyond the ring's usable capacity
///   (`shared_capacity - 1`) is not allocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    /// Number of worker caches (one per execution unit).
    pub workers: usize,
    /// Capacity of each worker cache ring (power of two).
    pub local_capacity: u32,
    /// Capacity of the shared ring (power of two).
    pub shared_capacity: u32,
    /// Objects to preallocate into the shared ring.
    pub prealloc: u32,
    /// Objects moved per worker/shared transfer.
    pub bulk_size: u32,
    /// Shared-pool refill burst, in bulks.
    pub refill_multiplier: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: num_cpus::get(),
            local_capacity: 64,
            shared_capacity: 1024,
            prealloc: 0,
            bulk_size: BULK_SIZE,
            refill_multiplier: REFILL_MULTIPLIER,
        }
    }
}

/// A violated [`PoolConfig`] constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("pool needs at least one worker")]
    NoWorkers,

    #[error("bulk size must be at least 1")]
    ZeroBulkSize,

    #[error("refill multiplier must be at least 1")]
    ZeroRefillMultiplier,

    #[error("local cache: {0}")]
    LocalRing(#[source] RingError),

    #[error("shared pool: {0}")]
    SharedRing(#[source] RingError),

    #[error("local capacity {local_capacity} is smaller than the bulk size {bulk_size}")]
    LocalTooSmall { local_capacity: u32, bulk_size: u32 },

    #[error("shared capacity {shared_capacity} cannot hold a refill burst of {required}")]
    SharedTooSmall { shared_capacity: u32, required: u32 },

    #[error("prealloc {prealloc} exceeds the shared capacity {shared_capacity}")]
    PreallocTooLarge { prealloc: u32, shared_capacity: u32 },
}

impl PoolConfig {
    /// Objects requested from the source when the shared pool runs dry.
    #[inline]
    #[must_use]
    pub const fn refill_burst(&self) -> u32 {
        self.bulk_size.saturating_mul(self.refill_multiplier)
    }

    /// Checks every sizing constraint.
    ///
    /// # Errors
    ///
    /// Returns the first violated constraint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::NoWorkers);
        }
        if self.bulk_size == 0 {
            return Err(ConfigError::ZeroBulkSize);
        }
        if self.refill_multiplier == 0 {
            return Err(ConfigError::ZeroRefillMultiplier);
        }
        ring::check_capacity(self.local_capacity).map_err(ConfigError::LocalRing)?;
        ring::check_capacity(self.shared_capacity).map_err(ConfigError::SharedRing)?;

        if self.local_capacity < self.bulk_size {
            return Err(ConfigError::LocalTooSmall {
                local_capacity: self.local_capacity,
                bulk_size: self.bulk_size,
            });
        }
        let required = self.refill_burst();
        if self.shared_capacity < required {
            return Err(ConfigError::SharedTooSmall {
                shared_capacity: self.shared_capacity,
                required,
            });
        }
        if self.prealloc > self.shared_capacity {
            return Err(ConfigError::PreallocTooLarge {
                prealloc: self.prealloc,
                shared_capacity: self.shared_capacity,
            });
        }
        Ok(())
    }
}
