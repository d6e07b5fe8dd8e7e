//! Bounded array-based lock-free queue with bulk transfer.
//!
//! [`Ring`] is a fixed-capacity circular array of handles. Producers and
//! consumers move whole batches at a time: one CAS reserves a range of slots,
//! the batch is copied in or out, and the range is published. Amortizing the
//! atomic operations over a batch is the point of the design.
//!
//! # Configurations
//!
//! | Side     | Safe method (concurrent)       | `unsafe` method (exclusive)          |
//! |----------|--------------------------------|--------------------------------------|
//! | Producer | [`Ring::enqueue_bulk`] (MP)    | [`Ring::enqueue_bulk_sp`] (SP)       |
//! | Consumer | [`Ring::dequeue_bulk`] (MC)    | [`Ring::dequeue_bulk_sc`] (SC)       |
//!
//! The single-producer and single-consumer variants skip the CAS and the wait
//! for predecessor reservations. They are `unsafe` because the ring cannot
//! check that the caller really is the only actor on that side.
//!
//! # Transfer policy
//!
//! - [`TransferPolicy::Fixed`]: all-or-nothing. An enqueue that does not fit
//!   fails with [`RingError::CapacityExceeded`]; a dequeue of more entries
//!   than are ready returns 0.
//! - [`TransferPolicy::Burst`]: transfer as many as possible and report the
//!   count.
//!
//! A ring may also carry a watermark. An enqueue that leaves the ring above
//! the watermark still succeeds, but reports [`Enqueued::quota_exceeded`].
//!
//! # Progress
//!
//! Reservations never overlap and are published in reservation order. A
//! producer that reserved after a stalled producer cannot publish until the
//! stalled one does, so the multi-producer path is lock-free but not
//! wait-free. No lock is ever held.
//!
//! # Example
//!
//! ```
//! use alf::ring::Ring;
//!
//! let ring = Ring::<u64>::new(32)?;
//! assert_eq!(ring.enqueue_slice(&[1, 2, 3])?.count, 3);
//!
//! let mut out = [0u64; 3];
//! assert_eq!(ring.dequeue_slice(&mut out), 3);
//! assert_eq!(out, [1, 2, 3]);
//! # Ok::<(), alf::ring::RingError>(())
//! ```

mod cursor;

use std::fmt;
use std::time::Duration;

use minstant::Instant;
use thiserror::Error;

use self::cursor::{Claim, Reservation, RingCore};

/// Largest supported ring capacity.
pub const MAX_CAPACITY: u32 = 1 << 16;

/// Ring construction and transfer errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RingError {
    /// Capacity is not a power of two in `2..=MAX_CAPACITY`.
    #[error("ring capacity {capacity} must be a power of two between 2 and {MAX_CAPACITY}")]
    InvalidCapacity { capacity: u32 },

    /// Watermark is not below the ring capacity.
    #[error("watermark {watermark} must be below the ring capacity {capacity}")]
    InvalidWatermark { watermark: u32, capacity: u32 },

    /// A fixed enqueue asked for more slots than were free. Nothing was
    /// enqueued.
    #[error("requested {requested} slots but only {available} are free")]
    CapacityExceeded { requested: u32, available: u32 },
}

/// Checks that `capacity` is usable as a ring size.
///
/// # Errors
///
/// Returns [`RingError::InvalidCapacity`] if `capacity` is not a power of two
/// or lies outside `2..=MAX_CAPACITY`.
pub const fn check_capacity(capacity: u32) -> Result<(), RingError> {
    if capacity.is_power_of_two() && capacity >= 2 && capacity <= MAX_CAPACITY {
        Ok(())
    } else {
        Err(RingError::InvalidCapacity { capacity })
    }
}

/// How a bulk transfer treats a request it cannot satisfy in full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TransferPolicy {
    /// Transfer all requested elements or none of them.
    #[default]
    Fixed,
    /// Transfer as many elements as possible.
    Burst,
}

/// Result of a successful enqueue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[must_use]
pub struct Enqueued {
    /// Number of elements enqueued.
    pub count: u32,
    /// The ring was above its watermark after this enqueue.
    pub quota_exceeded: bool,
}

/// Timeout specification for the blocking wrappers.
#[derive(Debug, Clone, Copy)]
pub enum Timeout {
    /// Wait indefinitely.
    Infinite,
    /// Wait for at most the specified duration.
    Duration(Duration),
}

impl From<Duration> for Timeout {
    fn from(d: Duration) -> Self {
        Self::Duration(d)
    }
}

impl Timeout {
    fn deadline(self) -> Option<Instant> {
        match self {
            Self::Infinite => None,
            Self::Duration(d) => Some(Instant::now() + d),
        }
    }
}

/// Builder for a [`Ring`] with a non-default policy or a watermark.
#[derive(Debug, Clone, Copy)]
#[must_use]
pub struct RingBuilder {
    capacity: u32,
    policy: TransferPolicy,
    watermark: Option<u32>,
}

impl RingBuilder {
    /// Starts building a ring of the given capacity.
    pub const fn new(capacity: u32) -> Self {
        Self {
            capacity,
            policy: TransferPolicy::Fixed,
            watermark: None,
        }
    }

    /// Sets the transfer policy. Defaults to [`TransferPolicy::Fixed`].
    pub const fn policy(mut self, policy: TransferPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Reports [`Enqueued::quota_exceeded`] once more than `watermark`
    /// entries are occupied.
    pub const fn watermark(mut self, watermark: u32) -> Self {
        self.watermark = Some(watermark);
        self
    }

    /// Builds the ring.
    ///
    /// # Errors
    ///
    /// [`RingError::InvalidCapacity`] or [`RingError::InvalidWatermark`].
    pub fn build<T>(self) -> Result<Ring<T>, RingError> {
        check_capacity(self.capacity)?;
        let watermark = match self.watermark {
            Some(watermark) if watermark >= self.capacity => {
                return Err(RingError::InvalidWatermark {
                    watermark,
                    capacity: self.capacity,
                });
            }
            Some(watermark) => watermark,
            None => u32::MAX,
        };
        Ok(Ring {
            core: RingCore::with_capacity(self.capacity),
            policy: self.policy,
            watermark,
        })
    }
}

/// Bounded lock-free MPMC ring of `T` handles.
pub struct Ring<T> {
    core: RingCore<T>,
    policy: TransferPolicy,
    /// `u32::MAX` when no watermark is set.
    watermark: u32,
}

impl<T> Ring<T> {
    /// Creates a ring with the [`TransferPolicy::Fixed`] policy and no
    /// watermark. `capacity - 1` elements fit.
    ///
    /// # Errors
    ///
    /// [`RingError::InvalidCapacity`] if `capacity` is not a power of two in
    /// `2..=MAX_CAPACITY`.
    pub fn new(capacity: u32) -> Result<Self, RingError> {
        RingBuilder::new(capacity).build()
    }

    /// Size of the slot array.
    #[inline]
    #[must_use]
    pub const fn capacity(&self) -> u32 {
        self.core.mask() + 1
    }

    /// Maximum number of elements the ring holds at once (`capacity - 1`).
    #[inline]
    #[must_use]
    pub const fn usable_capacity(&self) -> u32 {
        self.core.mask()
    }

    #[inline]
    #[must_use]
    pub const fn policy(&self) -> TransferPolicy {
        self.policy
    }

    /// The configured watermark, if any.
    #[inline]
    #[must_use]
    pub const fn watermark(&self) -> Option<u32> {
        if self.watermark == u32::MAX {
            None
        } else {
            Some(self.watermark)
        }
    }

    /// Number of committed entries.
    ///
    /// This is a snapshot; concurrent transfers may change it immediately.
    #[inline]
    #[must_use]
    pub fn count(&self) -> u32 {
        self.core.committed()
    }

    /// Number of free slots, based on committed state.
    #[inline]
    #[must_use]
    pub fn avail_space(&self) -> u32 {
        self.core.mask() - self.core.committed()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    #[inline]
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.avail_space() == 0
    }

    #[inline]
    const fn partial(&self) -> bool {
        matches!(self.policy, TransferPolicy::Burst)
    }

    /// Reserve, fill, publish. `fill` must write every slot of the
    /// reservation exactly once.
    #[inline]
    fn produce(
        &self,
        requested: u32,
        exclusive: bool,
        fill: impl FnOnce(&RingCore<T>, Reservation),
    ) -> Result<Enqueued, RingError> {
        if requested == 0 {
            return Ok(Enqueued::default());
        }
        let reservation = match self.core.claim_produce(requested, self.partial(), exclusive) {
            Claim::Granted(reservation) => reservation,
            Claim::Short { available } => {
                return match self.policy {
                    TransferPolicy::Fixed => Err(RingError::CapacityExceeded {
                        requested,
                        available,
                    }),
                    TransferPolicy::Burst => Ok(Enqueued::default()),
                };
            }
        };

        fill(&self.core, reservation);
        self.core.publish_produce(reservation, exclusive);

        let count = reservation.len();
        let occupied = self.core.mask() - reservation.observed + count;
        Ok(Enqueued {
            count,
            quota_exceeded: occupied > self.watermark,
        })
    }

    /// Reserve, drain, release. `drain` must read every slot of the
    /// reservation exactly once.
    #[inline]
    fn consume(
        &self,
        requested: u32,
        exclusive: bool,
        drain: impl FnOnce(&RingCore<T>, Reservation),
    ) -> u32 {
        if requested == 0 {
            return 0;
        }
        match self.core.claim_consume(requested, self.partial(), exclusive) {
            Claim::Granted(reservation) => {
                drain(&self.core, reservation);
                self.core.publish_consume(reservation, exclusive);
                reservation.len()
            }
            Claim::Short { .. } => 0,
        }
    }

    fn enqueue_vec(&self, items: &mut Vec<T>, exclusive: bool) -> Result<Enqueued, RingError> {
        let requested = u32::try_from(items.len()).unwrap_or(u32::MAX);
        self.produce(requested, exclusive, |core, reservation| {
            let moved = items.drain(..reservation.len() as usize);
            for (offset, item) in (0..).zip(moved) {
                // SAFETY: `offset < reservation.len()`, inside our reservation.
                unsafe { core.write(reservation.index(offset), item) };
            }
        })
    }

    fn dequeue_vec(&self, out: &mut Vec<T>, max: u32, exclusive: bool) -> u32 {
        // Grow before reserving: nothing inside a reservation may panic.
        out.reserve(max.min(self.core.mask()) as usize);
        self.consume(max, exclusive, |core, reservation| {
            for offset in 0..reservation.len() {
                // SAFETY: `offset < reservation.len()`, inside our reservation.
                out.push(unsafe { core.read(reservation.index(offset)) });
            }
        })
    }

    /// Moves elements from the front of `items` into the ring (multi-producer).
    ///
    /// Enqueued elements are removed from `items`; anything the ring did not
    /// take stays in `items` in its original order.
    ///
    /// # Errors
    ///
    /// [`RingError::CapacityExceeded`] under [`TransferPolicy::Fixed`] when
    /// `items` does not fit; `items` is left untouched.
    #[inline]
    pub fn enqueue_bulk(&self, items: &mut Vec<T>) -> Result<Enqueued, RingError> {
        self.enqueue_vec(items, false)
    }

    /// Single-producer variant of [`enqueue_bulk`](Self::enqueue_bulk).
    ///
    /// # Errors
    ///
    /// See [`enqueue_bulk`](Self::enqueue_bulk).
    ///
    /// # Safety
    ///
    /// No other thread may enqueue into this ring, through any method, while
    /// this call runs.
    #[inline]
    pub unsafe fn enqueue_bulk_sp(&self, items: &mut Vec<T>) -> Result<Enqueued, RingError> {
        self.enqueue_vec(items, true)
    }

    /// Appends up to `max` elements to `out` (multi-consumer) and returns how
    /// many were dequeued. 0 means nothing was available under the policy.
    #[inline]
    pub fn dequeue_bulk(&self, out: &mut Vec<T>, max: u32) -> u32 {
        self.dequeue_vec(out, max, false)
    }

    /// Single-consumer variant of [`dequeue_bulk`](Self::dequeue_bulk).
    ///
    /// # Safety
    ///
    /// No other thread may dequeue from this ring, through any method, while
    /// this call runs.
    #[inline]
    pub unsafe fn dequeue_bulk_sc(&self, out: &mut Vec<T>, max: u32) -> u32 {
        self.dequeue_vec(out, max, true)
    }

    fn push_one(&self, item: T, exclusive: bool) -> Result<(), T> {
        match self.core.claim_produce(1, false, exclusive) {
            Claim::Granted(reservation) => {
                // SAFETY: A granted single-slot reservation covers its head.
                unsafe { self.core.write(reservation.head, item) };
                self.core.publish_produce(reservation, exclusive);
                Ok(())
            }
            Claim::Short { .. } => Err(item),
        }
    }

    fn pop_one(&self, exclusive: bool) -> Option<T> {
        match self.core.claim_consume(1, false, exclusive) {
            Claim::Granted(reservation) => {
                // SAFETY: A granted single-slot reservation covers its head.
                let item = unsafe { self.core.read(reservation.head) };
                self.core.publish_consume(reservation, exclusive);
                Some(item)
            }
            Claim::Short { .. } => None,
        }
    }

    /// Enqueues a single element (multi-producer).
    ///
    /// # Errors
    ///
    /// Returns `Err(item)` if the ring is full.
    #[inline]
    pub fn enqueue(&self, item: T) -> Result<(), T> {
        self.push_one(item, false)
    }

    /// Single-producer variant of [`enqueue`](Self::enqueue).
    ///
    /// # Errors
    ///
    /// Returns `Err(item)` if the ring is full.
    ///
    /// # Safety
    ///
    /// No other thread may enqueue into this ring while this call runs.
    #[inline]
    pub unsafe fn enqueue_sp(&self, item: T) -> Result<(), T> {
        self.push_one(item, true)
    }

    /// Dequeues a single element (multi-consumer).
    #[inline]
    pub fn dequeue(&self) -> Option<T> {
        self.pop_one(false)
    }

    /// Single-consumer variant of [`dequeue`](Self::dequeue).
    ///
    /// # Safety
    ///
    /// No other thread may dequeue from this ring while this call runs.
    #[inline]
    pub unsafe fn dequeue_sc(&self) -> Option<T> {
        self.pop_one(true)
    }

    /// Spins until the element is enqueued or the timeout expires.
    ///
    /// # Errors
    ///
    /// Returns `Err(item)` on timeout.
    pub fn enqueue_blocking(&self, mut item: T, timeout: Timeout) -> Result<(), T> {
        let deadline = timeout.deadline();
        loop {
            match self.enqueue(item) {
                Ok(()) => return Ok(()),
                Err(returned) => {
                    item = returned;
                    if let Some(dl) = deadline
                        && Instant::now() > dl
                    {
                        return Err(item);
                    }
                    std::hint::spin_loop();
                }
            }
        }
    }

    /// Spins until an element is available or the timeout expires.
    pub fn dequeue_blocking(&self, timeout: Timeout) -> Option<T> {
        let deadline = timeout.deadline();
        loop {
            if let Some(item) = self.dequeue() {
                return Some(item);
            }
            if let Some(dl) = deadline
                && Instant::now() > dl
            {
                return None;
            }
            std::hint::spin_loop();
        }
    }
}

impl<T: Copy> Ring<T> {
    fn enqueue_copied(&self, items: &[T], exclusive: bool) -> Result<Enqueued, RingError> {
        let requested = u32::try_from(items.len()).unwrap_or(u32::MAX);
        self.produce(requested, exclusive, |core, reservation| {
            for (offset, item) in (0..reservation.len()).zip(items) {
                // SAFETY: `offset < reservation.len()`, inside our reservation.
                unsafe { core.write(reservation.index(offset), *item) };
            }
        })
    }

    fn dequeue_copied(&self, out: &mut [T], exclusive: bool) -> u32 {
        let requested = u32::try_from(out.len()).unwrap_or(u32::MAX);
        self.consume(requested, exclusive, |core, reservation| {
            for (offset, slot) in (0..reservation.len()).zip(out.iter_mut()) {
                // SAFETY: `offset < reservation.len()`, inside our reservation.
                *slot = unsafe { core.read(reservation.index(offset)) };
            }
        })
    }

    /// Copies the first elements of `items` into the ring (multi-producer).
    ///
    /// # Errors
    ///
    /// [`RingError::CapacityExceeded`] under [`TransferPolicy::Fixed`] when
    /// `items` does not fit.
    #[inline]
    pub fn enqueue_slice(&self, items: &[T]) -> Result<Enqueued, RingError> {
        self.enqueue_copied(items, false)
    }

    /// Single-producer variant of [`enqueue_slice`](Self::enqueue_slice).
    ///
    /// # Errors
    ///
    /// See [`enqueue_slice`](Self::enqueue_slice).
    ///
    /// # Safety
    ///
    /// No other thread may enqueue into this ring while this call runs.
    #[inline]
    pub unsafe fn enqueue_slice_sp(&self, items: &[T]) -> Result<Enqueued, RingError> {
        self.enqueue_copied(items, true)
    }

    /// Fills the front of `out` (multi-consumer) and returns how many
    /// elements were written.
    #[inline]
    pub fn dequeue_slice(&self, out: &mut [T]) -> u32 {
        self.dequeue_copied(out, false)
    }

    /// Single-consumer variant of [`dequeue_slice`](Self::dequeue_slice).
    ///
    /// # Safety
    ///
    /// No other thread may dequeue from this ring while this call runs.
    #[inline]
    pub unsafe fn dequeue_slice_sc(&self, out: &mut [T]) -> u32 {
        self.dequeue_copied(out, true)
    }
}

impl<T> fmt::Debug for Ring<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ring")
            .field("capacity", &self.capacity())
            .field("count", &self.count())
            .field("policy", &self.policy)
            .field("watermark", &self.watermark())
            .finish()
    }
}
