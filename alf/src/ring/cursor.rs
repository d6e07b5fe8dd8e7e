//! Reservation and publication protocol shared by every ring configuration.
//!
//! Each side of the ring owns a `head`/`tail` cursor pair:
//!
//! - `head` is advanced when a producer (or consumer) *reserves* a range of
//!   slots. With several concurrent actors on one side this is a CAS.
//! - `tail` is advanced when the reserved range is *published*. An actor only
//!   publishes after every reservation that started before its own has
//!   published, so `tail` moves forward in reservation order.
//!
//! The other side of the ring only ever looks at `tail`, which means it only
//! observes fully written (or fully read) ranges.
//!
//! Cursors are free-running `u32` counters. They are masked only when a slot
//! is addressed, and all distance arithmetic is modulo 2^32. One slot is kept
//! empty, so at most `mask` entries are ever occupied.
//!
//! # Safety
//!
//! Slot access is `unsafe`: the caller must hold the reservation covering the
//! slot index, and must write a slot before publishing it (producers) or read
//! it before publishing its release (consumers).

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;

use crate::shim::atomic::{AtomicU32, Ordering};
use crate::shim::spin_loop;

/// Producer-side cursors.
#[repr(C)]
#[repr(align(64))]
pub(crate) struct ProducerState {
    /// End of the last reserved range. Producers race on this via CAS.
    pub(crate) head: AtomicU32,

    /// End of the last published range. Read by consumers.
    pub(crate) tail: AtomicU32,
}

impl ProducerState {
    fn new() -> Self {
        Self {
            head: AtomicU32::new(0),
            tail: AtomicU32::new(0),
        }
    }
}

/// Consumer-side cursors.
#[repr(C)]
#[repr(align(64))]
pub(crate) struct ConsumerState {
    /// End of the last reserved range. Consumers race on this via CAS.
    pub(crate) head: AtomicU32,

    /// End of the last released range. Read by producers.
    pub(crate) tail: AtomicU32,
}

impl ConsumerState {
    fn new() -> Self {
        Self {
            head: AtomicU32::new(0),
            tail: AtomicU32::new(0),
        }
    }
}

/// A single slot in the ring.
pub(crate) struct Slot<T> {
    value: UnsafeCell<MaybeUninit<T>>,
}

impl<T> Slot<T> {
    fn empty() -> Self {
        Self {
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }
}

/// An exclusively owned index range `[head, next)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Reservation {
    pub(crate) head: u32,
    pub(crate) next: u32,
    /// Free slots (producer side) or ready entries (consumer side) observed
    /// when the reservation was taken, before subtracting this reservation.
    pub(crate) observed: u32,
}

impl Reservation {
    #[inline]
    pub(crate) const fn len(&self) -> u32 {
        self.next.wrapping_sub(self.head)
    }

    /// Cursor value of the `offset`-th element of the range.
    #[inline]
    pub(crate) const fn index(&self, offset: u32) -> u32 {
        self.head.wrapping_add(offset)
    }
}

/// Outcome of trying to reserve a range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Claim {
    Granted(Reservation),
    /// Not enough room (or entries) for the request; nothing was reserved.
    Short { available: u32 },
}

/// Core ring state: both cursor groups plus the slot array.
#[repr(C)]
pub(crate) struct RingCore<T> {
    producer: ProducerState,
    consumer: ConsumerState,
    mask: u32,
    slots: Box<[Slot<T>]>,
}

impl<T> RingCore<T> {
    /// Creates an empty ring. `capacity` must already be validated as a
    /// power of two no smaller than 2.
    pub(crate) fn with_capacity(capacity: u32) -> Self {
        debug_assert!(capacity.is_power_of_two() && capacity >= 2);
        let slots = (0..capacity).map(|_| Slot::empty()).collect();
        Self {
            producer: ProducerState::new(),
            consumer: ConsumerState::new(),
            mask: capacity - 1,
            slots,
        }
    }

    #[inline]
    pub(crate) const fn mask(&self) -> u32 {
        self.mask
    }

    /// Committed entries. Reads the consumer tail first so the result can
    /// only overestimate progress made between the two loads, then clamps.
    #[inline]
    pub(crate) fn committed(&self) -> u32 {
        let cons_tail = self.consumer.tail.load(Ordering::Acquire);
        let prod_tail = self.producer.tail.load(Ordering::Acquire);
        prod_tail.wrapping_sub(cons_tail).min(self.mask)
    }

    /// Reserves up to `n` slots for writing.
    ///
    /// With `partial` the request is clamped to the free space; otherwise a
    /// request larger than the free space is refused as a whole. `exclusive`
    /// means the caller is the only producer, so the head is stored instead
    /// of CAS'd.
    #[inline]
    pub(crate) fn claim_produce(&self, n: u32, partial: bool, exclusive: bool) -> Claim {
        let mut head = self.producer.head.load(Ordering::Relaxed);
        loop {
            // Acquire pairs with the consumer's release of `tail`: slots below
            // it have been read out and may be overwritten.
            let cons_tail = self.consumer.tail.load(Ordering::Acquire);
            // A stale `head` can make this wrap; the CAS below then fails.
            let free = self.mask.wrapping_sub(head.wrapping_sub(cons_tail));

            let count = if n <= free {
                n
            } else if partial && free > 0 {
                free
            } else {
                return Claim::Short { available: free };
            };
            let next = head.wrapping_add(count);

            if exclusive {
                self.producer.head.store(next, Ordering::Relaxed);
            } else if let Err(current) = self.producer.head.compare_exchange_weak(
                head,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                head = current;
                continue;
            }

            return Claim::Granted(Reservation {
                head,
                next,
                observed: free,
            });
        }
    }

    /// Publishes a producer reservation to consumers.
    ///
    /// Concurrent producers wait here until every earlier reservation has
    /// been published. This is the step that makes enqueue lock-free rather
    /// than wait-free.
    #[inline]
    pub(crate) fn publish_produce(&self, reservation: Reservation, exclusive: bool) {
        if !exclusive {
            // Acquire so the predecessor's slot writes are ordered before our
            // release below; a plain store does not extend its release sequence.
            while self.producer.tail.load(Ordering::Acquire) != reservation.head {
                spin_loop();
            }
        }
        self.producer.tail.store(reservation.next, Ordering::Release);
    }

    /// Reserves up to `n` committed entries for reading. Mirrors
    /// [`claim_produce`](Self::claim_produce).
    #[inline]
    pub(crate) fn claim_consume(&self, n: u32, partial: bool, exclusive: bool) -> Claim {
        let mut head = self.consumer.head.load(Ordering::Relaxed);
        loop {
            // Acquire pairs with the producer's release of `tail` and makes the
            // slot contents below it visible.
            let prod_tail = self.producer.tail.load(Ordering::Acquire);
            let entries = prod_tail.wrapping_sub(head);

            let count = if n <= entries {
                n
            } else if partial && entries > 0 {
                entries
            } else {
                return Claim::Short { available: entries };
            };
            let next = head.wrapping_add(count);

            if exclusive {
                self.consumer.head.store(next, Ordering::Relaxed);
            } else if let Err(current) = self.consumer.head.compare_exchange_weak(
                head,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                head = current;
                continue;
            }

            return Claim::Granted(Reservation {
                head,
                next,
                observed: entries,
            });
        }
    }

    /// Releases a consumer reservation back to producers.
    #[inline]
    pub(crate) fn publish_consume(&self, reservation: Reservation, exclusive: bool) {
        if !exclusive {
            while self.consumer.tail.load(Ordering::Acquire) != reservation.head {
                spin_loop();
            }
        }
        self.consumer.tail.store(reservation.next, Ordering::Release);
    }

    /// Writes `value` into the slot addressed by cursor `index`.
    ///
    /// # Safety
    ///
    /// The caller must hold an unpublished producer reservation covering
    /// `index`, and must write each slot of it exactly once.
    #[inline]
    pub(crate) unsafe fn write(&self, index: u32, value: T) {
        let slot = &self.slots[(index & self.mask) as usize];
        // SAFETY: The reservation gives us exclusive access to this slot, and
        // the consumer has released it (checked against `consumer.tail`).
        unsafe { (*slot.value.get()).write(value) };
    }

    /// Moves the value out of the slot addressed by cursor `index`.
    ///
    /// # Safety
    ///
    /// The caller must hold an unpublished consumer reservation covering
    /// `index`, and must read each slot of it exactly once.
    #[inline]
    pub(crate) unsafe fn read(&self, index: u32) -> T {
        let slot = &self.slots[(index & self.mask) as usize];
        // SAFETY: The slot lies below the producer tail we acquired, so it was
        // initialized and published, and our reservation makes us its only reader.
        unsafe { (*slot.value.get()).assume_init_read() }
    }
}

impl<T> Drop for RingCore<T> {
    fn drop(&mut self) {
        if !std::mem::needs_drop::<T>() {
            return;
        }
        let mut index = self.consumer.tail.load(Ordering::Relaxed);
        let end = self.producer.tail.load(Ordering::Relaxed);
        while index != end {
            // SAFETY: `&mut self` rules out concurrent access, and every slot
            // in `[consumer.tail, producer.tail)` holds a published value.
            drop(unsafe { self.read(index) });
            index = index.wrapping_add(1);
        }
    }
}

// SAFETY: RingCore owns its `T` values; moving it moves them.
unsafe impl<T: Send> Send for RingCore<T> {}

// SAFETY: Concurrent access is mediated by the cursor protocol:
// - Overlapping reservations are never granted (CAS on `head`)
// - Slot writes are published with release stores of `producer.tail`
// - Slot reads are released with release stores of `consumer.tail`
unsafe impl<T: Send> Sync for RingCore<T> {}
