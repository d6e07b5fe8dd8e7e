//! Unbounded multi-producer single-consumer linked queue.
//!
//! The sibling of [`Ring`](crate::ring::Ring) for callers that cannot bound
//! their backlog. Enqueue is wait-free: one atomic swap of the head pointer
//! followed by one store linking the previous node to the new one. Dequeue
//! busy-waits in the short window where a producer has swapped the head but
//! not yet linked its node.
//!
//! # Algorithm
//!
//! Nodes form a singly linked list from the consumer's `tail` (a stub node
//! whose value has already been taken) to the producers' `head` (the most
//! recently pushed node):
//!
//! ```text
//! tail (stub) -> n1 -> n2 -> ... -> head
//! ```
//!
//! - `push` swaps `head` to the new node, then stores `prev.next = node`.
//! - `pop` follows `tail.next`, takes its value, makes it the new stub and
//!   frees the old one.
//!
//! A node is freed only after the consumer has moved past it, which requires
//! its `next` to be linked, so a producer that still has to link `prev` never
//! touches freed memory.
//!
//! # Example
//!
//! ```
//! use alf::linked;
//!
//! let (tx, rx) = linked::channel::<u32>();
//! let tx2 = tx.clone();
//! tx.push(1);
//! tx2.push(2);
//! assert_eq!(rx.pop(), Some(1));
//! assert_eq!(rx.pop(), Some(2));
//! assert_eq!(rx.pop(), None);
//! ```

use std::cell::{Cell, UnsafeCell};
use std::marker::PhantomData;
use std::ptr;
use std::sync::Arc;

use crate::shim::atomic::{AtomicPtr, Ordering};
use crate::shim::spin_loop;

struct Node<T> {
    next: AtomicPtr<Node<T>>,
    /// `None` only for the stub.
    value: Option<T>,
}

impl<T> Node<T> {
    fn alloc(value: Option<T>) -> *mut Self {
        Box::into_raw(Box::new(Self {
            next: AtomicPtr::new(ptr::null_mut()),
            value,
        }))
    }
}

/// Producer-side state: the most recently pushed node.
#[repr(C)]
#[repr(align(64))]
struct ProducerState<T> {
    head: AtomicPtr<Node<T>>,
}

/// Consumer-side state: the current stub node. Owned by the consumer.
#[repr(C)]
#[repr(align(64))]
struct ConsumerState<T> {
    tail: UnsafeCell<*mut Node<T>>,
}

#[repr(C)]
struct Queue<T> {
    producer: ProducerState<T>,
    consumer: ConsumerState<T>,
}

impl<T> Queue<T> {
    fn new() -> Self {
        let stub = Node::alloc(None);
        Self {
            producer: ProducerState {
                head: AtomicPtr::new(stub),
            },
            consumer: ConsumerState {
                tail: UnsafeCell::new(stub),
            },
        }
    }

    fn push(&self, value: T) {
        let node = Node::alloc(Some(value));
        // AcqRel: release our node's contents to whoever swaps after us, and
        // acquire the previous node so linking it is ordered after its creation.
        let prev = self.producer.head.swap(node, Ordering::AcqRel);
        // SAFETY: `prev.next` is still null, so the consumer cannot have moved
        // past `prev` and freed it.
        unsafe { (*prev).next.store(node, Ordering::Release) };
    }

    /// # Safety
    ///
    /// Caller must be the only consumer.
    unsafe fn pop(&self) -> Option<T> {
        // SAFETY: Only the consumer reads or writes `tail`.
        let tail = unsafe { *self.consumer.tail.get() };
        // SAFETY: `tail` is the live stub; only this consumer frees nodes.
        let mut next = unsafe { (*tail).next.load(Ordering::Acquire) };

        if next.is_null() {
            if self.producer.head.load(Ordering::Acquire) == tail {
                return None;
            }
            // A producer swapped `head` but has not linked its node yet.
            loop {
                spin_loop();
                // SAFETY: As above.
                next = unsafe { (*tail).next.load(Ordering::Acquire) };
                if !next.is_null() {
                    break;
                }
            }
        }

        // SAFETY: `next` was published by a producer's release store and is
        // freed only by this consumer, after it stops being the stub.
        unsafe {
            *self.consumer.tail.get() = next;
            let value = (*next).value.take();
            drop(Box::from_raw(tail));
            value
        }
    }

    /// # Safety
    ///
    /// Caller must be the only consumer.
    unsafe fn is_empty(&self) -> bool {
        // SAFETY: Only the consumer reads `tail`, and the stub is live.
        let tail = unsafe { *self.consumer.tail.get() };
        let next = unsafe { (*tail).next.load(Ordering::Acquire) };
        next.is_null() && self.producer.head.load(Ordering::Acquire) == tail
    }
}

impl<T> Drop for Queue<T> {
    fn drop(&mut self) {
        let mut node = *self.consumer.tail.get_mut();
        while !node.is_null() {
            // SAFETY: `&mut self` means all producers and the consumer are
            // gone; every node from the stub onward is owned by the queue.
            let boxed = unsafe { Box::from_raw(node) };
            node = boxed.next.load(Ordering::Relaxed);
        }
    }
}

// SAFETY: The queue owns its nodes and their `T` values.
unsafe impl<T: Send> Send for Queue<T> {}

// SAFETY: Producers only touch `head` (atomic swap) and the `next` of the node
// they displaced; the consumer side is confined to one `Consumer` handle.
unsafe impl<T: Send> Sync for Queue<T> {}

/// Marker type to opt-out of `Sync` while remaining `Send`.
type PhantomUnsync = PhantomData<Cell<&'static ()>>;

/// Write end of the linked queue. Clone it to add producers.
pub struct Producer<T: Send> {
    queue: Arc<Queue<T>>,
}

impl<T: Send> Clone for Producer<T> {
    fn clone(&self) -> Self {
        Self {
            queue: Arc::clone(&self.queue),
        }
    }
}

/// Read end of the linked queue.
///
/// `Consumer` is [`Send`] but not [`Sync`]: there is exactly one consumer.
pub struct Consumer<T: Send> {
    queue: Arc<Queue<T>>,
    _unsync: PhantomUnsync,
}

/// Creates a new linked queue.
#[must_use]
pub fn channel<T: Send>() -> (Producer<T>, Consumer<T>) {
    let queue = Arc::new(Queue::new());
    let producer = Producer {
        queue: Arc::clone(&queue),
    };
    let consumer = Consumer {
        queue,
        _unsync: PhantomData,
    };
    (producer, consumer)
}

impl<T: Send> Producer<T> {
    /// Appends an element. Wait-free; never fails.
    #[inline]
    pub fn push(&self, value: T) {
        self.queue.push(value);
    }
}

impl<T: Send> Consumer<T> {
    /// Removes the oldest element, or returns `None` when the queue is empty.
    ///
    /// May spin briefly if a producer is midway through a push.
    #[inline]
    pub fn pop(&self) -> Option<T> {
        // SAFETY: `Consumer` is unique and not `Sync`.
        unsafe { self.queue.pop() }
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        // SAFETY: `Consumer` is unique and not `Sync`.
        unsafe { self.queue.is_empty() }
    }
}
