//! Bounded lock-free array queues with bulk transfer, and a two-tier object
//! pool built on them.
//!
//! - [`ring`]: fixed-capacity MPMC ring with single-producer and
//!   single-consumer fast paths, all-or-nothing or burst transfers, and an
//!   optional watermark.
//! - [`qmempool`]: per-worker SPSC caches in front of a shared ring, in front
//!   of a pluggable [`ObjectSource`](qmempool::ObjectSource).
//! - [`linked`]: unbounded MPSC linked queue for callers that cannot bound
//!   their backlog.
//!
//! Enable the `tracing` feature for slow-path logging and call
//! [`init_tracing`] to install a subscriber.

pub mod linked;
pub mod qmempool;
pub mod ring;

mod shim;
mod trace;

pub use qmempool::{ObjectSource, Pool, PoolConfig, PoolError, Worker};
pub use ring::{Enqueued, Ring, RingBuilder, RingError, Timeout, TransferPolicy};
pub use trace::init_tracing;
