//! Switches synchronization primitives between `std` and `loom`.
//!
//! Everything that takes part in the cursor protocols imports its atomics and
//! spin hint from here, so the loom model tests (`--features loom`) explore
//! the same code that ships.

#[cfg(not(feature = "loom"))]
pub(crate) mod atomic {
    pub(crate) use std::sync::atomic::*;
}

#[cfg(feature = "loom")]
pub(crate) mod atomic {
    pub(crate) use loom::sync::atomic::*;
}

#[cfg(not(feature = "loom"))]
pub(crate) use std::hint::spin_loop;

// Loom's hint yields to the scheduler, so busy-waits make progress in models.
#[cfg(feature = "loom")]
pub(crate) use loom::hint::spin_loop;
