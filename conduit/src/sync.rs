//! Cross-process synchronization primitives.
//!
//! Everything in this module operates on 32-bit words that live inside a
//! shared memory mapping, so the same word may be touched concurrently by
//! threads of unrelated processes. The queue engine composes these directly;
//! [`Mutex`] additionally serves the pool allocator and the name registry.

pub mod atomics;
pub mod futex;
pub mod mutex;

pub use mutex::{Mutex, MutexGuard};
