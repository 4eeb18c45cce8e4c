//! The bounded MPSC queue engine.
//!
//! A queue is a ring of fixed-size slots living in a [`Pool`] segment, with
//! an atomic reservation protocol on the producer side, a single consumer
//! cursor, and futex-backed blocking variants of both ends. See
//! [`MpscQueue`] for the operation set and the per-slot state machine.
//!
//! [`Pool`]: crate::ipc::pool::Pool

pub(crate) mod copy;
mod queue;

pub use queue::{MpscQueue, QueueError};

/// Default slot count for queues whose creators have no particular opinion.
pub const DEFAULT_CAPACITY: u32 = 64;
