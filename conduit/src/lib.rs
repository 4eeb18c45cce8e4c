//! Lock-free shared-memory queues for inter-process communication.
//!
//! conduit gives cooperating processes a bounded multi-producer /
//! single-consumer queue whose entire state lives in a POSIX shared memory
//! segment. The fast path never enters the kernel; when a producer meets a
//! full queue or the consumer meets an empty one, the blocking variants park
//! on futexes embedded in the shared records.
//!
//! # Layers
//!
//! - [`ipc::shmem`] - named segment mapping and the [`SharedMemorySafe`]
//!   contract for types placed in it
//! - [`ipc::pool`] - a block allocator carving queue records out of one
//!   segment, with stable cross-process offsets
//! - [`ipc::registry`] - a name → offset map at a fixed location, so peers
//!   can find each other's queues
//! - [`sync`] - the atomics, futex, and mutex primitives the above build on
//! - [`mpsc`] - the queue engine itself
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use conduit::ipc::pool::Pool;
//! use conduit::ipc::registry::Registry;
//! use conduit::ipc::shmem::{Creator, Opener};
//! use conduit::mpsc::MpscQueue;
//!
//! // Daemon: create the pool, a queue, and publish it by name.
//! let pool = Arc::new(Pool::<Creator>::create("/my-app", 64_000)?);
//! let registry = Registry::open(&pool)?;
//! let mut inbox = MpscQueue::<u64, _>::create(&pool, 64)?;
//! registry.insert("inbox", inbox.offset())?;
//!
//! // Client (normally another process): map the same pool, look the queue
//! // up, and produce into it.
//! let peer = Arc::new(Pool::<Opener>::open("/my-app", 64_000)?);
//! let names = Registry::open(&peer)?;
//! let offset = names.get("inbox").expect("queue published");
//! // SAFETY: the offset came from the registry and the payload type matches.
//! let outbox = unsafe { MpscQueue::<u64, _>::load(&peer, offset) };
//!
//! assert!(outbox.enqueue(&7));
//! assert_eq!(inbox.dequeue_next(), Some(7));
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

// Allow the crate to reference itself as ::conduit for derive macro usage
extern crate self as conduit;

pub mod ipc;
pub mod mpsc;
pub mod sync;
pub mod trace;

#[doc(inline)]
pub use conduit_derive::SharedMemorySafe;

#[doc(inline)]
pub use ipc::shmem::SharedMemorySafe;

// Hidden re-export for the derive macro
#[doc(hidden)]
pub use ipc::shmem::SharedMemorySafe as __SharedMemorySafePrivate;
