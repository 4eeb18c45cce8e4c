//! Shared-memory plumbing: segment mapping, the pool allocator, and the
//! queue name registry.
//!
//! A conduit deployment maps exactly one named segment per application. The
//! [`pool::Pool`] carves queue records out of it and translates pointers to
//! segment-relative offsets (the only currency that survives a process
//! boundary); the [`registry::Registry`] sits at a fixed offset so peers can
//! resolve queue names without any prior coordination.

pub mod pool;
pub mod registry;
pub mod shmem;
