//! A futex-backed mutex that lives in shared memory.

use std::sync::atomic::AtomicU32;

use crate::sync::{atomics, futex};

const FREE: u32 = 0;
const HELD: u32 = 1;
const CONTENDED: u32 = 2;

/// Three-state futex mutex for coarse critical sections.
///
/// The state word is `0` when free, `1` when held without waiters, and `2`
/// when held with (probable) waiters; only a release from state `2` pays for
/// a wake syscall. All-zero bytes are a valid unlocked mutex, which is what
/// a freshly truncated segment contains, so no placement initialization is
/// needed.
///
/// Not recursive, no timed acquire, no poisoning. The pool allocator and the
/// name registry serialize on one of these; the queue engine never touches
/// a mutex.
#[repr(transparent)]
pub struct Mutex {
    state: AtomicU32,
}

// SAFETY: all state transitions go through atomics and the futex protocol;
// the whole point of the type is concurrent access from multiple mappings.
unsafe impl crate::SharedMemorySafe for Mutex {}

impl Mutex {
    pub const fn new() -> Self {
        Self {
            state: AtomicU32::new(FREE),
        }
    }

    /// Acquires the lock, sleeping in the kernel under contention.
    pub fn lock(&self) -> MutexGuard<'_> {
        if !atomics::compare_and_swap(&self.state, FREE, HELD) {
            // Contended. Advertise a waiter by pushing the state to 2, sleep
            // while it stays there, and take the lock in the contended state
            // so our own release will wake the next waiter in line.
            loop {
                if atomics::load(&self.state) == CONTENDED
                    || atomics::compare_and_swap(&self.state, HELD, CONTENDED)
                {
                    futex::wait(&self.state, CONTENDED);
                }
                if atomics::compare_and_swap(&self.state, FREE, CONTENDED) {
                    break;
                }
            }
        }
        MutexGuard { mutex: self }
    }

    fn unlock(&self) {
        if atomics::compare_and_swap(&self.state, HELD, FREE) {
            return;
        }
        // The state only ever goes up while the lock is held, so a failed
        // 1 -> 0 swap means it must be 2 now and someone may be sleeping.
        let released = atomics::compare_and_swap(&self.state, CONTENDED, FREE);
        debug_assert!(released, "shared-memory mutex released twice");
        futex::wake(&self.state, 1);
    }
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

/// Releases the lock on drop.
#[must_use = "dropping the guard releases the lock immediately"]
pub struct MutexGuard<'a> {
    mutex: &'a Mutex,
}

impl Drop for MutexGuard<'_> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}
