//! Lock-free bounded MPSC queue over pool-allocated shared memory.
//!
//! # Record layout
//!
//! A queue is two pool allocations: a [`RawQueue`] record holding the
//! cursors, and a power-of-two array of [`Slot`]s. Handles in any process
//! reach both through the record's offset.
//!
//! # Per-slot protocol
//!
//! Each slot carries a `valid` word that doubles as a futex:
//!
//! ```text
//!          publish (producer)                 consume (consumer)
//!   0 ─────────────────────────► 1 ─────────────────────────────► 0
//!   ▲                            │
//!   │ consumer announces sleep   │
//!   │        (CAS 0→2)           │
//!   2 ◄──────────────────────────┘
//!       producer publishes over the 2 and wakes the sleeper
//! ```
//!
//! and a `write_waiters` word whose two 16-bit halves implement the
//! take-a-number discipline for producers blocked on a full queue: the low
//! half counts tickets issued, the high half tickets served, and a blocked
//! producer sleeps until the served counter reaches its ticket
//! (wrap-aware — see [`MpscQueue::wait_for_turn`]).
//!
//! # Capacity accounting
//!
//! `write_length` is the apparent producer-side occupancy. Non-blocking
//! enqueues claim with `fetch_add`, roll back when the queue is full, and
//! so never push it past `N` for long. Blocking enqueues skip the check
//! entirely: the excess above `N` is precisely how the consumer learns that
//! producers are parked and a wake is owed.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::AtomicU32;

use thiserror::Error;

use crate::ipc::pool::{Pool, PoolError};
use crate::ipc::shmem::{SharedMemorySafe, ShmMode};
use crate::mpsc::copy::volatile_copy;
use crate::sync::{atomics, futex};

/// Slot is empty.
const EMPTY: u32 = 0;
/// Slot holds a published, unconsumed message.
const FULL: u32 = 1;
/// Slot is empty and the consumer sleeps on it.
const CONSUMER_WAITING: u32 = 2;

/// The ticket and served counters are 15-bit; bit 15 of each half flags how
/// often the counter has wrapped.
const TICKET_MASK: u16 = 0x7FFF;

/// Errors produced when creating a queue.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Index wrapping is a bitmask, so only power-of-two rings work.
    #[error("queue capacity must be a nonzero power of two, got {capacity}")]
    BadCapacity { capacity: u32 },

    /// The pool could not back the record or the slot array.
    #[error(transparent)]
    Pool(#[from] PoolError),
}

/// Storage for one message.
#[repr(C)]
struct Slot<T> {
    value: UnsafeCell<MaybeUninit<T>>,
    /// State word of the diagram above; 4-byte aligned, used as a futex by
    /// the blocking consumer.
    valid: AtomicU32,
    /// Ticket counter (low half) and served counter (high half) for
    /// blocked producers; used as a futex by them.
    write_waiters: AtomicU32,
}

// SAFETY: value is only touched by the slot's current owner per the valid
// protocol; the other fields are atomics.
unsafe impl<T: SharedMemorySafe> Send for Slot<T> {}
unsafe impl<T: SharedMemorySafe> Sync for Slot<T> {}
unsafe impl<T: SharedMemorySafe> SharedMemorySafe for Slot<T> {}

/// The shared queue record. Lives at a stable pool offset; all cross-process
/// handles are views onto one of these.
#[repr(C)]
struct RawQueue {
    /// Pool offset of the slot array.
    array_offset: u32,
    /// Slot count `N`; a power of two.
    array_length: u32,
    /// `log2(N)`, cached at creation.
    array_length_shifts: u32,
    /// Apparent occupancy as producers see it. May transiently exceed `N`
    /// by the number of reservations about to roll back, and exceeds it
    /// persistently while blocking producers are parked.
    write_length: AtomicU32,
    /// Producer cursor. Advanced by fetch-add, folded back into `[0, N)`
    /// with a fetch-and.
    head_index: AtomicU32,
    /// Monotonic count of producers that ever entered a blocking enqueue.
    /// Zero means no wake syscall can ever be owed.
    blocked_threads: AtomicU32,
}

// SAFETY: plain fields are written once before the record's offset is
// published; everything mutable afterwards is atomic.
unsafe impl SharedMemorySafe for RawQueue {}

/// Handle onto a shared MPSC queue, generic over the payload type and the
/// pool's cleanup mode.
///
/// Producer operations take `&self`; the consumer operations take
/// `&mut self` because there must be exactly **one** consumer side —
/// [`tail_index`](#structfield.tail_index) lives in the handle, not in
/// shared memory. The handle is `Send` but not `Sync`: to produce from
/// several threads or processes, [`load`](Self::load) a handle per
/// producer. Nothing stops a second process from consuming the same queue;
/// keeping that single-consumer contract is on the application, exactly
/// like the type parameter matching.
///
/// Payloads are plain values (`SharedMemorySafe + Copy`): they cross the
/// process boundary as bytes, so there is nothing for `Drop` to own.
pub struct MpscQueue<T: SharedMemorySafe + Copy, M: ShmMode> {
    pool: Arc<Pool<M>>,
    queue: NonNull<RawQueue>,
    array: NonNull<Slot<T>>,
    /// Next slot to read. Consumer-private; no synchronization.
    tail_index: u32,
    /// `N - 1`, cached for index folding.
    wrapping_mask: u32,
}

// SAFETY: the handle may migrate between threads; all shared state behind
// the pointers is reached through atomics and futexes.
unsafe impl<T: SharedMemorySafe + Copy, M: ShmMode> Send for MpscQueue<T, M> {}

impl<T: SharedMemorySafe + Copy, M: ShmMode> MpscQueue<T, M> {
    /// Creates a new queue with `capacity` slots in the pool.
    ///
    /// All slots start empty. Publish the result of [`offset`](Self::offset)
    /// (typically through the registry) so other processes can
    /// [`load`](Self::load) the queue.
    pub fn create(pool: &Arc<Pool<M>>, capacity: u32) -> Result<Self, QueueError> {
        if capacity == 0 || !capacity.is_power_of_two() {
            return Err(QueueError::BadCapacity { capacity });
        }

        let queue = pool.allocate_for_type::<RawQueue>()?;
        let array = match pool.allocate_array::<Slot<T>>(capacity as usize) {
            Ok(array) => array,
            Err(err) => {
                pool.free_type(queue);
                return Err(err.into());
            }
        };

        // Both regions arrive zeroed: cursors at zero, every slot EMPTY
        // with no tickets. Only the geometry fields need writing, and the
        // record is not reachable by peers until its offset is published.
        unsafe {
            let record = queue.as_ptr();
            (*record).array_offset = pool.offset_of(array);
            (*record).array_length = capacity;
            (*record).array_length_shifts = capacity.trailing_zeros();
        }

        Ok(Self {
            pool: Arc::clone(pool),
            queue,
            array,
            tail_index: 0,
            wrapping_mask: capacity - 1,
        })
    }

    /// Attaches to an existing queue by its record offset.
    ///
    /// # Safety
    ///
    /// `offset` must have come from [`offset`](Self::offset) on a live
    /// queue in this same pool, created with this same payload type `T`,
    /// and not yet freed. The offset is typically obtained from the
    /// [registry](crate::ipc::registry::Registry).
    pub unsafe fn load(pool: &Arc<Pool<M>>, offset: u32) -> Self {
        let queue = pool.at_offset::<RawQueue>(offset);
        // SAFETY: per the contract, the offset designates an initialized
        // record.
        let (array_offset, shifts) = unsafe {
            let record = queue.as_ref();
            (record.array_offset, record.array_length_shifts)
        };

        Self {
            pool: Arc::clone(pool),
            queue,
            array: pool.at_offset::<Slot<T>>(array_offset),
            tail_index: 0,
            // Rebuild N - 1 from the cached log2 so it needs no division.
            wrapping_mask: (1u32 << shifts) - 1,
        }
    }

    fn raw(&self) -> &RawQueue {
        // SAFETY: the record outlives the handle; free() consumes it.
        unsafe { self.queue.as_ref() }
    }

    /// Raw slot pointer. Callers deref it themselves so the resulting
    /// borrow is tied to the mapping rather than to `self`, letting the
    /// consumer advance `tail_index` while still holding the slot.
    fn slot_ptr(&self, index: u32) -> *const Slot<T> {
        debug_assert!(index <= self.wrapping_mask);
        // SAFETY: index is masked into [0, N).
        unsafe { self.array.as_ptr().add(index as usize) }
    }

    /// Number of slots.
    pub fn capacity(&self) -> u32 {
        self.raw().array_length
    }

    /// Pool offset of the queue record, for publication to other processes.
    pub fn offset(&self) -> u32 {
        self.pool.offset_of(self.queue)
    }

    // --- producer side ------------------------------------------------

    /// Claims a slot for a later [`enqueue_at`](Self::enqueue_at) without
    /// writing anything yet. Returns `false` if the queue is at capacity.
    ///
    /// A successful reservation **must** be resolved by exactly one
    /// `enqueue_at` or [`cancel_reservation`](Self::cancel_reservation);
    /// abandoning it permanently wastes a slot.
    pub fn reserve(&self) -> bool {
        let record = self.raw();
        // Claim first so a racing reserver can't hand out the same space.
        let old_length = atomics::fetch_add(&record.write_length, 1);
        atomics::fence();
        if old_length >= record.array_length {
            // Full; roll the claim back.
            atomics::fetch_sub(&record.write_length, 1);
            return false;
        }
        true
    }

    /// Writes `item` into the slot claimed by a prior successful
    /// [`reserve`](Self::reserve) and publishes it. Never fails and never
    /// blocks; the reservation is the capacity check.
    ///
    /// Calling this without holding a reservation overruns the consumer and
    /// corrupts the queue.
    pub fn enqueue_at(&self, item: &T) {
        self.publish(item, false);
    }

    /// Releases a reservation made by [`reserve`](Self::reserve) without
    /// writing.
    ///
    /// The producer cursor is not rewound: the skipped slot is simply
    /// written by whichever producer claims that index after the ring
    /// wraps. Calling this without holding a reservation corrupts the
    /// queue.
    pub fn cancel_reservation(&self) {
        atomics::fetch_sub(&self.raw().write_length, 1);
    }

    /// Reserve-and-publish in one call. Returns `false` if the queue was
    /// full.
    pub fn enqueue(&self, item: &T) -> bool {
        if !self.reserve() {
            return false;
        }
        self.enqueue_at(item);
        true
    }

    /// Publishes `item`, sleeping in the kernel while the queue is full.
    ///
    /// Pair with [`dequeue_next_blocking`](Self::dequeue_next_blocking):
    /// the non-blocking consumer never issues wakes, so producers parked
    /// here would sleep forever against it.
    pub fn enqueue_blocking(&self, item: &T) {
        let record = self.raw();
        // Flag ourselves before overshooting write_length: a consumer that
        // observes the overshoot is then guaranteed to observe a nonzero
        // hint and issue the wake.
        atomics::fetch_add(&record.blocked_threads, 1);
        // No capacity check; the excess above N is the blocked-producer
        // signal.
        atomics::fetch_add(&record.write_length, 1);
        atomics::fence();
        self.publish(item, true);
    }

    /// Common enqueue tail: claim a head slot, take a ticket, optionally
    /// wait for the slot to come free, then copy and publish.
    fn publish(&self, item: &T, can_block: bool) {
        let record = self.raw();
        let old_head = atomics::fetch_add(&record.head_index, 1);
        atomics::fence();
        // Fold the shared cursor back into [0, N). Our own slot comes from
        // the value read above, so it is immune to the cursor transiently
        // overflowing under a burst of increments.
        atomics::fetch_and(&record.head_index, self.wrapping_mask);
        let index = old_head & self.wrapping_mask;
        // SAFETY: index is masked; see slot_ptr.
        let slot = unsafe { &*self.slot_ptr(index) };

        // Take a ticket even on the non-blocking path: the consumer bumps
        // the served counter for every slot it drains, so the ticket
        // counter has to match arrivals or the two drift apart.
        let ticket = atomics::fetch_add_low(&slot.write_waiters, 1);
        if can_block {
            self.wait_for_turn(slot, ticket);
        }

        // SAFETY: the value cell is ours until valid flips to FULL; source
        // and destination cannot overlap (one is a caller-owned borrow).
        unsafe {
            volatile_copy(
                slot.value.get().cast::<u8>(),
                (item as *const T).cast::<u8>(),
                size_of::<T>(),
            );
        }

        // Publication fence: the payload must be globally visible before
        // the FULL flag is.
        atomics::fence();
        let previous = atomics::exchange(&slot.valid, FULL);
        debug_assert_ne!(previous, FULL, "producer overran the consumer");
        if previous == CONSUMER_WAITING {
            futex::wake(&slot.valid, 1);
        }
    }

    /// Take-a-number wait: sleep until the slot's served counter reaches
    /// `ticket`.
    ///
    /// Both counters are 15-bit values in 16-bit halves of one futex word.
    /// When their wrap bits (15 and 31) agree the counters have wrapped
    /// equally often and the comparison is the obvious one; when they
    /// differ the served counter is a lap behind and the comparison
    /// inverts. Reliable for up to `2^15 - 1` producers parked on one slot.
    fn wait_for_turn(&self, slot: &Slot<T>, ticket: u16) {
        let ticket = ticket & TICKET_MASK;

        let mut waiters = atomics::load(&slot.write_waiters);
        loop {
            let served = (waiters >> 16) as u16 & TICKET_MASK;
            let inverted = ((waiters >> 15) & 1) != ((waiters >> 31) & 1);
            let must_wait = if inverted {
                served > ticket
            } else {
                served < ticket
            };
            if !must_wait {
                return;
            }
            futex::wait(&slot.write_waiters, waiters);
            waiters = atomics::load(&slot.write_waiters);
        }
    }

    // --- consumer side ------------------------------------------------

    /// Pops the next message, or `None` if the queue is empty.
    ///
    /// Never enters the kernel — deliberately not even to wake blocked
    /// producers, so a realtime consumer stays syscall-free. Mixing this
    /// with [`enqueue_blocking`](Self::enqueue_blocking) producers can
    /// therefore leave them parked; blocking producers belong with the
    /// blocking consumer.
    pub fn dequeue_next(&mut self) -> Option<T> {
        // SAFETY: tail_index stays masked.
        let slot = unsafe { &*self.slot_ptr(self.tail_index) };
        if !atomics::compare_and_swap(&slot.valid, FULL, EMPTY) {
            return None;
        }

        let item = self.take_value(slot);
        atomics::fence();
        atomics::fetch_sub(&self.raw().write_length, 1);
        Some(item)
    }

    /// Pops the next message, sleeping in the kernel while the queue is
    /// empty.
    pub fn dequeue_next_blocking(&mut self) -> T {
        // SAFETY: tail_index stays masked.
        let slot = unsafe { &*self.slot_ptr(self.tail_index) };
        if !atomics::compare_and_swap(&slot.valid, FULL, EMPTY) {
            // Nothing here yet. Announce the sleep with valid = 2; the
            // producer that publishes over it will wake us.
            if atomics::compare_and_swap(&slot.valid, EMPTY, CONSUMER_WAITING) {
                while atomics::load(&slot.valid) == CONSUMER_WAITING {
                    futex::wait(&slot.valid, CONSUMER_WAITING);
                }
            }
            // Either the wait ended or a producer published between the two
            // swaps above. We are the only consumer, so the slot is FULL
            // now; claim it.
            let previous = atomics::exchange(&slot.valid, EMPTY);
            debug_assert_eq!(previous, FULL, "woken on a slot that was never published");
        }

        let item = self.take_value(slot);
        atomics::fence();
        let record = self.raw();
        let old_length = atomics::fetch_sub(&record.write_length, 1);
        if old_length > record.array_length && atomics::load(&record.blocked_threads) != 0 {
            // Producers are parked on this slot's ticket word. Wake them
            // all; the served counter lets exactly one continue and the
            // rest go back to sleep.
            futex::wake_all(&slot.write_waiters);
        }
        item
    }

    /// Copies the next message out without consuming it, or `None` if the
    /// queue is empty.
    ///
    /// A producer never writes over a slot whose `valid` flag is still set,
    /// so once the flag has been observed the payload is stable and the
    /// copy cannot tear. The message is returned again by the next
    /// dequeue.
    pub fn peek_next(&mut self) -> Option<T> {
        // SAFETY: tail_index stays masked.
        let slot = unsafe { &*self.slot_ptr(self.tail_index) };
        if atomics::load(&slot.valid) != FULL {
            return None;
        }
        // Order the copy after the flag check.
        atomics::fence();
        Some(unsafe { self.read_value(slot) })
    }

    /// Copies the next message out without consuming it, sleeping in the
    /// kernel while the queue is empty. Does not wake blocked producers —
    /// nothing was consumed.
    pub fn peek_next_blocking(&mut self) -> T {
        // SAFETY: tail_index stays masked.
        let slot = unsafe { &*self.slot_ptr(self.tail_index) };
        if atomics::load(&slot.valid) != FULL {
            if atomics::compare_and_swap(&slot.valid, EMPTY, CONSUMER_WAITING) {
                while atomics::load(&slot.valid) == CONSUMER_WAITING {
                    futex::wait(&slot.valid, CONSUMER_WAITING);
                }
            }
            debug_assert_eq!(atomics::load(&slot.valid), FULL);
        }
        atomics::fence();
        // The flag stays FULL; the message remains for the next dequeue.
        unsafe { self.read_value(slot) }
    }

    /// Copies a slot's payload out and retires the slot: advances the tail
    /// cursor and credits the served counter for any producer waiting on
    /// this index.
    fn take_value(&mut self, slot: &Slot<T>) -> T {
        // SAFETY: the caller just transitioned valid FULL -> EMPTY, so the
        // payload is initialized and no producer touches it before the
        // write_length decrement that follows.
        let item = unsafe { self.read_value(slot) };
        atomics::increment_high(&slot.write_waiters);
        self.tail_index = (self.tail_index + 1) & self.wrapping_mask;
        item
    }

    /// Volatile read of a slot payload into ordinary memory.
    ///
    /// # Safety
    ///
    /// The slot must currently hold a fully published `T`.
    unsafe fn read_value(&self, slot: &Slot<T>) -> T {
        unsafe { slot.value.get().cast::<T>().read_volatile() }
    }

    // --- lifecycle ----------------------------------------------------

    /// Returns the record and the slot array to the pool.
    ///
    /// Expert mode: every other handle onto this queue, in this process or
    /// any other, is left dangling. Only call once all sides are done.
    pub fn free(self) {
        let capacity = self.raw().array_length;
        self.pool.free_array(self.array, capacity as usize);
        self.pool.free_type(self.queue);
    }
}
