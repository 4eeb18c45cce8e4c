//! Atomic operations on words in shared memory.
//!
//! The queue protocol is written against explicit fences rather than
//! per-operation orderings: plain [`load`]/[`store`] are relaxed, while the
//! read-modify-write operations are acquire-release. [`fence`] is the
//! sequentially-consistent barrier placed at the publication points.
//!
//! The half-word operations exist for the producer wait discipline, which
//! packs a ticket counter and a served counter into the two halves of a
//! single 32-bit futex word (a futex can only watch one 32-bit address, and
//! waiters need to sleep on the relationship between the two counters).

use std::sync::atomic::{self, AtomicU16, AtomicU32, Ordering};

/// Relaxed load of a shared word.
#[inline]
pub fn load(word: &AtomicU32) -> u32 {
    word.load(Ordering::Relaxed)
}

/// Relaxed store to a shared word.
#[inline]
pub fn store(word: &AtomicU32, value: u32) {
    word.store(value, Ordering::Relaxed);
}

/// Atomically adds `delta`, returning the previous value.
#[inline]
pub fn fetch_add(word: &AtomicU32, delta: u32) -> u32 {
    word.fetch_add(delta, Ordering::AcqRel)
}

/// Atomically subtracts `delta`, returning the previous value.
#[inline]
pub fn fetch_sub(word: &AtomicU32, delta: u32) -> u32 {
    word.fetch_sub(delta, Ordering::AcqRel)
}

/// Atomically ANDs `mask` into the word, returning the previous value.
///
/// The queue uses this to fold its head cursor back into `[0, N)`.
#[inline]
pub fn fetch_and(word: &AtomicU32, mask: u32) -> u32 {
    word.fetch_and(mask, Ordering::AcqRel)
}

/// Atomically replaces the word, returning the previous value.
#[inline]
pub fn exchange(word: &AtomicU32, value: u32) -> u32 {
    word.swap(value, Ordering::AcqRel)
}

/// Strong compare-and-swap. Returns whether the word was updated.
#[inline]
pub fn compare_and_swap(word: &AtomicU32, expected: u32, new: u32) -> bool {
    word.compare_exchange(expected, new, Ordering::AcqRel, Ordering::Acquire)
        .is_ok()
}

/// Full two-way memory barrier.
#[inline]
pub fn fence() {
    atomic::fence(Ordering::SeqCst);
}

/// Index of the low-order half of a `u32` addressed as two `u16`s.
#[cfg(target_endian = "little")]
const LOW_HALF: usize = 0;
#[cfg(target_endian = "big")]
const LOW_HALF: usize = 1;

/// Views one 16-bit half of a 32-bit shared word as its own atomic.
#[inline]
fn half(word: &AtomicU32, low: bool) -> &AtomicU16 {
    let halves = word.as_ptr().cast::<u16>();
    let index = if low { LOW_HALF } else { 1 - LOW_HALF };
    // SAFETY: `word` is 4-byte aligned, so both halves are valid, 2-byte
    // aligned AtomicU16 locations inside it, alive as long as the borrow of
    // `word`. Mixed-size access is confined to this protocol: full-word
    // readers only ever `load`, and each half has a single kind of writer.
    unsafe { AtomicU16::from_ptr(halves.add(index)) }
}

/// Atomically adds `delta` to the low 16 bits of `word`, returning the
/// previous low half. Wraps at 16 bits without touching the high half.
#[inline]
pub fn fetch_add_low(word: &AtomicU32, delta: u16) -> u16 {
    half(word, true).fetch_add(delta, Ordering::AcqRel)
}

/// Atomically increments the high 16 bits of `word`, wrapping at 16 bits
/// without touching the low half.
#[inline]
pub fn increment_high(word: &AtomicU32) {
    half(word, false).fetch_add(1, Ordering::AcqRel);
}
