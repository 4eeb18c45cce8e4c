//! Futex wait/wake on 32-bit words in shared memory.
//!
//! There is no libc wrapper for futex, so the syscalls are made directly.
//! `FUTEX_PRIVATE_FLAG` is deliberately absent: the waiter and the waker are
//! usually different processes mapping the same segment, and private futexes
//! skip the cross-process hash lookup that makes that work.

use std::ptr;
use std::sync::atomic::AtomicU32;

fn futex(word: &AtomicU32, op: libc::c_int, value: u32) -> libc::c_long {
    // SAFETY: the kernel reads 4 bytes at the word's address; AtomicU32
    // guarantees the alignment futex requires, and the borrow keeps the
    // mapping alive for the duration of the call.
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            op,
            value,
            ptr::null::<libc::timespec>(),
            ptr::null::<u32>(),
            0u32,
        )
    }
}

/// Sleeps until woken, provided `*word` still equals `expected`.
///
/// Returns `true` if the kernel confirmed a wait took place (including one
/// cut short by a signal) and `false` if the word had already changed.
/// Callers must re-check their condition either way; wakes are allowed to be
/// spurious. Any other outcome is a protocol bug.
pub fn wait(word: &AtomicU32, expected: u32) -> bool {
    if futex(word, libc::FUTEX_WAIT, expected) == 0 {
        return true;
    }
    match std::io::Error::last_os_error().raw_os_error() {
        Some(libc::EAGAIN) => false,
        Some(libc::EINTR) => true,
        errno => panic!("futex(FUTEX_WAIT) failed unexpectedly: errno {errno:?}"),
    }
}

/// Wakes up to `count` waiters sleeping on `word`, returning how many were
/// actually woken.
pub fn wake(word: &AtomicU32, count: u32) -> u32 {
    let woken = futex(word, libc::FUTEX_WAKE, count);
    assert!(woken >= 0, "futex(FUTEX_WAKE) failed unexpectedly");
    woken as u32
}

/// Wakes every waiter sleeping on `word`.
pub fn wake_all(word: &AtomicU32) -> u32 {
    wake(word, i32::MAX as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::Ordering;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn wake_without_waiters_wakes_nobody() {
        let word = AtomicU32::new(0);
        assert_eq!(wake(&word, 1), 0);
        assert_eq!(wake_all(&word), 0);
    }

    #[test]
    fn wait_with_stale_expectation_returns_immediately() {
        let word = AtomicU32::new(42);
        assert!(!wait(&word, 0));
    }

    #[test]
    fn waiter_is_released_by_wake() {
        let word = Arc::new(AtomicU32::new(0));

        let waiter = {
            let word = Arc::clone(&word);
            thread::spawn(move || {
                // Either we sleep and get woken, or the main thread already
                // flipped the word and the wait bails with EAGAIN.
                while word.load(Ordering::Acquire) == 0 {
                    wait(&word, 0);
                }
            })
        };

        thread::sleep(Duration::from_millis(50));
        word.store(1, Ordering::Release);
        wake_all(&word);

        waiter.join().unwrap();
    }
}
