//! POSIX shared memory segments with typestate-based cleanup.
//!
//! [`ShmSegment`] wraps `shm_open` + `mmap` for a named, fixed-length byte
//! region. The `Mode` parameter decides what happens on drop:
//!
//! - [`Creator`]: created the object (`O_CREAT | O_EXCL`), unmaps *and*
//!   unlinks the name when dropped
//! - [`Opener`]: attached to an existing object, only unmaps
//!
//! The two being distinct types keeps "who cleans up the name" a
//! compile-time fact instead of a convention.
//!
//! Anything stored inside a segment must be [`SharedMemorySafe`]: stable
//! layout, no process-local pointers, concurrency handled via atomics. Use
//! `#[derive(SharedMemorySafe)]` for custom records; the macro checks the
//! layout requirements at compile time.

use std::marker::PhantomData;
use std::ptr::{NonNull, null_mut};
use std::sync::atomic::*;

use rustix::fs::{Mode, fstat, ftruncate};
use rustix::mm::{MapFlags, ProtFlags, mmap, munmap};
use rustix::{io, shm};
use thiserror::Error;

use crate::trace::debug;

/// Result alias for shared memory operations.
pub type Result<T> = std::result::Result<T, ShmError>;

/// Contextual errors produced by [`ShmSegment`].
#[derive(Debug, Error)]
pub enum ShmError {
    /// The provided POSIX shared memory name is invalid.
    #[error("invalid shared memory path `{path}`: {reason}")]
    InvalidPath { path: String, reason: &'static str },

    /// `shm_open`, `mmap`, `ftruncate`, etc. failed with an errno.
    #[error("{op} failed for `{path}`: {source}")]
    Posix {
        op: &'static str,
        path: String,
        source: io::Errno,
    },

    /// The existing shared memory object has an unexpected size.
    #[error("shared memory `{path}` size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        path: String,
        expected: usize,
        actual: u64,
    },

    /// The creating process never finished initializing the segment.
    #[error("shared memory `{path}` was not initialized within {timeout_ms} ms")]
    InitTimeout { path: String, timeout_ms: u64 },
}

impl ShmError {
    fn posix(op: &'static str, path: &str, err: io::Errno) -> Self {
        Self::Posix {
            op,
            path: path.to_string(),
            source: err,
        }
    }
}

/// Cleanup behavior marker for [`ShmSegment`]. See [`Creator`] and
/// [`Opener`]; this trait is not meant to be implemented outside the crate.
pub trait ShmMode {
    /// Whether to unlink the shared memory name on drop.
    const SHOULD_UNLINK: bool;
}

/// Typestate marker for the process that creates a segment.
///
/// Dropping a `Creator` mapping unmaps the memory and unlinks the name;
/// once every opener has also unmapped, the kernel releases the backing
/// pages.
pub struct Creator;
impl ShmMode for Creator {
    const SHOULD_UNLINK: bool = true;
}

/// Typestate marker for processes that attach to an existing segment.
///
/// Dropping an `Opener` mapping only unmaps; the name stays for the creator
/// to clean up.
pub struct Opener;
impl ShmMode for Opener {
    const SHOULD_UNLINK: bool = false;
}

/// Types safe to place in shared memory and access from several processes.
///
/// # Safety
///
/// Implementers must guarantee all of the following:
///
/// - **Layout**: `#[repr(C)]` or `#[repr(transparent)]`; the processes
///   mapping the segment may not share a binary, and default Rust layout is
///   not stable.
/// - **No pointers**: no references, raw pointers, or heap-owning types.
///   Virtual addresses are process-local; cross-process links must be pool
///   offsets.
/// - **Zero-valid**: conduit hands out zeroed memory, so the all-zero bit
///   pattern should be a meaningful initial state (counters at zero, flags
///   clear).
/// - **Concurrency**: mutable shared state goes through atomics. A
///   `std::sync::Mutex` does not work across processes.
/// - **No `Drop` reliance**: a `SIGKILL`ed peer runs no destructors.
///
/// Prefer `#[derive(SharedMemorySafe)]`, which verifies the layout and
/// pointer rules mechanically.
pub unsafe trait SharedMemorySafe: Send + Sync {}

macro_rules! impl_shared_memory_safe {
    ($($t:ty),* $(,)?) => {
        $(
            unsafe impl SharedMemorySafe for $t {}
        )*
    };
}

impl_shared_memory_safe! {
    i8, i16, i32, i64, i128, isize,
    u8, u16, u32, u64, u128, usize,
    f32, f64,
    bool,
    AtomicBool,
    AtomicI8, AtomicI16, AtomicI32, AtomicI64, AtomicIsize,
    AtomicU8, AtomicU16, AtomicU32, AtomicU64, AtomicUsize,
}

// Arrays are SharedMemorySafe if their elements are
unsafe impl<T: SharedMemorySafe, const N: usize> SharedMemorySafe for [T; N] {}

const POSIX_NAME_MAX: usize = 255;

/// Validates that a path meets POSIX `shm_open` requirements: a leading
/// slash, no further slashes, at most `NAME_MAX` bytes.
fn validate_shm_path(path: &str) -> Result<()> {
    if !path.starts_with('/') {
        return Err(ShmError::InvalidPath {
            path: path.to_string(),
            reason: "path must start with '/'",
        });
    }

    if path[1..].contains('/') {
        return Err(ShmError::InvalidPath {
            path: path.to_string(),
            reason: "path must not contain additional '/' characters",
        });
    }

    if path.len() > POSIX_NAME_MAX {
        return Err(ShmError::InvalidPath {
            path: path.to_string(),
            reason: "path length must be <= 255 bytes",
        });
    }

    Ok(())
}

/// A mapped, named shared memory region of `len` bytes.
///
/// The segment is untyped on purpose: its one consumer in this crate is the
/// pool allocator, which lays its own header, bitmap, and data region over
/// the bytes. Typed access happens further up, through pool offsets.
pub struct ShmSegment<M: ShmMode> {
    ptr: NonNull<u8>,
    len: usize,
    path: String,
    _mode: PhantomData<M>,
}

// SAFETY: the mapping is plain shared memory, not tied to any thread; all
// typed access above this layer is gated on SharedMemorySafe.
unsafe impl<M: ShmMode> Send for ShmSegment<M> {}
unsafe impl<M: ShmMode> Sync for ShmSegment<M> {}

impl ShmSegment<Creator> {
    /// Creates a new shared memory object of `len` bytes and maps it.
    ///
    /// The object is created with `O_CREAT | O_EXCL`, so an existing object
    /// at `path` is an error, and `ftruncate` guarantees the bytes start
    /// zeroed. The name is unlinked on drop.
    pub fn create(path: &str, len: usize) -> Result<Self> {
        validate_shm_path(path)?;

        let fd = shm::open(
            path,
            shm::OFlags::CREATE | shm::OFlags::EXCL | shm::OFlags::RDWR,
            Mode::RUSR | Mode::WUSR,
        )
        .map_err(|err| ShmError::posix("shm_open", path, err))?;

        if let Err(err) = ftruncate(&fd, len as u64) {
            drop(fd);
            let _ = shm::unlink(path);
            return Err(ShmError::posix("ftruncate", path, err));
        }

        let ptr = match map_fd(&fd, len) {
            Ok(ptr) => ptr,
            Err(err) => {
                drop(fd);
                let _ = shm::unlink(path);
                return Err(ShmError::posix("mmap", path, err));
            }
        };

        debug!(path, len, "created shared memory segment");

        Ok(Self {
            ptr,
            len,
            path: path.to_string(),
            _mode: PhantomData,
        })
    }
}

impl ShmSegment<Opener> {
    /// Opens an existing shared memory object and maps it.
    ///
    /// `len` must match the creator's length exactly; a mismatch means the
    /// two sides disagree about the layout and nothing past this call would
    /// be safe.
    pub fn open(path: &str, len: usize) -> Result<Self> {
        validate_shm_path(path)?;

        let fd = shm::open(path, shm::OFlags::RDWR, Mode::empty())
            .map_err(|err| ShmError::posix("shm_open", path, err))?;

        let stat = match fstat(&fd) {
            Ok(stat) => stat,
            Err(err) => {
                drop(fd);
                return Err(ShmError::posix("fstat", path, err));
            }
        };
        if stat.st_size != len as i64 {
            drop(fd);
            return Err(ShmError::SizeMismatch {
                path: path.to_string(),
                expected: len,
                actual: stat.st_size as u64,
            });
        }

        let ptr = match map_fd(&fd, len) {
            Ok(ptr) => ptr,
            Err(err) => {
                drop(fd);
                return Err(ShmError::posix("mmap", path, err));
            }
        };

        debug!(path, len, "opened shared memory segment");

        Ok(Self {
            ptr,
            len,
            path: path.to_string(),
            _mode: PhantomData,
        })
    }
}

fn map_fd(fd: &rustix::fd::OwnedFd, len: usize) -> std::result::Result<NonNull<u8>, io::Errno> {
    // SAFETY: a fresh MAP_SHARED mapping of a valid fd aliases no existing
    // Rust object; mmap returns page-aligned addresses, satisfying any
    // record alignment the layers above place at block boundaries.
    let ptr = unsafe {
        mmap(
            null_mut(),
            len,
            ProtFlags::READ | ProtFlags::WRITE,
            MapFlags::SHARED,
            fd,
            0,
        )?
    };
    // SAFETY: mmap never returns null on success.
    Ok(unsafe { NonNull::new_unchecked(ptr.cast::<u8>()) })
}

impl<M: ShmMode> ShmSegment<M> {
    /// Base address of the mapping in this process.
    pub fn as_ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    /// Length of the mapping in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The POSIX object name this segment was created or opened with.
    pub fn path(&self) -> &str {
        &self.path
    }
}

impl<M: ShmMode> Drop for ShmSegment<M> {
    fn drop(&mut self) {
        // SAFETY: ptr/len describe exactly the mapping established in
        // create/open, and no further access happens after drop.
        unsafe {
            let _ = munmap(self.ptr.as_ptr().cast(), self.len);
        }

        if M::SHOULD_UNLINK {
            let _ = shm::unlink(&self.path);
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::{skippable, unique_path};
    use super::*;

    #[test]
    fn create_and_reopen_sees_writes() -> Result<()> {
        let path = unique_path("shmem-roundtrip");

        let seg = match ShmSegment::<Creator>::create(&path, 4096) {
            Ok(seg) => seg,
            Err(err) if skippable(&err) => {
                eprintln!("skipping create_and_reopen_sees_writes: {err}");
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        // ftruncate zero-fills.
        let first = unsafe { seg.as_ptr().as_ptr().read() };
        assert_eq!(first, 0);

        unsafe { seg.as_ptr().as_ptr().write(0xAB) };

        {
            let peer = ShmSegment::<Opener>::open(&path, 4096)?;
            assert_eq!(unsafe { peer.as_ptr().as_ptr().read() }, 0xAB);
            unsafe { peer.as_ptr().as_ptr().write(0xCD) };
        } // opener drops: unmap only

        assert_eq!(unsafe { seg.as_ptr().as_ptr().read() }, 0xCD);
        Ok(())
    }

    #[test]
    fn open_rejects_wrong_length() -> Result<()> {
        let path = unique_path("shmem-len");

        let _seg = match ShmSegment::<Creator>::create(&path, 4096) {
            Ok(seg) => seg,
            Err(err) if skippable(&err) => {
                eprintln!("skipping open_rejects_wrong_length: {err}");
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        match ShmSegment::<Opener>::open(&path, 8192) {
            Err(ShmError::SizeMismatch {
                expected, actual, ..
            }) => {
                assert_eq!(expected, 8192);
                assert_eq!(actual, 4096);
            }
            Err(err) => panic!("expected SizeMismatch, got {err}"),
            Ok(_) => panic!("expected SizeMismatch, but open() succeeded"),
        }
        Ok(())
    }

    #[test]
    fn path_validation() {
        assert!(validate_shm_path("/valid").is_ok());
        assert!(validate_shm_path("/valid-name_123").is_ok());

        assert!(matches!(
            validate_shm_path("no-slash"),
            Err(ShmError::InvalidPath { reason, .. }) if reason.contains("start with")
        ));
        assert!(matches!(
            validate_shm_path("/foo/bar"),
            Err(ShmError::InvalidPath { reason, .. }) if reason.contains("additional")
        ));

        let too_long = format!("/{}", "a".repeat(255));
        assert!(validate_shm_path(&too_long).is_err());
        let max = format!("/{}", "a".repeat(254));
        assert!(validate_shm_path(&max).is_ok());
    }

    #[test]
    fn creator_unlinks_on_drop() -> Result<()> {
        let path = unique_path("shmem-unlink");

        match ShmSegment::<Creator>::create(&path, 1024) {
            Ok(seg) => drop(seg),
            Err(err) if skippable(&err) => {
                eprintln!("skipping creator_unlinks_on_drop: {err}");
                return Ok(());
            }
            Err(err) => return Err(err),
        }

        match ShmSegment::<Opener>::open(&path, 1024) {
            Err(ShmError::Posix { op, .. }) => assert_eq!(op, "shm_open"),
            Err(err) => panic!("expected the name to be gone, got {err}"),
            Ok(_) => panic!("expected the name to be gone, but open() succeeded"),
        }
        Ok(())
    }
}
