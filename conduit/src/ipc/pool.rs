//! Block allocator over a shared memory segment.
//!
//! The pool owns one [`ShmSegment`] and hands out 128-byte-granular regions
//! of it. Its bookkeeping lives *inside* the segment — a header, a one bit
//! per block allocation bitmap, then the data region — so every process
//! mapping the segment sees the same allocator state. Allocations are
//! serialized by a [`Mutex`](crate::sync::Mutex) in the header.
//!
//! Pointers into the pool are process-local; the segment may land at a
//! different base address in every mapping. The stable cross-process
//! currency is the byte offset into the data region, which [`Pool::offset_of`]
//! and [`Pool::at_offset`] translate in both directions.
//!
//! Layout of the segment:
//!
//! ```text
//! +------------+------------------+---------------------------------+
//! | PoolHeader | block bitmap     | data region (num_blocks * 128)  |
//! +------------+------------------+---------------------------------+
//!              ^ one bit per block ^ aligned up to a block boundary
//! ```

use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::ipc::shmem::{Creator, Opener, SharedMemorySafe, ShmError, ShmMode, ShmSegment};
use crate::sync::Mutex;
use crate::trace::trace;

/// Allocation granularity in bytes. Chosen to balance internal
/// fragmentation against bitmap overhead; the page size is an integer
/// multiple of it.
pub const BLOCK_SIZE: usize = 128;

/// Default data-region size in bytes for applications without special needs.
pub const DEFAULT_POOL_SIZE: usize = 64_000;

/// "CONDPOOL": stored in the header once the creator finished initializing.
const POOL_MAGIC: u64 = 0x434F_4E44_504F_4F4C;

/// How long an opener waits for the creator to finish initializing.
const INIT_TIMEOUT: Duration = Duration::from_secs(1);

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, PoolError>;

/// Errors produced by [`Pool`].
#[derive(Debug, Error)]
pub enum PoolError {
    /// No free run of blocks was large enough.
    #[error("shared memory pool exhausted (requested {requested} bytes)")]
    OutOfMemory { requested: usize },

    /// A fixed-position allocation collided with existing allocations.
    #[error("pool region at offset {offset} is already allocated")]
    RegionInUse { offset: u32 },

    /// Mapping the backing segment failed.
    #[error(transparent)]
    Shm(#[from] ShmError),
}

/// Allocator bookkeeping at the start of the segment.
#[repr(C)]
struct PoolHeader {
    /// Becomes [`POOL_MAGIC`] once the creator has written the fields below.
    init: AtomicU64,
    /// Data-region size in bytes.
    data_size: u32,
    /// Number of blocks in the data region.
    num_blocks: u32,
    /// Bytes used by the allocation bitmap.
    bitmap_bytes: u32,
    /// Serializes every bitmap mutation, across processes.
    lock: Mutex,
}

/// Segment geometry derived from a requested data-region size. Both sides
/// must compute this from the same `size` argument; the total length check
/// in [`ShmSegment::open`] catches most disagreements.
struct Geometry {
    num_blocks: usize,
    bitmap_bytes: usize,
    data_size: usize,
    data_start: usize,
    total_len: usize,
}

fn geometry(size: usize) -> Geometry {
    let num_blocks = size.div_ceil(BLOCK_SIZE);
    let data_size = num_blocks * BLOCK_SIZE;
    let bitmap_bytes = num_blocks.div_ceil(8);
    let data_start = (size_of::<PoolHeader>() + bitmap_bytes).next_multiple_of(BLOCK_SIZE);
    Geometry {
        num_blocks,
        bitmap_bytes,
        data_size,
        data_start,
        total_len: data_start + data_size,
    }
}

/// A shared-memory allocator handle.
///
/// Cheap to share within a process behind an `Arc`; each cooperating
/// process constructs its own `Pool` over the same segment name. `Creator`
/// unlinks the segment on drop, `Opener` only unmaps (see
/// [`ShmMode`](crate::ipc::shmem::ShmMode)).
pub struct Pool<M: ShmMode> {
    segment: ShmSegment<M>,
    header: NonNull<PoolHeader>,
    bitmap: NonNull<u8>,
    data: NonNull<u8>,
    num_blocks: u32,
    data_size: u32,
}

// SAFETY: the pointer fields all target the shared mapping, which is valid
// for the lifetime of `segment`; mutation is serialized by the header mutex.
unsafe impl<M: ShmMode> Send for Pool<M> {}
unsafe impl<M: ShmMode> Sync for Pool<M> {}

impl Pool<Creator> {
    /// Creates the backing segment and initializes a fresh pool in it.
    ///
    /// `size` is the usable data-region size in bytes (rounded up to a
    /// whole number of blocks); the segment itself is slightly larger to
    /// hold the header and bitmap.
    pub fn create(path: &str, size: usize) -> Result<Self> {
        let geo = geometry(size);
        let segment = ShmSegment::create(path, geo.total_len)?;
        let pool = Self::attach(segment, &geo);

        // The segment arrives zeroed: the bitmap reads all-free and the
        // zero-state mutex is unlocked. Only the header fields and the
        // publication magic are left to write.
        unsafe {
            let header = pool.header.as_ptr();
            (*header).data_size = geo.data_size as u32;
            (*header).num_blocks = geo.num_blocks as u32;
            (*header).bitmap_bytes = geo.bitmap_bytes as u32;
            (*header).init.store(POOL_MAGIC, Ordering::Release);
        }

        Ok(pool)
    }
}

impl Pool<Opener> {
    /// Attaches to a pool created by another process.
    ///
    /// `size` must be the same value the creator passed to
    /// [`Pool::create`]; the underlying segment length check rejects
    /// mismatches. Waits briefly for the creator to finish initializing.
    pub fn open(path: &str, size: usize) -> Result<Self> {
        let geo = geometry(size);
        let segment = ShmSegment::open(path, geo.total_len)?;
        let pool = Self::attach(segment, &geo);

        let deadline = Instant::now() + INIT_TIMEOUT;
        loop {
            // Acquire pairs with the creator's Release of the magic, making
            // the header fields visible.
            if pool.header().init.load(Ordering::Acquire) == POOL_MAGIC {
                break;
            }
            if Instant::now() >= deadline {
                return Err(ShmError::InitTimeout {
                    path: path.to_string(),
                    timeout_ms: INIT_TIMEOUT.as_millis() as u64,
                }
                .into());
            }
            std::hint::spin_loop();
        }

        // The stored geometry and the locally computed one must agree, or
        // the two sides are speaking past each other.
        let header = pool.header();
        debug_assert_eq!(header.num_blocks as usize, geo.num_blocks);
        debug_assert_eq!(header.data_size as usize, geo.data_size);
        debug_assert_eq!(header.bitmap_bytes as usize, geo.bitmap_bytes);

        Ok(pool)
    }
}

impl<M: ShmMode> Pool<M> {
    fn attach(segment: ShmSegment<M>, geo: &Geometry) -> Self {
        let base = segment.as_ptr().as_ptr();
        // SAFETY: geometry() sized the segment to contain all three regions.
        unsafe {
            Self {
                header: NonNull::new_unchecked(base.cast::<PoolHeader>()),
                bitmap: NonNull::new_unchecked(base.add(size_of::<PoolHeader>())),
                data: NonNull::new_unchecked(base.add(geo.data_start)),
                num_blocks: geo.num_blocks as u32,
                data_size: geo.data_size as u32,
                segment,
            }
        }
    }

    fn header(&self) -> &PoolHeader {
        // SAFETY: the header pointer targets the live mapping.
        unsafe { self.header.as_ref() }
    }

    /// Usable data-region size in bytes.
    pub fn size(&self) -> usize {
        self.data_size as usize
    }

    /// The POSIX name of the backing segment.
    pub fn path(&self) -> &str {
        self.segment.path()
    }

    /// Allocates a zeroed region of at least `size` bytes, aligned to the
    /// block size.
    ///
    /// Picks the smallest free run of blocks that fits, which keeps the
    /// large runs intact for the queue arrays.
    pub fn allocate(&self, size: usize) -> Result<NonNull<u8>> {
        assert!(size > 0, "allocating a zero-length region");
        let blocks_needed = size.div_ceil(BLOCK_SIZE) as u32;

        let start_block = {
            let _guard = self.header().lock.lock();
            let Some(start) = self.smallest_free_run(blocks_needed) else {
                return Err(PoolError::OutOfMemory { requested: size });
            };
            self.set_blocks(start, blocks_needed, true);
            start
        };

        let offset = start_block as usize * BLOCK_SIZE;
        trace!(offset, size, "pool allocate");

        // SAFETY: offset stays inside the data region by construction.
        let ptr = unsafe { NonNull::new_unchecked(self.data.as_ptr().add(offset)) };
        // SAFETY: the blocks were just claimed; nobody else writes them.
        unsafe { ptr.as_ptr().write_bytes(0, size) };
        Ok(ptr)
    }

    /// Allocates a zeroed region at a caller-chosen offset.
    ///
    /// This is how well-known structures (the name registry) claim their
    /// fixed location. Fails with [`PoolError::RegionInUse`] if any block in
    /// the range is already taken — which doubles as the "someone else
    /// created it first" signal.
    pub fn allocate_at(&self, offset: u32, size: usize) -> Result<NonNull<u8>> {
        assert!(size > 0, "allocating a zero-length region");
        let end = offset as usize + size;
        assert!(end <= self.data_size as usize, "region does not fit the pool");

        let first = offset / BLOCK_SIZE as u32;
        let last = ((end - 1) / BLOCK_SIZE) as u32;
        {
            let _guard = self.header().lock.lock();
            for block in first..=last {
                if self.block_is_set(block) {
                    return Err(PoolError::RegionInUse { offset });
                }
            }
            self.set_blocks(first, last - first + 1, true);
        }

        trace!(offset, size, "pool allocate_at");

        // SAFETY: bounds checked above.
        let ptr = unsafe { NonNull::new_unchecked(self.data.as_ptr().add(offset as usize)) };
        // SAFETY: the blocks were just claimed.
        unsafe { ptr.as_ptr().write_bytes(0, size) };
        Ok(ptr)
    }

    /// Returns a region obtained from [`allocate`](Self::allocate) or
    /// [`allocate_at`](Self::allocate_at) with the same size.
    ///
    /// Freeing memory that other handles still use corrupts whatever gets
    /// allocated over it; the caller decides when everyone is done.
    pub fn free(&self, ptr: NonNull<u8>, size: usize) {
        assert!(size > 0, "freeing a zero-length region");
        let offset = self.offset_of(ptr);
        let first = offset / BLOCK_SIZE as u32;
        let last = ((offset as usize + size - 1) / BLOCK_SIZE) as u32;

        let _guard = self.header().lock.lock();
        self.set_blocks(first, last - first + 1, false);
        trace!(offset, size, "pool free");
    }

    /// Allocates a zeroed, properly aligned region for one `R`.
    pub fn allocate_for_type<R: SharedMemorySafe>(&self) -> Result<NonNull<R>> {
        const { assert!(size_of::<R>() > 0, "zero-sized pool records are meaningless") };
        debug_assert!(align_of::<R>() <= BLOCK_SIZE);
        Ok(self.allocate(size_of::<R>())?.cast())
    }

    /// Allocates a zeroed region for `len` elements of `R`.
    pub fn allocate_array<R: SharedMemorySafe>(&self, len: usize) -> Result<NonNull<R>> {
        debug_assert!(align_of::<R>() <= BLOCK_SIZE);
        Ok(self.allocate(size_of::<R>() * len)?.cast())
    }

    /// Frees a region allocated with [`allocate_for_type`](Self::allocate_for_type).
    pub fn free_type<R>(&self, ptr: NonNull<R>) {
        self.free(ptr.cast(), size_of::<R>());
    }

    /// Frees a region allocated with [`allocate_array`](Self::allocate_array).
    pub fn free_array<R>(&self, ptr: NonNull<R>, len: usize) {
        self.free(ptr.cast(), size_of::<R>() * len);
    }

    /// Translates a data-region offset (from [`offset_of`](Self::offset_of),
    /// possibly in another process) back into a typed pointer.
    ///
    /// The returned pointer is guaranteed in-bounds and aligned;
    /// dereferencing it is the caller's contract — the offset must actually
    /// designate a live `R`.
    pub fn at_offset<R: SharedMemorySafe>(&self, offset: u32) -> NonNull<R> {
        assert!(
            offset as usize + size_of::<R>() <= self.data_size as usize,
            "offset out of bounds"
        );
        // SAFETY: bounds checked above.
        let ptr = unsafe { self.data.as_ptr().add(offset as usize) };
        assert_eq!(
            ptr as usize % align_of::<R>(),
            0,
            "offset is not aligned for the target type"
        );
        // SAFETY: derived from a NonNull base.
        unsafe { NonNull::new_unchecked(ptr.cast()) }
    }

    /// The data-region offset of a pointer into this pool. Inverse of
    /// [`at_offset`](Self::at_offset).
    pub fn offset_of<R>(&self, ptr: NonNull<R>) -> u32 {
        let addr = ptr.as_ptr() as usize;
        let base = self.data.as_ptr() as usize;
        assert!(
            addr >= base && addr < base + self.data_size as usize,
            "pointer does not target this pool"
        );
        (addr - base) as u32
    }

    /// Whether the block containing `offset` is currently allocated.
    pub fn is_allocated(&self, offset: u32) -> bool {
        let _guard = self.header().lock.lock();
        self.block_is_set(offset / BLOCK_SIZE as u32)
    }

    /// Finds the start of the smallest free run of at least `needed`
    /// blocks. Caller must hold the allocation lock.
    fn smallest_free_run(&self, needed: u32) -> Option<u32> {
        let mut best: Option<(u32, u32)> = None;
        let mut consider = |start: u32, len: u32| {
            if len >= needed && best.is_none_or(|(_, best_len)| len < best_len) {
                best = Some((start, len));
            }
        };

        let mut run_start = 0;
        let mut run_len = 0;
        for block in 0..self.num_blocks {
            if self.block_is_set(block) {
                consider(run_start, run_len);
                run_len = 0;
            } else {
                if run_len == 0 {
                    run_start = block;
                }
                run_len += 1;
            }
        }
        consider(run_start, run_len);

        best.map(|(start, _)| start)
    }

    fn block_is_set(&self, block: u32) -> bool {
        debug_assert!(block < self.num_blocks);
        // SAFETY: block < num_blocks keeps the byte index inside the bitmap;
        // the allocation lock orders bitmap access across mappings.
        let byte = unsafe { self.bitmap.as_ptr().add((block / 8) as usize).read() };
        byte & (1 << (block % 8)) != 0
    }

    fn set_blocks(&self, start: u32, count: u32, value: bool) {
        for block in start..start + count {
            debug_assert!(block < self.num_blocks);
            // SAFETY: as in block_is_set.
            unsafe {
                let byte = self.bitmap.as_ptr().add((block / 8) as usize);
                let mask = 1u8 << (block % 8);
                if value {
                    byte.write(byte.read() | mask);
                } else {
                    byte.write(byte.read() & !mask);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::shmem::test_support::{skippable, unique_path};

    /// Creates a pool for a test, or skips the test on sandboxes that deny
    /// /dev/shm access.
    fn create_pool(tag: &str, size: usize) -> Option<Pool<Creator>> {
        let path = unique_path(tag);
        match Pool::<Creator>::create(&path, size) {
            Ok(pool) => Some(pool),
            Err(PoolError::Shm(err)) if skippable(&err) => {
                eprintln!("skipping {tag}: {err}");
                None
            }
            Err(err) => panic!("pool creation failed: {err}"),
        }
    }

    #[test]
    fn allocate_returns_distinct_zeroed_blocks() {
        let Some(pool) = create_pool("pool-basic", 4096) else {
            return;
        };

        let a = pool.allocate(100).unwrap();
        let b = pool.allocate(100).unwrap();
        assert_ne!(a, b);
        assert_eq!(a.as_ptr() as usize % BLOCK_SIZE, 0);
        assert_eq!(b.as_ptr() as usize % BLOCK_SIZE, 0);

        for i in 0..100 {
            assert_eq!(unsafe { a.as_ptr().add(i).read() }, 0);
        }
    }

    #[test]
    fn freed_memory_is_reusable_and_rezeroed() {
        let Some(pool) = create_pool("pool-free", 1024) else {
            return;
        };

        let first = pool.allocate(BLOCK_SIZE).unwrap();
        unsafe { first.as_ptr().write_bytes(0xAB, BLOCK_SIZE) };
        let offset = pool.offset_of(first);
        pool.free(first, BLOCK_SIZE);

        // Exhaust the pool: the freed block must come back, zeroed.
        let mut got_it_back = false;
        loop {
            match pool.allocate(BLOCK_SIZE) {
                Ok(ptr) => {
                    if pool.offset_of(ptr) == offset {
                        got_it_back = true;
                        assert_eq!(unsafe { ptr.as_ptr().read() }, 0);
                    }
                }
                Err(PoolError::OutOfMemory { .. }) => break,
                Err(err) => panic!("{err}"),
            }
        }
        assert!(got_it_back);
    }

    #[test]
    fn exhaustion_reports_out_of_memory() {
        let Some(pool) = create_pool("pool-oom", 512) else {
            return;
        };

        assert!(pool.allocate(512).is_ok());
        assert!(matches!(
            pool.allocate(1),
            Err(PoolError::OutOfMemory { requested: 1 })
        ));
    }

    #[test]
    fn offsets_translate_both_ways() {
        let Some(pool) = create_pool("pool-offsets", 4096) else {
            return;
        };

        let ptr = pool.allocate_for_type::<u64>().unwrap();
        let offset = pool.offset_of(ptr);
        assert_eq!(pool.at_offset::<u64>(offset), ptr);
    }

    #[test]
    fn allocate_at_claims_and_conflicts() {
        let Some(pool) = create_pool("pool-at", 4096) else {
            return;
        };

        assert!(!pool.is_allocated(0));
        let fixed = pool.allocate_at(0, 1000).unwrap();
        assert_eq!(pool.offset_of(fixed), 0);
        assert!(pool.is_allocated(0));

        // Same region again: taken.
        assert!(matches!(
            pool.allocate_at(0, 1),
            Err(PoolError::RegionInUse { offset: 0 })
        ));

        // Dynamic allocations steer around it.
        let dynamic = pool.allocate(100).unwrap();
        assert!(pool.offset_of(dynamic) >= 1000_u32.next_multiple_of(BLOCK_SIZE as u32));
    }

    #[test]
    fn smallest_suitable_gap_is_preferred() {
        let Some(pool) = create_pool("pool-bestfit", 4096) else {
            return;
        };

        let a = pool.allocate(BLOCK_SIZE).unwrap();
        let gap = pool.allocate(2 * BLOCK_SIZE).unwrap();
        let b = pool.allocate(BLOCK_SIZE).unwrap();
        let gap_offset = pool.offset_of(gap);
        pool.free(gap, 2 * BLOCK_SIZE);

        // The two-block hole is smaller than the open tail, so a two-block
        // request lands exactly in it.
        let refill = pool.allocate(2 * BLOCK_SIZE).unwrap();
        assert_eq!(pool.offset_of(refill), gap_offset);

        pool.free(a, BLOCK_SIZE);
        pool.free(b, BLOCK_SIZE);
    }

    #[test]
    fn opener_shares_the_creator_state() {
        let path = unique_path("pool-shared");
        let creator = match Pool::<Creator>::create(&path, 4096) {
            Ok(pool) => pool,
            Err(PoolError::Shm(err)) if skippable(&err) => {
                eprintln!("skipping opener_shares_the_creator_state: {err}");
                return;
            }
            Err(err) => panic!("{err}"),
        };

        let ptr = creator.allocate(64).unwrap();
        unsafe { ptr.as_ptr().write_bytes(0x5A, 64) };
        let offset = creator.offset_of(ptr);

        let opener = Pool::<Opener>::open(&path, 4096).unwrap();
        assert!(opener.is_allocated(offset));
        let mirrored = opener.at_offset::<u8>(offset);
        assert_eq!(unsafe { mirrored.as_ptr().read() }, 0x5A);

        // An allocation through the opener is visible to the creator.
        let from_peer = opener.allocate(64).unwrap();
        assert!(creator.is_allocated(opener.offset_of(from_peer)));
    }
}
