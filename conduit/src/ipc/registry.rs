//! Queue discovery: a name → offset map at a fixed place in the pool.
//!
//! Publishing a queue means storing its record offset under a well-known
//! string; any process that can map the pool can then resolve the name and
//! load the queue. The map claims the very first bytes of the data region
//! (offset 0), so there is nothing to coordinate beyond the segment name
//! itself.
//!
//! The structure is a fixed array of 128 buckets with chained overflow
//! buckets allocated from the pool on collision. Keys are stored inline, up
//! to 64 bytes. Every operation takes the registry's own shared-memory
//! [`Mutex`] — queue discovery is a cold path.

use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::SharedMemorySafe;
use crate::ipc::pool::{Pool, PoolError};
use crate::ipc::shmem::ShmMode;
use crate::sync::Mutex;
use crate::trace::trace;

/// Number of home buckets. Lookups stay O(1)-ish while the queue count per
/// application remains in the low hundreds.
const REGISTRY_BUCKETS: usize = 128;

/// Longest storable name, in bytes.
pub const MAX_NAME_LEN: usize = 64;

/// Data-region offset where every process expects the registry.
pub const REGISTRY_OFFSET: u32 = 0;

/// "CONDNAME": stored once the creating process finished initializing.
const REGISTRY_MAGIC: u64 = 0x434F_4E44_4E41_4D45;

const INIT_TIMEOUT: Duration = Duration::from_secs(1);

/// Result alias for registry operations.
pub type Result<T> = std::result::Result<T, RegistryError>;

/// Errors produced by [`Registry`].
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The name does not fit a bucket's inline key storage.
    #[error("queue name is {len} bytes; the registry stores at most {MAX_NAME_LEN}")]
    NameTooLong { len: usize },

    /// Another process claimed the registry region but never finished
    /// initializing it.
    #[error("name registry was claimed but not initialized within {timeout_ms} ms")]
    Uninitialized { timeout_ms: u64 },

    /// The pool could not back the registry or an overflow bucket.
    #[error(transparent)]
    Pool(#[from] PoolError),
}

/// One entry slot. Overflow buckets use the same layout and are chained
/// through `next`.
#[derive(SharedMemorySafe)]
#[repr(C)]
struct Bucket {
    /// 1 when this bucket holds an entry.
    used: u32,
    key_len: u32,
    key: [u8; MAX_NAME_LEN],
    /// The published queue offset.
    value: u32,
    /// Pool offset of the next bucket in this chain. 0 terminates: offset 0
    /// is the registry itself and can never be an overflow bucket, which is
    /// also why zeroed memory means "empty chain".
    next: u32,
}

#[repr(C)]
struct RegistryHeader {
    /// Becomes [`REGISTRY_MAGIC`] once the buckets are ready.
    init: AtomicU64,
    lock: Mutex,
    buckets: [Bucket; REGISTRY_BUCKETS],
}

// SAFETY: implemented by hand because the derive cannot tell this `Mutex`
// (the cross-process futex one) apart from std's. Every field is itself
// SharedMemorySafe and the layout is repr(C).
unsafe impl SharedMemorySafe for RegistryHeader {}

/// Handle onto the shared name map.
///
/// Any number of handles may exist across processes; operations serialize
/// on the registry mutex.
pub struct Registry<M: ShmMode> {
    pool: Arc<Pool<M>>,
    header: NonNull<RegistryHeader>,
}

// SAFETY: the header pointer targets the pool's mapping, which the Arc'd
// pool keeps alive; all access goes through the shared mutex.
unsafe impl<M: ShmMode> Send for Registry<M> {}
unsafe impl<M: ShmMode> Sync for Registry<M> {}

/// FNV-1a. The hash must agree across processes that may not share a
/// binary, which rules out `std`'s randomly-keyed hasher.
fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash = 0xcbf2_9ce4_8422_2325u64;
    for &byte in bytes {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x100_0000_01b3);
    }
    hash
}

impl<M: ShmMode> Registry<M> {
    /// Attaches to the registry, creating it if this is the first process
    /// to ask.
    ///
    /// Creation is serialized by the pool's allocation lock: exactly one
    /// caller wins `allocate_at(0)`, everyone else attaches and waits
    /// briefly for the winner's init marker.
    ///
    /// Open the registry before allocating anything else from a fresh
    /// pool. If some other allocation grabs the low blocks first, attaching
    /// processes would misread that memory as the name map.
    pub fn open(pool: &Arc<Pool<M>>) -> Result<Self> {
        let header = match pool.allocate_at(REGISTRY_OFFSET, size_of::<RegistryHeader>()) {
            Ok(region) => {
                let header = region.cast::<RegistryHeader>();
                // The region is zeroed: all buckets unused, all chains empty,
                // the mutex unlocked. Publishing the magic is the only init.
                unsafe { header.as_ref() }
                    .init
                    .store(REGISTRY_MAGIC, Ordering::Release);
                header
            }
            Err(PoolError::RegionInUse { .. }) => {
                let header = pool.at_offset::<RegistryHeader>(REGISTRY_OFFSET);
                let deadline = Instant::now() + INIT_TIMEOUT;
                while unsafe { header.as_ref() }.init.load(Ordering::Acquire) != REGISTRY_MAGIC {
                    if Instant::now() >= deadline {
                        return Err(RegistryError::Uninitialized {
                            timeout_ms: INIT_TIMEOUT.as_millis() as u64,
                        });
                    }
                    std::hint::spin_loop();
                }
                header
            }
            Err(err) => return Err(err.into()),
        };

        Ok(Self {
            pool: Arc::clone(pool),
            header,
        })
    }

    fn header(&self) -> &RegistryHeader {
        // SAFETY: the header pointer targets the live mapping.
        unsafe { self.header.as_ref() }
    }

    fn home_bucket(&self, key: &[u8]) -> *mut Bucket {
        let index = (fnv1a(key) % REGISTRY_BUCKETS as u64) as usize;
        let header = self.header.as_ptr();
        // SAFETY: index < REGISTRY_BUCKETS.
        unsafe { (&raw mut (*header).buckets).cast::<Bucket>().add(index) }
    }

    /// Publishes `offset` under `name`, overwriting any previous entry.
    pub fn insert(&self, name: &str, offset: u32) -> Result<()> {
        let key = name.as_bytes();
        if key.len() > MAX_NAME_LEN {
            return Err(RegistryError::NameTooLong { len: key.len() });
        }

        let _guard = self.header().lock.lock();
        let mut current = self.home_bucket(key);
        loop {
            // SAFETY: bucket pointers come from the header array or from
            // chain offsets written under this same lock.
            unsafe {
                if (*current).used == 0 {
                    // Only a home bucket can be unused; fill it in place.
                    (&mut (*current).key)[..key.len()].copy_from_slice(key);
                    (*current).key_len = key.len() as u32;
                    (*current).value = offset;
                    (*current).used = 1;
                    break;
                }
                let len = (*current).key_len as usize;
                if &(&(*current).key)[..len] == key {
                    (*current).value = offset;
                    break;
                }
                if (*current).next == 0 {
                    let fresh = self.pool.allocate_for_type::<Bucket>()?;
                    let bucket = fresh.as_ptr();
                    (&mut (*bucket).key)[..key.len()].copy_from_slice(key);
                    (*bucket).key_len = key.len() as u32;
                    (*bucket).value = offset;
                    (*bucket).used = 1;
                    (*current).next = self.pool.offset_of(fresh);
                    break;
                }
                current = self.pool.at_offset::<Bucket>((*current).next).as_ptr();
            }
        }

        trace!(name, offset, "registry insert");
        Ok(())
    }

    /// Resolves a published name to its queue offset.
    pub fn get(&self, name: &str) -> Option<u32> {
        let key = name.as_bytes();
        if key.len() > MAX_NAME_LEN {
            return None;
        }

        let _guard = self.header().lock.lock();
        let mut current = self.home_bucket(key);
        loop {
            // SAFETY: as in insert.
            unsafe {
                if (*current).used == 1 {
                    let len = (*current).key_len as usize;
                    if &(&(*current).key)[..len] == key {
                        return Some((*current).value);
                    }
                }
                if (*current).next == 0 {
                    return None;
                }
                current = self.pool.at_offset::<Bucket>((*current).next).as_ptr();
            }
        }
    }

    /// Returns the registry's storage — home array and every overflow
    /// bucket — to the pool.
    ///
    /// Every process is expected to be done with name lookups; a concurrent
    /// `get` on another handle races with the teardown.
    pub fn free(self) {
        let overflow: Vec<u32> = {
            let _guard = self.header().lock.lock();
            let header = self.header.as_ptr();
            let mut chained = Vec::new();
            for index in 0..REGISTRY_BUCKETS {
                // SAFETY: in-bounds bucket walk under the lock.
                unsafe {
                    let mut next = (*(&raw const (*header).buckets).cast::<Bucket>().add(index)).next;
                    while next != 0 {
                        chained.push(next);
                        next = (*self.pool.at_offset::<Bucket>(next).as_ptr()).next;
                    }
                }
            }
            chained
        };

        for offset in overflow {
            self.pool.free_type::<Bucket>(self.pool.at_offset(offset));
        }
        self.pool.free(self.header.cast(), size_of::<RegistryHeader>());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::pool::DEFAULT_POOL_SIZE;
    use crate::ipc::shmem::Creator;
    use crate::ipc::shmem::test_support::{skippable, unique_path};

    fn registry_pool(tag: &str) -> Option<Arc<Pool<Creator>>> {
        let path = unique_path(tag);
        match Pool::<Creator>::create(&path, DEFAULT_POOL_SIZE) {
            Ok(pool) => Some(Arc::new(pool)),
            Err(PoolError::Shm(err)) if skippable(&err) => {
                eprintln!("skipping {tag}: {err}");
                None
            }
            Err(err) => panic!("pool creation failed: {err}"),
        }
    }

    #[test]
    fn insert_and_get_round_trip() {
        let Some(pool) = registry_pool("reg-roundtrip") else {
            return;
        };
        let registry = Registry::open(&pool).unwrap();

        assert_eq!(registry.get("events"), None);
        registry.insert("events", 4096).unwrap();
        assert_eq!(registry.get("events"), Some(4096));

        // Overwrite in place.
        registry.insert("events", 8192).unwrap();
        assert_eq!(registry.get("events"), Some(8192));
    }

    #[test]
    fn names_too_long_are_rejected() {
        let Some(pool) = registry_pool("reg-long") else {
            return;
        };
        let registry = Registry::open(&pool).unwrap();

        let name = "q".repeat(MAX_NAME_LEN + 1);
        assert!(matches!(
            registry.insert(&name, 1),
            Err(RegistryError::NameTooLong { .. })
        ));
        assert_eq!(registry.get(&name), None);

        // Exactly at the limit is fine.
        let name = "q".repeat(MAX_NAME_LEN);
        registry.insert(&name, 1).unwrap();
        assert_eq!(registry.get(&name), Some(1));
    }

    #[test]
    fn collision_chains_resolve() {
        let Some(pool) = registry_pool("reg-chains") else {
            return;
        };
        let registry = Registry::open(&pool).unwrap();

        // More names than home buckets forces overflow chains.
        for i in 0..200u32 {
            registry.insert(&format!("queue-{i}"), i * 128).unwrap();
        }
        for i in 0..200u32 {
            assert_eq!(registry.get(&format!("queue-{i}")), Some(i * 128));
        }
        assert_eq!(registry.get("queue-200"), None);
    }

    #[test]
    fn second_open_attaches_to_the_same_map() {
        let Some(pool) = registry_pool("reg-attach") else {
            return;
        };
        let first = Registry::open(&pool).unwrap();
        first.insert("inbox", 640).unwrap();

        let second = Registry::open(&pool).unwrap();
        assert_eq!(second.get("inbox"), Some(640));
    }

    #[test]
    fn free_returns_storage_to_the_pool() {
        let Some(pool) = registry_pool("reg-free") else {
            return;
        };
        let registry = Registry::open(&pool).unwrap();
        for i in 0..200u32 {
            registry.insert(&format!("queue-{i}"), i).unwrap();
        }
        registry.free();

        // The fixed region is claimable again, so a fresh registry starts
        // empty.
        let reborn = Registry::open(&pool).unwrap();
        assert_eq!(reborn.get("queue-0"), None);
    }
}
