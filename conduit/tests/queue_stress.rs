//! Cross-thread stress scenarios for the shared-memory MPSC queue.
//!
//! Producers push signed sequences that sum to zero, so a single checksum on
//! the consumer side catches lost, duplicated, and torn messages alike.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use conduit::ipc::pool::{DEFAULT_POOL_SIZE, Pool, PoolError};
use conduit::ipc::registry::Registry;
use conduit::ipc::shmem::{Creator, Opener};
use conduit::mpsc::{DEFAULT_CAPACITY, MpscQueue};
use rustix::io::Errno;

fn unique_path(tag: &str) -> String {
    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    format!(
        "/conduit-stress-{}-{}-{}",
        tag,
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::Relaxed)
    )
}

/// Creates a pool, or skips the test on sandboxes that deny /dev/shm.
fn stress_pool(tag: &str) -> Option<Arc<Pool<Creator>>> {
    let path = unique_path(tag);
    match Pool::<Creator>::create(&path, DEFAULT_POOL_SIZE) {
        Ok(pool) => Some(Arc::new(pool)),
        Err(PoolError::Shm(conduit::ipc::shmem::ShmError::Posix { source, .. }))
            if source == Errno::ACCESS =>
        {
            eprintln!("skipping {tag}: no shared memory access");
            None
        }
        Err(err) => panic!("pool creation failed: {err}"),
    }
}

#[test]
fn nonblocking_producers_sum_to_zero() {
    let Some(pool) = stress_pool("nonblocking") else {
        return;
    };
    let mut consumer = MpscQueue::<i64, _>::create(&pool, DEFAULT_CAPACITY).unwrap();
    let offset = consumer.offset();

    const PRODUCERS: usize = 3;
    let mut handles = Vec::new();
    for _ in 0..PRODUCERS {
        let pool = Arc::clone(&pool);
        handles.push(thread::spawn(move || {
            // SAFETY: offset published by the queue created above; same T.
            let queue = unsafe { MpscQueue::<i64, _>::load(&pool, offset) };
            for i in -3000..=3000i64 {
                while !queue.enqueue(&i) {
                    thread::yield_now();
                }
            }
        }));
    }

    let mut total = 0i64;
    for _ in 0..PRODUCERS * 6001 {
        loop {
            if let Some(value) = consumer.dequeue_next() {
                total += value;
                break;
            }
            thread::yield_now();
        }
    }
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(total, 0);
    assert_eq!(consumer.dequeue_next(), None);
}

#[test]
fn blocking_producers_sum_to_zero() {
    let Some(pool) = stress_pool("blocking") else {
        return;
    };
    // A small ring keeps producers constantly parked and woken.
    let mut consumer = MpscQueue::<i64, _>::create(&pool, 8).unwrap();
    let offset = consumer.offset();

    const PRODUCERS: usize = 2;
    let mut handles = Vec::new();
    for _ in 0..PRODUCERS {
        let pool = Arc::clone(&pool);
        handles.push(thread::spawn(move || {
            // SAFETY: offset published by the queue created above; same T.
            let queue = unsafe { MpscQueue::<i64, _>::load(&pool, offset) };
            for i in -6000..=6000i64 {
                queue.enqueue_blocking(&i);
            }
        }));
    }

    let mut total = 0i64;
    for _ in 0..PRODUCERS * 12001 {
        total += consumer.dequeue_next_blocking();
    }
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(total, 0);
    assert_eq!(consumer.dequeue_next(), None);
}

#[test]
fn producers_alternating_blocking_and_nonblocking() {
    let Some(pool) = stress_pool("alternating") else {
        return;
    };
    let mut consumer = MpscQueue::<i64, _>::create(&pool, 16).unwrap();
    let offset = consumer.offset();

    // The consumer stays blocking throughout: only the blocking dequeue
    // wakes parked producers, so a spinning consumer opposite blocking
    // producers is exactly the pairing the queue documents as unsupported.
    const PRODUCERS: usize = 2;
    let mut handles = Vec::new();
    for _ in 0..PRODUCERS {
        let pool = Arc::clone(&pool);
        handles.push(thread::spawn(move || {
            // SAFETY: offset published by the queue created above; same T.
            let queue = unsafe { MpscQueue::<i64, _>::load(&pool, offset) };
            for i in -6000..=6000i64 {
                if i % 2 != 0 {
                    queue.enqueue_blocking(&i);
                } else {
                    while !queue.enqueue(&i) {
                        thread::yield_now();
                    }
                }
            }
        }));
    }

    let mut total = 0i64;
    for _ in 0..PRODUCERS * 12001 {
        total += consumer.dequeue_next_blocking();
    }
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(total, 0);
}

#[test]
fn eight_spinning_producers_deliver_exactly_once() {
    let Some(pool) = stress_pool("eight") else {
        return;
    };
    let mut consumer = MpscQueue::<u64, _>::create(&pool, DEFAULT_CAPACITY).unwrap();
    let offset = consumer.offset();

    const PRODUCERS: u64 = 8;
    const PER_PRODUCER: u64 = 1000;

    let mut handles = Vec::new();
    for p in 0..PRODUCERS {
        let pool = Arc::clone(&pool);
        handles.push(thread::spawn(move || {
            // SAFETY: offset published by the queue created above; same T.
            let queue = unsafe { MpscQueue::<u64, _>::load(&pool, offset) };
            for i in 0..PER_PRODUCER {
                let value = p * 10_000 + i;
                while !queue.enqueue(&value) {
                    std::hint::spin_loop();
                }
            }
        }));
    }

    let mut per_producer = [0u64; PRODUCERS as usize];
    let mut delivered = 0;
    while delivered < PRODUCERS * PER_PRODUCER {
        match consumer.dequeue_next() {
            Some(value) => {
                per_producer[(value / 10_000) as usize] += 1;
                delivered += 1;
            }
            None => thread::yield_now(),
        }
    }
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(per_producer, [PER_PRODUCER; PRODUCERS as usize]);
    assert_eq!(consumer.dequeue_next(), None);
}

#[test]
fn registry_published_queue_reaches_a_second_mapping() {
    let path = unique_path("registry-e2e");
    let daemon_pool = match Pool::<Creator>::create(&path, DEFAULT_POOL_SIZE) {
        Ok(pool) => Arc::new(pool),
        Err(PoolError::Shm(conduit::ipc::shmem::ShmError::Posix { source, .. }))
            if source == Errno::ACCESS =>
        {
            eprintln!("skipping registry-e2e: no shared memory access");
            return;
        }
        Err(err) => panic!("pool creation failed: {err}"),
    };

    // Daemon side: create, publish by name.
    let registry = Registry::open(&daemon_pool).unwrap();
    let mut inbox = MpscQueue::<u64, _>::create(&daemon_pool, 16).unwrap();
    registry.insert("daemon-inbox", inbox.offset()).unwrap();

    // Client side: a second, independent mapping of the same segment — the
    // base address differs, the offsets must not.
    let client_pool = Arc::new(Pool::<Opener>::open(&path, DEFAULT_POOL_SIZE).unwrap());
    let names = Registry::open(&client_pool).unwrap();
    let offset = names.get("daemon-inbox").expect("queue was published");
    // SAFETY: the offset was published by the daemon side; same T.
    let outbox = unsafe { MpscQueue::<u64, _>::load(&client_pool, offset) };

    for i in 0..10u64 {
        assert!(outbox.enqueue(&(i * 7)));
    }
    for i in 0..10u64 {
        assert_eq!(inbox.dequeue_next(), Some(i * 7));
    }
    assert_eq!(inbox.dequeue_next(), None);
}
