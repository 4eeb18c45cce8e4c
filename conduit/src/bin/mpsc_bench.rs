//! MPSC queue throughput benchmark.
//!
//! Usage:
//!     cargo run --release --bin mpsc_bench
//!
//! Environment variables:
//!     PRODUCERS=4          Number of producer threads (default: 4)
//!     CONSUMER_CPU=0       Pin the consumer to this CPU (default: 0)
//!     PRODUCER_CPU_BASE=1  Pin producer i to CPU base + i (default: 1)

use std::env;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Instant;

use conduit::ipc::pool::Pool;
use conduit::ipc::shmem::Creator;
use conduit::mpsc::MpscQueue;

const QUEUE_CAPACITY: u32 = 1024;
const POOL_SIZE: usize = 64_000;
const MESSAGES_PER_PRODUCER: u64 = 1_000_000;

type Payload = u64;

fn env_usize(name: &str, default: usize) -> usize {
    env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn pin_to_cpu(id: usize) {
    core_affinity::set_for_current(core_affinity::CoreId { id });
}

fn unique_path(tag: &str) -> String {
    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    format!(
        "/{}-{}-{}",
        tag,
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::Relaxed)
    )
}

fn bench(label: &str, producers: usize, consumer_cpu: usize, cpu_base: usize, blocking: bool) {
    let path = unique_path("mpsc-bench");
    let pool = Arc::new(Pool::<Creator>::create(&path, POOL_SIZE).expect("pool creation"));
    let mut consumer =
        MpscQueue::<Payload, _>::create(&pool, QUEUE_CAPACITY).expect("queue creation");
    let offset = consumer.offset();

    let mut handles = Vec::new();
    for p in 0..producers {
        let pool = Arc::clone(&pool);
        handles.push(thread::spawn(move || {
            pin_to_cpu(cpu_base + p);
            // SAFETY: offset comes from the queue created above; same payload
            // type on both sides.
            let queue = unsafe { MpscQueue::<Payload, _>::load(&pool, offset) };
            for i in 0..MESSAGES_PER_PRODUCER {
                let value = p as u64 * MESSAGES_PER_PRODUCER + i;
                if blocking {
                    queue.enqueue_blocking(&value);
                } else {
                    while !queue.enqueue(&value) {
                        std::hint::spin_loop();
                    }
                }
            }
        }));
    }

    pin_to_cpu(consumer_cpu);
    let total = producers as u64 * MESSAGES_PER_PRODUCER;
    let start = Instant::now();
    let mut checksum = 0u64;
    for _ in 0..total {
        let value = if blocking {
            consumer.dequeue_next_blocking()
        } else {
            loop {
                if let Some(value) = consumer.dequeue_next() {
                    break value;
                }
                std::hint::spin_loop();
            }
        };
        checksum = checksum.wrapping_add(value);
    }
    let elapsed = start.elapsed();

    for handle in handles {
        handle.join().expect("producer panicked");
    }

    let expected: u64 = (0..producers as u64)
        .flat_map(|p| (0..MESSAGES_PER_PRODUCER).map(move |i| p * MESSAGES_PER_PRODUCER + i))
        .fold(0u64, u64::wrapping_add);
    assert_eq!(checksum, expected, "data corruption during benchmark");

    let rate = total as f64 / elapsed.as_secs_f64();
    println!(
        "{label}: {producers} producers, {total} msgs in {elapsed:?} ({rate:.0} msg/s)"
    );
}

fn main() {
    let producers = env_usize("PRODUCERS", 4);
    let consumer_cpu = env_usize("CONSUMER_CPU", 0);
    let cpu_base = env_usize("PRODUCER_CPU_BASE", 1);

    bench("spin", producers, consumer_cpu, cpu_base, false);
    bench("blocking", producers, consumer_cpu, cpu_base, true);
}
