//! MPMC queue throughput benchmark over a shared-memory segment.
//!
//! Usage:
//!     cargo run --release --bin queue_bench
//!
//! Environment variables:
//!     PUSH_THREADS=4       Number of producer threads (default: 4)
//!     POP_THREADS=4        Number of consumer threads (default: 4)
//!     PRODUCER_CPUS=0,2    Pin producer threads round-robin to these cores
//!     CONSUMER_CPUS=4,6    Pin consumer threads round-robin to these cores

use std::env;
use std::hint;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use minstant::Instant;

use ferry::mpmc::{ByteQueue, Queue};
use ferry::segment::{Creator, Segment};
use ferry::SharedMemorySafe;

const FIXED_ELEMENTS: usize = 1 << 22;
const VAR_RECORDS: usize = 1 << 20;
const VAR_RECORD_LEN: usize = 64;

type FixedRing = Queue<Element, 1024>;
type VarRing = ByteQueue<{ 1 << 20 }>;

#[derive(SharedMemorySafe, Clone, Copy)]
#[repr(C)]
struct Element {
    thread_id: u64,
    value: u64,
}

fn thread_counts() -> (usize, usize) {
    let parse = |key: &str, default: usize| {
        env::var(key)
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(default)
    };
    (parse("PUSH_THREADS", 4), parse("POP_THREADS", 4))
}

/// Per-role core assignments for producer and consumer threads.
struct Pinning {
    producers: Vec<usize>,
    consumers: Vec<usize>,
}

impl Pinning {
    fn from_env() -> Self {
        Self {
            producers: cpu_list("PRODUCER_CPUS"),
            consumers: cpu_list("CONSUMER_CPUS"),
        }
    }
}

/// Reads a comma-separated core-id list from the environment; an absent or
/// empty variable disables pinning for that role.
fn cpu_list(key: &str) -> Vec<usize> {
    env::var(key)
        .map(|s| s.split(',').filter_map(|t| t.trim().parse().ok()).collect())
        .unwrap_or_default()
}

fn pin_to_cpu(cpus: &[usize], index: usize) {
    if !cpus.is_empty() {
        core_affinity::set_for_current(core_affinity::CoreId {
            id: cpus[index % cpus.len()],
        });
    }
}

fn unique_name(tag: &str) -> String {
    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    format!(
        "/ferry-bench-{}-{}-{}",
        tag,
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::Relaxed)
    )
}

fn bench_fixed(push_threads: usize, pop_threads: usize, pins: &Pinning) {
    let name = unique_name("fixed");
    let segment =
        Segment::<Creator>::create(&name, std::mem::size_of::<FixedRing>()).expect("create segment");
    let queue: &FixedRing = segment
        .allocate_with(FixedRing::init_in_place)
        .expect("segment too small");

    let popped = AtomicUsize::new(0);
    let per_producer = FIXED_ELEMENTS / push_threads;
    let target = per_producer * push_threads;

    let start = Instant::now();
    thread::scope(|scope| {
        for p in 0..push_threads {
            let queue = &queue;
            scope.spawn(move || {
                pin_to_cpu(&pins.producers, p);
                for i in 0..per_producer {
                    queue.push(Element {
                        thread_id: p as u64,
                        value: i as u64,
                    });
                }
            });
        }
        for c in 0..pop_threads {
            let queue = &queue;
            let popped = &popped;
            scope.spawn(move || {
                pin_to_cpu(&pins.consumers, c);
                while popped.load(Ordering::Relaxed) < target {
                    if let Some(element) = queue.try_pop() {
                        debug_assert!(element.thread_id < push_threads as u64);
                        debug_assert!(element.value < per_producer as u64);
                        popped.fetch_add(1, Ordering::Relaxed);
                    } else {
                        hint::spin_loop();
                    }
                }
            });
        }
    });
    let elapsed = start.elapsed();

    let ops_per_ms = target as u128 * 1_000_000 / elapsed.as_nanos().max(1);
    println!(
        "fixed   {push_threads}p/{pop_threads}c: {target} elements, {ops_per_ms} ops/ms"
    );
    assert!(queue.empty());
}

fn bench_var(push_threads: usize, pop_threads: usize, pins: &Pinning) {
    let name = unique_name("var");
    let segment =
        Segment::<Creator>::create(&name, std::mem::size_of::<VarRing>()).expect("create segment");
    let queue: &VarRing = segment
        .allocate_with(VarRing::init_in_place)
        .expect("segment too small");

    let popped = AtomicUsize::new(0);
    let per_producer = VAR_RECORDS / push_threads;
    let target = per_producer * push_threads;
    let record = [7u8; VAR_RECORD_LEN];

    let start = Instant::now();
    thread::scope(|scope| {
        for p in 0..push_threads {
            let queue = &queue;
            scope.spawn(move || {
                pin_to_cpu(&pins.producers, p);
                for _ in 0..per_producer {
                    while !queue.try_push(&record) {
                        hint::spin_loop();
                    }
                }
            });
        }
        for c in 0..pop_threads {
            let queue = &queue;
            let popped = &popped;
            scope.spawn(move || {
                pin_to_cpu(&pins.consumers, c);
                let mut buffer = Vec::with_capacity(VAR_RECORD_LEN);
                while popped.load(Ordering::Relaxed) < target {
                    if queue.try_pop(&mut buffer) {
                        assert_eq!(buffer.len(), VAR_RECORD_LEN);
                        popped.fetch_add(1, Ordering::Relaxed);
                    } else {
                        hint::spin_loop();
                    }
                }
            });
        }
    });
    let elapsed = start.elapsed();

    let ops_per_ms = target as u128 * 1_000_000 / elapsed.as_nanos().max(1);
    println!(
        "var     {push_threads}p/{pop_threads}c: {target} records of {VAR_RECORD_LEN} bytes, {ops_per_ms} ops/ms"
    );
    assert!(queue.empty());
}

fn main() {
    ferry::init_tracing();
    let (push_threads, pop_threads) = thread_counts();
    let pins = Pinning::from_env();
    println!("ferry MPMC benchmark ({push_threads} producers, {pop_threads} consumers)");
    bench_fixed(push_threads, pop_threads, &pins);
    bench_var(push_threads, pop_threads, &pins);
}
