//! Multi-threaded stress tests for the fixed-size MPMC ring.
//!
//! The properties checked here only need quiescence, not timing: every
//! pushed element is popped exactly once (conservation, no ghost reads, no
//! duplication), and the queue reports empty once all threads have joined.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::thread;

use ferry::mpmc::Queue;

/// Drives `producers * per_producer` distinct values through `queue` with
/// `consumers` popping concurrently, and returns everything popped.
fn drive<const N: usize>(
    queue: &Queue<u64, N>,
    producers: usize,
    consumers: usize,
    per_producer: usize,
) -> Vec<u64> {
    let total = producers * per_producer;
    let popped = AtomicUsize::new(0);
    let received = Mutex::new(Vec::with_capacity(total));

    thread::scope(|scope| {
        for p in 0..producers {
            scope.spawn(move || {
                for i in 0..per_producer {
                    let value = (p * 1_000_000 + i) as u64;
                    loop {
                        if queue.try_push(value).is_ok() {
                            break;
                        }
                        thread::yield_now();
                    }
                }
            });
        }
        for _ in 0..consumers {
            let popped = &popped;
            let received = &received;
            scope.spawn(move || {
                let mut local = Vec::new();
                while popped.load(Ordering::Relaxed) < total {
                    match queue.try_pop() {
                        Some(value) => {
                            popped.fetch_add(1, Ordering::Relaxed);
                            local.push(value);
                        }
                        None => thread::yield_now(),
                    }
                }
                received.lock().unwrap().extend(local);
            });
        }
    });

    received.into_inner().unwrap()
}

fn expected(producers: usize, per_producer: usize) -> Vec<u64> {
    let mut values: Vec<u64> = (0..producers)
        .flat_map(|p| (0..per_producer).map(move |i| (p * 1_000_000 + i) as u64))
        .collect();
    values.sort_unstable();
    values
}

#[test]
fn capacity_one_queue_conserves_elements() {
    // The smallest possible ring fully serializes every hand-off; 1024
    // elements must still cross exactly once.
    let queue: Queue<u64, 1> = Queue::new();
    let mut received = drive(&queue, 4, 4, 256);

    assert_eq!(received.len(), 1024);
    received.sort_unstable();
    assert_eq!(received, expected(4, 256));
    assert!(queue.empty());
    assert_eq!(queue.size(), 0);
}

#[test]
fn wide_queue_conserves_elements() {
    let queue = Queue::<u64, 64>::boxed();
    let mut received = drive(&queue, 4, 4, 25_000);

    assert_eq!(received.len(), 100_000);
    received.sort_unstable();
    assert_eq!(received, expected(4, 25_000));
    assert!(queue.empty());
    assert_eq!(queue.size(), 0);
}

#[test]
fn unbalanced_sides_still_conserve() {
    let queue = Queue::<u64, 16>::boxed();

    let mut received = drive(&queue, 8, 1, 4_000);
    assert_eq!(received.len(), 32_000);
    received.sort_unstable();
    assert_eq!(received, expected(8, 4_000));
    assert!(queue.empty());

    let mut received = drive(&queue, 1, 8, 32_000);
    assert_eq!(received.len(), 32_000);
    received.sort_unstable();
    assert_eq!(received, expected(1, 32_000));
    assert!(queue.empty());
}

#[test]
fn blocking_pairs_round_trip() {
    // Blocking push against blocking pop, one producer and one consumer per
    // direction, exercising the spin hand-off rather than try-retry.
    let forward = Queue::<u64, 8>::boxed();
    let back = Queue::<u64, 8>::boxed();
    let rounds = 10_000u64;

    thread::scope(|scope| {
        let forward = &forward;
        let back = &back;
        scope.spawn(move || {
            for i in 0..rounds {
                forward.push(i);
                assert_eq!(back.pop(), i.wrapping_mul(3));
            }
        });
        scope.spawn(move || {
            for i in 0..rounds {
                assert_eq!(forward.pop(), i);
                back.push(i.wrapping_mul(3));
            }
        });
    });

    assert!(forward.empty());
    assert!(back.empty());
}
