//! Byte-queue stress: scatter a large buffer into random-size records,
//! ferry them through the ring from P producers to C consumers, and gather
//! them back at the offsets encoded in each record.
//!
//! Every record is `8-byte LE destination offset ++ chunk bytes`. Consumers
//! write chunks straight into a shared output buffer; chunk ranges are
//! disjoint by construction, so the concurrent writes never overlap. A
//! byte-exact comparison at the end catches lost, duplicated, torn or
//! misordered records all at once.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use ferry::mpmc::ByteQueue;

const TOTAL_BYTES: usize = 8 * 1024 * 1024;
const MAX_CHUNK: usize = 1001;
const RING_BYTES: usize = 256 * 1024;

/// Deterministic 64-bit generator (splitmix64); the stress is reproducible
/// run to run.
struct SplitMix64(u64);

impl SplitMix64 {
    fn next(&mut self) -> u64 {
        self.0 = self.0.wrapping_add(0x9E37_79B9_7F4A_7C15);
        let mut z = self.0;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^ (z >> 31)
    }
}

/// Base pointer of the output buffer, shared with every consumer thread.
#[derive(Clone, Copy)]
struct WritePtr(*mut u8);

// SAFETY: every record targets a distinct, non-overlapping byte range of
// the buffer (the chunks partition it), so concurrent writes through this
// pointer never alias.
unsafe impl Send for WritePtr {}
unsafe impl Sync for WritePtr {}

fn random_source(seed: u64) -> Vec<u8> {
    let mut rng = SplitMix64(seed);
    let mut out = Vec::with_capacity(TOTAL_BYTES);
    while out.len() < TOTAL_BYTES {
        out.extend_from_slice(&rng.next().to_le_bytes());
    }
    out.truncate(TOTAL_BYTES);
    out
}

/// Splits `[0, TOTAL_BYTES)` into chunks with lengths uniform in
/// `[1, MAX_CHUNK]`.
fn random_chunks(seed: u64) -> Vec<(usize, usize)> {
    let mut rng = SplitMix64(seed);
    let mut chunks = Vec::new();
    let mut offset = 0;
    while offset < TOTAL_BYTES {
        let len = (1 + rng.next() as usize % MAX_CHUNK).min(TOTAL_BYTES - offset);
        chunks.push((offset, len));
        offset += len;
    }
    chunks
}

fn run(producers: usize, consumers: usize) {
    let source = random_source(0x5EED ^ producers as u64);
    let chunks = random_chunks(0xC0FFEE ^ consumers as u64);
    let queue = ByteQueue::<RING_BYTES>::boxed();

    let mut gathered = vec![0u8; TOTAL_BYTES];
    let dst = WritePtr(gathered.as_mut_ptr());
    let delivered = AtomicUsize::new(0);
    let total_chunks = chunks.len();

    thread::scope(|scope| {
        for p in 0..producers {
            let queue = &queue;
            let source = &source;
            let chunks = &chunks;
            scope.spawn(move || {
                let mut record = Vec::with_capacity(8 + MAX_CHUNK);
                // Chunks are striped over producers; order across producers
                // is deliberately scrambled relative to buffer order.
                for (offset, len) in chunks.iter().skip(p).step_by(producers) {
                    record.clear();
                    record.extend_from_slice(&(*offset as u64).to_le_bytes());
                    record.extend_from_slice(&source[*offset..offset + len]);
                    while !queue.try_push(&record) {
                        thread::yield_now();
                    }
                }
            });
        }

        for _ in 0..consumers {
            let queue = &queue;
            let delivered = &delivered;
            scope.spawn(move || {
                let dst = dst;
                let mut record = Vec::new();
                while delivered.load(Ordering::Relaxed) < total_chunks {
                    if !queue.try_pop(&mut record) {
                        thread::yield_now();
                        continue;
                    }
                    delivered.fetch_add(1, Ordering::Relaxed);
                    let (header, chunk) = record.split_at(8);
                    let offset = u64::from_le_bytes(header.try_into().unwrap()) as usize;
                    // SAFETY: chunk ranges partition the buffer; no two
                    // records overlap.
                    unsafe {
                        std::ptr::copy_nonoverlapping(chunk.as_ptr(), dst.0.add(offset), chunk.len());
                    }
                }
            });
        }
    });

    assert_eq!(delivered.load(Ordering::Relaxed), total_chunks);
    assert!(queue.empty());
    assert_eq!(gathered.len(), source.len());
    assert!(gathered == source, "reassembled buffer differs from source");
}

#[test]
fn single_producer_single_consumer() {
    run(1, 1);
}

#[test]
fn many_producers_single_consumer() {
    run(8, 1);
}

#[test]
fn many_producers_many_consumers() {
    run(4, 4);
}
