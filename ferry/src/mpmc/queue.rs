//! Fixed-size-element MPMC ring with per-slot turn sequencing.
//!
//! The algorithm is the classic Vyukov bounded MPMC queue: producers and
//! consumers each claim an ever-growing *ticket* from their cursor, the
//! ticket maps to a slot (`ticket % N`) and an epoch (`ticket / N`), and a
//! per-slot *turn* counter arbitrates ownership:
//!
//! - `turn == 2*epoch`: slot is empty and waiting for the epoch's writer
//! - `turn == 2*epoch + 1`: slot is full and waiting for the epoch's reader
//!
//! A producer publishes by storing `2*epoch + 1` with `Release`; the
//! consumer's `Acquire` load of the same turn orders the payload write
//! before the payload read with no extra fences. The turn encodes both the
//! position in the sequence and the current owner, so there is no separate
//! full/empty flag to keep coherent.
//!
//! All state is slot-relative offsets and atomics, never pointers, so the
//! queue can be constructed in place inside a shared-memory segment by one
//! process and used through a plain reinterpret by another.

use std::cell::UnsafeCell;
use std::mem::{align_of, offset_of, size_of, MaybeUninit};
use std::ptr::addr_of_mut;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::{Cursor, CACHE_LINE};
use crate::segment::SharedMemorySafe;

/// One element's storage plus the turn counter arbitrating it.
///
/// Slots are aligned and padded to the cache line so neighboring producers
/// and consumers never false-share.
#[repr(C, align(128))]
pub struct Slot<T> {
    /// Sequence/ownership counter. Starts at 0; see the module docs for the
    /// parity protocol.
    turn: AtomicUsize,
    value: UnsafeCell<MaybeUninit<T>>,
}

impl<T> Slot<T> {
    const fn new() -> Self {
        Self {
            turn: AtomicUsize::new(0),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }
}

// SAFETY: the turn protocol guarantees a slot is owned by exactly one
// producer or one consumer at a time; the atomic turn with Release/Acquire
// ordering is the hand-off.
unsafe impl<T: Send> Send for Slot<T> {}
unsafe impl<T: Send> Sync for Slot<T> {}

// SAFETY: repr(C, align(128)); turn is an atomic, the payload is inline
// storage of a SharedMemorySafe type.
unsafe impl<T: SharedMemorySafe> SharedMemorySafe for Slot<T> {}

/// Bounded lock-free MPMC queue of `N` identically-sized elements.
///
/// Any number of threads in any number of processes may push and pop
/// concurrently. [`push`](Self::push)/[`pop`](Self::pop) busy-wait for
/// space/data; [`try_push`](Self::try_push)/[`try_pop`](Self::try_pop)
/// return immediately.
///
/// ```
/// use ferry::mpmc::Queue;
///
/// let q: Queue<u64, 4> = Queue::new();
/// assert!(q.try_push(10).is_ok());
/// assert_eq!(q.try_pop(), Some(10));
/// assert!(q.empty());
/// ```
#[repr(C)]
pub struct Queue<T, const N: usize> {
    slots: [Slot<T>; N],
    /// Next produce ticket.
    head: Cursor,
    /// Next consume ticket. Exactly one cache line after `head`.
    tail: Cursor,
}

// SAFETY: cursors are atomics; slots are synchronized by the turn protocol.
unsafe impl<T: Send, const N: usize> Send for Queue<T, N> {}
unsafe impl<T: Send, const N: usize> Sync for Queue<T, N> {}

// SAFETY: repr(C) composition of SharedMemorySafe parts.
unsafe impl<T: SharedMemorySafe, const N: usize> SharedMemorySafe for Queue<T, N> {}

impl<T: SharedMemorySafe, const N: usize> Queue<T, N> {
    /// Compile-time layout obligations. Violations are build failures, not
    /// runtime surprises: a queue whose cursors share a cache line would
    /// still be correct, just quietly slow, and a queue whose size is not a
    /// cache-line multiple would false-share with its segment neighbors.
    const LAYOUT_CHECKS: () = {
        assert!(N > 0, "capacity must be at least 1");
        assert!(align_of::<Slot<T>>() == CACHE_LINE);
        assert!(size_of::<Slot<T>>() % CACHE_LINE == 0);
        assert!(offset_of!(Self, tail) - offset_of!(Self, head) == CACHE_LINE);
        assert!(size_of::<Self>() % CACHE_LINE == 0);
    };

    #[inline]
    const fn idx(ticket: usize) -> usize {
        ticket % N
    }

    #[inline]
    const fn epoch(ticket: usize) -> usize {
        ticket / N
    }

    /// Creates an empty queue by value.
    ///
    /// Convenient for in-process use and tests; segment placement goes
    /// through [`init_in_place`](Self::init_in_place) instead.
    pub fn new() -> Self {
        let _ = Self::LAYOUT_CHECKS;
        Self {
            slots: std::array::from_fn(|_| Slot::new()),
            head: Cursor::new(0),
            tail: Cursor::new(0),
        }
    }

    /// Initializes a queue directly inside uninitialized memory.
    ///
    /// This is the constructor used with
    /// [`Segment::allocate_with`](crate::segment::Segment::allocate_with):
    /// the slot array is written field by field so no `Queue` value ever
    /// exists on the stack, which matters once `N * size_of::<Slot<T>>()`
    /// stops being small.
    pub fn init_in_place(uninit: &mut MaybeUninit<Self>) {
        let _ = Self::LAYOUT_CHECKS;
        let ptr = uninit.as_mut_ptr();
        // SAFETY: writing every field of `*ptr` through addr_of_mut! without
        // materializing a reference to uninitialized memory.
        unsafe {
            for i in 0..N {
                addr_of_mut!((*ptr).slots[i]).write(Slot::new());
            }
            addr_of_mut!((*ptr).head).write(Cursor::new(0));
            addr_of_mut!((*ptr).tail).write(Cursor::new(0));
        }
    }

    /// Heap-constructs an empty queue without a stack round-trip.
    pub fn boxed() -> Box<Self> {
        let mut uninit = Box::<Self>::new_uninit();
        Self::init_in_place(&mut uninit);
        // SAFETY: init_in_place fully initialized the value.
        unsafe { uninit.assume_init() }
    }

    /// Pushes an element, spinning while the queue is full.
    ///
    /// The ticket is claimed up front with a `fetch_add`, so back-pressure is
    /// expressed purely by the spin: a full queue stalls this producer until
    /// the matching consumer advances the slot's turn. There is no timeout.
    pub fn push(&self, value: T) {
        let ticket = self.head.0.fetch_add(1, Ordering::AcqRel);
        let slot = &self.slots[Self::idx(ticket)];
        let write_turn = 2 * Self::epoch(ticket);
        while slot.turn.load(Ordering::Acquire) != write_turn {
            std::hint::spin_loop();
        }
        // SAFETY: turn == 2*epoch grants this producer exclusive slot access.
        unsafe {
            (*slot.value.get()).write(value);
        }
        slot.turn.store(write_turn + 1, Ordering::Release);
    }

    /// Attempts to push without blocking.
    ///
    /// # Errors
    ///
    /// Returns `Err(value)` if the queue was full at the linearization
    /// point, handing the element back for retry.
    pub fn try_push(&self, value: T) -> Result<(), T> {
        let mut ticket = self.head.0.load(Ordering::Acquire);
        loop {
            let slot = &self.slots[Self::idx(ticket)];
            let write_turn = 2 * Self::epoch(ticket);
            if slot.turn.load(Ordering::Acquire) == write_turn {
                match self.head.0.compare_exchange(
                    ticket,
                    ticket.wrapping_add(1),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => {
                        // SAFETY: the CAS made this producer the sole owner
                        // of `ticket`, and the turn said the slot is empty.
                        unsafe {
                            (*slot.value.get()).write(value);
                        }
                        slot.turn.store(write_turn + 1, Ordering::Release);
                        return Ok(());
                    }
                    Err(current) => ticket = current,
                }
            } else {
                // Turn mismatch: either the queue is full or another
                // producer claimed this ticket first. If head has not moved
                // since we looked, it is genuinely full.
                let prev = ticket;
                ticket = self.head.0.load(Ordering::Acquire);
                if ticket == prev {
                    return Err(value);
                }
            }
        }
    }

    /// Pops the next element, spinning while the queue is empty.
    #[must_use]
    pub fn pop(&self) -> T {
        let ticket = self.tail.0.fetch_add(1, Ordering::AcqRel);
        let slot = &self.slots[Self::idx(ticket)];
        let read_turn = 2 * Self::epoch(ticket) + 1;
        while slot.turn.load(Ordering::Acquire) != read_turn {
            std::hint::spin_loop();
        }
        // SAFETY: turn == 2*epoch + 1 means the producer for this ticket
        // finished writing; this consumer exclusively owns the read.
        let value = unsafe { (*slot.value.get()).assume_init_read() };
        slot.turn.store(read_turn + 1, Ordering::Release);
        value
    }

    /// Attempts to pop without blocking. Returns `None` when the queue was
    /// empty at the linearization point.
    #[must_use]
    pub fn try_pop(&self) -> Option<T> {
        let mut ticket = self.tail.0.load(Ordering::Acquire);
        loop {
            let slot = &self.slots[Self::idx(ticket)];
            let read_turn = 2 * Self::epoch(ticket) + 1;
            if slot.turn.load(Ordering::Acquire) == read_turn {
                match self.tail.0.compare_exchange(
                    ticket,
                    ticket.wrapping_add(1),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => {
                        // SAFETY: CAS won the ticket; the turn said the slot
                        // holds this epoch's value.
                        let value = unsafe { (*slot.value.get()).assume_init_read() };
                        slot.turn.store(read_turn + 1, Ordering::Release);
                        return Some(value);
                    }
                    Err(current) => ticket = current,
                }
            } else {
                let prev = ticket;
                ticket = self.tail.0.load(Ordering::Acquire);
                if ticket == prev {
                    return None;
                }
            }
        }
    }

    /// Number of elements currently queued, as a best-effort estimate.
    ///
    /// May be negative while blocked consumers hold tickets for elements
    /// that have not been produced yet. Only authoritative once all
    /// producers and consumers have quiesced.
    pub fn size(&self) -> isize {
        let head = self.head.0.load(Ordering::Relaxed);
        let tail = self.tail.0.load(Ordering::Relaxed);
        head.wrapping_sub(tail) as isize
    }

    /// Best-effort emptiness; see [`size`](Self::size).
    pub fn empty(&self) -> bool {
        self.size() <= 0
    }

    /// Maximum number of elements the queue can hold.
    pub const fn capacity(&self) -> usize {
        N
    }
}

impl<T: SharedMemorySafe, const N: usize> Default for Queue<T, N> {
    fn default() -> Self {
        Self::new()
    }
}
