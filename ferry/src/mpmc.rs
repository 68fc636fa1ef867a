//! Bounded lock-free multi-producer / multi-consumer queues.
//!
//! Two shapes, both designed to be placed inside a [`Segment`]
//! (`crate::segment`) and driven from any number of processes:
//!
//! - [`Queue<T, N>`]: fixed-size elements, per-slot turn sequencing
//!   (Vyukov-style bounded MPMC).
//! - [`ByteQueue<N>`]: variable-size byte records with in-band headers and
//!   a three-cursor reclamation protocol.
//!
//! Neither contains pointers: all internal state is offsets and atomics, so
//! one process can construct a queue in place and another can reinterpret
//! the same bytes at a different virtual address.
//!
//! [`Segment`]: crate::segment::Segment

pub mod byte_queue;
pub mod queue;

pub use byte_queue::ByteQueue;
pub use queue::Queue;

/// Cache line size assumed for false-sharing avoidance and block rounding.
///
/// Fixed at 128 so the in-memory format is identical across peers regardless
/// of how each build resolves the hardware interference size.
pub const CACHE_LINE: usize = 128;

/// Rounds `len` up to the next multiple of [`CACHE_LINE`].
#[inline]
pub(crate) const fn align_to_cache_line(len: usize) -> usize {
    (len + CACHE_LINE - 1) & !(CACHE_LINE - 1)
}

/// A `usize` cursor alone on its own cache line.
///
/// Head and tail cursors sit in adjacent `Cursor` fields, which pins them
/// exactly one cache line apart.
#[repr(C, align(128))]
pub(crate) struct Cursor(pub(crate) std::sync::atomic::AtomicUsize);

impl Cursor {
    pub(crate) const fn new(value: usize) -> Self {
        Self(std::sync::atomic::AtomicUsize::new(value))
    }
}

// SAFETY: repr(C) + explicit alignment, single atomic field.
unsafe impl crate::segment::SharedMemorySafe for Cursor {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_occupies_one_cache_line() {
        assert_eq!(std::mem::size_of::<Cursor>(), CACHE_LINE);
        assert_eq!(std::mem::align_of::<Cursor>(), CACHE_LINE);
    }

    #[test]
    fn cache_line_rounding() {
        assert_eq!(align_to_cache_line(0), 0);
        assert_eq!(align_to_cache_line(1), 128);
        assert_eq!(align_to_cache_line(128), 128);
        assert_eq!(align_to_cache_line(129), 256);
    }
}
