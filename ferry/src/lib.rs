//! Bounded lock-free MPMC queues that live inside named shared memory.
//!
//! One process creates a [`segment::Segment`], place-constructs a queue in
//! it with the segment's bump allocator, and any other process mapping the
//! same name can reinterpret the segment bytes as the queue type and push or
//! pop concurrently: the queues contain no pointers, only offsets and
//! atomics, so differing virtual base addresses are irrelevant.
//!
//! - [`mpmc::Queue`]: fixed-size elements, per-slot turn sequencing.
//! - [`mpmc::ByteQueue`]: variable-size byte records, three-cursor
//!   reclamation.
//!
//! Types placed in a segment must be
//! [`SharedMemorySafe`](segment::SharedMemorySafe); use the derive macro to
//! have the layout and field requirements checked at compile time.

// Allow the crate to reference itself as ::ferry for derive macro expansion.
extern crate self as ferry;

pub mod mpmc;
pub mod segment;
mod trace;

#[doc(inline)]
pub use ferry_derive::SharedMemorySafe;

#[doc(inline)]
pub use segment::SharedMemorySafe;

// Hidden re-export targeted by the derive macro's generated impls.
#[doc(hidden)]
pub use segment::SharedMemorySafe as __SharedMemorySafePrivate;

pub use trace::init_tracing;
