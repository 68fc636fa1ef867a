//! Named shared-memory segments and in-segment placement.
//!
//! A [`Segment`] wraps a POSIX shared memory object (`shm_open` + `mmap`)
//! holding a fixed-capacity byte range that any number of processes can map.
//! The process that *creates* the segment owns the name and unlinks it on
//! drop; processes that merely *open* it unmap and leave the name alone.
//! This split is enforced at compile time with the [`Creator`] / [`Opener`]
//! typestate markers.
//!
//! Creator-mode segments additionally expose a bump allocator
//! ([`Segment::allocate`], [`Segment::allocate_with`]) used to place-construct
//! objects at monotonically increasing offsets. Opener-mode segments recover
//! those objects with [`Segment::view_as`], which reinterprets an offset as a
//! reference after bounds and alignment checks. Because both sides may map
//! the segment at different virtual addresses, anything placed inside must be
//! [`SharedMemorySafe`]: stable layout, no pointers, atomics for all shared
//! mutation.
//!
//! ```no_run
//! use ferry::segment::{Creator, Opener, Segment};
//! use ferry::mpmc::ByteQueue;
//!
//! // Process A
//! let seg = Segment::<Creator>::create("/ferry-demo", 1 << 20)?;
//! let queue: &ByteQueue<65536> = seg
//!     .allocate_with(ByteQueue::init_in_place)
//!     .expect("segment too small");
//! assert!(queue.try_push(b"hello"));
//!
//! // Process B
//! let view = Segment::<Opener>::open("/ferry-demo", 1 << 20)?;
//! let queue: &ByteQueue<65536> = view.view_as(0).expect("bad layout");
//! let mut out = Vec::new();
//! assert!(queue.try_pop(&mut out));
//! assert_eq!(out, b"hello");
//! # Ok::<(), ferry::segment::SegmentError>(())
//! ```

use std::cell::Cell;
use std::marker::PhantomData;
use std::mem::{align_of, size_of, MaybeUninit};
use std::ptr::{null_mut, NonNull};
use std::sync::atomic::*;

use rustix::fs::{fchmod, fstat, ftruncate, Mode};
use rustix::mm::{mmap, munmap, MapFlags, ProtFlags};
use rustix::{io, shm};
use thiserror::Error;

use crate::trace;

/// Result alias for segment operations.
pub type Result<T> = std::result::Result<T, SegmentError>;

/// Errors produced while creating, opening or mapping a segment.
#[derive(Debug, Error)]
pub enum SegmentError {
    /// The segment name does not satisfy POSIX `shm_open` requirements.
    #[error("invalid segment name `{name}`: {reason}")]
    InvalidName { name: String, reason: &'static str },

    /// An OS call (`shm_open`, `ftruncate`, `mmap`, ...) failed.
    #[error("{op} failed for `{name}`: {source}")]
    Os {
        op: &'static str,
        name: String,
        #[source]
        source: io::Errno,
    },

    /// The existing object is smaller than the capacity being opened.
    #[error("segment `{name}` is {actual} bytes, expected at least {expected}")]
    TooSmall {
        name: String,
        expected: usize,
        actual: u64,
    },
}

impl SegmentError {
    fn os(op: &'static str, name: &str, source: io::Errno) -> Self {
        Self::Os {
            op,
            name: name.to_string(),
            source,
        }
    }
}

/// Cleanup behavior marker for segment modes. See [`Creator`] and [`Opener`].
pub trait ShmMode {
    /// Whether dropping the segment unlinks the OS-level name.
    const SHOULD_UNLINK: bool;
}

/// Typestate marker for the process that created the segment.
///
/// Exactly one process should hold a creator segment for a given name at a
/// time. Dropping it unmaps the view *and* unlinks the name; already-mapped
/// opener views stay valid until they unmap.
pub struct Creator;
impl ShmMode for Creator {
    const SHOULD_UNLINK: bool = true;
}

/// Typestate marker for processes that opened an existing segment.
///
/// Dropping only unmaps; the creator retains responsibility for the name.
pub struct Opener;
impl ShmMode for Opener {
    const SHOULD_UNLINK: bool = false;
}

/// Types safe to place in shared memory and access from multiple processes.
///
/// Implement via `#[derive(SharedMemorySafe)]`, which checks the layout and
/// field requirements at compile time.
///
/// # Safety
///
/// Implementers must guarantee:
///
/// - `#[repr(C)]` or `#[repr(transparent)]` layout (processes may be built
///   separately; the default Rust layout is unstable),
/// - no pointers, references or heap-owning fields; virtual addresses do
///   not transfer across address spaces,
/// - all fields recursively `SharedMemorySafe`,
/// - concurrent access mediated by atomics (a peer process can observe any
///   intermediate state),
/// - soundness even if `Drop` never runs (peers can die holding a mapping).
pub unsafe trait SharedMemorySafe: Send + Sync {}

macro_rules! impl_shared_memory_safe {
    ($($t:ty),* $(,)?) => {
        $(
            unsafe impl SharedMemorySafe for $t {}
        )*
    };
}

impl_shared_memory_safe! {
    i8, i16, i32, i64, i128, isize,
    u8, u16, u32, u64, u128, usize,
    f32, f64,
    bool,
    AtomicBool,
    AtomicI8, AtomicI16, AtomicI32, AtomicI64, AtomicIsize,
    AtomicU8, AtomicU16, AtomicU32, AtomicU64, AtomicUsize,
}

unsafe impl<T: SharedMemorySafe, const N: usize> SharedMemorySafe for [T; N] {}

const POSIX_NAME_MAX: usize = 255;

/// Removes a segment name without mapping it.
///
/// Intended for startup cleanup: a creator that crashed never ran its
/// unlink, and a subsequent [`Segment::create`] of the same name would fail
/// with `EEXIST`. Errors from the OS (for example `ENOENT` when there is
/// nothing to remove) are returned for the caller to ignore or report.
pub fn unlink(name: &str) -> Result<()> {
    validate_name(name)?;
    shm::unlink(name).map_err(|err| SegmentError::os("shm_unlink", name, err))
}

/// Checks that `name` is a portable POSIX shared memory name: a leading
/// slash, no other slashes, at most 255 bytes.
fn validate_name(name: &str) -> Result<()> {
    if !name.starts_with('/') {
        return Err(SegmentError::InvalidName {
            name: name.to_string(),
            reason: "name must start with '/'",
        });
    }
    if name[1..].contains('/') {
        return Err(SegmentError::InvalidName {
            name: name.to_string(),
            reason: "name must not contain additional '/' characters",
        });
    }
    if name.len() > POSIX_NAME_MAX {
        return Err(SegmentError::InvalidName {
            name: name.to_string(),
            reason: "name must be at most 255 bytes",
        });
    }
    Ok(())
}

/// A named shared-memory segment mapped into this process.
///
/// The mapped range is `capacity()` bytes long, page-aligned (so offset 0 is
/// always suitably aligned for any cache-line-aligned queue type), and
/// zero-initialized when freshly created.
///
/// `Segment` is `Send` but not `Sync`: the bump cursor is process-local
/// bookkeeping and is not meant to be raced. References handed out by
/// [`allocate_with`](Self::allocate_with) and [`view_as`](Self::view_as)
/// borrow the segment and may be shared freely across threads whenever the
/// target type is `Sync`.
pub struct Segment<M: ShmMode> {
    ptr: NonNull<u8>,
    capacity: usize,
    /// Next free offset for the bump allocator. Only advanced by creators.
    bump: Cell<usize>,
    name: String,
    _mode: PhantomData<M>,
}

// SAFETY: the mapping is plain shared memory, not tied to the creating
// thread; the bump cursor moves with the value.
unsafe impl<M: ShmMode> Send for Segment<M> {}

impl Segment<Creator> {
    /// Creates a new shared memory object of `capacity` bytes and maps it.
    ///
    /// The object is created exclusively (`O_EXCL`), truncated to size (so a
    /// fresh segment is guaranteed zero-filled) and `fchmod`ed to be
    /// readable and writable by user, group and others. The permissive mode
    /// is an interop requirement: peer processes running under different
    /// users must be able to map the queue. The explicit `fchmod` defeats the
    /// process umask, which `shm_open` honors.
    ///
    /// # Errors
    ///
    /// Invalid name, `EEXIST` (object already present; unlink leftovers
    /// first), `EACCES`, `ENOMEM`, or any mapping failure. On partial
    /// failure the half-created object is unlinked before returning.
    pub fn create(name: &str, capacity: usize) -> Result<Self> {
        validate_name(name)?;

        let world_rw = Mode::RUSR
            | Mode::WUSR
            | Mode::RGRP
            | Mode::WGRP
            | Mode::ROTH
            | Mode::WOTH;

        let fd = shm::open(
            name,
            shm::OFlags::CREATE | shm::OFlags::EXCL | shm::OFlags::RDWR,
            world_rw,
        )
        .map_err(|err| SegmentError::os("shm_open", name, err))?;

        // shm_open applies the umask; re-apply the intended mode directly.
        if let Err(err) = fchmod(&fd, world_rw) {
            drop(fd);
            let _ = shm::unlink(name);
            return Err(SegmentError::os("fchmod", name, err));
        }

        if let Err(err) = ftruncate(&fd, capacity as u64) {
            drop(fd);
            let _ = shm::unlink(name);
            return Err(SegmentError::os("ftruncate", name, err));
        }

        // SAFETY: fresh mapping of a valid fd, sized to `capacity`; does not
        // alias any existing Rust object in this process.
        let ptr = match unsafe {
            mmap(
                null_mut(),
                capacity,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &fd,
                0,
            )
        } {
            Ok(p) => p,
            Err(err) => {
                drop(fd);
                let _ = shm::unlink(name);
                return Err(SegmentError::os("mmap", name, err));
            }
        };

        trace::debug!(name, capacity, "created shared memory segment");

        // SAFETY: mmap never returns null on success.
        let ptr = unsafe { NonNull::new_unchecked(ptr as *mut u8) };
        Ok(Self {
            ptr,
            capacity,
            bump: Cell::new(0),
            name: name.to_string(),
            _mode: PhantomData,
        })
    }

    /// Returns a pointer to the next `len` free bytes, advancing the bump
    /// cursor, or `None` once fewer than `len` bytes remain.
    ///
    /// There is no `free`; every allocation lives as long as the segment.
    pub fn allocate(&self, len: usize) -> Option<NonNull<u8>> {
        let offset = self.bump.get();
        let end = offset.checked_add(len)?;
        if end > self.capacity {
            return None;
        }
        self.bump.set(end);
        trace::trace!(len, offset, "bump allocation");
        // SAFETY: offset < capacity, so the add stays inside the mapping.
        Some(unsafe { NonNull::new_unchecked(self.ptr.as_ptr().add(offset)) })
    }

    /// Reserves space for a `T`, runs `init` on the uninitialized slot and
    /// returns a reference to the placed value.
    ///
    /// The bump cursor is first rounded up to `align_of::<T>()`; the original
    /// raw-byte allocator cannot express alignment, and a misaligned `&T`
    /// would be immediate undefined behavior. Returns `None` when the
    /// remaining capacity cannot fit an aligned `T`.
    pub fn allocate_with<T, F>(&self, init: F) -> Option<&T>
    where
        T: SharedMemorySafe,
        F: FnOnce(&mut MaybeUninit<T>),
    {
        let offset = self.bump.get();
        let aligned = offset.checked_add(align_of::<T>() - 1)? & !(align_of::<T>() - 1);
        let end = aligned.checked_add(size_of::<T>())?;
        if end > self.capacity {
            return None;
        }
        self.bump.set(end);

        // SAFETY: the region [aligned, end) is in bounds, correctly aligned,
        // and handed out exactly once, so no other reference can alias it.
        let slot = unsafe { &mut *(self.ptr.as_ptr().add(aligned) as *mut MaybeUninit<T>) };
        init(slot);
        // SAFETY: `init` fully initialized the value.
        Some(unsafe { slot.assume_init_ref() })
    }

    /// Bytes handed out by the bump allocator so far.
    pub fn size(&self) -> usize {
        self.bump.get()
    }
}

impl Segment<Opener> {
    /// Opens an existing shared memory object and maps `capacity` bytes of it.
    ///
    /// Fails with `ENOENT` if no object of that name exists and with
    /// [`SegmentError::TooSmall`] if the object is smaller than `capacity`
    /// (mapping past the end would fault on first touch rather than here).
    pub fn open(name: &str, capacity: usize) -> Result<Self> {
        validate_name(name)?;

        let fd = shm::open(name, shm::OFlags::RDWR, Mode::empty())
            .map_err(|err| SegmentError::os("shm_open", name, err))?;

        let stat = match fstat(&fd) {
            Ok(stat) => stat,
            Err(err) => {
                drop(fd);
                return Err(SegmentError::os("fstat", name, err));
            }
        };
        if (stat.st_size as u64) < capacity as u64 {
            drop(fd);
            return Err(SegmentError::TooSmall {
                name: name.to_string(),
                expected: capacity,
                actual: stat.st_size as u64,
            });
        }

        // SAFETY: mapping an existing object of verified size; aliases no
        // local Rust object.
        let ptr = match unsafe {
            mmap(
                null_mut(),
                capacity,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &fd,
                0,
            )
        } {
            Ok(p) => p,
            Err(err) => {
                drop(fd);
                return Err(SegmentError::os("mmap", name, err));
            }
        };

        trace::debug!(name, capacity, "opened shared memory segment");

        // SAFETY: mmap never returns null on success.
        let ptr = unsafe { NonNull::new_unchecked(ptr as *mut u8) };
        Ok(Self {
            ptr,
            capacity,
            bump: Cell::new(0),
            name: name.to_string(),
            _mode: PhantomData,
        })
    }
}

impl<M: ShmMode> Segment<M> {
    /// Raw base pointer of the mapped range.
    pub fn data(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Total mapped capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The OS-level name this segment was created or opened with.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Reinterprets the bytes at `offset` as a `T`.
    ///
    /// Returns `None` if `[offset, offset + size_of::<T>())` leaves the
    /// mapping or `offset` is misaligned for `T`. This is how an opener
    /// process recovers an object a creator placed with
    /// [`allocate_with`](Segment::allocate_with): same type, same offset.
    ///
    /// The bytes are trusted to hold a valid `T`; the `SharedMemorySafe`
    /// contract (no pointers, atomics for shared state, peer initializes
    /// before publishing the name) is what makes that trust reasonable.
    pub fn view_as<T: SharedMemorySafe>(&self, offset: usize) -> Option<&T> {
        let end = offset.checked_add(size_of::<T>())?;
        if end > self.capacity || offset % align_of::<T>() != 0 {
            return None;
        }
        // SAFETY: in bounds, aligned, and T: SharedMemorySafe vouches for
        // cross-process access through shared references.
        Some(unsafe { &*(self.ptr.as_ptr().add(offset) as *const T) })
    }
}

impl<M: ShmMode> Drop for Segment<M> {
    fn drop(&mut self) {
        trace::debug!(name = %self.name, unlink = M::SHOULD_UNLINK, "dropping segment");
        // SAFETY: ptr/capacity describe the mapping made at construction.
        unsafe {
            let _ = munmap(self.ptr.as_ptr() as *mut _, self.capacity);
        }
        if M::SHOULD_UNLINK {
            let _ = shm::unlink(&self.name);
        }
    }
}
