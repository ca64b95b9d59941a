//! Fixed-capacity single-producer single-consumer ring.
//!
//! Lives entirely inside an allocator's region so producer and consumer
//! can sit in different processes. The producer is wait-free; overflow
//! fails with [`Error::QueueFull`] rather than blocking.

use crate::error::{Error, Result};
use crate::memory::{OffsetPtr, ShmAllocator, ShmRef};
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

/// Bytes reserved for the ring header ahead of the slot array; also
/// keeps the hot counters on their own cache line.
const SLOTS_OFFSET: u64 = 64;

#[repr(C)]
struct RingHeader {
    head: AtomicU64,
    tail: AtomicU64,
    capacity: u64,
}

/// SPSC ring buffer handle.
///
/// `T` must be plain data (`Copy`): values are stored by bit copy in
/// shared memory.
pub struct SpscRing<T: Copy> {
    hdr: NonNull<RingHeader>,
    slots: NonNull<UnsafeCell<MaybeUninit<T>>>,
    shm: ShmRef,
    cap: u64,
}

impl<T: Copy> SpscRing<T> {
    /// Slot-array offset: at least a cache line past the header, and
    /// aligned for `T` (the allocation itself is `T`-aligned).
    fn slots_offset() -> u64 {
        (std::mem::align_of::<T>() as u64).max(SLOTS_OFFSET)
    }

    fn layout_size(capacity: usize) -> usize {
        Self::slots_offset() as usize
            + capacity * std::mem::size_of::<UnsafeCell<MaybeUninit<T>>>()
    }

    /// Allocate and initialize a ring of `capacity` slots inside `alloc`.
    pub fn create_in(alloc: &dyn ShmAllocator, capacity: usize) -> Result<Self> {
        assert!(capacity > 0, "capacity must be at least 1");
        let align = Self::slots_offset().max(16) as usize;
        let off = alloc
            .allocate_offset(Self::layout_size(capacity), align)
            .ok_or(Error::OutOfMemory)?;

        // SAFETY: the allocation spans the header and the slot array.
        let hdr = unsafe { alloc.base().as_ptr().add(off.get() as usize).cast::<RingHeader>() };
        unsafe {
            std::ptr::write(
                hdr,
                RingHeader {
                    head: AtomicU64::new(0),
                    tail: AtomicU64::new(0),
                    capacity: capacity as u64,
                },
            );
        }
        // SAFETY: just initialized at a valid in-region offset.
        Ok(unsafe { Self::attach(alloc, off) })
    }

    /// Reattach to a ring created by another process (or handle).
    ///
    /// # Safety
    ///
    /// `shm.off` must point at a ring of `T` created by
    /// [`SpscRing::create_in`] in a region `alloc` has mapped.
    pub unsafe fn from_ref(alloc: &dyn ShmAllocator, shm: ShmRef) -> Self {
        // SAFETY: forwarded contract.
        unsafe { Self::attach(alloc, shm.off) }
    }

    unsafe fn attach(alloc: &dyn ShmAllocator, off: OffsetPtr) -> Self {
        // SAFETY: caller guarantees a ring lives at `off`.
        unsafe {
            let base = alloc.base().as_ptr().add(off.get() as usize);
            let hdr = NonNull::new_unchecked(base.cast::<RingHeader>());
            let cap = (*hdr.as_ptr()).capacity;
            let slots = NonNull::new_unchecked(
                base.add(Self::slots_offset() as usize)
                    .cast::<UnsafeCell<MaybeUninit<T>>>(),
            );
            Self {
                hdr,
                slots,
                shm: ShmRef::new(alloc.id(), off),
                cap,
            }
        }
    }

    /// The reference another process uses to reattach.
    #[inline]
    pub fn shm(&self) -> ShmRef {
        self.shm
    }

    /// Slot count.
    #[inline]
    pub fn capacity(&self) -> u64 {
        self.cap
    }

    /// Elements currently queued (approximate from a third thread).
    #[inline]
    pub fn len(&self) -> u64 {
        // SAFETY: hdr points at the live ring header.
        let h = unsafe { self.hdr.as_ref() };
        h.tail
            .load(Ordering::Acquire)
            .saturating_sub(h.head.load(Ordering::Acquire))
    }

    /// Whether the ring is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    fn slot(&self, pos: u64) -> *mut MaybeUninit<T> {
        // SAFETY: pos % cap < cap slots exist.
        unsafe { (*self.slots.as_ptr().add((pos % self.cap) as usize)).get() }
    }

    /// Push a value; fails with [`Error::QueueFull`] when no slot is
    /// free. Producer side only.
    pub fn push(&self, value: T) -> Result<()> {
        // SAFETY: hdr points at the live ring header.
        let h = unsafe { self.hdr.as_ref() };
        let tail = h.tail.load(Ordering::Relaxed);
        if tail - h.head.load(Ordering::Acquire) >= self.cap {
            return Err(Error::QueueFull);
        }
        // SAFETY: the slot at tail is unreachable by the consumer until
        // the tail store below publishes it.
        unsafe { (*self.slot(tail)).write(value) };
        h.tail.store(tail + 1, Ordering::Release);
        Ok(())
    }

    /// Pop the oldest value; fails with [`Error::QueueEmpty`]. Consumer
    /// side only.
    pub fn pop(&self) -> Result<T> {
        // SAFETY: hdr points at the live ring header.
        let h = unsafe { self.hdr.as_ref() };
        let head = h.head.load(Ordering::Relaxed);
        if h.tail.load(Ordering::Acquire) == head {
            return Err(Error::QueueEmpty);
        }
        // SAFETY: head < tail, so the slot holds a published value.
        let value = unsafe { (*self.slot(head)).assume_init_read() };
        h.head.store(head + 1, Ordering::Release);
        Ok(value)
    }
}

// SAFETY: the handle may move across threads; the producer/consumer
// single-writer discipline is the caller's contract, and the memory it
// points into is shared.
unsafe impl<T: Copy + Send> Send for SpscRing<T> {}
unsafe impl<T: Copy + Send> Sync for SpscRing<T> {}
