//! Fixed-capacity multi-producer single-consumer ring.
//!
//! Every slot carries its own sequence number. A producer claims a slot
//! by CAS on the tail only after observing the slot's sequence equal to
//! the claimed position, writes the value, and publishes by bumping the
//! sequence. The consumer observes a value only after that bump, so a
//! successful `emplace` is exactly the visibility guarantee a `pop`
//! relies on, and per-producer FIFO order holds.
//!
//! The protocol uses only ordinary atomic loads, stores and CAS on
//! unified memory — no fences or syscalls — so a device-side producer
//! writing through a coherent mapping pairs with a host consumer that
//! simply polls.

use crate::error::{Error, Result};
use crate::memory::{OffsetPtr, ShmAllocator, ShmRef};
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

/// Bytes reserved for the ring header ahead of the slot array.
const SLOTS_OFFSET: u64 = 64;

#[repr(C)]
struct RingHeader {
    head: AtomicU64,
    tail: AtomicU64,
    capacity: u64,
}

#[repr(C)]
struct Slot<T> {
    /// Sequence number: `pos` when free for the producer claiming `pos`,
    /// `pos + 1` when holding that position's value, `pos + capacity`
    /// after the consumer recycles it.
    seq: AtomicU64,
    value: UnsafeCell<MaybeUninit<T>>,
}

/// MPSC ring buffer handle.
///
/// `T` must be plain data (`Copy`): values are stored by bit copy in
/// shared memory.
pub struct MpscRing<T: Copy> {
    hdr: NonNull<RingHeader>,
    slots: NonNull<Slot<T>>,
    shm: ShmRef,
    cap: u64,
}

impl<T: Copy> MpscRing<T> {
    /// Slot-array offset: at least a cache line past the header, and
    /// aligned for the slot type (the allocation itself matches).
    fn slots_offset() -> u64 {
        (std::mem::align_of::<Slot<T>>() as u64).max(SLOTS_OFFSET)
    }

    fn layout_size(capacity: usize) -> usize {
        Self::slots_offset() as usize + capacity * std::mem::size_of::<Slot<T>>()
    }

    /// Allocate and initialize a ring of `capacity` slots inside `alloc`.
    pub fn create_in(alloc: &dyn ShmAllocator, capacity: usize) -> Result<Self> {
        assert!(capacity > 0, "capacity must be at least 1");
        let align = Self::slots_offset().max(16) as usize;
        let off = alloc
            .allocate_offset(Self::layout_size(capacity), align)
            .ok_or(Error::OutOfMemory)?;

        // SAFETY: the allocation spans the header and the slot array.
        unsafe {
            let base = alloc.base().as_ptr().add(off.get() as usize);
            std::ptr::write(
                base.cast::<RingHeader>(),
                RingHeader {
                    head: AtomicU64::new(0),
                    tail: AtomicU64::new(0),
                    capacity: capacity as u64,
                },
            );
            let slots = base.add(Self::slots_offset() as usize).cast::<Slot<T>>();
            for i in 0..capacity {
                std::ptr::write(
                    slots.add(i),
                    Slot {
                        seq: AtomicU64::new(i as u64),
                        value: UnsafeCell::new(MaybeUninit::uninit()),
                    },
                );
            }
        }
        // SAFETY: just initialized at a valid in-region offset.
        Ok(unsafe { Self::attach(alloc, off) })
    }

    /// Reattach to a ring created by another process (or handle).
    ///
    /// # Safety
    ///
    /// `shm.off` must point at a ring of `T` created by
    /// [`MpscRing::create_in`] in a region `alloc` has mapped.
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
            let slots =
                NonNull::new_unchecked(base.add(Self::slots_offset() as usize).cast::<Slot<T>>());
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

    /// Elements currently queued (approximate under contention).
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
    fn slot(&self, pos: u64) -> &Slot<T> {
        // SAFETY: pos % cap < cap slots exist for the handle's lifetime.
        unsafe { &*self.slots.as_ptr().add((pos % self.cap) as usize) }
    }

    /// Push a value, spinning while the ring is full.
    pub fn emplace(&self, value: T) {
        loop {
            match self.try_emplace(value) {
                Ok(()) => return,
                Err(_) => std::hint::spin_loop(),
            }
        }
    }

    /// Push a value; fails with [`Error::QueueFull`] when every slot is
    /// occupied.
    pub fn try_emplace(&self, value: T) -> Result<()> {
        // SAFETY: hdr points at the live ring header.
        let h = unsafe { self.hdr.as_ref() };
        loop {
            let tail = h.tail.load(Ordering::Acquire);
            let slot = self.slot(tail);
            let seq = slot.seq.load(Ordering::Acquire);

            if seq == tail {
                // The slot is free at this position; claim it.
                if h.tail
                    .compare_exchange_weak(tail, tail + 1, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    // SAFETY: the claim made this slot exclusively ours
                    // until the sequence bump below.
                    unsafe { (*slot.value.get()).write(value) };
                    slot.seq.store(tail + 1, Ordering::Release);
                    return Ok(());
                }
                // Lost the claim race; retry.
            } else if seq < tail {
                // The consumer has not recycled this slot yet.
                return Err(Error::QueueFull);
            }
            // seq > tail: another producer advanced the tail; reload.
        }
    }

    /// Pop the oldest value; fails with [`Error::QueueEmpty`] when no
    /// published value is ready. Single consumer only.
    pub fn pop(&self) -> Result<T> {
        // SAFETY: hdr points at the live ring header.
        let h = unsafe { self.hdr.as_ref() };
        let head = h.head.load(Ordering::Relaxed);
        let slot = self.slot(head);
        if slot.seq.load(Ordering::Acquire) != head + 1 {
            return Err(Error::QueueEmpty);
        }
        // SAFETY: the sequence bump published this value; the consumer
        // is the only reader.
        let value = unsafe { (*slot.value.get()).assume_init_read() };
        // Recycle the slot for the producer that will claim head + cap.
        slot.seq.store(head + self.cap, Ordering::Release);
        h.head.store(head + 1, Ordering::Release);
        Ok(value)
    }
}

// SAFETY: producers synchronize through the tail CAS and per-slot
// sequences; the single-consumer discipline is the caller's contract.
unsafe impl<T: Copy + Send> Send for MpscRing<T> {}
unsafe impl<T: Copy + Send> Sync for MpscRing<T> {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{AllocatorId, BackendId, BuddyAllocator, HeapBackend};
    use std::sync::Arc;

    fn fixture() -> (HeapBackend, BuddyAllocator) {
        let backend = HeapBackend::create(BackendId::new(0, 0), 4 << 20).unwrap();
        let alloc = BuddyAllocator::create(AllocatorId::new(0, 0), &backend);
        (backend, alloc)
    }

    #[test]
    fn test_mpsc_single_thread_fifo() {
        let (_b, alloc) = fixture();
        let ring: MpscRing<i32> = MpscRing::create_in(&alloc, 10).unwrap();
        for i in 0..10 {
            ring.try_emplace(i).unwrap();
        }
        assert!(matches!(ring.try_emplace(10), Err(Error::QueueFull)));
        for i in 0..10 {
            assert_eq!(ring.pop().unwrap(), i);
        }
        assert!(matches!(ring.pop(), Err(Error::QueueEmpty)));
    }

    #[test]
    fn test_mpsc_slot_recycling() {
        let (_b, alloc) = fixture();
        let ring: MpscRing<u64> = MpscRing::create_in(&alloc, 3).unwrap();
        // Far more traffic than capacity; positions keep advancing.
        for round in 0..1000u64 {
            ring.try_emplace(round).unwrap();
            assert_eq!(ring.pop().unwrap(), round);
        }
    }

    #[test]
    fn test_mpsc_visibility_after_emplace() {
        let (_b, alloc) = fixture();
        let ring: MpscRing<[u8; 24]> = MpscRing::create_in(&alloc, 4).unwrap();
        ring.try_emplace([9; 24]).unwrap();
        let v = ring.pop().unwrap();
        assert_eq!(v, [9; 24]);
    }

    #[test]
    fn test_mpsc_concurrent_producers_per_producer_fifo() {
        const PRODUCERS: u64 = 4;
        const PER_PRODUCER: u64 = 256;

        let backend = Arc::new(HeapBackend::create(BackendId::new(0, 1), 4 << 20).unwrap());
        let alloc = BuddyAllocator::create(AllocatorId::new(0, 1), backend.as_ref());
        // Tiny capacity so producers constantly contend and spin.
        let ring: Arc<MpscRing<u64>> = Arc::new(MpscRing::create_in(&alloc, 8).unwrap());

        let mut handles = vec![];
        for p in 0..PRODUCERS {
            let ring = Arc::clone(&ring);
            let backend = Arc::clone(&backend);
            handles.push(std::thread::spawn(move || {
                let _keep = backend;
                for i in 0..PER_PRODUCER {
                    ring.emplace(p << 32 | i);
                }
            }));
        }

        let mut next_per_producer = [0u64; PRODUCERS as usize];
        let mut received = 0;
        while received < PRODUCERS * PER_PRODUCER {
            match ring.pop() {
                Ok(v) => {
                    let producer = (v >> 32) as usize;
                    let seq = v & 0xFFFF_FFFF;
                    // FIFO per producer.
                    assert_eq!(seq, next_per_producer[producer]);
                    next_per_producer[producer] += 1;
                    received += 1;
                }
                Err(_) => std::hint::spin_loop(),
            }
        }
        for h in handles {
            h.join().unwrap();
        }
        assert!(next_per_producer.iter().all(|&n| n == PER_PRODUCER));
    }
}
