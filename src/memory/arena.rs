//! Reset-only arena allocator.
//!
//! A lifetime-scoped allocator over a backend: allocation bumps a single
//! offset, free is a no-op, and `reset()` returns every issued offset at
//! once. Useful as a sub-allocator and as the backing allocator for
//! short-lived unified-memory workloads.

use super::alloc::ShmAllocator;
use super::backend::MemoryBackend;
use super::bump::BumpHeap;
use super::pointer::{AllocatorId, OffsetPtr};
use crate::error::{Error, Result};
use std::ptr::NonNull;

/// An arena allocator over a backend's data area.
pub struct ArenaAllocator {
    id: AllocatorId,
    base: NonNull<u8>,
    data_size: usize,
    heap: BumpHeap,
}

impl ArenaAllocator {
    /// Create an arena covering the whole data area of `backend`.
    pub fn new(id: AllocatorId, backend: &dyn MemoryBackend) -> Self {
        Self::with_capacity(id, backend.data_ptr(), backend.data_len())
    }

    /// Create an arena over an explicit range, e.g. one carved out of a
    /// larger allocator.
    pub fn with_capacity(id: AllocatorId, base: NonNull<u8>, capacity: usize) -> Self {
        Self {
            id,
            base,
            data_size: capacity,
            heap: BumpHeap::new(0, capacity as u64),
        }
    }

    /// Current heap offset (bytes issued so far, padding included).
    #[inline]
    pub fn heap_offset(&self) -> u64 {
        self.heap.offset()
    }

    /// Bytes remaining before exhaustion.
    #[inline]
    pub fn remaining(&self) -> u64 {
        self.heap.remaining()
    }

    /// Return every issued offset at once.
    ///
    /// Outstanding pointers into the arena become dangling; the caller
    /// is responsible for not using them past this point.
    pub fn reset(&self) {
        self.heap.reset(0);
    }
}

impl ShmAllocator for ArenaAllocator {
    fn id(&self) -> AllocatorId {
        self.id
    }

    fn base(&self) -> NonNull<u8> {
        self.base
    }

    fn data_len(&self) -> usize {
        self.data_size
    }

    fn allocate_offset(&self, size: usize, align: usize) -> Option<OffsetPtr> {
        // Arena offsets are exact: the first allocation sits at 0.
        let align = if align == 0 { 1 } else { align };
        self.heap
            .allocate(size as u64, align as u64)
            .map(OffsetPtr::new)
    }

    fn free_offset(&self, off: OffsetPtr) -> Result<()> {
        if off.is_null() {
            return Err(Error::InvalidFree("null pointer freed".into()));
        }
        if !self.contains(off) {
            return Err(Error::InvalidFree(format!(
                "offset {off} outside arena of {} bytes",
                self.data_size
            )));
        }
        // Arena free is a no-op; memory is reclaimed by reset().
        Ok(())
    }
}

// SAFETY: the bump heap is atomic and the backing region is shared
// memory; no other interior state exists.
unsafe impl Send for ArenaAllocator {}
unsafe impl Sync for ArenaAllocator {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{BackendId, HeapBackend};

    fn arena(size: usize) -> (HeapBackend, ArenaAllocator) {
        let backend = HeapBackend::create(BackendId::new(0, 0), size).unwrap();
        let base = backend.data_ptr();
        let alloc = ArenaAllocator::with_capacity(AllocatorId::new(0, 0), base, size.min(backend.data_len()));
        (backend, alloc)
    }

    #[test]
    fn test_arena_offset_sequence() {
        let (_b, alloc) = arena(1024 * 1024);
        let p1 = alloc.allocate_offset(100, 1).unwrap();
        let p2 = alloc.allocate_offset(200, 1).unwrap();
        let p3 = alloc.allocate_offset(300, 1).unwrap();
        assert_eq!(p1.get(), 0);
        assert_eq!(p2.get(), 100);
        assert_eq!(p3.get(), 300);
        assert_eq!(alloc.heap_offset(), 600);
    }

    #[test]
    fn test_arena_aligned_allocation() {
        let (_b, alloc) = arena(1024 * 1024);
        let p1 = alloc.allocate_offset(1, 1).unwrap();
        let p2 = alloc.allocate_offset(1, 64).unwrap();
        assert_eq!(p1.get(), 0);
        // Skips to the next 64-byte boundary.
        assert_eq!(p2.get(), 64);
        let p3 = alloc.allocate_offset(50, 64).unwrap();
        assert_eq!(p3.get() % 64, 0);
    }

    #[test]
    fn test_arena_reset() {
        let (_b, alloc) = arena(1024 * 1024);
        alloc.allocate_offset(100, 1).unwrap();
        alloc.allocate_offset(200, 1).unwrap();
        assert_eq!(alloc.heap_offset(), 300);

        alloc.reset();
        assert_eq!(alloc.heap_offset(), 0);

        let p = alloc.allocate_offset(50, 1).unwrap();
        assert_eq!(p.get(), 0);
    }

    #[test]
    fn test_arena_out_of_memory() {
        let backend = HeapBackend::create(BackendId::new(0, 1), 1024 * 1024).unwrap();
        let alloc = ArenaAllocator::with_capacity(AllocatorId::new(0, 1), backend.data_ptr(), 1024);

        alloc.allocate_offset(512, 1).unwrap();
        alloc.allocate_offset(256, 1).unwrap();
        assert!(alloc.allocate_offset(200, 1).is_some()); // 968 < 1024
        assert!(alloc.allocate_offset(100, 1).is_none()); // would exceed

        // The typed wrapper raises instead.
        assert!(matches!(
            alloc.allocate::<u8>(100),
            Err(Error::OutOfMemory)
        ));
    }

    #[test]
    fn test_arena_free_is_noop() {
        let (_b, alloc) = arena(1024 * 1024);
        let p = alloc.allocate::<u32>(10).unwrap();
        let before = alloc.heap_offset();
        alloc.free(p).unwrap();
        assert_eq!(alloc.heap_offset(), before);
    }

    #[test]
    fn test_arena_remaining() {
        let backend = HeapBackend::create(BackendId::new(0, 2), 1024 * 1024).unwrap();
        let alloc = ArenaAllocator::with_capacity(AllocatorId::new(0, 2), backend.data_ptr(), 1000);
        assert_eq!(alloc.remaining(), 1000);
        alloc.allocate_offset(300, 1).unwrap();
        assert_eq!(alloc.remaining(), 700);
        alloc.allocate_offset(200, 1).unwrap();
        assert_eq!(alloc.remaining(), 500);
        alloc.reset();
        assert_eq!(alloc.remaining(), 1000);
    }

    #[test]
    fn test_arena_invalid_free() {
        let (_b, alloc) = arena(1024 * 1024);
        assert!(alloc.free_offset(OffsetPtr::NULL).is_err());
        assert!(alloc
            .free_offset(OffsetPtr::new(u64::MAX - 1))
            .is_err());
    }
}
