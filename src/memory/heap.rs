//! Heap-backed memory region.
//!
//! The simplest backend: a page-aligned allocation from the process heap
//! with the standard region layout. Useful for single-process pipelines
//! and tests; `attach` necessarily fails.

use super::backend::{
    data_offset, BackendHeader, BackendId, BackendKind, MemoryBackend, HEADER_ALIGNMENT,
    MIN_BACKEND_SIZE,
};
use crate::error::{Error, Result};
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;

/// A region backed by process-local heap memory.
pub struct HeapBackend {
    base: NonNull<u8>,
    total_size: usize,
}

impl HeapBackend {
    /// Create a new heap-backed region.
    ///
    /// Sizes below the 1 MiB minimum are silently rounded up. The size
    /// covers the whole region; the data area is what remains after the
    /// headers.
    pub fn create(id: BackendId, size: usize) -> Result<Self> {
        let total_size = size.max(MIN_BACKEND_SIZE);

        let layout = Layout::from_size_align(total_size, HEADER_ALIGNMENT)
            .map_err(|e| Error::BackendCreateFailed(e.to_string()))?;
        // SAFETY: layout has non-zero size.
        let ptr = unsafe { alloc_zeroed(layout) };
        let base = NonNull::new(ptr)
            .ok_or_else(|| Error::BackendCreateFailed("heap allocation failed".into()))?;

        let data_size = total_size - data_offset();
        // SAFETY: base points at a fresh zeroed allocation large enough
        // for the header.
        unsafe {
            (*base.as_ptr().cast::<BackendHeader>()).configure(
                id,
                total_size as u64,
                data_size as u64,
            );
        }

        tracing::debug!(?id, total_size, data_size, "created heap backend");
        Ok(Self { base, total_size })
    }

    /// Heap regions are process-local; attaching always fails.
    pub fn attach(_url: &str) -> Result<Self> {
        Err(Error::BackendAttachFailed(
            "heap backend cannot be attached across processes".into(),
        ))
    }
}

impl MemoryBackend for HeapBackend {
    fn header(&self) -> &BackendHeader {
        // SAFETY: the header was constructed in create() and the
        // allocation lives as long as self.
        unsafe { &*self.base.as_ptr().cast::<BackendHeader>() }
    }

    fn data_ptr(&self) -> NonNull<u8> {
        // SAFETY: data_offset() < total_size by construction.
        unsafe { NonNull::new_unchecked(self.base.as_ptr().add(data_offset())) }
    }

    fn data_len(&self) -> usize {
        self.total_size - data_offset()
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Heap
    }

    fn is_owner(&self) -> bool {
        true
    }
}

impl Drop for HeapBackend {
    fn drop(&mut self) {
        // Layout matches create(); from_size_align cannot fail twice.
        let layout = Layout::from_size_align(self.total_size, HEADER_ALIGNMENT).unwrap();
        // SAFETY: base came from alloc_zeroed with this exact layout.
        unsafe { dealloc(self.base.as_ptr(), layout) };
    }
}

// SAFETY: the region is a plain allocation; all interior mutability is
// done through atomics by the allocators layered on top.
unsafe impl Send for HeapBackend {}
unsafe impl Sync for HeapBackend {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heap_backend_creation() {
        let backend = HeapBackend::create(BackendId::new(0, 0), 2 * 1024 * 1024).unwrap();
        assert_eq!(backend.kind(), BackendKind::Heap);
        assert!(backend.is_owner());
        assert!(backend.header().is_initialized());
        assert_eq!(backend.header().id, BackendId::new(0, 0));
        assert_eq!(backend.data_len(), 2 * 1024 * 1024 - data_offset());
    }

    #[test]
    fn test_heap_backend_minimum_size_rounding() {
        let backend = HeapBackend::create(BackendId::new(0, 1), 4096).unwrap();
        assert_eq!(backend.header().backend_size, MIN_BACKEND_SIZE as u64);
    }

    #[test]
    fn test_heap_backend_attach_fails() {
        assert!(matches!(
            HeapBackend::attach("/whatever"),
            Err(Error::BackendAttachFailed(_))
        ));
    }

    #[test]
    fn test_heap_backend_data_is_zeroed_and_writable() {
        let backend = HeapBackend::create(BackendId::new(0, 2), MIN_BACKEND_SIZE).unwrap();
        let ptr = backend.data_ptr().as_ptr();
        unsafe {
            assert_eq!(*ptr, 0);
            *ptr = 42;
            *ptr.add(backend.data_len() - 1) = 99;
            assert_eq!(*ptr, 42);
            assert_eq!(*ptr.add(backend.data_len() - 1), 99);
        }
    }
}
