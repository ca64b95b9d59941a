//! Per-process allocator registry.
//!
//! A [`ShmRef`] names an allocator and an offset; turning it into a
//! native address requires knowing where that allocator's region is
//! mapped *in this process*. The registry is that lookup table: one
//! explicit value created at process initialization and torn down at
//! shutdown, with every attach registering and every detach
//! unregistering.

use super::alloc::ShmAllocator;
use super::pointer::{AllocatorId, ShmRef};
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::RwLock;

#[derive(Debug, Clone, Copy)]
struct RegionEntry {
    /// Mapped base address, stored as an integer so the table is Send.
    base: usize,
    len: usize,
}

/// Registry mapping allocator ids to their mapped ranges.
#[derive(Default)]
pub struct AllocatorRegistry {
    map: RwLock<HashMap<AllocatorId, RegionEntry>>,
}

impl AllocatorRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an allocator's mapped range under its id.
    ///
    /// The caller keeps the region mapped for as long as the entry
    /// stays registered.
    pub fn register(&self, alloc: &(impl ShmAllocator + ?Sized)) {
        let entry = RegionEntry {
            base: alloc.base().as_ptr() as usize,
            len: alloc.data_len(),
        };
        self.map.write().unwrap().insert(alloc.id(), entry);
    }

    /// Remove an allocator's entry on detach.
    pub fn unregister(&self, id: AllocatorId) {
        self.map.write().unwrap().remove(&id);
    }

    /// Whether an allocator is currently registered.
    pub fn is_registered(&self, id: AllocatorId) -> bool {
        self.map.read().unwrap().contains_key(&id)
    }

    /// Number of registered allocators.
    pub fn len(&self) -> usize {
        self.map.read().unwrap().len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.map.read().unwrap().is_empty()
    }

    /// Resolve a shared reference to a native address.
    ///
    /// The mark bit is masked off before the bounds check. Fails with
    /// [`Error::PointerNotInAllocator`] when the allocator is unknown
    /// here or the offset leaves its range.
    pub fn resolve(&self, shm: ShmRef) -> Result<NonNull<u8>> {
        if shm.is_null() {
            return Err(Error::PointerNotInAllocator);
        }
        let off = shm.off.unmark().get();
        let map = self.map.read().unwrap();
        let entry = map.get(&shm.alloc).ok_or(Error::PointerNotInAllocator)?;
        if off >= entry.len as u64 {
            return Err(Error::PointerNotInAllocator);
        }
        // SAFETY: base was non-null at registration and off is in-range.
        Ok(unsafe { NonNull::new_unchecked((entry.base as *mut u8).add(off as usize)) })
    }
}
