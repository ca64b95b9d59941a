//! Process-portable pointer model.
//!
//! Native addresses are only meaningful inside one process's mapping of a
//! region. Everything stored *inside* a region therefore addresses memory
//! with an [`OffsetPtr`] (a byte offset from the region's data base) or a
//! [`ShmRef`] (an offset paired with the owning allocator's id). A native
//! address is materialized only at the point of use, as a [`FullPtr`].
//!
//! The high bit of every offset is reserved as a **mark**: a tag bit used
//! by lock-free list protocols to defeat ABA. Readers must unmark an
//! offset before dereferencing it.

use crate::error::{Error, Result};
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

use super::ShmAllocator;

/// The identifier of an allocator.
///
/// `major` is typically derived from the backend, `minor` is a
/// backend-local ordinal. Two allocators are equal iff both fields match.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    rkyv::Archive,
    rkyv::Serialize,
    rkyv::Deserialize,
)]
#[rkyv(derive(Debug))]
#[repr(C)]
pub struct AllocatorId {
    /// Backend-derived component.
    pub major: i32,
    /// Backend-local component.
    pub minor: i32,
}

impl AllocatorId {
    /// The null allocator id, `(-1, -1)`.
    pub const NULL: AllocatorId = AllocatorId {
        major: -1,
        minor: -1,
    };

    /// Create an allocator id.
    #[inline]
    pub const fn new(major: i32, minor: i32) -> Self {
        Self { major, minor }
    }

    /// Check whether this is the null id.
    #[inline]
    pub fn is_null(&self) -> bool {
        *self == Self::NULL
    }

    /// Collapse the id into a single index.
    ///
    /// Callers must keep ids unique under this mapping; the registry
    /// itself keys on the full id, not the index.
    #[inline]
    pub fn to_index(&self) -> u32 {
        (self.major * 2 + self.minor) as u32
    }
}

impl fmt::Display for AllocatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// The mark bit: the most significant bit of an offset.
const MARK_BIT: u64 = 1 << 63;

/// Sentinel for "no offset".
const NULL_OFFSET: u64 = u64::MAX;

/// A 64-bit byte offset into a region's data area.
///
/// `u64::MAX` is the null offset. Offsets never cross a region boundary.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    rkyv::Archive,
    rkyv::Serialize,
    rkyv::Deserialize,
)]
#[rkyv(derive(Debug))]
#[repr(transparent)]
pub struct OffsetPtr(u64);

impl OffsetPtr {
    /// The null offset.
    pub const NULL: OffsetPtr = OffsetPtr(NULL_OFFSET);

    /// Create an offset pointer from a raw byte offset.
    #[inline]
    pub const fn new(off: u64) -> Self {
        Self(off)
    }

    /// Raw byte offset, including the mark bit if set.
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Byte offset with the mark bit cleared; what dereferencers use.
    #[inline]
    pub const fn get(self) -> u64 {
        self.0 & !MARK_BIT
    }

    /// Check whether this is the null offset.
    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == NULL_OFFSET
    }

    /// Return this offset with the mark bit set.
    #[inline]
    pub const fn mark(self) -> Self {
        Self(self.0 | MARK_BIT)
    }

    /// Return this offset with the mark bit cleared.
    #[inline]
    pub const fn unmark(self) -> Self {
        Self(self.0 & !MARK_BIT)
    }

    /// Check the mark bit.
    #[inline]
    pub const fn is_marked(self) -> bool {
        self.0 & MARK_BIT != 0
    }

    /// Offset advanced by `count` bytes.
    #[inline]
    pub const fn add(self, count: u64) -> Self {
        Self(self.0 + count)
    }

    /// Offset moved back by `count` bytes.
    #[inline]
    pub const fn sub(self, count: u64) -> Self {
        Self(self.0 - count)
    }
}

impl fmt::Display for OffsetPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "null")
        } else {
            write!(f, "{}", self.get())
        }
    }
}

/// An atomic offset pointer, usable in-place inside shared headers.
///
/// Supports the same mark semantics as [`OffsetPtr`] plus compare-and-swap,
/// which is what lock-free list heads in shared memory are built from.
#[repr(transparent)]
pub struct AtomicOffsetPtr {
    off: AtomicU64,
}

impl AtomicOffsetPtr {
    /// Create a new atomic offset holding `off`.
    pub const fn new(off: OffsetPtr) -> Self {
        Self {
            off: AtomicU64::new(off.raw()),
        }
    }

    /// Load the current offset.
    #[inline]
    pub fn load(&self, order: Ordering) -> OffsetPtr {
        OffsetPtr(self.off.load(order))
    }

    /// Store a new offset.
    #[inline]
    pub fn store(&self, val: OffsetPtr, order: Ordering) {
        self.off.store(val.raw(), order);
    }

    /// Compare-and-swap; returns the observed value on failure.
    #[inline]
    pub fn compare_exchange(
        &self,
        current: OffsetPtr,
        new: OffsetPtr,
        success: Ordering,
        failure: Ordering,
    ) -> std::result::Result<OffsetPtr, OffsetPtr> {
        self.off
            .compare_exchange(current.raw(), new.raw(), success, failure)
            .map(OffsetPtr)
            .map_err(OffsetPtr)
    }

    /// Weak compare-and-swap for retry loops.
    #[inline]
    pub fn compare_exchange_weak(
        &self,
        current: OffsetPtr,
        new: OffsetPtr,
        success: Ordering,
        failure: Ordering,
    ) -> std::result::Result<OffsetPtr, OffsetPtr> {
        self.off
            .compare_exchange_weak(current.raw(), new.raw(), success, failure)
            .map(OffsetPtr)
            .map_err(OffsetPtr)
    }

    /// Atomically advance the offset, returning the previous value.
    #[inline]
    pub fn fetch_add(&self, count: u64, order: Ordering) -> OffsetPtr {
        OffsetPtr(self.off.fetch_add(count, order))
    }

    /// Atomically move the offset back, returning the previous value.
    #[inline]
    pub fn fetch_sub(&self, count: u64, order: Ordering) -> OffsetPtr {
        OffsetPtr(self.off.fetch_sub(count, order))
    }
}

/// A process-independent pointer: an offset plus the allocator it belongs
/// to.
///
/// This is the only pointer form that may be stored in shared data
/// structures or serialized across a process boundary.
///
/// # Wire Format
///
/// ```text
/// ┌──────────────────┬──────────────────┐
/// │   allocator id   │      offset      │
/// │    (8 bytes)     │    (8 bytes)     │
/// └──────────────────┴──────────────────┘
/// ```
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    rkyv::Archive,
    rkyv::Serialize,
    rkyv::Deserialize,
)]
#[rkyv(derive(Debug))]
#[repr(C)]
pub struct ShmRef {
    /// Allocator the offset belongs to.
    pub alloc: AllocatorId,
    /// Offset within the allocator's data area.
    pub off: OffsetPtr,
}

impl ShmRef {
    /// The null reference.
    pub const NULL: ShmRef = ShmRef {
        alloc: AllocatorId::NULL,
        off: OffsetPtr::NULL,
    };

    /// Create a reference from an allocator id and offset.
    #[inline]
    pub const fn new(alloc: AllocatorId, off: OffsetPtr) -> Self {
        Self { alloc, off }
    }

    /// Check whether this reference is null.
    #[inline]
    pub fn is_null(&self) -> bool {
        self.alloc.is_null() || self.off.is_null()
    }

    /// Return this reference with the offset's mark bit set.
    #[inline]
    pub const fn mark(self) -> Self {
        Self {
            alloc: self.alloc,
            off: self.off.mark(),
        }
    }

    /// Return this reference with the offset's mark bit cleared.
    #[inline]
    pub const fn unmark(self) -> Self {
        Self {
            alloc: self.alloc,
            off: self.off.unmark(),
        }
    }

    /// Check the offset's mark bit.
    #[inline]
    pub const fn is_marked(self) -> bool {
        self.off.is_marked()
    }
}

impl fmt::Display for ShmRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.alloc, self.off)
    }
}

/// A native address paired with the shared reference it was resolved from.
///
/// A `FullPtr` is only valid while the allocator it was resolved through
/// remains mapped in this process. Only the [`ShmRef`] half may be handed
/// to another process or persisted.
pub struct FullPtr<T> {
    ptr: NonNull<T>,
    shm: ShmRef,
}

impl<T> FullPtr<T> {
    /// Resolve a shared reference against an allocator.
    ///
    /// Fails with [`Error::PointerNotInAllocator`] if the (unmarked)
    /// offset does not lie within the allocator's data area.
    pub fn resolve(alloc: &(impl ShmAllocator + ?Sized), shm: ShmRef) -> Result<Self> {
        let off = shm.off.unmark();
        if shm.is_null() || off.get() + std::mem::size_of::<T>() as u64 > alloc.data_len() as u64 {
            return Err(Error::PointerNotInAllocator);
        }
        // SAFETY: the offset was just bounds-checked against the mapped
        // data area, so the sum cannot leave the region.
        let ptr = unsafe { alloc.base().as_ptr().add(off.get() as usize) };
        Ok(Self {
            // SAFETY: base is non-null and the add stays in-bounds.
            ptr: unsafe { NonNull::new_unchecked(ptr.cast::<T>()) },
            shm: ShmRef::new(shm.alloc, off),
        })
    }

    /// Construct from both halves without validation.
    ///
    /// # Safety
    ///
    /// `ptr` must be the in-process address of `shm` within a mapped
    /// region that outlives the `FullPtr`.
    #[inline]
    pub unsafe fn from_parts(ptr: NonNull<T>, shm: ShmRef) -> Self {
        Self { ptr, shm }
    }

    /// The native address half.
    #[inline]
    pub fn as_ptr(&self) -> *mut T {
        self.ptr.as_ptr()
    }

    /// The shared half; the only part that survives serialization.
    #[inline]
    pub fn shm(&self) -> ShmRef {
        self.shm
    }

    /// The offset within the owning allocator.
    #[inline]
    pub fn offset(&self) -> OffsetPtr {
        self.shm.off
    }

    /// Borrow the pointee.
    ///
    /// # Safety
    ///
    /// The caller must ensure the region is still mapped and no mutable
    /// access is live.
    #[inline]
    pub unsafe fn as_ref(&self) -> &T {
        // SAFETY: caller upholds aliasing and lifetime rules.
        unsafe { self.ptr.as_ref() }
    }

    /// Mutably borrow the pointee.
    ///
    /// # Safety
    ///
    /// The caller must ensure the region is still mapped and this is the
    /// only live access.
    #[allow(clippy::mut_from_ref)]
    #[inline]
    pub unsafe fn as_mut(&self) -> &mut T {
        // SAFETY: caller upholds exclusivity.
        unsafe { &mut *self.ptr.as_ptr() }
    }
}

impl<T> Clone for FullPtr<T> {
    fn clone(&self) -> Self {
        Self {
            ptr: self.ptr,
            shm: self.shm,
        }
    }
}

impl<T> Copy for FullPtr<T> {}

impl<T> fmt::Debug for FullPtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FullPtr({:p} {})", self.ptr.as_ptr(), self.shm)
    }
}
