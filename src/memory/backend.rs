//! Memory backend trait and region layout.
//!
//! A backend owns a named, contiguous byte range laid out as
//! `[BackendHeader | private area | data…]`, with the data area starting
//! at the first page-aligned offset past the headers. The creator process
//! initializes the header; attaching processes re-derive their pointers
//! from it.

use std::ptr::NonNull;

/// Minimum backend size; smaller requests are silently rounded up.
pub const MIN_BACKEND_SIZE: usize = 1024 * 1024;

/// Header/private area granule; the data area starts on this boundary.
pub const HEADER_ALIGNMENT: usize = 4096;

/// The identifier for a memory backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(C)]
pub struct BackendId {
    /// Node-level component.
    pub major: u32,
    /// Node-local component.
    pub minor: u32,
}

impl BackendId {
    /// Create a backend id.
    #[inline]
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }
}

/// Status bit: the header has been fully initialized by the creator.
pub const BACKEND_INITIALIZED: u32 = 1 << 0;

/// The shared header at the start of every region.
///
/// Attachers read this before mapping the full region, so it must fit in
/// the first page and be self-describing.
#[repr(C)]
pub struct BackendHeader {
    /// Identifier recorded by the creator.
    pub id: BackendId,
    /// Total mapped bytes, headers included.
    pub backend_size: u64,
    /// Bytes in the data area.
    pub data_size: u64,
    /// Status flag bitfield.
    pub flags: u32,
}

impl BackendHeader {
    /// Initialize the header in place.
    pub fn configure(&mut self, id: BackendId, backend_size: u64, data_size: u64) {
        self.id = id;
        self.backend_size = backend_size;
        self.data_size = data_size;
        self.flags = BACKEND_INITIALIZED;
    }

    /// Whether the creator finished initializing the region.
    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.flags & BACKEND_INITIALIZED != 0
    }
}

/// Byte offset of the data area from the region base.
///
/// One header granule covers the shared header plus the private scratch
/// area; the data area begins at the next page boundary.
#[inline]
pub const fn data_offset() -> usize {
    let hdr_end = std::mem::size_of::<BackendHeader>();
    (hdr_end + HEADER_ALIGNMENT - 1) / HEADER_ALIGNMENT * HEADER_ALIGNMENT
}

/// Kind of memory backing a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// Process-local heap memory; cannot be attached by other processes.
    Heap,
    /// POSIX named shared memory (`shm_open`).
    PosixShm,
    /// memfd-backed unified memory a GPU can import coherently.
    Unified,
}

impl BackendKind {
    /// Can another process on this host attach to the region?
    #[inline]
    pub fn supports_attach(&self) -> bool {
        !matches!(self, BackendKind::Heap)
    }
}

/// Trait for memory backends.
///
/// A backend represents one mapped region. Allocators are constructed
/// over its data area and never see the headers.
///
/// # Lifecycle
///
/// A region is created once and destroyed by its owner; other processes
/// attach and detach. Implementations detach (and, for the owner,
/// destroy) on drop.
///
/// # Safety
///
/// Implementations must keep the data pointer valid and the layout
/// constants honored for the lifetime of the value.
pub trait MemoryBackend: Send + Sync {
    /// The shared header of this region.
    fn header(&self) -> &BackendHeader;

    /// Base pointer of the data area.
    fn data_ptr(&self) -> NonNull<u8>;

    /// Size of the data area in bytes.
    fn data_len(&self) -> usize;

    /// The kind of memory backing this region.
    fn kind(&self) -> BackendKind;

    /// Whether this process created (and will destroy) the region.
    fn is_owner(&self) -> bool;

    /// The region's name, for backends that have one.
    fn url(&self) -> Option<&str> {
        None
    }

    /// View the data area as a byte slice.
    ///
    /// # Safety
    ///
    /// The caller must ensure no conflicting mutable access exists.
    unsafe fn data_slice(&self) -> &[u8] {
        // SAFETY: data_ptr/data_len describe one mapped range.
        unsafe { std::slice::from_raw_parts(self.data_ptr().as_ptr(), self.data_len()) }
    }
}
