//! Unified host/device memory region.
//!
//! Backed by an anonymous memfd mapped into the host, with the same
//! region layout as every other backend. The mapping is plain, cacheable
//! host memory, which is exactly what GPU runtimes import as coherent
//! external host memory: the fd from [`UnifiedBackend::export_fd`] can be
//! handed to a device-side import (CUDA external memory, Vulkan
//! `VK_EXT_external_memory_host`/DMA-BUF) so kernels read and write the
//! data area coherently with the host.
//!
//! Only host-side allocation into the region is supported; devices
//! consume offsets handed to them, they never run an allocator.

use super::backend::{
    data_offset, BackendHeader, BackendId, BackendKind, MemoryBackend, MIN_BACKEND_SIZE,
};
use crate::error::{Error, Result};
use rustix::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use rustix::fs::MemfdFlags;
use rustix::mm::{MapFlags, ProtFlags};
use std::os::unix::io::RawFd;
use std::ptr::NonNull;

/// A region in unified memory shared between the host and one GPU.
pub struct UnifiedBackend {
    fd: OwnedFd,
    base: NonNull<u8>,
    total_size: usize,
    url: String,
    device_index: u32,
    owner: bool,
}

impl UnifiedBackend {
    /// Create a new unified region for `device_index`.
    ///
    /// The url is used as the memfd's debug name (visible under
    /// `/proc/self/fd/`); sizes below 1 MiB are rounded up.
    pub fn create(id: BackendId, size: usize, url: &str, device_index: u32) -> Result<Self> {
        let total_size = size.max(MIN_BACKEND_SIZE);

        let name = url.trim_start_matches('/');
        let fd = rustix::fs::memfd_create(name, MemfdFlags::CLOEXEC)
            .map_err(|e| Error::BackendCreateFailed(format!("memfd_create {url}: {e}")))?;
        rustix::fs::ftruncate(&fd, total_size as u64)
            .map_err(|e| Error::BackendCreateFailed(format!("ftruncate {url}: {e}")))?;

        let base = map_shared(&fd, total_size)
            .map_err(|e| Error::BackendCreateFailed(format!("mmap {url}: {e}")))?;

        let data_size = total_size - data_offset();
        // SAFETY: fresh zeroed mapping, large enough for the header.
        unsafe {
            (*base.as_ptr().cast::<BackendHeader>()).configure(
                id,
                total_size as u64,
                data_size as u64,
            );
        }

        tracing::debug!(?id, url, device_index, total_size, "created unified backend");
        Ok(Self {
            fd,
            base,
            total_size,
            url: url.to_string(),
            device_index,
            owner: true,
        })
    }

    /// Attach to a unified region whose fd was received from the creator
    /// (e.g. over `SCM_RIGHTS`).
    ///
    /// # Safety
    ///
    /// `fd` must refer to a memfd created by [`UnifiedBackend::create`].
    pub unsafe fn from_fd(fd: OwnedFd, device_index: u32) -> Result<Self> {
        let stat = rustix::fs::fstat(&fd)
            .map_err(|e| Error::BackendAttachFailed(format!("fstat: {e}")))?;
        let total_size = stat.st_size as usize;
        if total_size < MIN_BACKEND_SIZE {
            return Err(Error::BackendAttachFailed(
                "fd does not hold an initialized region".into(),
            ));
        }

        let base = map_shared(&fd, total_size)
            .map_err(|e| Error::BackendAttachFailed(format!("mmap: {e}")))?;
        // SAFETY: the creator wrote the header at the mapping base.
        let initialized = unsafe { (*base.as_ptr().cast::<BackendHeader>()).is_initialized() };
        if !initialized {
            // SAFETY: base came from map_shared with total_size.
            unsafe {
                let _ = rustix::mm::munmap(base.as_ptr().cast(), total_size);
            }
            return Err(Error::BackendAttachFailed(
                "fd does not hold an initialized region".into(),
            ));
        }

        Ok(Self {
            fd,
            base,
            total_size,
            url: String::new(),
            device_index,
            owner: false,
        })
    }

    /// The fd to hand to a device-side external-memory import, or to
    /// another process over a Unix socket.
    #[inline]
    pub fn export_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }

    /// The raw exported fd.
    #[inline]
    pub fn export_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// The GPU this region was created for.
    #[inline]
    pub fn device_index(&self) -> u32 {
        self.device_index
    }

    /// Touch every page so neither host nor device faults later.
    pub fn prefault(&self) {
        let ptr = self.base.as_ptr();
        for off in (0..self.total_size).step_by(4096) {
            // SAFETY: off < total_size.
            unsafe {
                std::ptr::read_volatile(ptr.add(off));
            }
        }
    }
}

fn map_shared(fd: &OwnedFd, len: usize) -> std::result::Result<NonNull<u8>, rustix::io::Errno> {
    // SAFETY: len > 0 and the fd is at least len bytes.
    let ptr = unsafe {
        rustix::mm::mmap(
            std::ptr::null_mut(),
            len,
            ProtFlags::READ | ProtFlags::WRITE,
            MapFlags::SHARED,
            fd,
            0,
        )?
    };
    NonNull::new(ptr.cast::<u8>()).ok_or(rustix::io::Errno::NOMEM)
}

impl MemoryBackend for UnifiedBackend {
    fn header(&self) -> &BackendHeader {
        // SAFETY: mapping outlives self; header at base.
        unsafe { &*self.base.as_ptr().cast::<BackendHeader>() }
    }

    fn data_ptr(&self) -> NonNull<u8> {
        // SAFETY: data_offset() < total_size.
        unsafe { NonNull::new_unchecked(self.base.as_ptr().add(data_offset())) }
    }

    fn data_len(&self) -> usize {
        self.total_size - data_offset()
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Unified
    }

    fn is_owner(&self) -> bool {
        self.owner
    }

    fn url(&self) -> Option<&str> {
        if self.url.is_empty() {
            None
        } else {
            Some(&self.url)
        }
    }
}

impl Drop for UnifiedBackend {
    fn drop(&mut self) {
        // SAFETY: base came from map_shared with total_size. The kernel
        // reclaims the memfd when the last fd closes.
        unsafe {
            let _ = rustix::mm::munmap(self.base.as_ptr().cast(), self.total_size);
        }
    }
}

// SAFETY: the mapping is shared memory; coordination is done by the
// structures placed inside it.
unsafe impl Send for UnifiedBackend {}
unsafe impl Sync for UnifiedBackend {}
