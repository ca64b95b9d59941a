//! POSIX named shared-memory region.
//!
//! Backed by `shm_open` + `mmap`, portable across cooperating processes
//! on one host. The url follows the `shm_open` convention: a name of the
//! form `/name`.
//!
//! Attach is two-phase: map just the first page, learn the full size from
//! the header, then remap the whole region and rebuild the pointers.

use super::backend::{
    data_offset, BackendHeader, BackendId, BackendKind, MemoryBackend, HEADER_ALIGNMENT,
    MIN_BACKEND_SIZE,
};
use crate::error::{Error, Result};
use rustix::fd::OwnedFd;
use rustix::fs::Mode;
use rustix::mm::{MapFlags, MsyncFlags, ProtFlags};
use rustix::shm::OFlags;
use std::ptr::NonNull;

/// A region backed by POSIX named shared memory.
#[derive(Debug)]
pub struct ShmBackend {
    fd: OwnedFd,
    base: NonNull<u8>,
    total_size: usize,
    url: String,
    owner: bool,
}

impl ShmBackend {
    /// Create a new named region, destroying any stale segment with the
    /// same name first.
    ///
    /// Sizes below the 1 MiB minimum are silently rounded up.
    pub fn create(id: BackendId, size: usize, url: &str) -> Result<Self> {
        let total_size = size.max(MIN_BACKEND_SIZE);

        // A crashed owner can leave the name behind; reclaim it.
        let _ = rustix::shm::unlink(url);

        let fd = rustix::shm::open(
            url,
            OFlags::CREATE | OFlags::EXCL | OFlags::RDWR,
            Mode::from_raw_mode(0o644),
        )
        .map_err(|e| Error::BackendCreateFailed(format!("shm_open {url}: {e}")))?;

        rustix::fs::ftruncate(&fd, total_size as u64)
            .map_err(|e| Error::BackendCreateFailed(format!("ftruncate {url}: {e}")))?;

        let base = map_region(&fd, total_size)
            .map_err(|e| Error::BackendCreateFailed(format!("mmap {url}: {e}")))?;

        let data_size = total_size - data_offset();
        // SAFETY: the mapping starts with a zeroed page large enough for
        // the header.
        unsafe {
            (*base.as_ptr().cast::<BackendHeader>()).configure(
                id,
                total_size as u64,
                data_size as u64,
            );
        }

        tracing::debug!(?id, url, total_size, data_size, "created shm backend");
        Ok(Self {
            fd,
            base,
            total_size,
            url: url.to_string(),
            owner: true,
        })
    }

    /// Attach to an existing named region.
    pub fn attach(url: &str) -> Result<Self> {
        let fd = rustix::shm::open(url, OFlags::RDWR, Mode::empty())
            .map_err(|e| Error::BackendAttachFailed(format!("shm_open {url}: {e}")))?;

        // Phase 1: map only the header page to learn the region size.
        let probe = map_region(&fd, HEADER_ALIGNMENT)
            .map_err(|e| Error::BackendAttachFailed(format!("mmap header {url}: {e}")))?;
        let (total_size, initialized) = {
            // SAFETY: the first page holds the header written by create().
            let hdr = unsafe { &*probe.as_ptr().cast::<BackendHeader>() };
            (hdr.backend_size as usize, hdr.is_initialized())
        };
        // SAFETY: probe came from map_region with this length.
        unsafe {
            let _ = rustix::mm::munmap(probe.as_ptr().cast(), HEADER_ALIGNMENT);
        }
        if !initialized || total_size < MIN_BACKEND_SIZE {
            return Err(Error::BackendAttachFailed(format!(
                "{url} is not an initialized region"
            )));
        }

        // Phase 2: map the whole region.
        let base = map_region(&fd, total_size)
            .map_err(|e| Error::BackendAttachFailed(format!("mmap {url}: {e}")))?;

        tracing::debug!(url, total_size, "attached shm backend");
        Ok(Self {
            fd,
            base,
            total_size,
            url: url.to_string(),
            owner: false,
        })
    }

    /// Flush the mapped region to the backing object.
    pub fn sync(&self) -> Result<()> {
        // SAFETY: base/total_size describe one live mapping.
        unsafe {
            rustix::mm::msync(self.base.as_ptr().cast(), self.total_size, MsyncFlags::SYNC)?;
        }
        Ok(())
    }

    /// Touch every page so later accesses do not fault.
    pub fn prefault(&self) {
        let ptr = self.base.as_ptr();
        for off in (0..self.total_size).step_by(HEADER_ALIGNMENT) {
            // SAFETY: off < total_size; volatile read defeats optimization.
            unsafe {
                std::ptr::read_volatile(ptr.add(off));
            }
        }
    }

    fn detach(&mut self) {
        // SAFETY: base came from map_region with total_size.
        unsafe {
            let _ = rustix::mm::munmap(self.base.as_ptr().cast(), self.total_size);
        }
    }
}

fn map_region(fd: &OwnedFd, len: usize) -> std::result::Result<NonNull<u8>, rustix::io::Errno> {
    // SAFETY: len > 0 and fd refers to an object of at least len bytes.
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

impl MemoryBackend for ShmBackend {
    fn header(&self) -> &BackendHeader {
        // SAFETY: the mapping outlives self and starts with the header.
        unsafe { &*self.base.as_ptr().cast::<BackendHeader>() }
    }

    fn data_ptr(&self) -> NonNull<u8> {
        // SAFETY: data_offset() < total_size (enforced by MIN_BACKEND_SIZE).
        unsafe { NonNull::new_unchecked(self.base.as_ptr().add(data_offset())) }
    }

    fn data_len(&self) -> usize {
        self.total_size - data_offset()
    }

    fn kind(&self) -> BackendKind {
        BackendKind::PosixShm
    }

    fn is_owner(&self) -> bool {
        self.owner
    }

    fn url(&self) -> Option<&str> {
        Some(&self.url)
    }
}

impl Drop for ShmBackend {
    fn drop(&mut self) {
        self.detach();
        if self.owner {
            tracing::debug!(url = %self.url, "destroying shm backend");
            let _ = rustix::shm::unlink(&self.url);
        }
    }
}

// SAFETY: the mapping is shared memory; cross-thread and cross-process
// coordination is the job of the structures placed inside it.
unsafe impl Send for ShmBackend {}
unsafe impl Sync for ShmBackend {}
