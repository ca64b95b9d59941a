//! Shared-memory substrate.
//!
//! This module provides the memory layer that lets many processes (and a
//! GPU) address the same bytes through stable offsets.
//!
//! # Architecture
//!
//! - [`MemoryBackend`]: a named, contiguous region with a shared header
//!   and a page-aligned data area ([`HeapBackend`], [`ShmBackend`],
//!   [`UnifiedBackend`]).
//! - [`ShmAllocator`]: allocators constructed inside a backend's data
//!   area, handing out [`OffsetPtr`]s ([`ArenaAllocator`],
//!   [`BuddyAllocator`], [`ShardedAllocator`]).
//! - [`ShmRef`] / [`FullPtr`]: process-portable addressing; natives are
//!   materialized only at the point of use via the
//!   [`AllocatorRegistry`].

mod alloc;
mod arena;
mod backend;
mod buddy;
mod bump;
mod heap;
mod pointer;
mod registry;
mod sharded;
mod shm;
mod unified;

pub use alloc::{PageHeader, ShmAllocator, PAGE_HEADER_SIZE};
pub use arena::ArenaAllocator;
pub use backend::{
    data_offset, BackendHeader, BackendId, BackendKind, MemoryBackend, HEADER_ALIGNMENT,
    MIN_BACKEND_SIZE,
};
pub use buddy::BuddyAllocator;
pub use bump::BumpHeap;
pub use heap::HeapBackend;
pub use pointer::{AllocatorId, AtomicOffsetPtr, FullPtr, OffsetPtr, ShmRef};
pub use registry::AllocatorRegistry;
pub use sharded::{
    MemContext, ScopedMemContext, ShardedAllocator, ShardedConfig, THREAD_BLOCK_HEADER_SIZE,
};
pub use shm::ShmBackend;
pub use unified::UnifiedBackend;
