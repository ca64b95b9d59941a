//! # Stratum
//!
//! A shared-memory substrate and durable metadata core for distributed
//! context storage.
//!
//! Stratum provides the two load-bearing subsystems of a context store:
//!
//! - **Shared-memory substrate**: named memory regions mappable by many
//!   processes, allocators that hand out stable offsets inside those
//!   regions (bump, arena, buddy, sharded), and lock-free ring buffers
//!   built on top of them.
//! - **Durable metadata core**: an append-only write-ahead log for a
//!   tag/blob catalog, with a fixed binary record layout, torn-tail
//!   tolerant replay, and compaction via truncation.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use stratum::prelude::*;
//!
//! // A named region two processes can map.
//! let backend = ShmBackend::create(BackendId::new(0, 0), 64 << 20, "/stratum-demo")?;
//!
//! // A buddy allocator carving offsets out of the region.
//! let alloc = BuddyAllocator::create(AllocatorId::new(0, 0), &backend);
//! let ptr = alloc.allocate::<u64>(128)?;
//!
//! // Catalog mutations survive crashes through the WAL.
//! let mut wal = TransactionLog::open("/tmp/catalog.wal", 1 << 20)?;
//! wal.log(&TxnRecord::CreateTag {
//!     tag_name: "t".into(),
//!     tag: TagId::new(1, 2),
//! })?;
//! wal.sync()?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod catalog;
pub mod error;
pub mod memory;
pub mod queue;
pub mod wal;

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::catalog::Catalog;
    pub use crate::error::{Error, Result};
    pub use crate::memory::{
        AllocatorId, AllocatorRegistry, ArenaAllocator, BackendId, BuddyAllocator, FullPtr,
        HeapBackend, MemContext, MemoryBackend, OffsetPtr, ScopedMemContext, ShardedAllocator,
        ShmAllocator, ShmBackend, ShmRef, UnifiedBackend,
    };
    pub use crate::queue::{ExtRing, MpscRing, PreRingQueue, SpscRing};
    pub use crate::wal::{TagId, TransactionLog, TxnRecord};
}

pub use error::{Error, Result};
