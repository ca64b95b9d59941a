//! Ring buffers over shared memory.
//!
//! Four variants, all FIFO, all indexed by 64-bit counters that never
//! wrap (`size = tail − head`, slot = `counter % capacity`):
//!
//! | Variant | Producers | Consumers | Capacity | Overflow |
//! |---|---|---|---|---|
//! | [`PreRingQueue`] | 1 | 1 | const generic | fails |
//! | [`SpscRing`] | 1 | 1 | fixed | fails |
//! | [`MpscRing`] | many | 1 | fixed | producers spin |
//! | [`ExtRing`] | 1 | 1 | elastic | grows via allocator |
//!
//! The allocator-backed variants live entirely inside a region: a handle
//! holds native pointers for this process plus the [`ShmRef`] another
//! process uses to reattach.
//!
//! [`ShmRef`]: crate::memory::ShmRef

mod ext;
mod mpsc;
mod pre;
mod spsc;

pub use ext::ExtRing;
pub use mpsc::MpscRing;
pub use pre::PreRingQueue;
pub use spsc::SpscRing;
