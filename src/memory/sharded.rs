//! Process- and thread-sharded allocator.
//!
//! An overlay on a backend that partitions the region so the hot path is
//! single-writer: each attaching process claims a **process block** from
//! the root bump heap, and each thread that binds a [`MemContext`] gets a
//! **thread block** inside its process's block. The only cross-process
//! atomics are the root heap and the lock-free reuse lists.
//!
//! Thread blocks start with a metadata header; allocation ranges are
//! carved strictly after it, so no allocation can ever overlap thread
//! block metadata — boundaries are computed when an extent is created
//! and the header bytes are excluded from the allocatable range.
//!
//! List heads shared between processes are popped under a mark-bit lock:
//! the popper CAS-marks the head, walks the quiescent list, then stores
//! the new head unmarked. Pushers spin while the mark is set, which is
//! what defeats ABA on these lists.

use super::alloc::{PageHeader, ShmAllocator, PAGE_HEADER_SIZE};
use super::backend::MemoryBackend;
use super::bump::{align_up, BumpHeap};
use super::pointer::{AllocatorId, AtomicOffsetPtr, OffsetPtr};
use crate::error::{Error, Result};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Maximum thread slots a process block can be configured with.
const MAX_THREAD_SLOTS: usize = 64;
/// End-of-list sentinel.
const NIL: u64 = u64::MAX;
/// Smallest block worth tracking on a free list.
const MIN_BLOCK_TOTAL: u64 = 32;

/// Sizing knobs for the sharded allocator.
#[derive(Debug, Clone, Copy)]
pub struct ShardedConfig {
    /// Bytes per process-block unit.
    pub process_unit: u64,
    /// Units per process block.
    pub process_units: u32,
    /// Thread slots per process block.
    pub thread_slots: u32,
    /// Bytes per thread-block extent.
    pub thread_unit: u64,
}

impl Default for ShardedConfig {
    fn default() -> Self {
        Self {
            process_unit: 1 << 20,
            process_units: 64,
            thread_slots: 64,
            thread_unit: 1 << 20,
        }
    }
}

/// Root header at the start of the region.
#[repr(C)]
struct ShardedRoot {
    id: AllocatorId,
    process_unit: u64,
    process_units: u32,
    thread_slots: u32,
    thread_unit: u64,
    process_count: AtomicU32,
    /// Reuse list of released process blocks.
    free_blocks: AtomicOffsetPtr,
    /// Root heap over the rest of the region.
    heap: BumpHeap,
}

/// Header at the start of every process block.
///
/// The leading `next`/`size` pair is layout-identical to [`PageHeader`],
/// so a released block can ride the same shared-list machinery.
#[repr(C)]
struct ProcessBlock {
    /// Link used while the block sits on the reuse list.
    next: u64,
    /// Total block size, header included.
    size: u64,
    /// Claim bitmap for thread slots.
    slot_bits: AtomicU64,
    /// Free list for allocations made without a bound thread.
    shared_free: AtomicOffsetPtr,
    /// Block-local heap over the interior.
    heap: BumpHeap,
    /// Active thread-block extent per slot (`u64::MAX` when unbound).
    threads: [u64; MAX_THREAD_SLOTS],
}

/// Header at the start of every thread-block extent.
#[repr(C)]
struct ThreadBlock {
    /// Single-threaded free list of blocks returned to this thread.
    free_head: u64,
    /// Heap over the extent interior, strictly past this header.
    heap: BumpHeap,
}

/// Size of the thread-block metadata that allocations must never overlap.
pub const THREAD_BLOCK_HEADER_SIZE: u64 =
    (std::mem::size_of::<ThreadBlock>() as u64).next_multiple_of(16);

/// Thread binding for allocation calls.
///
/// An unbound context routes through the process block's shared path;
/// a bound context owns a thread slot and allocates without atomics.
#[derive(Debug, Clone, Copy)]
pub struct MemContext {
    slot: Option<u32>,
}

impl MemContext {
    /// A context with no thread binding.
    #[inline]
    pub const fn unbound() -> Self {
        Self { slot: None }
    }

    /// The bound slot, if any.
    #[inline]
    pub fn slot(&self) -> Option<u32> {
        self.slot
    }
}

impl Default for MemContext {
    fn default() -> Self {
        Self::unbound()
    }
}

/// The sharded allocator handle for one process.
pub struct ShardedAllocator {
    id: AllocatorId,
    base: NonNull<u8>,
    data_size: usize,
    pblock: u64,
}

impl ShardedAllocator {
    fn root_size() -> u64 {
        align_up(std::mem::size_of::<ShardedRoot>() as u64, 16)
    }

    fn pblock_header_size() -> u64 {
        align_up(std::mem::size_of::<ProcessBlock>() as u64, 16)
    }

    /// Create the allocator in `backend` and claim this process's block.
    pub fn create(
        id: AllocatorId,
        backend: &dyn MemoryBackend,
        config: ShardedConfig,
    ) -> Result<Self> {
        assert!(config.thread_slots as usize <= MAX_THREAD_SLOTS);
        let base = backend.data_ptr();
        let data_size = backend.data_len();
        if (data_size as u64) < Self::root_size() {
            return Err(Error::OutOfMemory);
        }

        let root = ShardedRoot {
            id,
            process_unit: config.process_unit,
            process_units: config.process_units,
            thread_slots: config.thread_slots,
            thread_unit: config.thread_unit,
            process_count: AtomicU32::new(0),
            free_blocks: AtomicOffsetPtr::new(OffsetPtr::NULL),
            heap: BumpHeap::new(Self::root_size(), data_size as u64),
        };
        // SAFETY: root_size() fits (checked above).
        unsafe { std::ptr::write(base.as_ptr().cast::<ShardedRoot>(), root) };

        let mut this = Self {
            id,
            base,
            data_size,
            pblock: NIL,
        };
        this.claim_process_block()?;
        Ok(this)
    }

    /// Attach to an existing region and claim this process's block.
    pub fn attach(backend: &dyn MemoryBackend) -> Result<Self> {
        let base = backend.data_ptr();
        let data_size = backend.data_len();
        if (data_size as u64) < Self::root_size() {
            return Err(Error::BackendAttachFailed(
                "region too small for sharded allocator".into(),
            ));
        }
        // SAFETY: the creator wrote the root at the base.
        let id = unsafe { (*base.as_ptr().cast::<ShardedRoot>()).id };
        let mut this = Self {
            id,
            base,
            data_size,
            pblock: NIL,
        };
        this.claim_process_block()?;
        Ok(this)
    }

    #[inline]
    fn root(&self) -> *mut ShardedRoot {
        self.base.as_ptr().cast::<ShardedRoot>()
    }

    #[inline]
    fn pb(&self) -> *mut ProcessBlock {
        debug_assert!(self.pblock != NIL);
        // SAFETY: pblock was claimed inside the region.
        unsafe { self.base.as_ptr().add(self.pblock as usize).cast::<ProcessBlock>() }
    }

    #[inline]
    fn tb(&self, off: u64) -> *mut ThreadBlock {
        // SAFETY: thread blocks are created inside the region.
        unsafe { self.base.as_ptr().add(off as usize).cast::<ThreadBlock>() }
    }

    /// Offset of this process's block (diagnostics).
    #[inline]
    pub fn process_block_offset(&self) -> u64 {
        self.pblock
    }

    /// Offset of the context's active thread-block extent (diagnostics).
    pub fn thread_block_offset(&self, ctx: &MemContext) -> Option<u64> {
        let slot = ctx.slot? as usize;
        // SAFETY: slot < MAX_THREAD_SLOTS by construction.
        let off = unsafe { (*self.pb()).threads[slot] };
        (off != NIL).then_some(off)
    }

    fn claim_process_block(&mut self) -> Result<()> {
        let root = self.root();
        // SAFETY: root is the in-region header.
        let (unit, units, slots) = unsafe {
            (
                (*root).process_unit,
                (*root).process_units,
                (*root).thread_slots,
            )
        };
        let block_size = unit * units as u64;

        // A released block is reused before the root heap grows.
        // SAFETY: popped offsets were pushed by release paths.
        let off = unsafe {
            self.locked_pop(&(*root).free_blocks, |_| true)
                .map(|(off, _)| off)
        };
        let off = match off {
            Some(off) => off,
            None => {
                // SAFETY: root heap covers the region past the root header.
                let allocated = unsafe { (*root).heap.allocate(block_size, 16) };
                allocated.ok_or(Error::OutOfMemory)?
            }
        };

        let pb = ProcessBlock {
            next: NIL,
            size: block_size,
            slot_bits: AtomicU64::new(0),
            shared_free: AtomicOffsetPtr::new(OffsetPtr::NULL),
            heap: BumpHeap::new(off + Self::pblock_header_size(), off + block_size),
            threads: [NIL; MAX_THREAD_SLOTS],
        };
        // SAFETY: [off, off+block_size) belongs to this process now.
        unsafe {
            std::ptr::write(self.base.as_ptr().add(off as usize).cast::<ProcessBlock>(), pb);
            (*root).process_count.fetch_add(1, Ordering::AcqRel);
        }
        self.pblock = off;
        tracing::debug!(off, block_size, slots, "claimed process block");
        Ok(())
    }

    /// Bind the calling thread to a slot of this process's block.
    ///
    /// Prefer [`ShardedAllocator::scoped`], which releases the slot on
    /// drop even when unwinding.
    pub fn bind_thread(&self) -> Result<MemContext> {
        let root = self.root();
        let pb = self.pb();
        // SAFETY: root/pb are in-region headers.
        let slots = unsafe { (*root).thread_slots };
        let mask = if slots as usize >= 64 {
            u64::MAX
        } else {
            (1u64 << slots) - 1
        };

        let slot = loop {
            // SAFETY: pb is the in-region process block.
            let cur = unsafe { (*pb).slot_bits.load(Ordering::Acquire) };
            let avail = !cur & mask;
            if avail == 0 {
                return Err(Error::OutOfMemory);
            }
            let idx = avail.trailing_zeros();
            let claim = unsafe {
                (*pb).slot_bits.compare_exchange_weak(
                    cur,
                    cur | (1 << idx),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
            };
            if claim.is_ok() {
                break idx;
            }
        };

        if let Err(e) = self.new_thread_extent(slot, 0) {
            // Give the slot back rather than leaking it on exhaustion.
            // SAFETY: pb is the in-region process block.
            unsafe {
                (*pb).slot_bits.fetch_and(!(1 << slot), Ordering::AcqRel);
            }
            return Err(e);
        }
        Ok(MemContext { slot: Some(slot) })
    }

    /// Create a fresh extent for `slot`, sized for at least `need` bytes
    /// of payload. Old-extent leftovers are pushed onto the new extent's
    /// free list so expansion never leaks.
    fn new_thread_extent(&self, slot: u32, need: u64) -> Result<()> {
        let root = self.root();
        let pb = self.pb();
        // SAFETY: root is the in-region header.
        let unit = unsafe { (*root).thread_unit };
        let ext_size = align_up(unit.max(need + PAGE_HEADER_SIZE) + THREAD_BLOCK_HEADER_SIZE, 16);

        // The process block feeds extents; when it runs out, expansion
        // pulls more memory from the root bump heap.
        // SAFETY: both heaps hand out in-region ranges.
        let off = unsafe {
            (*pb).heap
                .allocate(ext_size, 16)
                .or_else(|| (*root).heap.allocate(ext_size, 16))
                .ok_or(Error::OutOfMemory)?
        };

        let old = unsafe { (*pb).threads[slot as usize] };
        let tb = ThreadBlock {
            free_head: NIL,
            heap: BumpHeap::new(off + THREAD_BLOCK_HEADER_SIZE, off + ext_size),
        };
        // SAFETY: [off, off+ext_size) belongs to this thread now.
        unsafe {
            std::ptr::write(self.tb(off), tb);
            (*pb).threads[slot as usize] = off;
        }

        if old != NIL {
            // SAFETY: the old extent belonged to this slot.
            unsafe { self.absorb_old_extent(off, old) };
        }
        tracing::trace!(slot, off, ext_size, "created thread extent");
        Ok(())
    }

    /// Move the old extent's free list and heap tail to the new extent.
    unsafe fn absorb_old_extent(&self, new_off: u64, old_off: u64) {
        // SAFETY: both extents belong to this slot; single-threaded here.
        unsafe {
            let old = self.tb(old_off);
            let new = self.tb(new_off);
            // Re-home the free list.
            let mut cur = (*old).free_head;
            while cur != NIL {
                let page = PageHeader::read(self.base, cur);
                let next = page.next;
                PageHeader::write(
                    self.base,
                    cur,
                    PageHeader {
                        next: (*new).free_head,
                        size: page.size,
                    },
                );
                (*new).free_head = cur;
                cur = next;
            }
            // The unissued tail of the old extent becomes one free block.
            let tail_off = (*old).heap.offset();
            let tail_len = (*old).heap.max().saturating_sub(tail_off);
            if tail_len >= MIN_BLOCK_TOTAL {
                // Claim it so the old heap can hand nothing else out.
                if (*old).heap.allocate(tail_len, 1).is_some() {
                    PageHeader::write(
                        self.base,
                        tail_off,
                        PageHeader {
                            next: (*new).free_head,
                            size: tail_len,
                        },
                    );
                    (*new).free_head = tail_off;
                }
            }
        }
    }

    /// Release a thread binding, returning its memory to the process
    /// block's shared free list.
    pub fn release_thread(&self, ctx: MemContext) {
        let Some(slot) = ctx.slot else { return };
        let pb = self.pb();
        // SAFETY: the slot belongs to this context until the bit clears.
        unsafe {
            let tb_off = (*pb).threads[slot as usize];
            if tb_off != NIL {
                let tb = self.tb(tb_off);
                // Hand every free block to the shared list.
                let mut cur = (*tb).free_head;
                while cur != NIL {
                    let page = PageHeader::read(self.base, cur);
                    let next = page.next;
                    self.locked_push(&(*pb).shared_free, cur, page.size);
                    cur = next;
                }
                // And the unissued heap tail.
                let tail_off = (*tb).heap.offset();
                let tail_len = (*tb).heap.max().saturating_sub(tail_off);
                if tail_len >= MIN_BLOCK_TOTAL && (*tb).heap.allocate(tail_len, 1).is_some() {
                    self.locked_push(&(*pb).shared_free, tail_off, tail_len);
                }
                (*pb).threads[slot as usize] = NIL;
            }
            (*pb).slot_bits.fetch_and(!(1 << slot), Ordering::AcqRel);
        }
        tracing::trace!(slot, "released thread slot");
    }

    /// Bind the calling thread for the duration of a scope.
    pub fn scoped(&self) -> Result<ScopedMemContext<'_>> {
        let ctx = self.bind_thread()?;
        Ok(ScopedMemContext { alloc: self, ctx })
    }

    // ---- mark-locked shared lists ----

    /// Push a block onto a shared list. Spins while a popper holds the
    /// mark lock.
    unsafe fn locked_push(&self, head: &AtomicOffsetPtr, off: u64, size: u64) {
        loop {
            let h = head.load(Ordering::Acquire);
            // The null sentinel is all-ones, so test it before the mark.
            if !h.is_null() && h.is_marked() {
                std::hint::spin_loop();
                continue;
            }
            // SAFETY: caller owns [off, off+size).
            unsafe {
                PageHeader::write(self.base, off, PageHeader { next: h.raw(), size });
            }
            if head
                .compare_exchange_weak(h, OffsetPtr::new(off), Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }

    /// Pop the first block matching `fit` from a shared list.
    ///
    /// The head is CAS-marked first; with the mark set, pushers stand off
    /// and the walk sees a quiescent list, so the interior rewrite cannot
    /// race (this is the ABA defense the mark bit exists for).
    unsafe fn locked_pop(
        &self,
        head: &AtomicOffsetPtr,
        fit: impl Fn(u64) -> bool,
    ) -> Option<(u64, u64)> {
        let locked = loop {
            let h = head.load(Ordering::Acquire);
            if h.is_null() {
                return None;
            }
            if h.is_marked() {
                std::hint::spin_loop();
                continue;
            }
            if head
                .compare_exchange_weak(h, h.mark(), Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break h;
            }
        };

        // List is quiescent; walk it like a plain slist.
        let mut prev = NIL;
        let mut cur = locked.get();
        let mut found = None;
        // SAFETY: offsets on the list were pushed by locked_push.
        unsafe {
            while cur != NIL {
                let page = PageHeader::read(self.base, cur);
                if fit(page.size) {
                    if prev == NIL {
                        head.store(OffsetPtr::new(page.next), Ordering::Release);
                    } else {
                        let mut pp = PageHeader::read(self.base, prev);
                        pp.next = page.next;
                        PageHeader::write(self.base, prev, pp);
                        head.store(locked, Ordering::Release);
                    }
                    found = Some((cur, page.size));
                    break;
                }
                prev = cur;
                cur = page.next;
            }
        }
        if found.is_none() {
            head.store(locked, Ordering::Release);
        }
        found
    }

    // ---- allocation ----

    /// Allocate under a context. Bound contexts stay inside their thread
    /// block; unbound contexts use the shared path.
    pub fn allocate_ctx(&self, ctx: &MemContext, size: usize, align: usize) -> Option<OffsetPtr> {
        let align = if align == 0 { 8 } else { align as u64 };
        let data = size.max(1) as u64;
        if align <= 16 {
            let total = align_up(data + PAGE_HEADER_SIZE, 16);
            match ctx.slot {
                Some(slot) => self.allocate_thread(slot, total),
                None => self.allocate_shared(total),
            }
            .map(OffsetPtr::new)
        } else {
            self.allocate_ctx_aligned(ctx, data, align)
        }
    }

    fn allocate_thread(&self, slot: u32, total: u64) -> Option<u64> {
        let pb = self.pb();
        // SAFETY: the slot is bound to the calling thread.
        unsafe {
            let tb_off = (*pb).threads[slot as usize];
            debug_assert!(tb_off != NIL, "context not bound");
            let tb = self.tb(tb_off);

            // First fit from this thread's free list.
            if let Some(off) = self.pop_thread_fit(tb, total) {
                return Some(off + PAGE_HEADER_SIZE);
            }
            // Then the extent's own heap.
            if let Some(off) = (*tb).heap.allocate(total, 16) {
                PageHeader::write(self.base, off, PageHeader { next: NIL, size: total });
                return Some(off + PAGE_HEADER_SIZE);
            }
            // Extent exhausted: expand and retry once.
            self.new_thread_extent(slot, total).ok()?;
            let tb = self.tb((*pb).threads[slot as usize]);
            if let Some(off) = self.pop_thread_fit(tb, total) {
                return Some(off + PAGE_HEADER_SIZE);
            }
            let off = (*tb).heap.allocate(total, 16)?;
            PageHeader::write(self.base, off, PageHeader { next: NIL, size: total });
            Some(off + PAGE_HEADER_SIZE)
        }
    }

    /// Remove the first free block with `size >= total` from a thread
    /// list (single-threaded).
    unsafe fn pop_thread_fit(&self, tb: *mut ThreadBlock, total: u64) -> Option<u64> {
        // SAFETY: the list belongs to the calling thread.
        unsafe {
            let mut prev = NIL;
            let mut cur = (*tb).free_head;
            while cur != NIL {
                let page = PageHeader::read(self.base, cur);
                if page.size >= total {
                    if prev == NIL {
                        (*tb).free_head = page.next;
                    } else {
                        let mut pp = PageHeader::read(self.base, prev);
                        pp.next = page.next;
                        PageHeader::write(self.base, prev, pp);
                    }
                    return Some(cur);
                }
                prev = cur;
                cur = page.next;
            }
            None
        }
    }

    fn allocate_shared(&self, total: u64) -> Option<u64> {
        let root = self.root();
        let pb = self.pb();
        // SAFETY: in-region headers; list ops are mark-locked.
        unsafe {
            if let Some((off, _)) = self.locked_pop(&(*pb).shared_free, |s| s >= total) {
                return Some(off + PAGE_HEADER_SIZE);
            }
            let off = (*pb)
                .heap
                .allocate(total, 16)
                .or_else(|| (*root).heap.allocate(total, 16))?;
            PageHeader::write(self.base, off, PageHeader { next: NIL, size: total });
            Some(off + PAGE_HEADER_SIZE)
        }
    }

    fn allocate_ctx_aligned(&self, ctx: &MemContext, data: u64, align: u64) -> Option<OffsetPtr> {
        debug_assert!(align.is_power_of_two());
        // Over-allocate, then re-point the header at the aligned spot.
        // Worst-case front pad is align + 16 (a pad must itself be a
        // pushable block, which can force one extra alignment step).
        let raw = self
            .allocate_ctx(ctx, (data + align + PAGE_HEADER_SIZE) as usize, 16)?
            .get();
        let block_off = raw - PAGE_HEADER_SIZE;
        // SAFETY: raw was just handed out by this allocator.
        let block = unsafe { PageHeader::read(self.base, block_off) };

        let mut aligned = align_up(raw, align);
        if aligned != raw && aligned - raw < MIN_BLOCK_TOTAL {
            aligned += align;
        }
        if aligned == raw {
            return Some(OffsetPtr::new(raw));
        }
        debug_assert!(aligned + data <= block_off + block.size);
        let pad = aligned - raw;
        // SAFETY: both headers sit inside the block we own.
        unsafe {
            PageHeader::write(
                self.base,
                aligned - PAGE_HEADER_SIZE,
                PageHeader {
                    next: NIL,
                    size: block.size - pad,
                },
            );
            // The front pad becomes an ordinary freeable block.
            PageHeader::write(self.base, block_off, PageHeader { next: NIL, size: pad });
        }
        self.free_ctx(ctx, OffsetPtr::new(block_off + PAGE_HEADER_SIZE))
            .ok()?;
        Some(OffsetPtr::new(aligned))
    }

    /// Free under a context: bound frees go to the thread's own list,
    /// unbound frees to the process block's shared list.
    pub fn free_ctx(&self, ctx: &MemContext, off: OffsetPtr) -> Result<()> {
        if off.is_null() {
            return Err(Error::InvalidFree("null pointer freed".into()));
        }
        let data_off = off.unmark().get();
        if data_off < Self::root_size() + PAGE_HEADER_SIZE || data_off >= self.data_size as u64 {
            return Err(Error::InvalidFree(format!(
                "offset {data_off} outside allocator {}",
                self.id
            )));
        }
        let block_off = data_off - PAGE_HEADER_SIZE;
        // SAFETY: bounds checked above.
        let page = unsafe { PageHeader::read(self.base, block_off) };
        if page.size < MIN_BLOCK_TOTAL || block_off + page.size > self.data_size as u64 {
            return Err(Error::InvalidFree(format!(
                "corrupt block header at offset {block_off}"
            )));
        }

        let pb = self.pb();
        match ctx.slot {
            Some(slot) => {
                // SAFETY: the slot's list belongs to the calling thread.
                unsafe {
                    let tb = self.tb((*pb).threads[slot as usize]);
                    PageHeader::write(
                        self.base,
                        block_off,
                        PageHeader {
                            next: (*tb).free_head,
                            size: page.size,
                        },
                    );
                    (*tb).free_head = block_off;
                }
            }
            None => {
                // SAFETY: shared list push is mark-locked.
                unsafe { self.locked_push(&(*pb).shared_free, block_off, page.size) };
            }
        }
        Ok(())
    }

    /// Release this process's block back for reuse by later attachers.
    fn detach(&mut self) {
        if self.pblock == NIL {
            return;
        }
        let root = self.root();
        let pb = self.pb();
        // SAFETY: the block belongs to this process until pushed.
        unsafe {
            let size = (*pb).size;
            self.locked_push_pblock(&(*root).free_blocks, self.pblock, size);
            (*root).process_count.fetch_sub(1, Ordering::AcqRel);
        }
        tracing::debug!(off = self.pblock, "released process block");
        self.pblock = NIL;
    }

    /// Push a whole process block onto the reuse list. The link lives in
    /// the process-block header rather than a page header.
    unsafe fn locked_push_pblock(&self, head: &AtomicOffsetPtr, off: u64, size: u64) {
        let pb = self.base.as_ptr().wrapping_add(off as usize).cast::<ProcessBlock>();
        loop {
            let h = head.load(Ordering::Acquire);
            if !h.is_null() && h.is_marked() {
                std::hint::spin_loop();
                continue;
            }
            // SAFETY: we still own the block.
            unsafe {
                (*pb).next = h.raw();
                (*pb).size = size;
            }
            if head
                .compare_exchange_weak(h, OffsetPtr::new(off), Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }
}

impl Drop for ShardedAllocator {
    fn drop(&mut self) {
        self.detach();
    }
}

impl ShmAllocator for ShardedAllocator {
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
        self.allocate_ctx(&MemContext::unbound(), size, align)
    }

    fn free_offset(&self, off: OffsetPtr) -> Result<()> {
        self.free_ctx(&MemContext::unbound(), off)
    }
}

// SAFETY: cross-thread state is touched only through atomics or
// mark-locked lists; thread blocks are single-writer by slot ownership.
unsafe impl Send for ShardedAllocator {}
unsafe impl Sync for ShardedAllocator {}

/// Scope guard that binds a thread slot and releases it on drop, on both
/// success and unwind paths.
pub struct ScopedMemContext<'a> {
    alloc: &'a ShardedAllocator,
    ctx: MemContext,
}

impl ScopedMemContext<'_> {
    /// The bound context.
    #[inline]
    pub fn ctx(&self) -> &MemContext {
        &self.ctx
    }

    /// Allocate through the bound context.
    pub fn allocate(&self, size: usize, align: usize) -> Option<OffsetPtr> {
        self.alloc.allocate_ctx(&self.ctx, size, align)
    }

    /// Free through the bound context.
    pub fn free(&self, off: OffsetPtr) -> Result<()> {
        self.alloc.free_ctx(&self.ctx, off)
    }
}

impl Drop for ScopedMemContext<'_> {
    fn drop(&mut self) {
        self.alloc.release_thread(self.ctx);
    }
}
