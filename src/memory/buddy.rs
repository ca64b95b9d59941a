//! Buddy allocator with small/large split free lists.
//!
//! The allocator's header lives at the start of the region's data area
//! and holds the free-list heads plus a bump-heap reservoir covering the
//! rest of the region. Every block carries a 16-byte [`PageHeader`]
//! immediately before its data; `size` in that header is the total block
//! size including the header, and is what `free` trusts.
//!
//! Requests whose data fits in `16 KiB − 16` take the **small path**:
//! sizes round to a power-of-two total and land in one of ten exact-size
//! lists (32 B…16 KiB). Larger requests take the **large path**: exact
//! sizes, seven log₂-bucketed lists, with coalescence run only when a
//! large allocation would otherwise fail.
//!
//! The allocator is single-threaded: share it across threads behind a
//! lock if needed. Offsets it returns are stable across processes.

use super::alloc::{PageHeader, ShmAllocator, PAGE_HEADER_SIZE};
use super::backend::MemoryBackend;
use super::bump::{align_up, BumpHeap};
use super::pointer::{AllocatorId, OffsetPtr};
use crate::error::{Error, Result};
use std::ptr::NonNull;

/// Number of small free lists (power-of-two totals 32 B…16 KiB).
const NUM_SMALL_LISTS: usize = 10;
/// Number of large free lists (32 KiB buckets upward; the last bucket
/// holds everything from 2 MiB up).
const NUM_LARGE_LISTS: usize = 7;
/// log2 of the smallest block total (32 bytes).
const SMALL_MIN_SHIFT: u32 = 5;
/// Largest small-path block total.
const SMALL_MAX_TOTAL: u64 = 1 << 14;
/// log2 of the smallest large bucket (32 KiB).
const LARGE_BASE_SHIFT: u32 = 15;
/// Largest data size served by the small path.
pub(crate) const SMALL_MAX_DATA: u64 = SMALL_MAX_TOTAL - PAGE_HEADER_SIZE;
/// Bytes carved from a large page when the small lists run dry.
const SMALL_ARENA_SIZE: u64 = 64 * 1024;
/// Smallest representable block: header plus 16 data bytes.
const MIN_BLOCK_TOTAL: u64 = 32;
/// End-of-list sentinel.
const NIL: u64 = u64::MAX;

/// The shared header at the start of the allocator's region.
#[repr(C)]
struct BuddyHeader {
    id: AllocatorId,
    page_header_size: u64,
    small_heads: [u64; NUM_SMALL_LISTS],
    large_heads: [u64; NUM_LARGE_LISTS],
    heap: BumpHeap,
}

/// Buddy allocator over a backend's data area.
pub struct BuddyAllocator {
    id: AllocatorId,
    base: NonNull<u8>,
    data_size: usize,
    /// False when the region cannot even hold the header; every
    /// allocation then returns null and no region byte is written.
    usable: bool,
}

impl BuddyAllocator {
    /// Byte offset of the reservoir, past the in-region header.
    fn heap_start() -> u64 {
        align_up(std::mem::size_of::<BuddyHeader>() as u64, 16)
    }

    /// Create the allocator inside `backend`, initializing its header.
    pub fn create(id: AllocatorId, backend: &dyn MemoryBackend) -> Self {
        Self::create_at(id, backend.data_ptr(), backend.data_len())
    }

    /// Create the allocator over an explicit range, e.g. a sub-range of a
    /// backend shared with other structures.
    ///
    /// A range too small to hold the allocator header yields an inert
    /// allocator: every allocation returns null and no byte of the range
    /// is written.
    pub fn create_at(id: AllocatorId, base: NonNull<u8>, data_size: usize) -> Self {
        let start = Self::heap_start();
        if (data_size as u64) < start {
            // Too small to even hold the header: stay inert.
            return Self {
                id,
                base,
                data_size,
                usable: false,
            };
        }

        let header = BuddyHeader {
            id,
            page_header_size: PAGE_HEADER_SIZE,
            small_heads: [NIL; NUM_SMALL_LISTS],
            large_heads: [NIL; NUM_LARGE_LISTS],
            heap: BumpHeap::new(start, data_size as u64),
        };
        // SAFETY: the header fits below `start`, which is inside the
        // data area.
        unsafe { std::ptr::write(base.as_ptr().cast::<BuddyHeader>(), header) };

        Self {
            id,
            base,
            data_size,
            usable: true,
        }
    }

    /// Re-derive the allocator from a region another process initialized.
    /// The header is read, never reinitialized.
    pub fn attach(backend: &dyn MemoryBackend) -> Self {
        let base = backend.data_ptr();
        let data_size = backend.data_len();
        if (data_size as u64) < Self::heap_start() {
            return Self {
                id: AllocatorId::NULL,
                base,
                data_size,
                usable: false,
            };
        }
        // SAFETY: an initialized region holds the header at the base.
        let id = unsafe { (*base.as_ptr().cast::<BuddyHeader>()).id };
        Self {
            id,
            base,
            data_size,
            usable: true,
        }
    }

    /// Bytes left in the bump-heap reservoir.
    pub fn heap_remaining(&self) -> u64 {
        if !self.usable {
            return 0;
        }
        // SAFETY: usable implies the header exists.
        unsafe { (*self.hdr()).heap.remaining() }
    }

    #[inline]
    fn hdr(&self) -> *mut BuddyHeader {
        self.base.as_ptr().cast::<BuddyHeader>()
    }

    // ---- free-list index arithmetic ----

    /// Small list index for a power-of-two total.
    #[inline]
    fn small_idx(total: u64) -> usize {
        debug_assert!(total.is_power_of_two());
        (total.trailing_zeros() - SMALL_MIN_SHIFT) as usize
    }

    /// Large list index for an arbitrary total.
    #[inline]
    fn large_idx(total: u64) -> usize {
        let log2 = 63 - total.leading_zeros();
        (log2 as i32 - LARGE_BASE_SHIFT as i32).clamp(0, NUM_LARGE_LISTS as i32 - 1) as usize
    }

    /// Round a small-path data size to its power-of-two block total.
    #[inline]
    fn small_total(data: u64) -> u64 {
        (data + PAGE_HEADER_SIZE)
            .next_power_of_two()
            .max(MIN_BLOCK_TOTAL)
    }

    // ---- raw list manipulation ----

    unsafe fn push_block(&self, off: u64, size: u64) {
        debug_assert!(size >= MIN_BLOCK_TOTAL);
        debug_assert!(off + size <= self.data_size as u64);
        let hdr = self.hdr();
        let slot: *mut u64 = if size <= SMALL_MAX_TOTAL && size.is_power_of_two() {
            // SAFETY: hdr points at the in-region header.
            unsafe { &raw mut (*hdr).small_heads[Self::small_idx(size)] }
        } else {
            unsafe { &raw mut (*hdr).large_heads[Self::large_idx(size)] }
        };
        // SAFETY: off+16 is in-region (asserted above).
        unsafe {
            let next = *slot;
            PageHeader::write(self.base, off, PageHeader { next, size });
            *slot = off;
        }
    }

    unsafe fn pop_small(&self, idx: usize) -> Option<u64> {
        let hdr = self.hdr();
        // SAFETY: hdr is the in-region header.
        unsafe {
            let slot = &raw mut (*hdr).small_heads[idx];
            let head = *slot;
            if head == NIL {
                return None;
            }
            let page = PageHeader::read(self.base, head);
            *slot = page.next;
            Some(head)
        }
    }

    /// Remove the first block with `size >= total` from large list `idx`.
    unsafe fn remove_large_fit(&self, idx: usize, total: u64) -> Option<(u64, u64)> {
        let hdr = self.hdr();
        // SAFETY: walking offsets previously pushed by push_block.
        unsafe {
            let slot = &raw mut (*hdr).large_heads[idx];
            let mut prev = NIL;
            let mut cur = *slot;
            while cur != NIL {
                let page = PageHeader::read(self.base, cur);
                if page.size >= total {
                    if prev == NIL {
                        *slot = page.next;
                    } else {
                        let mut pp = PageHeader::read(self.base, prev);
                        pp.next = page.next;
                        PageHeader::write(self.base, prev, pp);
                    }
                    return Some((cur, page.size));
                }
                prev = cur;
                cur = page.next;
            }
            None
        }
    }

    /// Return an arbitrary region to the free lists, or drop it silently
    /// when it cannot hold a valid block. A remainder of 16 bytes or less
    /// must never be written as a header.
    unsafe fn add_remainder(&self, off: u64, len: u64) {
        if len < MIN_BLOCK_TOTAL {
            if len > 0 {
                tracing::trace!(off, len, "discarding sub-minimum remainder");
            }
            return;
        }
        // SAFETY: caller hands a region inside the reservoir.
        unsafe { self.push_block(off, len) };
    }

    // ---- small path ----

    fn allocate_small(&self, data: u64) -> Option<u64> {
        let total = Self::small_total(data);
        let idx = Self::small_idx(total);

        // Upward scan: the first non-empty bucket at or above the class.
        if let Some(off) = self.scan_small_upward(idx, total) {
            return Some(off);
        }
        // Repopulate from a large page, then scan upward again.
        if self.repopulate_small(total) {
            if let Some(off) = self.scan_small_upward(idx, total) {
                return Some(off);
            }
        }
        // Bump-heap reservoir; a failure here never advances the heap.
        // SAFETY: usable implies the header exists.
        let heap_off = unsafe { (*self.hdr()).heap.allocate(total, 16) };
        if let Some(off) = heap_off {
            // SAFETY: the heap handed us [off, off+total).
            unsafe {
                PageHeader::write(self.base, off, PageHeader { next: NIL, size: total });
            }
            return Some(off + PAGE_HEADER_SIZE);
        }
        // Last resort: carve exactly from any large free block, so a free
        // block of size S stays reachable for every request <= S - 16
        // regardless of bucket arithmetic.
        self.carve_from_large(total)
    }

    fn scan_small_upward(&self, idx: usize, total: u64) -> Option<u64> {
        for j in idx..NUM_SMALL_LISTS {
            // SAFETY: list heads are maintained by push/pop.
            if let Some(off) = unsafe { self.pop_small(j) } {
                return Some(self.finish_small(off, j, total));
            }
        }
        None
    }

    /// Split a block of total `2^(j+5)` down to `total`, pushing the
    /// buddy halves back. The decomposition is exact, so nothing leaks.
    fn finish_small(&self, off: u64, j: usize, total: u64) -> u64 {
        let from = total.trailing_zeros();
        let to = j as u32 + SMALL_MIN_SHIFT;
        // SAFETY: the popped block spans [off, off + 2^to).
        unsafe {
            for k in from..to {
                self.push_block(off + (1 << k), 1 << k);
            }
            PageHeader::write(self.base, off, PageHeader { next: NIL, size: total });
        }
        off + PAGE_HEADER_SIZE
    }

    /// Carve a small arena from a large free page and chop it into blocks
    /// of `class_total`. Every unused byte of the page goes back to a
    /// free list.
    fn repopulate_small(&self, class_total: u64) -> bool {
        let found = (0..NUM_LARGE_LISTS)
            // SAFETY: list heads are maintained by push/remove.
            .find_map(|j| unsafe { self.remove_large_fit(j, class_total) });
        let Some((off, size)) = found else {
            return false;
        };

        let arena_len = size.min(SMALL_ARENA_SIZE);
        let chunks = arena_len / class_total;
        debug_assert!(chunks >= 1);
        // SAFETY: [off, off+size) was a free block we now own.
        unsafe {
            for i in 0..chunks {
                self.push_block(off + i * class_total, class_total);
            }
            let used = chunks * class_total;
            self.add_remainder(off + used, size - used);
        }
        tracing::trace!(off, size, class_total, chunks, "repopulated small arena");
        true
    }

    // ---- large path ----

    fn allocate_large(&self, data: u64) -> Option<u64> {
        let total = align_up(data + PAGE_HEADER_SIZE, 16);

        if let Some(off) = self.carve_from_large(total) {
            return Some(off);
        }
        // Merge adjacent free blocks, then look once more.
        self.coalesce();
        if let Some(off) = self.carve_from_large(total) {
            return Some(off);
        }
        // SAFETY: usable implies the header exists.
        let heap_off = unsafe { (*self.hdr()).heap.allocate(total, 16) };
        if let Some(off) = heap_off {
            // SAFETY: the heap handed us [off, off+total).
            unsafe {
                PageHeader::write(self.base, off, PageHeader { next: NIL, size: total });
            }
            return Some(off + PAGE_HEADER_SIZE);
        }
        None
    }

    /// Upward scan over the large lists for a block with `size >= total`;
    /// split off the tail remainder when it can hold a block of its own.
    fn carve_from_large(&self, total: u64) -> Option<u64> {
        let idx = Self::large_idx(total);
        for j in idx..NUM_LARGE_LISTS {
            // SAFETY: list heads are maintained by push/remove.
            if let Some((off, size)) = unsafe { self.remove_large_fit(j, total) } {
                let kept = if size - total >= MIN_BLOCK_TOTAL {
                    // SAFETY: the tail lies inside the block we own.
                    unsafe { self.add_remainder(off + total, size - total) };
                    total
                } else {
                    // Sub-minimum remainder: the slack stays inside the
                    // allocated block and comes back whole on free.
                    size
                };
                // SAFETY: front of the block we own.
                unsafe {
                    PageHeader::write(self.base, off, PageHeader { next: NIL, size: kept });
                }
                return Some(off + PAGE_HEADER_SIZE);
            }
        }
        None
    }

    /// Merge adjacent free blocks and rebuild every list.
    ///
    /// Free blocks all come from one contiguous reservoir, so adjacency
    /// (offset + size == next offset) is proof of mergeability. Blocks
    /// are gathered into an offset-sorted vector rather than any linked
    /// structure so the pass is rebuildable across attaches.
    fn coalesce(&self) {
        let hdr = self.hdr();
        let mut blocks: Vec<(u64, u64)> = Vec::new();
        // SAFETY: draining lists this allocator maintains.
        unsafe {
            for idx in 0..NUM_SMALL_LISTS {
                let mut cur = (*hdr).small_heads[idx];
                while cur != NIL {
                    let page = PageHeader::read(self.base, cur);
                    blocks.push((cur, page.size));
                    cur = page.next;
                }
                (*hdr).small_heads[idx] = NIL;
            }
            for idx in 0..NUM_LARGE_LISTS {
                let mut cur = (*hdr).large_heads[idx];
                while cur != NIL {
                    let page = PageHeader::read(self.base, cur);
                    blocks.push((cur, page.size));
                    cur = page.next;
                }
                (*hdr).large_heads[idx] = NIL;
            }
        }

        blocks.sort_unstable();
        let before = blocks.len();
        let mut merged: Vec<(u64, u64)> = Vec::with_capacity(blocks.len());
        for (off, size) in blocks {
            match merged.last_mut() {
                Some((m_off, m_size)) if *m_off + *m_size == off => *m_size += size,
                _ => merged.push((off, size)),
            }
        }
        tracing::debug!(before, after = merged.len(), "coalesced free lists");

        for (off, size) in merged {
            // SAFETY: each entry was a free block; merging preserved that.
            unsafe { self.push_block(off, size) };
        }
    }
}

impl ShmAllocator for BuddyAllocator {
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
        if !self.usable {
            return None;
        }
        let data = size.max(1) as u64;
        let align = if align == 0 { 8 } else { align as u64 };
        if align <= 16 {
            // Block data is always 16-aligned.
            if data <= SMALL_MAX_DATA {
                self.allocate_small(data).map(OffsetPtr::new)
            } else {
                self.allocate_large(data).map(OffsetPtr::new)
            }
        } else {
            self.allocate_aligned(data, align).map(OffsetPtr::new)
        }
    }

    fn free_offset(&self, off: OffsetPtr) -> Result<()> {
        if off.is_null() {
            return Err(Error::InvalidFree("null pointer freed".into()));
        }
        if !self.usable {
            return Err(Error::InvalidFree("allocator region is inert".into()));
        }
        let data_off = off.unmark().get();
        let min = Self::heap_start() + PAGE_HEADER_SIZE;
        if data_off < min || data_off >= self.data_size as u64 {
            return Err(Error::InvalidFree(format!(
                "offset {data_off} outside allocator {}",
                self.id
            )));
        }
        let block_off = data_off - PAGE_HEADER_SIZE;
        // SAFETY: block_off+16 is in-region (checked above).
        let page = unsafe { PageHeader::read(self.base, block_off) };
        if page.size < MIN_BLOCK_TOTAL || block_off + page.size > self.data_size as u64 {
            return Err(Error::InvalidFree(format!(
                "corrupt block header at offset {block_off}"
            )));
        }
        // SAFETY: the block was handed out by this allocator.
        unsafe { self.push_block(block_off, page.size) };
        Ok(())
    }
}

impl BuddyAllocator {
    /// Allocation with alignment above the native 16 bytes: over-allocate
    /// and re-point the header at the aligned position, returning the
    /// front pad to the free lists.
    fn allocate_aligned(&self, data: u64, align: u64) -> Option<u64> {
        debug_assert!(align.is_power_of_two());
        // Worst-case front pad is align + 16: the pad must itself be a
        // pushable block, which can force one extra alignment step.
        let padded = data + align + PAGE_HEADER_SIZE;
        let raw = if padded <= SMALL_MAX_DATA {
            self.allocate_small(padded)?
        } else {
            self.allocate_large(padded)?
        };
        let block_off = raw - PAGE_HEADER_SIZE;
        // SAFETY: raw was just returned by this allocator.
        let block = unsafe { PageHeader::read(self.base, block_off) };

        let mut aligned = align_up(raw, align);
        if aligned != raw && aligned - raw < MIN_BLOCK_TOTAL {
            // The pad must itself be a pushable block, or nothing.
            aligned += align;
        }
        if aligned == raw {
            return Some(raw);
        }
        debug_assert!(aligned + data <= block_off + block.size);

        let pad = aligned - raw;
        // SAFETY: both headers lie inside the block we own.
        unsafe {
            PageHeader::write(
                self.base,
                aligned - PAGE_HEADER_SIZE,
                PageHeader {
                    next: NIL,
                    size: block.size - pad,
                },
            );
            self.push_block(block_off, pad);
        }
        Some(aligned)
    }
}

// SAFETY: the handle can move between threads; the region it points to
// is shared memory. The type is deliberately not Sync: the free lists
// are single-writer.
unsafe impl Send for BuddyAllocator {}
