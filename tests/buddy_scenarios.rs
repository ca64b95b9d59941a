//! End-to-end buddy allocator scenarios over real backends.
//!
//! These walk the allocator through the exhaustion/recovery sequences
//! that historically exposed free-list bugs: upward searches, heap
//! rollback, split remainders, arena repopulation, and coalescence.

use stratum::memory::{
    AllocatorId, AllocatorRegistry, BackendId, BuddyAllocator, HeapBackend, OffsetPtr,
    ShmAllocator, ShmBackend, ShmRef,
};

fn drain(alloc: &BuddyAllocator, size: usize) -> Vec<OffsetPtr> {
    let mut held = vec![];
    while let Some(p) = alloc.allocate_offset(size, 0) {
        held.push(p);
    }
    held
}

unsafe fn fill(alloc: &BuddyAllocator, off: OffsetPtr, byte: u8, len: usize) {
    unsafe {
        std::ptr::write_bytes(alloc.base().as_ptr().add(off.get() as usize), byte, len);
    }
}

unsafe fn check(alloc: &BuddyAllocator, off: OffsetPtr, byte: u8, len: usize) {
    unsafe {
        let slice =
            std::slice::from_raw_parts(alloc.base().as_ptr().add(off.get() as usize), len);
        assert!(slice.iter().all(|&b| b == byte));
    }
}

// ============================================================================
// Scenario: freed-then-smaller
// ============================================================================

/// Drain a 4 MiB backend with 512 KiB blocks, free one, then ask for
/// 300 KiB: the request's own bucket is empty, so only an upward search
/// finds the freed block. The memory must be fully usable.
#[test]
fn freed_then_smaller_large_block_is_found() {
    let backend = HeapBackend::create(BackendId::new(10, 0), 4 << 20).unwrap();
    let alloc = BuddyAllocator::create(AllocatorId::new(10, 0), &backend);

    let held = drain(&alloc, 512 * 1024);
    assert!(!held.is_empty(), "backend too small to drain");

    let freed = *held.last().unwrap();
    alloc.free_offset(freed).unwrap();

    let p = alloc
        .allocate_offset(300 * 1024, 0)
        .expect("upward search must find the freed 512 KiB block");
    unsafe {
        fill(&alloc, p, 0xAB, 300 * 1024);
        check(&alloc, p, 0xAB, 300 * 1024);
    }
}

// ============================================================================
// Scenario: huge-then-small
// ============================================================================

/// Drain an 8 MiB backend with 1 MiB blocks, ask for 64 MiB (must fail
/// without corrupting the heap), free one block, then allocate 1024
/// bytes — the failure must not have consumed anything.
#[test]
fn huge_request_fails_cleanly_then_small_succeeds() {
    let backend = HeapBackend::create(BackendId::new(10, 1), 8 << 20).unwrap();
    let alloc = BuddyAllocator::create(AllocatorId::new(10, 1), &backend);

    let held = drain(&alloc, 1 << 20);
    assert!(!held.is_empty());

    assert!(alloc.allocate_offset(64 << 20, 0).is_none());

    alloc.free_offset(*held.last().unwrap()).unwrap();
    let p = alloc.allocate_offset(1024, 0).expect("allocator unusable after failed request");
    unsafe {
        fill(&alloc, p, 0xCD, 1024);
        check(&alloc, p, 0xCD, 1024);
    }
}

// ============================================================================
// Scenario: remainder-16
// ============================================================================

/// A freed block re-requested 16 bytes smaller leaves a remainder that
/// cannot hold a header. It must be discarded without writing one, and
/// the allocator must stay fully functional.
#[test]
fn sixteen_byte_remainder_never_corrupts() {
    let backend = HeapBackend::create(BackendId::new(10, 2), 16 << 20).unwrap();
    let alloc = BuddyAllocator::create(AllocatorId::new(10, 2), &backend);
    let k128 = 128 * 1024;

    let big = alloc.allocate_offset(k128 + 16, 0).unwrap();
    unsafe { fill(&alloc, big, 0xAA, k128 + 16) };
    alloc.free_offset(big).unwrap();

    let p = alloc.allocate_offset(k128, 0).unwrap();
    unsafe {
        fill(&alloc, p, 0xBB, k128);
        check(&alloc, p, 0xBB, k128);
    }
    alloc.free_offset(p).unwrap();

    let q = alloc.allocate_offset(4096, 0).unwrap();
    unsafe {
        fill(&alloc, q, 0xCC, 4096);
        check(&alloc, q, 0xCC, 4096);
    }
}

// ============================================================================
// Property: freed block reusable by any smaller request
// ============================================================================

#[test]
fn freed_block_serves_any_smaller_request() {
    let backend = HeapBackend::create(BackendId::new(10, 3), 2 << 20).unwrap();
    let alloc = BuddyAllocator::create(AllocatorId::new(10, 3), &backend);

    // Exercise a spread of block sizes across both paths.
    for size in [64usize, 1000, 16 * 1024 - 16, 40 * 1024, 700 * 1024] {
        let p = alloc.allocate_offset(size, 0).unwrap();
        alloc.free_offset(p).unwrap();
        for smaller in [size / 2, size / 3, 1.max(size / 10)] {
            let q = alloc
                .allocate_offset(smaller, 0)
                .unwrap_or_else(|| panic!("request {smaller} after freeing {size}"));
            alloc.free_offset(q).unwrap();
        }
    }
}

// ============================================================================
// Property: small-path upward search survives full exhaustion
// ============================================================================

#[test]
fn small_upward_search_after_heap_exhaustion() {
    let backend = HeapBackend::create(BackendId::new(10, 4), 4 << 20).unwrap();
    let alloc = BuddyAllocator::create(AllocatorId::new(10, 4), &backend);

    let saved = alloc.allocate_offset(512, 0).unwrap();
    unsafe { fill(&alloc, saved, 0x11, 512) };

    let held = drain(&alloc, 64);
    assert!(!held.is_empty());

    alloc.free_offset(saved).unwrap();
    let p = alloc
        .allocate_offset(64, 0)
        .expect("small upward search failed with exhausted heap");
    unsafe { fill(&alloc, p, 0x22, 64) };

    // The drained allocations are all still intact and freeable.
    for h in held {
        alloc.free_offset(h).unwrap();
    }
}

// ============================================================================
// Cross-process visibility through a shm region
// ============================================================================

/// Offsets minted by the creator resolve to the same bytes through a
/// second mapping, and the registry arbitrates which allocator may
/// resolve what.
#[test]
fn offsets_are_stable_across_attach() {
    let url = format!("/stratum-buddy-it-{}", std::process::id());
    let owner = ShmBackend::create(BackendId::new(11, 0), 8 << 20, &url).unwrap();
    let creator = BuddyAllocator::create(AllocatorId::new(11, 0), &owner);

    let p = creator.allocate_offset(4096, 0).unwrap();
    unsafe {
        std::ptr::write_bytes(creator.base().as_ptr().add(p.get() as usize), 0x5C, 4096);
    }

    // Second mapping stands in for a peer process.
    let peer_backend = ShmBackend::attach(&url).unwrap();
    let peer = BuddyAllocator::attach(&peer_backend);
    assert_eq!(peer.id(), AllocatorId::new(11, 0));

    let registry = AllocatorRegistry::new();
    registry.register(&peer);
    let addr = registry.resolve(ShmRef::new(peer.id(), p)).unwrap();
    unsafe {
        let slice = std::slice::from_raw_parts(addr.as_ptr(), 4096);
        assert!(slice.iter().all(|&b| b == 0x5C));
    }

    // Foreign ids stay unresolvable.
    assert!(registry
        .resolve(ShmRef::new(AllocatorId::new(99, 0), p))
        .is_err());
}

// ============================================================================
// Full-region recovery through coalescence
// ============================================================================

#[test]
fn free_everything_then_allocate_big() {
    let backend = HeapBackend::create(BackendId::new(10, 5), 4 << 20).unwrap();
    let alloc = BuddyAllocator::create(AllocatorId::new(10, 5), &backend);

    let held = drain(&alloc, 256 * 1024);
    let count = held.len();
    assert!(count >= 8);
    for p in held {
        alloc.free_offset(p).unwrap();
    }

    // Nothing but merged adjacent blocks can satisfy this.
    let big = (count - 1) * 256 * 1024;
    assert!(
        alloc.allocate_offset(big, 0).is_some(),
        "coalescence could not recover {big} contiguous bytes"
    );
}
