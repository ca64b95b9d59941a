//! Sharded allocator scenarios: several "processes" (mappings) over one
//! shm region, per-thread contexts, and the metadata-overlap invariant.

use std::sync::Arc;
use stratum::memory::{
    AllocatorId, BackendId, MemoryBackend, ShardedAllocator, ShardedConfig, ShmAllocator,
    ShmBackend, THREAD_BLOCK_HEADER_SIZE,
};

fn small_config() -> ShardedConfig {
    ShardedConfig {
        process_unit: 128 * 1024,
        process_units: 8,
        thread_slots: 16,
        thread_unit: 64 * 1024,
    }
}

// ============================================================================
// Two mappings of one region act as two processes
// ============================================================================

#[test]
fn two_attachers_get_disjoint_process_blocks() {
    let url = format!("/stratum-sharded-it-{}", std::process::id());
    let backend = ShmBackend::create(BackendId::new(30, 0), 16 << 20, &url).unwrap();
    let first =
        ShardedAllocator::create(AllocatorId::new(30, 0), &backend, small_config()).unwrap();

    let peer_backend = ShmBackend::attach(&url).unwrap();
    let second = ShardedAllocator::attach(&peer_backend).unwrap();

    let a = first.process_block_offset();
    let b = second.process_block_offset();
    let block = small_config().process_unit * small_config().process_units as u64;
    assert!(
        a + block <= b || b + block <= a,
        "process blocks overlap: {a} and {b}"
    );

    // Writes through one mapping are visible through the other.
    let p = first.allocate_offset(256, 0).unwrap();
    unsafe {
        std::ptr::write_bytes(first.base().as_ptr().add(p.get() as usize), 0x3E, 256);
        let via_second =
            std::slice::from_raw_parts(second.base().as_ptr().add(p.get() as usize), 256);
        assert!(via_second.iter().all(|&b| b == 0x3E));
    }
}

// ============================================================================
// Thread contexts: metadata never inside an allocation
// ============================================================================

/// Every allocation handed to a bound thread must exclude the thread
/// block's metadata bytes — the historical overlap bug this allocator
/// family once had.
#[test]
fn allocations_never_overlap_thread_metadata() {
    let url = format!("/stratum-sharded-meta-{}", std::process::id());
    let backend = ShmBackend::create(BackendId::new(30, 1), 16 << 20, &url).unwrap();
    let alloc =
        ShardedAllocator::create(AllocatorId::new(30, 1), &backend, small_config()).unwrap();

    let scope = alloc.scoped().unwrap();
    let mut extents = vec![alloc.thread_block_offset(scope.ctx()).unwrap()];
    let mut spans: Vec<(u64, u64)> = vec![];

    // Push through several extent expansions.
    for i in 0..120u64 {
        let size = 1024 + (i % 5) * 700;
        let p = scope.allocate(size as usize, 0).unwrap();
        spans.push((p.get(), size));
        let tb = alloc.thread_block_offset(scope.ctx()).unwrap();
        if *extents.last().unwrap() != tb {
            extents.push(tb);
        }
    }
    assert!(extents.len() > 1, "expansion never happened");

    for (off, size) in &spans {
        for tb in &extents {
            let meta = (*tb, *tb + THREAD_BLOCK_HEADER_SIZE);
            assert!(
                off + size <= meta.0 || *off >= meta.1,
                "allocation [{off}, {}) overlaps metadata [{}, {})",
                off + size,
                meta.0,
                meta.1
            );
        }
    }

    // And allocations are mutually disjoint across extents.
    spans.sort_unstable();
    for pair in spans.windows(2) {
        assert!(pair[0].0 + pair[0].1 <= pair[1].0);
    }
}

// ============================================================================
// Concurrency: one bound thread each, plus shared traffic
// ============================================================================

#[test]
fn bound_threads_allocate_without_interference() {
    let backend = Arc::new(
        ShmBackend::create(
            BackendId::new(30, 2),
            32 << 20,
            &format!("/stratum-sharded-mt-{}", std::process::id()),
        )
        .unwrap(),
    );
    let alloc = Arc::new(
        ShardedAllocator::create(AllocatorId::new(30, 2), backend.as_ref(), small_config())
            .unwrap(),
    );

    let mut handles = vec![];
    for t in 0..8u8 {
        let alloc = Arc::clone(&alloc);
        let backend = Arc::clone(&backend);
        handles.push(std::thread::spawn(move || {
            let _keep = backend;
            let scope = alloc.scoped().unwrap();
            let mut held = vec![];
            for i in 0..100usize {
                let p = scope.allocate(64 + i % 512, 0).unwrap();
                unsafe {
                    std::ptr::write_bytes(alloc.base().as_ptr().add(p.get() as usize), t, 64);
                }
                held.push(p);
            }
            // Verify our bytes survived everyone else's traffic.
            for p in &held {
                unsafe {
                    let slice =
                        std::slice::from_raw_parts(alloc.base().as_ptr().add(p.get() as usize), 64);
                    assert!(slice.iter().all(|&b| b == t));
                }
            }
            for p in held {
                scope.free(p).unwrap();
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }
}

// ============================================================================
// Detach returns the block for the next process
// ============================================================================

#[test]
fn released_blocks_recycle_across_attach_cycles() {
    let url = format!("/stratum-sharded-recycle-{}", std::process::id());
    let backend = ShmBackend::create(BackendId::new(30, 3), 8 << 20, &url).unwrap();
    // Seed the region.
    let first =
        ShardedAllocator::create(AllocatorId::new(30, 3), &backend, small_config()).unwrap();
    drop(first);

    // Far more attach/detach cycles than the root heap could feed if
    // blocks leaked on detach.
    let block = small_config().process_unit * small_config().process_units as u64;
    let cycles = (backend.data_len() as u64 / block) * 4;
    for _ in 0..cycles {
        let a = ShardedAllocator::attach(&backend).unwrap();
        let p = a.allocate_offset(512, 0).unwrap();
        a.free_offset(p).unwrap();
    }
}
