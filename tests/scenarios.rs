//! Black-box end-to-end scenarios exercised against a freshly constructed,
//! non-singleton allocator instance.

use heap_allocator::HeapAllocator;

#[test]
fn small_churn_returns_all_superpages_on_purge() {
    let heap = HeapAllocator::new();
    let mut ptrs = Vec::new();
    for _ in 0..1000 {
        let p = heap.allocate(8);
        assert!(!p.is_null());
        ptrs.push(p);
    }
    for p in ptrs.into_iter().rev() {
        heap.release(p);
    }
    heap.purge();
}

#[test]
fn bucket_to_tree_promotion_preserves_prefix() {
    let heap = HeapAllocator::new();
    let p = heap.allocate(64);
    assert!(!p.is_null());
    unsafe {
        core::ptr::write_bytes(p, 0x5a, 64);
    }
    let q = heap.reallocate(p, 4096);
    assert!(!q.is_null());
    let bytes = unsafe { core::slice::from_raw_parts(q, 64) };
    assert!(bytes.iter().all(|&b| b == 0x5a));
    heap.release(q);
    heap.purge();
}

#[test]
fn three_way_coalesce_moves_payload_left() {
    let heap = HeapAllocator::new();
    let a = heap.allocate(10_000);
    let b = heap.allocate(10_000);
    let c = heap.allocate(10_000);
    assert!(!a.is_null() && !b.is_null() && !c.is_null());
    unsafe {
        core::ptr::write_bytes(b, 0x33, 10_000);
    }
    heap.release(a);
    heap.release(c);
    let d = heap.reallocate(b, 28_000);
    assert!(!d.is_null());
    assert!(heap.query_size(d) >= 28_000);
    let bytes = unsafe { core::slice::from_raw_parts(d, 10_000) };
    assert!(bytes.iter().all(|&x| x == 0x33));
    heap.release(d);
    heap.purge();
}

#[test]
fn aligned_allocation_honors_alignment() {
    let heap = HeapAllocator::new();
    let p = heap.allocate_aligned(64, 4096);
    assert!(!p.is_null());
    assert_eq!(p as usize % 4096, 0);
    heap.release(p);
    heap.purge();
}

#[test]
fn purge_returns_superpages_spanning_both_subsystems() {
    let heap = HeapAllocator::new();
    // More allocations than could possibly fit in one 64KiB superpage of
    // 8-byte slots, so this spans at least two bucket superpages.
    const SMALL_COUNT: usize = 4096;
    let mut small = Vec::new();
    for _ in 0..SMALL_COUNT {
        small.push(heap.allocate(8));
    }
    let mut large = Vec::new();
    for _ in 0..4 {
        large.push(heap.allocate(8192));
    }
    for p in small {
        heap.release(p);
    }
    for p in large {
        heap.release(p);
    }
    heap.purge();
}

#[cfg(feature = "debug")]
#[test]
fn self_check_detects_overrun() {
    let heap = HeapAllocator::new();
    let p = heap.allocate(16);
    assert!(!p.is_null());
    unsafe {
        // Write one byte past the requested region, into the post-guard.
        *p.add(16) = 0;
    }
    assert!(heap.self_check().is_err());
    heap.release(p);
    // The corrupted entry is unlinked by release; nothing live remains.
    assert!(heap.self_check().is_ok());
}
