//! A two-tier bucket/tree allocator: a segregated free-list subsystem for
//! small, short-lived allocations, backed by a coalescing boundary-tag
//! subsystem for everything larger. Implements `core::alloc::GlobalAlloc`
//! so it can be installed as the process-wide allocator via
//! `#[global_allocator]`.
//!
//! ```no_run
//! use heap_allocator::HeapAlloc;
//!
//! #[global_allocator]
//! static ALLOC: HeapAlloc = HeapAlloc;
//! ```

#![no_std]

mod bucket;
pub mod constants;
#[cfg(feature = "debug")]
mod debug;
pub mod options;
mod os;
mod stats;
mod tree;

use core::alloc::{GlobalAlloc, Layout};
use core::panic::Location;
use core::ptr::null_mut;

use bucket::Buckets;
use constants::DEFAULT_ALIGNMENT;
use stats::Stats;
use tree::Tree;

#[cfg(feature = "debug")]
pub use debug::HeapCorruption;

/// The allocator's full state: a bucket subsystem, a tree subsystem, and
/// (when the `debug` feature is enabled) the provenance/guard envelope.
/// Every field is const-constructible, so the process-wide instance is a
/// plain `static` with no lazy-init guard.
pub struct HeapAllocator {
    buckets: Buckets,
    tree: Tree,
    #[cfg(not(feature = "debug"))]
    stats: Stats,
    #[cfg(feature = "debug")]
    debug: debug::DebugState,
}

impl HeapAllocator {
    pub const fn new() -> Self {
        HeapAllocator {
            buckets: Buckets::new(),
            tree: Tree::new(),
            #[cfg(not(feature = "debug"))]
            stats: Stats::new(),
            #[cfg(feature = "debug")]
            debug: debug::DebugState::new(),
        }
    }

    fn stats(&self) -> &Stats {
        #[cfg(feature = "debug")]
        {
            &self.debug.stats
        }
        #[cfg(not(feature = "debug"))]
        {
            &self.stats
        }
    }

    /// Services a request for `needed` raw bytes from whichever subsystem
    /// handles that size.
    fn route_alloc(&self, needed: usize) -> *mut u8 {
        match constants::bucket_index(needed) {
            Some(idx) => self.buckets.get(idx).alloc(self.stats()),
            None => self.tree.alloc(needed, self.stats()),
        }
    }

    /// Allocates `size` bytes aligned to `DEFAULT_ALIGNMENT`.
    #[track_caller]
    pub fn allocate(&self, size: usize) -> *mut u8 {
        self.allocate_aligned(size, DEFAULT_ALIGNMENT)
    }

    /// Allocates `size` bytes aligned to `align` (a power of two).
    #[track_caller]
    pub fn allocate_aligned(&self, size: usize, align: usize) -> *mut u8 {
        if size == 0 {
            return null_mut();
        }
        assert!(
            align == 0 || align.is_power_of_two(),
            "alignment must be a power of two"
        );
        // A request for less than the default alignment still gets the
        // default; only a stricter request changes anything.
        let align = align.max(DEFAULT_ALIGNMENT);

        #[cfg(feature = "debug")]
        {
            let needed = self.debug.raw_size_for(size, align);
            let raw = self.route_alloc(needed);
            if raw.is_null() {
                return null_mut();
            }
            let source = if constants::bucket_index(needed).is_some() {
                debug::Source::Bucket
            } else {
                debug::Source::Tree
            };
            unsafe { self.debug.wrap(raw, size, align, source, Location::caller()) }
        }
        #[cfg(not(feature = "debug"))]
        {
            if align <= DEFAULT_ALIGNMENT {
                self.route_alloc(size)
            } else {
                // No envelope to carry a raw-pointer offset, so an
                // alignment stricter than the default is only satisfiable
                // by the tree subsystem's own aligned carving (the header
                // itself is repositioned so the returned pointer is a
                // genuine block payload, reclaimable by a plain
                // `BlockHeader::from_payload` on release).
                self.tree.alloc_aligned(size, align, self.stats())
            }
        }
    }

    /// Allocates `count * size` bytes, zero-filled. Fails (returns null)
    /// rather than wrapping if `count * size` would overflow — the
    /// reference allocator's own `calloc` does not check this; this one
    /// does.
    #[track_caller]
    pub fn zero_allocate(&self, count: usize, size: usize) -> *mut u8 {
        let total = match count.checked_mul(size) {
            Some(t) => t,
            None => return null_mut(),
        };
        let p = self.allocate(total);
        if !p.is_null() {
            unsafe { core::ptr::write_bytes(p, 0, total) };
        }
        p
    }

    /// Returns the usable payload size of a live pointer, in bytes: the
    /// enclosing slot or block's size minus the debug envelope's overhead,
    /// not the size originally requested (they can differ whenever the slot
    /// or block is larger than what was asked for).
    pub fn query_size(&self, ptr: *mut u8) -> usize {
        if ptr.is_null() {
            return 0;
        }
        #[cfg(feature = "debug")]
        {
            let raw = unsafe { self.debug.raw_ptr(ptr) };
            let capacity = match self.buckets.classify(raw) {
                Some((_bucket, page)) => bucket::slot_size(page),
                None => self.tree.query_size(raw),
            };
            let overhead = (ptr as usize - raw as usize) + constants::PATTERN_SIZE;
            capacity - overhead
        }
        #[cfg(not(feature = "debug"))]
        {
            match self.buckets.classify(ptr) {
                Some((_bucket, page)) => bucket::slot_size(page),
                None => self.tree.query_size(ptr),
            }
        }
    }

    /// Releases a live pointer. `NULL` is a no-op.
    pub fn release(&self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        #[cfg(feature = "debug")]
        {
            let (raw, _requested, _alignment, _check) = unsafe { self.debug.unwrap(ptr) };
            self.release_raw(raw);
        }
        #[cfg(not(feature = "debug"))]
        {
            self.release_raw(ptr);
        }
    }

    fn release_raw(&self, raw: *mut u8) {
        match self.buckets.classify(raw) {
            Some((bucket, page)) => bucket.free(page, raw, self.stats()),
            None => self.tree.free(raw, self.stats()),
        }
    }

    /// Resizes a live pointer to `new_size`, preserving
    /// `min(old_size, new_size)` bytes of content. `ptr == NULL` behaves as
    /// `allocate`; `new_size == 0` behaves as `release` and returns `NULL`.
    #[track_caller]
    pub fn reallocate(&self, ptr: *mut u8, new_size: usize) -> *mut u8 {
        self.reallocate_aligned(ptr, new_size, DEFAULT_ALIGNMENT)
    }

    #[track_caller]
    pub fn reallocate_aligned(&self, ptr: *mut u8, new_size: usize, align: usize) -> *mut u8 {
        if ptr.is_null() {
            return self.allocate_aligned(new_size, align);
        }
        if new_size == 0 {
            self.release(ptr);
            return null_mut();
        }
        assert!(
            align == 0 || align.is_power_of_two(),
            "alignment must be a power of two"
        );
        let align = align.max(DEFAULT_ALIGNMENT);

        #[cfg(feature = "debug")]
        {
            let (raw, old_requested, old_alignment, _check) = unsafe { self.debug.unwrap(ptr) };
            let bucket_match = self.buckets.classify(raw);
            let was_bucket = bucket_match.is_some();
            let new_needed = self.debug.raw_size_for(new_size, align);

            // In-place fast path: the envelope is rewritten over the same
            // raw block whenever it still fits, rather than unconditionally
            // allocating fresh and copying. This never moves `raw` itself
            // (no memmove of an already-linked `PreBuffer`), it only
            // recomputes where inside that fixed block the (possibly
            // relocated) envelope and client region land.
            let old_capacity = match bucket_match {
                Some((_, page)) => bucket::slot_size(page),
                None => self.tree.query_size(raw),
            };
            if new_needed <= old_capacity {
                let source = if was_bucket {
                    debug::Source::Bucket
                } else {
                    debug::Source::Tree
                };
                let new_client =
                    unsafe { self.debug.wrap(raw, new_size, align, source, Location::caller()) };
                if new_client != ptr {
                    unsafe {
                        core::ptr::copy(ptr, new_client, old_requested.min(new_size));
                    }
                }
                return new_client;
            }

            let new_raw = self.route_alloc(new_needed);
            if new_raw.is_null() {
                // Put the envelope back so the original allocation is not
                // silently dropped on a failed grow.
                let source = if was_bucket {
                    debug::Source::Bucket
                } else {
                    debug::Source::Tree
                };
                unsafe {
                    self.debug
                        .wrap(raw, old_requested, old_alignment, source, Location::caller());
                }
                return null_mut();
            }
            let source = if constants::bucket_index(new_needed).is_some() {
                debug::Source::Bucket
            } else {
                debug::Source::Tree
            };
            let new_client =
                unsafe { self.debug.wrap(new_raw, new_size, align, source, Location::caller()) };
            unsafe {
                core::ptr::copy_nonoverlapping(ptr, new_client, old_requested.min(new_size));
            }
            self.release_raw(raw);
            new_client
        }
        #[cfg(not(feature = "debug"))]
        {
            let was_bucket = self.buckets.classify(ptr).is_some();
            if was_bucket {
                let old_size = self.query_size(ptr);
                if align <= DEFAULT_ALIGNMENT && new_size <= old_size {
                    return ptr;
                }
                let new_ptr = self.allocate_aligned(new_size, align);
                if new_ptr.is_null() {
                    return null_mut();
                }
                unsafe {
                    core::ptr::copy_nonoverlapping(ptr, new_ptr, old_size.min(new_size));
                }
                self.release(ptr);
                new_ptr
            } else if align <= DEFAULT_ALIGNMENT {
                self.tree.realloc(ptr, new_size, self.stats())
            } else {
                self.tree.realloc_aligned(ptr, new_size, align, self.stats())
            }
        }
    }

    /// Releases every bucket page and tree superpage that is entirely
    /// free back to the OS.
    pub fn purge(&self) {
        #[cfg(feature = "debug")]
        if options::report_on_purge() {
            self.debug.report();
        }
        self.tree.purge(self.stats());
        self.buckets.purge(self.stats());
    }

    /// Verifies every live allocation's guard bytes, returning the first
    /// violation found. Only meaningful when built with the `debug`
    /// feature; otherwise always succeeds since nothing is tracked.
    #[cfg(feature = "debug")]
    pub fn self_check(&self) -> Result<(), HeapCorruption> {
        self.debug.self_check()
    }

    #[cfg(not(feature = "debug"))]
    pub fn self_check(&self) -> Result<(), ()> {
        Ok(())
    }

    /// Logs a snapshot of current allocation statistics (and, with `debug`,
    /// every live allocation's provenance) via the `log` facade.
    pub fn report(&self) {
        #[cfg(feature = "debug")]
        {
            self.debug.report();
        }
        #[cfg(not(feature = "debug"))]
        {
            log::info!(
                "heap report: {} bytes requested (peak {}), {} bytes committed (peak {}), {} live superpages",
                self.stats.requested_bytes.current(),
                self.stats.requested_bytes.peak(),
                self.stats.committed_bytes.current(),
                self.stats.committed_bytes.peak(),
                self.stats.superpages.current(),
            );
        }
    }
}

unsafe impl Sync for HeapAllocator {}

/// Process-wide singleton. Const-constructed, so there is no first-use
/// branch or lazy-init guard to race on.
static GLOBAL: HeapAllocator = HeapAllocator::new();

/// Zero-sized marker type implementing `GlobalAlloc` over the process-wide
/// singleton. Register it with `#[global_allocator]` to replace the
/// system allocator.
pub struct HeapAlloc;

unsafe impl GlobalAlloc for HeapAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        GLOBAL.allocate_aligned(layout.size(), layout.align())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        GLOBAL.release(ptr)
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        GLOBAL.reallocate_aligned(ptr, new_size, layout.align())
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        GLOBAL.zero_allocate(1, layout.size())
    }
}

#[cfg(test)]
mod tests {
    extern crate std;
    use super::*;

    #[test]
    fn small_allocate_and_release() {
        let heap = HeapAllocator::new();
        let p = heap.allocate(16);
        assert!(!p.is_null());
        assert!(heap.query_size(p) >= 16);
        heap.release(p);
        heap.purge();
    }

    #[test]
    fn zero_allocate_overflow_fails_closed() {
        let heap = HeapAllocator::new();
        let p = heap.zero_allocate(usize::MAX, 2);
        assert!(p.is_null());
    }

    #[test]
    fn bucket_to_tree_promotion_preserves_contents() {
        let heap = HeapAllocator::new();
        let p = heap.allocate(64);
        assert!(!p.is_null());
        unsafe {
            core::ptr::write_bytes(p, 0x7a, 64);
        }
        let q = heap.reallocate(p, 4096);
        assert!(!q.is_null());
        let first = unsafe { core::slice::from_raw_parts(q, 64) };
        assert!(first.iter().all(|&b| b == 0x7a));
        heap.release(q);
        heap.purge();
    }

    #[test]
    fn release_null_is_a_no_op() {
        let heap = HeapAllocator::new();
        heap.release(null_mut());
    }

    #[test]
    fn reallocate_to_zero_releases_and_returns_null() {
        let heap = HeapAllocator::new();
        let p = heap.allocate(32);
        let q = heap.reallocate(p, 0);
        assert!(q.is_null());
    }
}
