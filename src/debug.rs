//! Debug envelope: per-allocation provenance plus guard-byte overrun
//! detection.
//!
//! Compiled in only when the `debug` feature is enabled (the crate's
//! default, mirroring the reference allocator's own `#ifdef
//! DEBUG_ALLOCATOR`). Every client region is wrapped as:
//!
//! ```text
//! [ BlockInfo | PreBuffer (ends in PATTERN_SIZE pre-guard bytes) ] [ client bytes ] [ PATTERN_SIZE post-guard bytes ]
//!               ^-- pointer returned to the caller points here --^
//! ```
//!
//! `BlockInfo` lets the dispatcher recover the true start of the raw block
//! (as handed back by the bucket or tree subsystem) from the client
//! pointer, even when alignment padding was inserted ahead of it.

use core::mem::size_of;
use core::panic::Location;
use core::ptr::null_mut;

use intrusive_collections::{intrusive_adapter, LinkedList, LinkedListLink};
use log::error;
use spin::Mutex;

use crate::constants::{PATTERN_SIZE, POST_PATTERN, PRE_PATTERN};
use crate::stats::Stats;

/// Which subsystem produced the raw block this envelope wraps. Recorded
/// only for `report()`'s benefit — the dispatcher re-derives ownership
/// independently (via `ptr_in_bucket`) when it needs to route a free.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Bucket,
    Tree,
}

/// A single corruption finding from `self_check`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapCorruption {
    /// The bytes immediately before a live client region were overwritten.
    PreGuardOverwritten,
    /// The bytes immediately after a live client region were overwritten.
    PostGuardOverwritten,
}

/// `{ actual_size, pointer_offset }`, written immediately before each
/// allocation's `PreBuffer`. `pointer_offset` is how far back from this
/// struct the raw block pointer (the one the bucket/tree subsystem must be
/// given back on free) actually starts — nonzero only when alignment
/// padding was inserted ahead of the envelope.
///
/// The reference allocator bit-packs this as `{ actual_size: 24,
/// pointer_offset: 8 }`, capping padding at 255 bytes. That cap is too
/// narrow here: a page-aligned request (`allocate(n, 4096)`) can need up to
/// an alignment's worth of padding, far past 255 bytes. Both fields are
/// kept as plain `usize`s instead — the portable substitution the design
/// notes call out for the source's other pointer-bits trick applies
/// equally well to this one.
#[repr(C)]
struct BlockInfo {
    actual_size: usize,
    pointer_offset: usize,
}

impl BlockInfo {
    fn pack(actual_size: usize, pointer_offset: usize) -> Self {
        BlockInfo {
            actual_size,
            pointer_offset,
        }
    }

    fn pointer_offset(&self) -> usize {
        self.pointer_offset
    }
}

#[repr(C)]
struct PreBuffer {
    link: LinkedListLink,
    requested_size: usize,
    alignment: usize,
    source: Source,
    source_line: u32,
    // `Location::file()` already hands back a `'static str` baked in at the
    // call site, so unlike the reference allocator's fixed `MAX_FILEPATH`
    // byte buffer there is nothing to copy or truncate here.
    source_file: &'static str,
    pre_pattern: [u8; PATTERN_SIZE],
}

intrusive_adapter!(PreBufferAdapter = &'static PreBuffer: PreBuffer { link: LinkedListLink });

struct DebugInner {
    list: LinkedList<PreBufferAdapter>,
}

unsafe impl Send for DebugInner {}

pub struct DebugState {
    inner: Mutex<DebugInner>,
    pub stats: Stats,
}

const BLOCK_INFO_SIZE: usize = size_of::<BlockInfo>();
const PRE_BUFFER_SIZE: usize = size_of::<PreBuffer>();

/// Bytes of envelope overhead ahead of and behind the client region when no
/// alignment padding is needed.
pub const BASE_OVERHEAD: usize = BLOCK_INFO_SIZE + PRE_BUFFER_SIZE + PATTERN_SIZE;

impl DebugState {
    pub const fn new() -> Self {
        DebugState {
            inner: Mutex::new(DebugInner {
                list: LinkedList::new(PreBufferAdapter::NEW),
            }),
            stats: Stats::new(),
        }
    }

    /// Total raw bytes needed from the bucket/tree subsystem to wrap a
    /// `requested` byte allocation aligned to `align`.
    pub fn raw_size_for(&self, requested: usize, align: usize) -> usize {
        requested + BASE_OVERHEAD + align.saturating_sub(1)
    }

    /// Wraps a raw block `[raw, raw + raw_size)` obtained from the bucket or
    /// tree subsystem, returning the client pointer. `raw_size` must be at
    /// least `raw_size_for(requested, align)`.
    ///
    /// # Safety
    /// `raw` must be a live, exclusively-owned allocation of `raw_size`
    /// bytes that nothing else observes.
    pub unsafe fn wrap(
        &self,
        raw: *mut u8,
        requested: usize,
        align: usize,
        source: Source,
        location: &Location,
    ) -> *mut u8 {
        let prefix_base = raw as usize + BLOCK_INFO_SIZE + PRE_BUFFER_SIZE;
        let client_addr = crate::constants::align_up(prefix_base, align);
        let block_info_addr = client_addr - PRE_BUFFER_SIZE - BLOCK_INFO_SIZE;
        let offset = block_info_addr - raw as usize;

        let block_info = block_info_addr as *mut BlockInfo;
        block_info.write(BlockInfo::pack(requested, offset));

        let pre_addr = block_info_addr + BLOCK_INFO_SIZE;
        let pre = pre_addr as *mut PreBuffer;
        pre.write(PreBuffer {
            link: LinkedListLink::new(),
            requested_size: requested,
            alignment: align,
            source,
            source_line: location.line(),
            source_file: location.file(),
            pre_pattern: [PRE_PATTERN; PATTERN_SIZE],
        });

        let client = client_addr as *mut u8;
        core::ptr::write_bytes(client.add(requested), POST_PATTERN, PATTERN_SIZE);

        let pre_ref: &'static PreBuffer = &*pre;
        self.inner.lock().list.push_front(pre_ref);
        self.stats.requested_bytes.increase(requested);
        self.stats.live_allocations.increase(1);

        client
    }

    /// Recovers the raw block pointer and requested size for a client
    /// pointer previously returned by `wrap`, verifying both guard regions
    /// and unlinking it from the global allocation list.
    ///
    /// # Safety
    /// `client` must be a pointer previously returned by `wrap` and not yet
    /// unwrapped.
    pub unsafe fn unwrap(
        &self,
        client: *mut u8,
    ) -> (*mut u8, usize, usize, Result<(), HeapCorruption>) {
        let pre_addr = client as usize - PRE_BUFFER_SIZE;
        let pre = &*(pre_addr as *const PreBuffer);
        let block_info_addr = pre_addr - BLOCK_INFO_SIZE;
        let block_info = &*(block_info_addr as *const BlockInfo);
        let requested = pre.requested_size;
        debug_assert_eq!(block_info.actual_size, requested);
        let alignment = pre.alignment;

        let result = check_guards(pre, client, requested);
        if let Err(kind) = result {
            error!(
                "heap corruption detected ({:?}) on block allocated at {}:{}",
                kind, pre.source_file, pre.source_line
            );
        }

        let mut cursor = self
            .inner
            .lock()
            .list
            .cursor_mut_from_ptr(pre as *const PreBuffer);
        cursor.remove();

        self.stats.requested_bytes.decrease(requested);
        self.stats.live_allocations.decrease(1);

        let raw = (block_info_addr - block_info.pointer_offset()) as *mut u8;
        (raw, requested, alignment, result)
    }

    /// Recovers the raw block pointer for a live client pointer, without
    /// verifying guards or unlinking it from the global allocation list.
    /// Used by `query_size`, which must not disturb a still-live entry the
    /// way `unwrap` does.
    ///
    /// # Safety
    /// `client` must be a pointer previously returned by `wrap` and not yet
    /// unwrapped.
    pub unsafe fn raw_ptr(&self, client: *mut u8) -> *mut u8 {
        let pre_addr = client as usize - PRE_BUFFER_SIZE;
        let block_info_addr = pre_addr - BLOCK_INFO_SIZE;
        let block_info = &*(block_info_addr as *const BlockInfo);
        (block_info_addr - block_info.pointer_offset()) as *mut u8
    }

    /// Walks every live allocation and verifies its guard bytes, returning
    /// the first violation found. The reference allocator asserts directly;
    /// a library crate surfaces the diagnosis to the caller instead (see
    /// the design notes on `self_check`'s signature).
    pub fn self_check(&self) -> Result<(), HeapCorruption> {
        let inner = self.inner.lock();
        for pre in inner.list.iter() {
            let client = (pre as *const PreBuffer as usize + PRE_BUFFER_SIZE) as *mut u8;
            check_guards(pre, client, pre.requested_size)?;
        }
        Ok(())
    }

    pub fn report(&self) {
        let inner = self.inner.lock();
        let count = inner.list.iter().count();
        log::info!(
            "heap report: {} live allocations, {} bytes requested (peak {}), {} bytes committed (peak {}), {} live superpages",
            count,
            self.stats.requested_bytes.current(),
            self.stats.requested_bytes.peak(),
            self.stats.committed_bytes.current(),
            self.stats.committed_bytes.peak(),
            self.stats.superpages.current(),
        );
        for pre in inner.list.iter() {
            log::info!(
                "  leaked {} bytes from {}:{}",
                pre.requested_size, pre.source_file, pre.source_line,
            );
        }
    }
}

fn check_guards(pre: &PreBuffer, client: *mut u8, requested: usize) -> Result<(), HeapCorruption> {
    if pre.pre_pattern.iter().any(|&b| b != PRE_PATTERN) {
        return Err(HeapCorruption::PreGuardOverwritten);
    }
    let post = unsafe { core::slice::from_raw_parts(client.add(requested), PATTERN_SIZE) };
    if post.iter().any(|&b| b != POST_PATTERN) {
        return Err(HeapCorruption::PostGuardOverwritten);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    extern crate std;
    use super::*;
    use std::vec::Vec;

    fn alloc_raw(size: usize) -> *mut u8 {
        let mut v: Vec<u8> = std::vec![0u8; size];
        let ptr = v.as_mut_ptr();
        core::mem::forget(v);
        ptr
    }

    #[test]
    fn wrap_unwrap_roundtrip() {
        let debug = DebugState::new();
        let raw_size = debug.raw_size_for(64, 8);
        let raw = alloc_raw(raw_size);
        let client = unsafe {
            debug.wrap(raw, 64, 8, Source::Bucket, Location::caller())
        };
        assert_eq!(client as usize % 8, 0);
        let (recovered_raw, requested, alignment, result) = unsafe { debug.unwrap(client) };
        assert_eq!(recovered_raw, raw);
        assert_eq!(requested, 64);
        assert_eq!(alignment, 8);
        assert!(result.is_ok());
    }

    #[test]
    fn detects_post_overrun() {
        let debug = DebugState::new();
        let raw_size = debug.raw_size_for(16, 8);
        let raw = alloc_raw(raw_size);
        let client = unsafe { debug.wrap(raw, 16, 8, Source::Bucket, Location::caller()) };
        unsafe {
            *client.add(16) = 0;
        }
        let (_, _, _, result) = unsafe { debug.unwrap(client) };
        assert_eq!(result, Err(HeapCorruption::PostGuardOverwritten));
    }
}
