//! Page provider: acquires and releases `PAGE_SIZE`-aligned superpages from
//! the operating system.
//!
//! This is the crate's sole external-collaborator dependency on the OS,
//! mirroring the teacher's `os` module split between `libc` on Unix and
//! `winapi` on Windows, but reduced to exactly the contract the allocator
//! needs: aligned acquire and matching release. The large-page / permission
//! machinery and per-thread `Stats`/`OsTld` plumbing from the teacher's
//! mimalloc-derived version are not needed here (this allocator has a single
//! global arena, not per-thread segments) and are not carried over.

use core::ptr::null_mut;
use log::warn;

use crate::constants::{align_up, PAGE_SIZE};

#[cfg(not(windows))]
use libc::{mmap, munmap, MAP_ANONYMOUS, MAP_FAILED, MAP_PRIVATE, PROT_READ, PROT_WRITE};

#[cfg(windows)]
use winapi::shared::minwindef::LPVOID;
#[cfg(windows)]
use winapi::um::memoryapi::{VirtualAlloc, VirtualFree};
#[cfg(windows)]
use winapi::um::winnt::{MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_READWRITE};

/// Acquires a region of `n_pages * PAGE_SIZE` bytes, aligned to `PAGE_SIZE`.
/// Returns `NULL` on failure.
pub fn acquire(n_pages: usize) -> *mut u8 {
    debug_assert!(n_pages > 0);
    let size = n_pages * PAGE_SIZE;
    let p = raw_alloc(size);
    if p.is_null() {
        return null_mut();
    }
    if (p as usize) % PAGE_SIZE == 0 {
        return p;
    }

    // The hint wasn't honored; over-allocate and trim around an aligned
    // interior pointer, exactly the technique the teacher's `os` module uses
    // for its own aligned allocation path.
    raw_free(p, size);
    let over_size = size + PAGE_SIZE;
    let raw = raw_alloc(over_size);
    if raw.is_null() {
        return null_mut();
    }
    let aligned = align_up(raw as usize, PAGE_SIZE) as *mut u8;
    let pre = aligned as usize - raw as usize;
    let post = over_size - pre - size;

    #[cfg(not(windows))]
    {
        if pre > 0 {
            raw_free(raw, pre);
        }
        if post > 0 {
            raw_free((aligned as usize + size) as *mut u8, post);
        }
        aligned
    }
    #[cfg(windows)]
    {
        // VirtualFree can only release an entire region obtained from
        // VirtualAlloc, not an interior sub-range, so on Windows we give up
        // the whole over-allocation and retry a direct aligned-hint request.
        let _ = (pre, post);
        raw_free(raw, over_size);
        let p = win_alloc_at(aligned, size);
        if p == aligned {
            p
        } else {
            if !p.is_null() {
                raw_free(p, size);
            }
            null_mut()
        }
    }
}

/// Releases a region previously returned by `acquire`, given its size in
/// `PAGE_SIZE` units.
pub fn release(p: *mut u8, n_pages: usize) {
    if p.is_null() || n_pages == 0 {
        return;
    }
    raw_free(p, n_pages * PAGE_SIZE);
}

#[cfg(not(windows))]
fn raw_alloc(size: usize) -> *mut u8 {
    unsafe {
        let p = mmap(
            null_mut(),
            size,
            PROT_READ | PROT_WRITE,
            MAP_PRIVATE | MAP_ANONYMOUS,
            -1,
            0,
        );
        if p == MAP_FAILED {
            if crate::options::verbose() {
                warn!("mmap failed: {}, size {}", errno::errno(), size);
            }
            null_mut()
        } else {
            p as *mut u8
        }
    }
}

#[cfg(not(windows))]
fn raw_free(p: *mut u8, size: usize) {
    unsafe {
        if munmap(p as *mut _, size) != 0 {
            warn!("munmap failed: {}, addr {:p}, size {}", errno::errno(), p, size);
        }
    }
}

#[cfg(windows)]
fn raw_alloc(size: usize) -> *mut u8 {
    win_alloc_at(null_mut(), size)
}

#[cfg(windows)]
fn win_alloc_at(addr: *mut u8, size: usize) -> *mut u8 {
    unsafe {
        let p = VirtualAlloc(
            addr as LPVOID,
            size,
            MEM_RESERVE | MEM_COMMIT,
            PAGE_READWRITE,
        );
        if p.is_null() && crate::options::verbose() {
            warn!("VirtualAlloc failed: size {}", size);
        }
        p as *mut u8
    }
}

#[cfg(windows)]
fn raw_free(p: *mut u8, _size: usize) {
    unsafe {
        if VirtualFree(p as LPVOID, 0, MEM_RELEASE) == 0 {
            warn!("VirtualFree failed: addr {:p}", p);
        }
    }
}

#[cfg(test)]
mod tests {
    extern crate std;
    use super::*;

    #[test]
    fn acquire_is_page_aligned_and_usable() {
        let p = acquire(1);
        assert!(!p.is_null());
        assert_eq!(p as usize % PAGE_SIZE, 0);
        unsafe {
            core::ptr::write_bytes(p, 0x11, PAGE_SIZE);
            assert_eq!(*p, 0x11);
        }
        release(p, 1);
    }

    #[test]
    fn acquire_multi_page_region() {
        let p = acquire(4);
        assert!(!p.is_null());
        assert_eq!(p as usize % PAGE_SIZE, 0);
        release(p, 4);
    }
}
