//! Process-wide tunables.
//!
//! The teacher's `lib.rs` declared `mod options;` but shipped no such file;
//! this is the module that was meant to live there, sized to what this
//! allocator actually needs rather than ported wholesale.

use core::sync::atomic::{AtomicBool, Ordering};

/// When set, the OS layer logs every `mmap`/`VirtualAlloc`/`mprotect`
/// failure at `warn` level instead of staying silent.
static VERBOSE: AtomicBool = AtomicBool::new(false);

/// When set, `purge()` additionally logs a `report()` snapshot before
/// releasing superpages back to the OS, which is useful for tracking down
/// leaks interactively.
static REPORT_ON_PURGE: AtomicBool = AtomicBool::new(false);

pub fn set_verbose(enabled: bool) {
    VERBOSE.store(enabled, Ordering::Relaxed);
}

pub fn verbose() -> bool {
    VERBOSE.load(Ordering::Relaxed)
}

pub fn set_report_on_purge(enabled: bool) {
    REPORT_ON_PURGE.store(enabled, Ordering::Relaxed);
}

pub fn report_on_purge() -> bool {
    REPORT_ON_PURGE.load(Ordering::Relaxed)
}
