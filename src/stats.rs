//! Allocation statistics, tracked atomically so they can be read without
//! taking the debug mutex.
//!
//! Grounded on the teacher's `stats.rs`, which drove a `StatCount` through
//! `fetch_add` plus a manual compare-and-swap peak-tracking loop (using the
//! since-deprecated `compare_and_swap`). This version keeps the same shape
//! but reaches for `fetch_max`, stabilized after the teacher's version was
//! written.

use core::sync::atomic::{AtomicI64, AtomicUsize, Ordering};

/// A single running count with a high-water mark.
#[derive(Default)]
pub struct StatCount {
    current: AtomicI64,
    peak: AtomicI64,
    allocated: AtomicUsize,
    freed: AtomicUsize,
}

impl StatCount {
    pub const fn new() -> Self {
        StatCount {
            current: AtomicI64::new(0),
            peak: AtomicI64::new(0),
            allocated: AtomicUsize::new(0),
            freed: AtomicUsize::new(0),
        }
    }

    pub fn update(&self, amount: i64) {
        if amount == 0 {
            return;
        }
        let current = self.current.fetch_add(amount, Ordering::Relaxed) + amount;
        self.peak.fetch_max(current, Ordering::Relaxed);
        if amount > 0 {
            self.allocated.fetch_add(amount as usize, Ordering::Relaxed);
        } else {
            self.freed.fetch_add((-amount) as usize, Ordering::Relaxed);
        }
    }

    pub fn increase(&self, amount: usize) {
        self.update(amount as i64);
    }

    pub fn decrease(&self, amount: usize) {
        self.update(-(amount as i64));
    }

    pub fn current(&self) -> i64 {
        self.current.load(Ordering::Relaxed)
    }

    pub fn peak(&self) -> i64 {
        self.peak.load(Ordering::Relaxed)
    }
}

/// Process-wide allocation statistics, shared by the bucket and tree
/// subsystems and surfaced through `report()`.
#[derive(Default)]
pub struct Stats {
    pub requested_bytes: StatCount,
    pub committed_bytes: StatCount,
    pub live_allocations: StatCount,
    pub superpages: StatCount,
}

impl Stats {
    pub const fn new() -> Self {
        Stats {
            requested_bytes: StatCount::new(),
            committed_bytes: StatCount::new(),
            live_allocations: StatCount::new(),
            superpages: StatCount::new(),
        }
    }
}
