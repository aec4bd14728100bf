//! The engine-wide timestamp source.

use std::sync::atomic::{AtomicI64, Ordering};

/// Monotonic source of start, commit, and checkpoint timestamps.
///
/// Timestamp zero is reserved for primordial (non-versioned) writes; the
/// first allocated timestamp is 1. Recovery bumps the counter above every
/// timestamp observed in the journal before the engine goes live.
#[derive(Debug, Default)]
pub struct TimestampAllocator {
    counter: AtomicI64,
}

impl TimestampAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate(&self) -> i64 {
        self.counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Most recently allocated timestamp.
    pub fn current(&self) -> i64 {
        self.counter.load(Ordering::SeqCst)
    }

    /// Ensures future allocations exceed `at_least`.
    pub fn bump_to(&self, at_least: i64) {
        self.counter.fetch_max(at_least, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocations_are_strictly_increasing() {
        let alloc = TimestampAllocator::new();
        let a = alloc.allocate();
        let b = alloc.allocate();
        assert!(b > a);
        assert_eq!(alloc.current(), b);
    }

    #[test]
    fn bump_only_moves_forward() {
        let alloc = TimestampAllocator::new();
        alloc.bump_to(100);
        assert_eq!(alloc.allocate(), 101);
        alloc.bump_to(50);
        assert_eq!(alloc.allocate(), 102);
    }
}
