//! Bucket memory accounting used to gate replication ingest.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Shared byte-budget tracker for one bucket.
///
/// The max size and threshold are mutable at runtime so threshold behavior can be pinned
/// deterministically instead of racing the allocator.
#[derive(Debug)]
pub struct MemoryTracker {
    used_bytes: AtomicUsize,
    max_data_size: AtomicUsize,
    /// Throttle threshold stored as `f64` bits.
    throttle_threshold_bits: AtomicU64,
}

impl MemoryTracker {
    /// Creates a tracker with the given quota and replication-throttle threshold.
    #[must_use]
    pub fn new(max_data_size: usize, throttle_threshold: f64) -> Self {
        Self {
            used_bytes: AtomicUsize::new(0),
            max_data_size: AtomicUsize::new(max_data_size),
            throttle_threshold_bits: AtomicU64::new(
                throttle_threshold.clamp(0.0, 1.0).to_bits(),
            ),
        }
    }

    /// Accounts an allocation of `bytes`.
    pub fn account_alloc(&self, bytes: usize) {
        self.used_bytes.fetch_add(bytes, Ordering::AcqRel);
    }

    /// Accounts a free of `bytes`, saturating at zero.
    pub fn account_free(&self, bytes: usize) {
        let mut current = self.used_bytes.load(Ordering::Acquire);
        loop {
            let next = current.saturating_sub(bytes);
            match self.used_bytes.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    /// Returns the estimated total memory in use.
    #[must_use]
    pub fn estimated_total_memory_used(&self) -> usize {
        self.used_bytes.load(Ordering::Acquire)
    }

    /// Returns the current bucket quota.
    #[must_use]
    pub fn max_data_size(&self) -> usize {
        self.max_data_size.load(Ordering::Acquire)
    }

    /// Replaces the bucket quota.
    pub fn set_max_data_size(&self, bytes: usize) {
        self.max_data_size.store(bytes, Ordering::Release);
    }

    /// Returns the replication-throttle threshold fraction.
    #[must_use]
    pub fn replication_throttle_threshold(&self) -> f64 {
        f64::from_bits(self.throttle_threshold_bits.load(Ordering::Acquire))
    }

    /// Replaces the replication-throttle threshold fraction.
    pub fn set_replication_throttle_threshold(&self, fraction: f64) {
        self.throttle_threshold_bits
            .store(fraction.clamp(0.0, 1.0).to_bits(), Ordering::Release);
    }

    /// Returns whether replication ingest should be throttled right now.
    #[must_use]
    pub fn is_replication_throttled(&self) -> bool {
        let limit =
            (self.max_data_size() as f64) * self.replication_throttle_threshold();
        (self.estimated_total_memory_used() as f64) > limit
    }
}

/// Scoped accounting guard wrapping one message-processing span.
///
/// Bytes accounted through the guard are released when it drops, unless `commit` transfers them
/// to the long-lived tracker total.
#[derive(Debug)]
pub struct AllocationSpan<'a> {
    tracker: &'a MemoryTracker,
    bytes: usize,
    committed: bool,
}

impl<'a> AllocationSpan<'a> {
    /// Opens a span accounting `bytes` against the tracker.
    #[must_use]
    pub fn enter(tracker: &'a MemoryTracker, bytes: usize) -> Self {
        tracker.account_alloc(bytes);
        Self {
            tracker,
            bytes,
            committed: false,
        }
    }

    /// Keeps the accounted bytes after the span ends.
    pub fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for AllocationSpan<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.tracker.account_free(self.bytes);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{AllocationSpan, MemoryTracker};
    use googletest::prelude::*;
    use rstest::rstest;

    #[rstest]
    fn alloc_and_free_track_the_running_total() {
        let tracker = MemoryTracker::new(1000, 0.9);
        tracker.account_alloc(600);
        assert_that!(tracker.estimated_total_memory_used(), eq(600_usize));

        tracker.account_free(200);
        assert_that!(tracker.estimated_total_memory_used(), eq(400_usize));

        tracker.account_free(10_000);
        assert_that!(tracker.estimated_total_memory_used(), eq(0_usize));
    }

    #[rstest]
    fn throttling_trips_past_the_threshold_fraction() {
        let tracker = MemoryTracker::new(1000, 0.9);
        tracker.account_alloc(900);
        assert_that!(tracker.is_replication_throttled(), eq(false));

        tracker.account_alloc(1);
        assert_that!(tracker.is_replication_throttled(), eq(true));

        // Growing the quota relaxes the same usage below the threshold.
        tracker.set_max_data_size(2000);
        assert_that!(tracker.is_replication_throttled(), eq(false));
    }

    #[rstest]
    fn allocation_span_rolls_back_unless_committed() {
        let tracker = MemoryTracker::new(1000, 0.9);
        {
            let _span = AllocationSpan::enter(&tracker, 100);
            assert_that!(tracker.estimated_total_memory_used(), eq(100_usize));
        }
        assert_that!(tracker.estimated_total_memory_used(), eq(0_usize));

        AllocationSpan::enter(&tracker, 100).commit();
        assert_that!(tracker.estimated_total_memory_used(), eq(100_usize));
    }
}
