//! GC metrics and statistics.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

/// Statistics from one mark/sweep cycle (or the sum over a global run).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollectStats {
    /// Number of allocations freed by the sweep.
    pub objects_reclaimed: usize,
    /// Number of bytes freed by the sweep.
    pub bytes_reclaimed: usize,
    /// Number of allocations that survived.
    pub objects_surviving: usize,
    /// Number of bytes that survived.
    pub bytes_surviving: usize,
    /// Wall time spent in mark and sweep.
    pub duration: Duration,
}

impl CollectStats {
    /// Fold another collector's statistics into this one.
    pub fn absorb(&mut self, other: &Self) {
        self.objects_reclaimed += other.objects_reclaimed;
        self.bytes_reclaimed += other.bytes_reclaimed;
        self.objects_surviving += other.objects_surviving;
        self.bytes_surviving += other.bytes_surviving;
        self.duration += other.duration;
    }
}

/// Cumulative counters for one manager and all of its collectors.
#[derive(Debug, Default)]
pub struct GlobalMetrics {
    local_collections: AtomicUsize,
    automatic_collections: AtomicUsize,
    global_collections: AtomicUsize,
    objects_reclaimed: AtomicUsize,
    bytes_reclaimed: AtomicUsize,
    oom_recoveries: AtomicUsize,
    fatal_ooms: AtomicUsize,
    pause_ns: AtomicU64,
}

impl GlobalMetrics {
    /// Create a new `GlobalMetrics` with all counters initialized to zero.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            local_collections: AtomicUsize::new(0),
            automatic_collections: AtomicUsize::new(0),
            global_collections: AtomicUsize::new(0),
            objects_reclaimed: AtomicUsize::new(0),
            bytes_reclaimed: AtomicUsize::new(0),
            oom_recoveries: AtomicUsize::new(0),
            fatal_ooms: AtomicUsize::new(0),
            pause_ns: AtomicU64::new(0),
        }
    }

    fn add_reclaimed(&self, stats: &CollectStats) {
        self.objects_reclaimed
            .fetch_add(stats.objects_reclaimed, Ordering::Relaxed);
        self.bytes_reclaimed
            .fetch_add(stats.bytes_reclaimed, Ordering::Relaxed);
    }

    /// Record an explicit thread-local collection.
    pub fn record_local(&self, stats: &CollectStats) {
        self.local_collections.fetch_add(1, Ordering::Relaxed);
        self.add_reclaimed(stats);
    }

    /// Record a collection triggered by the sweep threshold.
    pub fn record_automatic(&self, stats: &CollectStats) {
        self.automatic_collections.fetch_add(1, Ordering::Relaxed);
        self.add_reclaimed(stats);
    }

    /// Record a completed stop-the-world run and how long the world was stopped.
    pub fn record_global(&self, stats: &CollectStats, pause: Duration) {
        self.global_collections.fetch_add(1, Ordering::Relaxed);
        self.add_reclaimed(stats);
        #[allow(clippy::cast_possible_truncation)]
        self.pause_ns
            .fetch_add(pause.as_nanos() as u64, Ordering::Relaxed);
    }

    /// Record an allocation that succeeded after out-of-memory recovery.
    pub fn record_oom_recovery(&self) {
        self.oom_recoveries.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an allocation that still failed after recovery.
    pub fn record_fatal_oom(&self) {
        self.fatal_ooms.fetch_add(1, Ordering::Relaxed);
    }

    /// Read every counter.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            local_collections: self.local_collections.load(Ordering::Relaxed),
            automatic_collections: self.automatic_collections.load(Ordering::Relaxed),
            global_collections: self.global_collections.load(Ordering::Relaxed),
            objects_reclaimed: self.objects_reclaimed.load(Ordering::Relaxed),
            bytes_reclaimed: self.bytes_reclaimed.load(Ordering::Relaxed),
            oom_recoveries: self.oom_recoveries.load(Ordering::Relaxed),
            fatal_ooms: self.fatal_ooms.load(Ordering::Relaxed),
            total_pause: Duration::from_nanos(self.pause_ns.load(Ordering::Relaxed)),
        }
    }
}

/// A point-in-time copy of [`GlobalMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Explicit `THREAD_LOCAL` collections.
    pub local_collections: usize,
    /// Collections fired by a collector's sweep threshold.
    pub automatic_collections: usize,
    /// Completed stop-the-world runs.
    pub global_collections: usize,
    /// Allocations reclaimed by any collection.
    pub objects_reclaimed: usize,
    /// Bytes reclaimed by any collection.
    pub bytes_reclaimed: usize,
    /// Allocations rescued by out-of-memory recovery.
    pub oom_recoveries: usize,
    /// Allocations that failed even after recovery.
    pub fatal_ooms: usize,
    /// Total time other threads spent paused by global runs.
    pub total_pause: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absorb_sums_fields() {
        let mut total = CollectStats::default();
        let part = CollectStats {
            objects_reclaimed: 2,
            bytes_reclaimed: 64,
            objects_surviving: 1,
            bytes_surviving: 32,
            duration: Duration::from_micros(5),
        };
        total.absorb(&part);
        total.absorb(&part);
        assert_eq!(total.objects_reclaimed, 4);
        assert_eq!(total.bytes_surviving, 64);
        assert_eq!(total.duration, Duration::from_micros(10));
    }

    #[test]
    fn test_counters() {
        let metrics = GlobalMetrics::new();
        let stats = CollectStats {
            objects_reclaimed: 3,
            bytes_reclaimed: 12,
            ..CollectStats::default()
        };
        metrics.record_local(&stats);
        metrics.record_automatic(&stats);
        metrics.record_global(&stats, Duration::from_millis(1));
        metrics.record_oom_recovery();

        let snap = metrics.snapshot();
        assert_eq!(snap.local_collections, 1);
        assert_eq!(snap.automatic_collections, 1);
        assert_eq!(snap.global_collections, 1);
        assert_eq!(snap.objects_reclaimed, 9);
        assert_eq!(snap.bytes_reclaimed, 36);
        assert_eq!(snap.oom_recoveries, 1);
        assert_eq!(snap.fatal_ooms, 0);
        assert_eq!(snap.total_pause, Duration::from_millis(1));
    }
}
