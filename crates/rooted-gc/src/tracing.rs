//! GC tracing support.
//!
//! When the `tracing` feature is enabled, this module provides structured
//! tracing spans and events for collector operations. Without the feature
//! every entry point compiles to nothing.

#[cfg(feature = "tracing")]
pub mod internal {
    use std::io;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    use tracing::{span, Level};

    use crate::metrics::CollectStats;
    use crate::thread::ThreadKey;

    /// Stable identifier for a stop-the-world run.
    ///
    /// Monotonically increasing, starting at 1.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GcId(pub u64);

    /// Global counter for generating unique GC IDs.
    static NEXT_GC_ID: AtomicU64 = AtomicU64::new(1);

    /// Generate the next unique GC ID.
    pub fn next_gc_id() -> GcId {
        GcId(NEXT_GC_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Create a span for a whole stop-the-world run.
    pub fn trace_global_collection(gc_id: GcId, participants: usize) -> span::EnteredSpan {
        span!(
            Level::DEBUG,
            "gc_collect",
            scope = "global",
            gc_id = gc_id.0,
            participants
        )
        .entered()
    }

    pub fn log_registered(key: ThreadKey, workers: usize) {
        tracing::debug!(thread = %key, workers, "collector_registered");
    }

    pub fn log_duplicate_registration(key: ThreadKey) {
        tracing::warn!(thread = %key, "thread already has a collector; returning inert handle");
    }

    pub fn log_stopped(key: ThreadKey, freed: usize) {
        tracing::debug!(thread = %key, freed, "collector_stopped");
    }

    pub fn log_unknown_thread(key: ThreadKey, op: &str) {
        tracing::warn!(thread = %key, op, "operation on unregistered thread");
    }

    pub fn log_handler_install_failed(err: &io::Error) {
        tracing::error!(error = %err, "pause signal handler not installed; global collection cannot pause this thread");
    }

    pub fn log_unpausable(key: ThreadKey) {
        tracing::warn!(thread = %key, "skipping unpausable thread during global collection");
    }

    pub fn log_pause_failed(key: ThreadKey, err: &io::Error) {
        tracing::warn!(thread = %key, error = %err, "failed to deliver pause signal");
    }

    pub fn log_local_collection(key: ThreadKey, stats: &CollectStats) {
        tracing::debug!(
            thread = %key,
            reclaimed = stats.objects_reclaimed,
            bytes_reclaimed = stats.bytes_reclaimed,
            surviving = stats.objects_surviving,
            "local_collect"
        );
    }

    pub fn log_automatic_collection(stats: &CollectStats, threshold: usize) {
        tracing::debug!(
            reclaimed = stats.objects_reclaimed,
            bytes_reclaimed = stats.bytes_reclaimed,
            threshold,
            "threshold_collect"
        );
    }

    pub fn log_global_collection(stats: &CollectStats, paused: usize, pause: Duration) {
        tracing::debug!(
            reclaimed = stats.objects_reclaimed,
            bytes_reclaimed = stats.bytes_reclaimed,
            surviving = stats.objects_surviving,
            paused,
            pause_us = u64::try_from(pause.as_micros()).unwrap_or(u64::MAX),
            "global_collect"
        );
    }

    pub fn log_global_already_running() {
        tracing::trace!("global collection already in flight");
    }

    pub fn log_oom(key: ThreadKey, size: usize, recovered: bool) {
        if recovered {
            tracing::debug!(thread = %key, size, "allocation recovered after global collection");
        } else {
            tracing::warn!(thread = %key, size, "out of memory after global collection");
        }
    }

    pub fn log_task_panicked(task: u64) {
        tracing::error!(task, "collector task panicked");
    }
}

#[cfg(not(feature = "tracing"))]
#[allow(clippy::missing_const_for_fn)]
pub mod internal {
    use std::io;
    use std::time::Duration;

    use crate::metrics::CollectStats;
    use crate::thread::ThreadKey;

    /// Stub type when tracing is disabled.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GcId(pub u64);

    /// Stub guard when tracing is disabled.
    pub struct NoSpan;

    pub fn next_gc_id() -> GcId {
        GcId(0)
    }

    pub fn trace_global_collection(_: GcId, _: usize) -> NoSpan {
        NoSpan
    }

    pub fn log_registered(_: ThreadKey, _: usize) {}
    pub fn log_duplicate_registration(_: ThreadKey) {}
    pub fn log_stopped(_: ThreadKey, _: usize) {}
    pub fn log_unknown_thread(_: ThreadKey, _: &str) {}
    pub fn log_handler_install_failed(_: &io::Error) {}
    pub fn log_unpausable(_: ThreadKey) {}
    pub fn log_pause_failed(_: ThreadKey, _: &io::Error) {}
    pub fn log_local_collection(_: ThreadKey, _: &CollectStats) {}
    pub fn log_automatic_collection(_: &CollectStats, _: usize) {}
    pub fn log_global_collection(_: &CollectStats, _: usize, _: Duration) {}
    pub fn log_global_already_running() {}
    pub fn log_oom(_: ThreadKey, _: usize, _: bool) {}
    pub fn log_task_panicked(_: u64) {}
}

pub use internal::GcId;
