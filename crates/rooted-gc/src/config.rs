//! Collector configuration.

/// Default sweep threshold for a fresh collector (1 MiB).
pub const DEFAULT_SWEEP_THRESHOLD: usize = 1024 * 1024;

/// Default number of pool workers kept alive without any collectors.
pub const DEFAULT_MIN_WORKERS: usize = 1;

/// Configuration shared by every collector a [`Manager`](crate::Manager) creates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GcConfig {
    /// Live-byte count at which a fresh collector first collects locally.
    pub initial_threshold: usize,
    /// Per-collector cap on live bytes. Requests beyond it report exhaustion.
    pub max_heap_bytes: Option<usize>,
    /// Pool workers kept alive even when no collector is registered.
    pub min_workers: usize,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            initial_threshold: DEFAULT_SWEEP_THRESHOLD,
            max_heap_bytes: None,
            min_workers: DEFAULT_MIN_WORKERS,
        }
    }
}

impl GcConfig {
    /// Create a configuration with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the initial sweep threshold. Zero is raised to one byte.
    #[must_use]
    pub const fn with_initial_threshold(mut self, bytes: usize) -> Self {
        self.initial_threshold = if bytes == 0 { 1 } else { bytes };
        self
    }

    /// Cap the live bytes of each collector.
    #[must_use]
    pub const fn with_max_heap_bytes(mut self, limit: Option<usize>) -> Self {
        self.max_heap_bytes = limit;
        self
    }

    /// Set the number of workers kept alive without collectors (at least one).
    #[must_use]
    pub const fn with_min_workers(mut self, workers: usize) -> Self {
        self.min_workers = if workers < 1 { 1 } else { workers };
        self
    }

    /// Upper bound for threshold doubling, half the addressable range.
    #[must_use]
    pub const fn threshold_cap() -> usize {
        usize::MAX / 2
    }
}
