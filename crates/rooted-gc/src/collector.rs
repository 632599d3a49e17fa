//! Per-thread mark-sweep collector.
//!
//! A [`Collector`] owns one thread's allocations and root slots. Marking starts
//! from the word stored in each root slot and scans every reachable allocation
//! conservatively, byte by byte. Sweeping frees every allocation left unmarked.

use std::ptr::NonNull;
use std::sync::Arc;
use std::time::Instant;

use rustc_hash::FxHashMap;
use sys_alloc::RawBlock;

use crate::config::GcConfig;
use crate::error::{GcError, Result};
use crate::metrics::{CollectStats, GlobalMetrics};
use crate::roots::RootSet;
use crate::scan::scan_region;

/// Mark state of one allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mark {
    /// Not (yet) reached in the current cycle.
    Unmarked,
    /// Reached from a root in the current cycle.
    Marked,
}

/// One live allocation.
#[derive(Debug)]
pub struct AllocRecord {
    block: RawBlock,
    mark: Mark,
}

impl AllocRecord {
    /// Start address of the allocation.
    #[must_use]
    pub fn addr(&self) -> usize {
        self.block.addr()
    }

    /// Requested size in bytes.
    #[must_use]
    pub const fn size(&self) -> usize {
        self.block.len()
    }

    /// Current mark state.
    #[must_use]
    pub const fn mark(&self) -> Mark {
        self.mark
    }
}

/// Allocation registry, root set and threshold state of one thread.
#[derive(Debug)]
pub struct Collector {
    records: FxHashMap<usize, AllocRecord>,
    roots: RootSet,
    allocated_bytes: usize,
    threshold: usize,
    max_heap_bytes: Option<usize>,
    metrics: Arc<GlobalMetrics>,
}

impl Collector {
    /// Create an empty collector.
    #[must_use]
    pub fn new(config: &GcConfig, metrics: Arc<GlobalMetrics>) -> Self {
        Self {
            records: FxHashMap::default(),
            roots: RootSet::new(),
            allocated_bytes: 0,
            threshold: config.initial_threshold.max(1),
            max_heap_bytes: config.max_heap_bytes,
            metrics,
        }
    }

    // ========================================================================
    // Mutator operations
    // ========================================================================

    /// Allocate `size` zeroed bytes and register them.
    ///
    /// If the request would bring the live-byte count to the sweep threshold, a
    /// local collection runs first and the threshold doubles.
    ///
    /// # Errors
    ///
    /// [`GcError::OutOfMemory`] if the heap cap is exceeded or the OS refuses
    /// the request. The registry is left untouched in that case.
    pub fn allocate(&mut self, size: usize) -> Result<NonNull<u8>> {
        if self.allocated_bytes.saturating_add(size) >= self.threshold {
            let stats = self.collect();
            self.threshold = self
                .threshold
                .saturating_mul(2)
                .min(GcConfig::threshold_cap());
            self.metrics.record_automatic(&stats);
            crate::tracing::internal::log_automatic_collection(&stats, self.threshold);
        }

        if let Some(limit) = self.max_heap_bytes {
            if self.allocated_bytes.saturating_add(size) > limit {
                return Err(GcError::OutOfMemory { size });
            }
        }

        let block = RawBlock::allocate(size).map_err(|_| GcError::OutOfMemory { size })?;
        let ptr = block.as_non_null();
        self.allocated_bytes += block.len();
        self.records.insert(
            block.addr(),
            AllocRecord {
                block,
                mark: Mark::Unmarked,
            },
        );
        Ok(ptr)
    }

    /// Free a known allocation. Unknown addresses are ignored.
    ///
    /// Returns whether anything was freed.
    pub fn release(&mut self, addr: usize) -> bool {
        match self.records.remove(&addr) {
            Some(record) => {
                self.allocated_bytes -= record.size();
                true
            }
            None => false,
        }
    }

    /// Register a root slot.
    pub fn add_root(&mut self, slot: usize) {
        self.roots.insert(slot);
    }

    /// Unregister a root slot. Unknown slots are ignored.
    pub fn remove_root(&mut self, slot: usize) {
        self.roots.remove(slot);
    }

    /// Run mark then sweep.
    pub fn collect(&mut self) -> CollectStats {
        let start = Instant::now();
        self.mark();
        let mut stats = self.sweep();
        stats.duration = start.elapsed();
        stats
    }

    /// Free every allocation and forget every root.
    ///
    /// Returns the number of allocations freed.
    pub fn release_all(&mut self) -> usize {
        let freed = self.records.len();
        self.records.clear();
        self.roots.clear();
        self.allocated_bytes = 0;
        freed
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Number of live allocations.
    #[must_use]
    pub fn allocation_count(&self) -> usize {
        self.records.len()
    }

    /// Number of registered root slots.
    #[must_use]
    pub fn root_count(&self) -> usize {
        self.roots.len()
    }

    /// Live bytes.
    #[must_use]
    pub const fn allocated_bytes(&self) -> usize {
        self.allocated_bytes
    }

    /// Current sweep threshold.
    #[must_use]
    pub const fn threshold(&self) -> usize {
        self.threshold
    }

    /// Whether `addr` is the start of a live allocation.
    #[must_use]
    pub fn is_allocation(&self, addr: usize) -> bool {
        self.records.contains_key(&addr)
    }

    // ========================================================================
    // Mark-Sweep
    // ========================================================================

    fn mark(&mut self) {
        let mut worklist = Vec::new();

        // SAFETY: root slots stay live while registered (caller contract of
        // `Manager::add_root`).
        for candidate in unsafe { self.roots.read_slots() } {
            shade(&mut self.records, candidate, &mut worklist);
        }

        while let Some(addr) = worklist.pop() {
            let Some(record) = self.records.get(&addr) else {
                continue;
            };
            let (ptr, len) = (record.block.ptr().cast_const(), record.size());

            // SAFETY: the block is owned by this collector and stays allocated
            // for the whole mark phase.
            unsafe {
                scan_region(ptr, len, |candidate| {
                    shade(&mut self.records, candidate, &mut worklist);
                });
            }
        }
    }

    fn sweep(&mut self) -> CollectStats {
        let mut stats = CollectStats::default();

        self.records.retain(|_, record| match record.mark {
            Mark::Marked => {
                record.mark = Mark::Unmarked;
                stats.objects_surviving += 1;
                stats.bytes_surviving += record.size();
                true
            }
            Mark::Unmarked => {
                stats.objects_reclaimed += 1;
                stats.bytes_reclaimed += record.size();
                false
            }
        });

        self.allocated_bytes -= stats.bytes_reclaimed;
        stats
    }
}

/// Mark the allocation starting at `candidate`, if any, and queue it for scanning.
fn shade(records: &mut FxHashMap<usize, AllocRecord>, candidate: usize, worklist: &mut Vec<usize>) {
    if let Some(record) = records.get_mut(&candidate) {
        if record.mark == Mark::Unmarked {
            record.mark = Mark::Marked;
            worklist.push(candidate);
        }
    }
}
