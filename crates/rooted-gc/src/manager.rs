//! Collection manager.
//!
//! The manager maps OS threads to their collectors and routes every mutator
//! operation through the shared [`TaskPool`]. Global collections close the
//! pool's admission gate, drain it, pause every other registered thread and
//! then collect every collector with priority tasks.

use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use parking_lot::{Condvar, Mutex, RwLock};
use rustc_hash::FxHashMap;

use crate::collector::Collector;
use crate::config::GcConfig;
use crate::error::{GcError, Result};
use crate::handle::GcHandle;
use crate::handshake::{self, LibraryGuard, Participant, Paused};
use crate::metrics::{CollectStats, GlobalMetrics, MetricsSnapshot};
use crate::pool::TaskPool;
use crate::thread::ThreadKey;
use crate::tracing::internal as log;

/// Flag value requesting a collection of the caller's collector only.
pub const THREAD_LOCAL: i32 = 0;

/// Flag value requesting a stop-the-world collection of every collector.
pub const GLOBAL: i32 = 1;

/// Scope of an explicit collection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum CollectScope {
    /// Collect the named thread's collector.
    ThreadLocal = THREAD_LOCAL,
    /// Stop the world and collect every registered collector.
    Global = GLOBAL,
}

impl TryFrom<i32> for CollectScope {
    type Error = GcError;

    fn try_from(flag: i32) -> Result<Self> {
        match flag {
            THREAD_LOCAL => Ok(Self::ThreadLocal),
            GLOBAL => Ok(Self::Global),
            other => Err(GcError::InvalidScope(other)),
        }
    }
}

/// One registered thread.
struct Entry {
    key: ThreadKey,
    collector: Mutex<Collector>,
    participant: Arc<Participant>,
}

#[derive(Default)]
struct RunState {
    in_flight: bool,
    /// Completed global runs.
    epoch: u64,
    /// Callers blocked until the in-flight run completes.
    waiters: usize,
}

/// Process-wide registry of per-thread collectors.
pub struct Manager {
    config: GcConfig,
    registry: RwLock<FxHashMap<ThreadKey, Arc<Entry>>>,
    pool: TaskPool,
    run: Mutex<RunState>,
    run_done: Condvar,
    /// Set while a global run has other threads paused.
    collecting: Arc<AtomicBool>,
    metrics: Arc<GlobalMetrics>,
}

static GLOBAL_MANAGER: OnceLock<Manager> = OnceLock::new();

impl Manager {
    /// Create a manager with no registered threads and no workers.
    #[must_use]
    pub fn new(config: GcConfig) -> Self {
        Self {
            config,
            registry: RwLock::new(FxHashMap::default()),
            pool: TaskPool::new(),
            run: Mutex::new(RunState::default()),
            run_done: Condvar::new(),
            collecting: Arc::new(AtomicBool::new(false)),
            metrics: Arc::new(GlobalMetrics::new()),
        }
    }

    /// The process-wide manager, created with default settings on first use.
    pub fn global() -> &'static Self {
        GLOBAL_MANAGER.get_or_init(|| Self::new(GcConfig::default()))
    }

    /// Create the process-wide manager with `config`.
    ///
    /// # Errors
    ///
    /// Hands `config` back if the global manager already exists.
    pub fn configure_global(config: GcConfig) -> std::result::Result<&'static Self, GcConfig> {
        let mut pending = Some(config);
        let manager = GLOBAL_MANAGER.get_or_init(|| {
            Self::new(pending.take().unwrap_or_default())
        });
        match pending {
            None => Ok(manager),
            Some(config) => Err(config),
        }
    }

    /// The configuration this manager was created with.
    #[must_use]
    pub const fn config(&self) -> &GcConfig {
        &self.config
    }

    // ========================================================================
    // Registration
    // ========================================================================

    /// Register a collector for the calling thread.
    ///
    /// A thread that is already registered gets a warning and an inert handle
    /// that does not stop the collector when dropped.
    ///
    /// # Errors
    ///
    /// [`GcError::WorkerSpawn`] if the pool cannot grow. The thread is not
    /// registered in that case.
    pub fn create(&self) -> Result<GcHandle<'_>> {
        let _outer = LibraryGuard::enter();
        let key = ThreadKey::current();
        if self.registry.read().contains_key(&key) {
            log::log_duplicate_registration(key);
            return Ok(GcHandle::inert(self, key));
        }

        let pausable = match handshake::install_handler() {
            Ok(()) => true,
            Err(err) => {
                log::log_handler_install_failed(&err);
                false
            }
        };

        let wanted = self.config.min_workers + self.registry.read().len() + 1;
        while self.pool.worker_count() < wanted {
            self.pool.grow().map_err(GcError::WorkerSpawn)?;
        }

        let participant = Participant::new(key, pausable, Arc::clone(&self.collecting));
        let entry = Arc::new(Entry {
            key,
            collector: Mutex::new(Collector::new(&self.config, Arc::clone(&self.metrics))),
            participant: Arc::clone(&participant),
        });

        handshake::attach(&participant);
        let _guard = LibraryGuard::adopt(participant);
        self.registry.write().insert(key, entry);
        log::log_registered(key, self.pool.worker_count());

        Ok(GcHandle::owned(self, key))
    }

    /// Stop `tid`'s collector, freeing every allocation it still owns.
    ///
    /// Returns the number of allocations freed. Unknown threads are a no-op.
    pub fn stop(&self, tid: ThreadKey) -> usize {
        let _guard = LibraryGuard::enter();
        let Some(entry) = self.registry.write().remove(&tid) else {
            return 0;
        };

        let teardown = Arc::clone(&entry);
        let freed = self
            .pool
            .submit(move || teardown.collector.lock().release_all())
            .join(&self.pool)
            .unwrap_or(0);

        handshake::detach(&entry.participant);
        self.pool
            .retire(self.config.min_workers + self.registry.read().len());
        log::log_stopped(tid, freed);
        freed
    }

    // ========================================================================
    // Mutator operations
    // ========================================================================

    /// Allocate `size` zeroed bytes on `tid`'s collector.
    ///
    /// If the collector reports exhaustion, a global collection runs (or the
    /// one in flight is awaited) and the request is retried once.
    ///
    /// # Errors
    ///
    /// - [`GcError::InvalidThread`] if `tid` is not registered.
    /// - [`GcError::OutOfMemory`] if the retry fails too.
    /// - [`GcError::TaskPanicked`] if the allocation task panicked.
    pub fn allocate(&self, tid: ThreadKey, size: usize) -> Result<NonNull<u8>> {
        let _guard = LibraryGuard::enter();
        let entry = self.lookup(tid, "allocate")?;

        match self.allocate_on(&entry, size) {
            Err(err) if err.is_out_of_memory() => self.recover_allocation(&entry, size),
            result => result,
        }
    }

    /// Free `ptr` if it is one of `tid`'s allocations.
    ///
    /// Returns whether anything was freed; unknown pointers are a no-op.
    ///
    /// # Errors
    ///
    /// [`GcError::InvalidThread`] if `tid` is not registered.
    pub fn release(&self, tid: ThreadKey, ptr: *mut u8) -> Result<bool> {
        let _guard = LibraryGuard::enter();
        let entry = self.lookup(tid, "release")?;
        let addr = ptr.expose_provenance();
        self.run_on(&entry, move |collector| collector.release(addr))
    }

    /// Register `slot` as a root of `tid`'s collector.
    ///
    /// # Errors
    ///
    /// [`GcError::InvalidThread`] if `tid` is not registered.
    ///
    /// # Safety
    ///
    /// `slot` must point to a readable pointer-sized location that stays valid
    /// until it is removed with [`remove_root`](Self::remove_root) or the
    /// collector is stopped.
    pub unsafe fn add_root(&self, tid: ThreadKey, slot: *const *mut u8) -> Result<()> {
        let _guard = LibraryGuard::enter();
        let entry = self.lookup(tid, "add_root")?;
        let addr = slot.expose_provenance();
        self.run_on(&entry, move |collector| collector.add_root(addr))
    }

    /// Unregister `slot`. Slots that are not roots are ignored.
    ///
    /// # Errors
    ///
    /// [`GcError::InvalidThread`] if `tid` is not registered.
    pub fn remove_root(&self, tid: ThreadKey, slot: *const *mut u8) -> Result<()> {
        let _guard = LibraryGuard::enter();
        let entry = self.lookup(tid, "remove_root")?;
        let addr = slot.expose_provenance();
        self.run_on(&entry, move |collector| collector.remove_root(addr))
    }

    /// Collect `tid`'s collector, or every collector for [`CollectScope::Global`].
    ///
    /// A global request made while another global run is in flight returns
    /// empty statistics without collecting.
    ///
    /// # Errors
    ///
    /// - [`GcError::InvalidThread`] if `tid` is not registered.
    /// - [`GcError::TaskPanicked`] if a collection task panicked.
    pub fn collect(&self, tid: ThreadKey, scope: CollectScope) -> Result<CollectStats> {
        let _guard = LibraryGuard::enter();
        let entry = self.lookup(tid, "collect")?;

        match scope {
            CollectScope::ThreadLocal => {
                let stats = self.run_on(&entry, Collector::collect)?;
                self.metrics.record_local(&stats);
                log::log_local_collection(tid, &stats);
                Ok(stats)
            }
            CollectScope::Global => Ok(self.stop_the_world(false)?.unwrap_or_default()),
        }
    }

    /// [`collect`](Self::collect) with a raw [`THREAD_LOCAL`] / [`GLOBAL`] flag.
    ///
    /// # Errors
    ///
    /// [`GcError::InvalidScope`] for any other flag, otherwise as `collect`.
    pub fn collect_flag(&self, tid: ThreadKey, flag: i32) -> Result<CollectStats> {
        let scope = CollectScope::try_from(flag)?;
        self.collect(tid, scope)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Number of live allocations owned by `tid`.
    ///
    /// # Errors
    ///
    /// [`GcError::InvalidThread`] if `tid` is not registered.
    pub fn allocation_count(&self, tid: ThreadKey) -> Result<usize> {
        let _guard = LibraryGuard::enter();
        let entry = self.lookup(tid, "allocation_count")?;
        let count = entry.collector.lock().allocation_count();
        Ok(count)
    }

    /// Number of roots registered by `tid`.
    ///
    /// # Errors
    ///
    /// [`GcError::InvalidThread`] if `tid` is not registered.
    pub fn root_count(&self, tid: ThreadKey) -> Result<usize> {
        let _guard = LibraryGuard::enter();
        let entry = self.lookup(tid, "root_count")?;
        let count = entry.collector.lock().root_count();
        Ok(count)
    }

    /// Live allocations across every registered collector.
    #[must_use]
    pub fn total_allocation_count(&self) -> usize {
        let _guard = LibraryGuard::enter();
        self.snapshot()
            .iter()
            .map(|entry| entry.collector.lock().allocation_count())
            .sum()
    }

    /// Whether `tid` has a registered collector.
    #[must_use]
    pub fn is_registered(&self, tid: ThreadKey) -> bool {
        let _guard = LibraryGuard::enter();
        self.registry.read().contains_key(&tid)
    }

    /// Every registered thread, in no particular order.
    #[must_use]
    pub fn registered_threads(&self) -> Vec<ThreadKey> {
        let _guard = LibraryGuard::enter();
        self.registry.read().keys().copied().collect()
    }

    /// Number of pool workers.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        let _guard = LibraryGuard::enter();
        self.pool.worker_count()
    }

    /// Whether a global collection is in flight.
    #[must_use]
    pub fn is_collecting(&self) -> bool {
        let _guard = LibraryGuard::enter();
        self.run.lock().in_flight
    }

    /// Cumulative collection counters.
    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn lookup(&self, tid: ThreadKey, op: &str) -> Result<Arc<Entry>> {
        let found = self.registry.read().get(&tid).cloned();
        found.ok_or_else(|| {
            log::log_unknown_thread(tid, op);
            GcError::InvalidThread(tid)
        })
    }

    fn snapshot(&self) -> Vec<Arc<Entry>> {
        self.registry.read().values().cloned().collect()
    }

    /// Run `op` on the entry's collector as an ordinary task and wait for it.
    fn run_on<F, R>(&self, entry: &Arc<Entry>, op: F) -> Result<R>
    where
        F: FnOnce(&mut Collector) -> R + Send + 'static,
        R: Send + 'static,
    {
        let entry = Arc::clone(entry);
        self.pool
            .submit(move || op(&mut *entry.collector.lock()))
            .join(&self.pool)
            .ok_or(GcError::TaskPanicked)
    }

    fn allocate_on(&self, entry: &Arc<Entry>, size: usize) -> Result<NonNull<u8>> {
        let addr = self.run_on(entry, move |collector| {
            collector
                .allocate(size)
                .map(|block| block.as_ptr().expose_provenance())
        })??;
        NonNull::new(ptr::with_exposed_provenance_mut(addr)).ok_or(GcError::OutOfMemory { size })
    }

    fn recover_allocation(&self, entry: &Arc<Entry>, size: usize) -> Result<NonNull<u8>> {
        self.stop_the_world(true)?;

        match self.allocate_on(entry, size) {
            Ok(block) => {
                self.metrics.record_oom_recovery();
                log::log_oom(entry.key, size, true);
                Ok(block)
            }
            Err(err) if err.is_out_of_memory() => {
                self.metrics.record_fatal_oom();
                log::log_oom(entry.key, size, false);
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    /// Run one stop-the-world collection.
    ///
    /// If a run is already in flight this returns `None` at once, or after that
    /// run completes when `wait_if_running` is set.
    fn stop_the_world(&self, wait_if_running: bool) -> Result<Option<CollectStats>> {
        {
            let mut run = self.run.lock();
            if run.in_flight {
                if wait_if_running {
                    let epoch = run.epoch;
                    run.waiters += 1;
                    while run.epoch == epoch {
                        self.run_done.wait(&mut run);
                    }
                    run.waiters -= 1;
                } else {
                    log::log_global_already_running();
                }
                return Ok(None);
            }
            run.in_flight = true;
        }

        let gc_id = log::next_gc_id();
        self.collecting.store(true, Ordering::SeqCst);
        self.pool.close_gate();
        self.pool.wait_all();

        let entries = self.snapshot();
        let _span = log::trace_global_collection(gc_id, entries.len());
        let initiator = ThreadKey::current();
        let pause_start = Instant::now();

        let mut paused = Vec::with_capacity(entries.len());
        let mut unpausable = Vec::new();
        let mut failed = Vec::new();
        for entry in entries.iter().filter(|entry| entry.key != initiator) {
            if !entry.participant.is_pausable() {
                unpausable.push(entry.key);
                continue;
            }
            match entry.participant.pause() {
                Ok(Paused::Departed) => {}
                Ok(how) => paused.push((Arc::clone(&entry.participant), how)),
                Err(err) => failed.push((entry.key, err)),
            }
        }

        let tasks: Vec<_> = entries
            .iter()
            .map(|entry| {
                let entry = Arc::clone(entry);
                self.pool
                    .submit_priority(move || entry.collector.lock().collect())
            })
            .collect();

        let mut total = CollectStats::default();
        let mut panicked = false;
        for task in tasks {
            match task.join(&self.pool) {
                Some(stats) => total.absorb(&stats),
                None => panicked = true,
            }
        }

        self.collecting.store(false, Ordering::SeqCst);
        for (participant, how) in &paused {
            participant.resume(*how);
        }
        let pause = pause_start.elapsed();

        {
            let mut run = self.run.lock();
            run.in_flight = false;
            run.epoch += 1;
        }
        self.run_done.notify_all();
        self.pool.open_gate();

        for key in unpausable {
            log::log_unpausable(key);
        }
        for (key, err) in &failed {
            log::log_pause_failed(*key, err);
        }
        self.metrics.record_global(&total, pause);
        log::log_global_collection(&total, paused.len(), pause);

        if panicked {
            return Err(GcError::TaskPanicked);
        }
        Ok(Some(total))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    use crossbeam::channel::unbounded;

    fn wait_until(mut ready: impl FnMut() -> bool) {
        while !ready() {
            thread::yield_now();
        }
    }

    #[test]
    fn test_scope_flags() {
        assert_eq!(CollectScope::try_from(0).unwrap(), CollectScope::ThreadLocal);
        assert_eq!(CollectScope::try_from(1).unwrap(), CollectScope::Global);
        assert!(matches!(
            CollectScope::try_from(2),
            Err(GcError::InvalidScope(2))
        ));
        assert_eq!(CollectScope::Global as i32, GLOBAL);
    }

    #[test]
    fn test_unknown_thread_is_rejected() {
        let manager = Manager::new(GcConfig::default());
        let stranger = ThreadKey::from_raw(1);

        let err = manager.allocate(stranger, 8).unwrap_err();
        assert_eq!(err.errno(), libc::EINVAL);
        assert!(manager.collect(stranger, CollectScope::ThreadLocal).is_err());
        assert!(manager.allocation_count(stranger).is_err());
        assert_eq!(manager.stop(stranger), 0);
        assert_eq!(manager.total_allocation_count(), 0);
    }

    #[test]
    fn test_create_allocate_stop() {
        let manager = Manager::new(GcConfig::default().with_min_workers(2));
        let handle = manager.create().unwrap();
        let key = handle.key();
        assert!(manager.is_registered(key));
        assert_eq!(manager.worker_count(), 3);

        let block = manager.allocate(key, 32).unwrap();
        assert_eq!(manager.allocation_count(key).unwrap(), 1);
        assert!(manager.release(key, block.as_ptr()).unwrap());
        assert!(!manager.release(key, block.as_ptr()).unwrap());

        manager.allocate(key, 16).unwrap();
        assert_eq!(handle.stop(), 1);
        assert!(!manager.is_registered(key));
        assert_eq!(manager.worker_count(), 2);
    }

    #[test]
    fn test_global_collect_alone_uses_no_signals() {
        let manager = Manager::new(GcConfig::default());
        let handle = manager.create().unwrap();
        handle.allocate(64).unwrap();

        let stats = manager.collect_flag(handle.key(), GLOBAL).unwrap();
        assert_eq!(stats.objects_reclaimed, 1);
        assert_eq!(manager.metrics().global_collections, 1);
        assert!(!manager.pool.is_gate_closed());
    }

    #[test]
    fn test_oom_recovery_waits_for_run_in_flight() {
        let manager = Manager::new(GcConfig::default().with_max_heap_bytes(Some(64)));
        let (ready_tx, ready_rx) = unbounded();
        let (go_alloc_tx, go_alloc_rx) = unbounded::<()>();
        let (go_collect_tx, go_collect_rx) = unbounded::<()>();
        let (finish_tx, finish_rx) = unbounded::<()>();
        let (alloc_tx, alloc_rx) = unbounded();
        let (stats_tx, stats_rx) = unbounded();

        thread::scope(|s| {
            let manager = &manager;
            {
                let ready_tx = ready_tx.clone();
                let finish_rx = finish_rx.clone();
                s.spawn(move || {
                    let gc = manager.create().unwrap();
                    let _garbage = gc.allocate(48).unwrap();
                    ready_tx.send(()).unwrap();
                    go_alloc_rx.recv().unwrap();
                    alloc_tx.send(gc.allocate(32).is_ok()).unwrap();
                    finish_rx.recv().unwrap();
                });
            }
            s.spawn(move || {
                let gc = manager.create().unwrap();
                ready_tx.send(()).unwrap();
                go_collect_rx.recv().unwrap();
                stats_tx.send(gc.collect(CollectScope::Global).unwrap()).unwrap();
                finish_rx.recv().unwrap();
            });
            ready_rx.recv().unwrap();
            ready_rx.recv().unwrap();

            // Occupy every worker so the allocation and the run queue up behind them.
            let workers = manager.pool.worker_count();
            let (started_tx, started_rx) = unbounded();
            let (unblock_tx, unblock_rx) = unbounded::<()>();
            let blockers: Vec<_> = (0..workers)
                .map(|_| {
                    let started_tx = started_tx.clone();
                    let unblock_rx = unblock_rx.clone();
                    manager.pool.submit(move || {
                        started_tx.send(()).unwrap();
                        unblock_rx.recv().unwrap();
                    })
                })
                .collect();
            for _ in 0..workers {
                started_rx.recv().unwrap();
            }

            go_alloc_tx.send(()).unwrap();
            wait_until(|| manager.pool.pending_count() == workers + 1);
            go_collect_tx.send(()).unwrap();
            wait_until(|| manager.run.lock().in_flight && manager.pool.is_gate_closed());

            // The freed worker runs the allocation, which fails and waits on the run.
            unblock_tx.send(()).unwrap();
            wait_until(|| manager.run.lock().waiters == 1);
            assert_eq!(manager.metrics().global_collections, 0);

            for _ in 1..workers {
                unblock_tx.send(()).unwrap();
            }
            for blocker in blockers {
                blocker.join(&manager.pool).unwrap();
            }

            let stats = stats_rx.recv().unwrap();
            assert_eq!(stats.objects_reclaimed, 1);
            assert!(alloc_rx.recv().unwrap());

            let metrics = manager.metrics();
            assert_eq!(metrics.global_collections, 1);
            assert_eq!(metrics.oom_recoveries, 1);
            assert_eq!(metrics.fatal_ooms, 0);

            finish_tx.send(()).unwrap();
            finish_tx.send(()).unwrap();
        });
        assert_eq!(manager.total_allocation_count(), 0);
    }
}
