//! Task-serialization engine.
//!
//! A growable pool of worker threads pulling boxed tasks from one FIFO queue.
//! Ordinary submissions pass through an admission gate that can be closed;
//! priority submissions bypass it. Combined with [`TaskPool::wait_all`], the
//! gate gives the manager its safepoint: once the gate is closed and the pool
//! drained, no ordinary task is queued or running anywhere.

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{bounded, Receiver};
use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashSet;

/// Identifier of a submitted task. Ids increase monotonically per pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    /// The raw id.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A submitted task and the channel its result arrives on.
#[must_use = "a task's result is only observable through its handle"]
pub struct Task<R> {
    id: TaskId,
    result: Receiver<R>,
}

impl<R> Task<R> {
    /// The task's id.
    pub const fn id(&self) -> TaskId {
        self.id
    }

    /// Block until the task completes and take its result.
    ///
    /// Returns `None` if the task panicked.
    pub fn join(self, pool: &TaskPool) -> Option<R> {
        pool.wait(self.id);
        self.result.try_recv().ok()
    }
}

type Job = Box<dyn FnOnce() + Send + 'static>;

struct QueuedJob {
    id: TaskId,
    run: Job,
}

struct PoolState {
    queue: VecDeque<QueuedJob>,
    /// Ids issued but not yet completed, queued or running.
    pending: FxHashSet<TaskId>,
    next_id: u64,
    gate_closed: bool,
    shutdown: bool,
    /// Workers currently running their loop.
    live: usize,
    /// Workers the pool should have.
    target: usize,
    /// Workers ever spawned; numbers worker thread names.
    spawned: usize,
}

struct Shared {
    state: Mutex<PoolState>,
    /// Signalled when a job is queued or the worker target drops.
    work: Condvar,
    /// Signalled when a job completes.
    done: Condvar,
    /// Signalled when the admission gate opens.
    gate: Condvar,
}

/// A pool of workers executing tasks in FIFO order.
pub struct TaskPool {
    shared: Arc<Shared>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskPool {
    /// Create a pool with no workers. Call [`grow`](Self::grow) before
    /// submitting work.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(PoolState {
                    queue: VecDeque::new(),
                    pending: FxHashSet::default(),
                    next_id: 0,
                    gate_closed: false,
                    shutdown: false,
                    live: 0,
                    target: 0,
                    spawned: 0,
                }),
                work: Condvar::new(),
                done: Condvar::new(),
                gate: Condvar::new(),
            }),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Create a pool with `workers` workers.
    ///
    /// # Errors
    ///
    /// Returns the spawn error if a worker thread cannot be started.
    pub fn with_workers(workers: usize) -> io::Result<Self> {
        let pool = Self::new();
        for _ in 0..workers {
            pool.grow()?;
        }
        Ok(pool)
    }

    // ========================================================================
    // Submission
    // ========================================================================

    /// Queue `f`, first blocking the caller while the admission gate is closed.
    pub fn submit<F, R>(&self, f: F) -> Task<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        self.enqueue(f, false)
    }

    /// Queue `f` regardless of the admission gate.
    pub fn submit_priority<F, R>(&self, f: F) -> Task<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        self.enqueue(f, true)
    }

    fn enqueue<F, R>(&self, f: F, priority: bool) -> Task<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = bounded(1);
        let run: Job = Box::new(move || {
            // The receiver may already be gone for fire-and-forget tasks.
            let _ = tx.send(f());
        });

        let mut state = self.shared.state.lock();
        if !priority {
            while state.gate_closed {
                self.shared.gate.wait(&mut state);
            }
        }
        let id = TaskId(state.next_id);
        state.next_id += 1;
        state.pending.insert(id);
        state.queue.push_back(QueuedJob { id, run });
        drop(state);

        self.shared.work.notify_one();
        Task { id, result: rx }
    }

    // ========================================================================
    // Completion
    // ========================================================================

    /// Block until task `id` has completed.
    pub fn wait(&self, id: TaskId) {
        let mut state = self.shared.state.lock();
        while state.pending.contains(&id) {
            self.shared.done.wait(&mut state);
        }
    }

    /// Block until the queue is empty and every issued task has completed.
    pub fn wait_all(&self) {
        let mut state = self.shared.state.lock();
        while !state.pending.is_empty() {
            self.shared.done.wait(&mut state);
        }
    }

    /// Number of issued tasks that have not completed.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.shared.state.lock().pending.len()
    }

    // ========================================================================
    // Admission gate
    // ========================================================================

    /// Stop admitting ordinary submissions. Queued and priority tasks still run.
    pub fn close_gate(&self) {
        self.shared.state.lock().gate_closed = true;
    }

    /// Admit ordinary submissions again and wake every blocked submitter.
    pub fn open_gate(&self) {
        self.shared.state.lock().gate_closed = false;
        self.shared.gate.notify_all();
    }

    /// Whether the admission gate is closed.
    #[must_use]
    pub fn is_gate_closed(&self) -> bool {
        self.shared.state.lock().gate_closed
    }

    // ========================================================================
    // Workers
    // ========================================================================

    /// Add one worker.
    ///
    /// # Errors
    ///
    /// Returns the spawn error if the thread cannot be started; the worker
    /// target is left unchanged in that case.
    pub fn grow(&self) -> io::Result<()> {
        let mut handles = self.handles.lock();
        handles.retain(|h| !h.is_finished());

        let index = {
            let mut state = self.shared.state.lock();
            state.target += 1;
            state.live += 1;
            state.spawned += 1;
            state.spawned
        };

        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name(format!("rooted-gc-worker-{index}"))
            .spawn(move || worker_loop(&shared));

        match spawned {
            Ok(handle) => {
                handles.push(handle);
                Ok(())
            }
            Err(err) => {
                let mut state = self.shared.state.lock();
                state.target -= 1;
                state.live -= 1;
                Err(err)
            }
        }
    }

    /// Retire one worker, never going below `floor` workers.
    ///
    /// The retiring worker finishes its current task before exiting.
    pub fn retire(&self, floor: usize) {
        let mut state = self.shared.state.lock();
        if state.target > floor.max(1) {
            state.target -= 1;
            drop(state);
            self.shared.work.notify_all();
        }
    }

    /// Number of workers the pool is sized for.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.shared.state.lock().target
    }
}

impl Default for TaskPool {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TaskPool {
    fn drop(&mut self) {
        self.shared.state.lock().shutdown = true;
        self.shared.work.notify_all();
        for handle in self.handles.get_mut().drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop(shared: &Shared) {
    loop {
        let job = {
            let mut state = shared.state.lock();
            loop {
                if state.live > state.target || (state.shutdown && state.queue.is_empty()) {
                    state.live -= 1;
                    return;
                }
                if let Some(job) = state.queue.pop_front() {
                    break job;
                }
                shared.work.wait(&mut state);
            }
        };

        let QueuedJob { id, run } = job;
        if catch_unwind(AssertUnwindSafe(run)).is_err() {
            crate::tracing::internal::log_task_panicked(id.get());
        }

        shared.state.lock().pending.remove(&id);
        shared.done.notify_all();
    }
}
