//! An embeddable, conservative, per-thread garbage collector.
//!
//! `rooted-gc` gives every registered OS thread its own collector. A thread's
//! heap is the set of blocks it allocated through the collector, and its roots
//! are storage slots it explicitly registered. Marking starts from the values
//! held in those slots and scans every reachable block conservatively, treating
//! the word at each byte offset as a potential pointer. Unreached blocks are
//! freed by the sweep.
//!
//! # Features
//!
//! - **Explicit roots**: no stack scanning; roots are slots the caller names
//! - **Adaptive threshold**: collectors collect on their own as they grow
//! - **Stop-the-world**: a global collection pauses every other registered
//!   thread and collects every collector
//! - **Out-of-memory recovery**: exhausted allocations retry once after a
//!   global collection
//!
//! # Quick Start
//!
//! ```ignore
//! use rooted_gc::{CollectScope, Manager};
//!
//! let manager = Manager::global();
//! let gc = manager.create()?;
//!
//! let mut slot = gc.allocate(64)?.as_ptr();
//! unsafe { gc.add_root(&raw const slot)? };
//!
//! gc.collect(CollectScope::ThreadLocal)?; // `slot` keeps its block alive
//! gc.remove_root(&raw const slot)?;
//! slot = std::ptr::null_mut();
//! gc.collect(CollectScope::ThreadLocal)?; // block freed
//! ```
//!
//! # Threads
//!
//! Every manager call is executed by a shared pool of worker threads; the
//! calling thread blocks until its task completes. Global collections pause
//! other registered threads with `SIGUSR1`, so this crate is Unix only and a
//! registered thread must stop its collector (drop its [`GcHandle`]) before
//! it exits.

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

mod config;
mod error;
mod handle;
mod handshake;
mod manager;
mod metrics;
mod thread;
mod tracing;

/// Per-thread allocation registry and mark/sweep.
///
/// Public for testing and advanced use cases; most users go through
/// [`Manager`].
pub mod collector;
pub mod pool;
pub mod roots;
pub mod scan;

pub use collector::Collector;
pub use config::{GcConfig, DEFAULT_MIN_WORKERS, DEFAULT_SWEEP_THRESHOLD};
pub use error::{GcError, Result};
pub use handle::GcHandle;
pub use manager::{CollectScope, Manager, GLOBAL, THREAD_LOCAL};
pub use metrics::{CollectStats, GlobalMetrics, MetricsSnapshot};
pub use pool::{Task, TaskId, TaskPool};
pub use thread::ThreadKey;

/// Register the calling thread with the process-wide [`Manager`].
///
/// # Errors
///
/// As [`Manager::create`].
pub fn create() -> Result<GcHandle<'static>> {
    Manager::global().create()
}
