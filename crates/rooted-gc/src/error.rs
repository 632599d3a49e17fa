//! Error types for collector operations.

use std::io;

use thiserror::Error;

use crate::thread::ThreadKey;

/// Errors reported by the collection manager.
#[derive(Error, Debug)]
pub enum GcError {
    /// The thread never registered a collector, or already stopped it.
    #[error("thread {0} has no registered collector")]
    InvalidThread(ThreadKey),

    /// `collect` was called with a flag other than `THREAD_LOCAL` or `GLOBAL`.
    #[error("invalid collection scope flag {0}")]
    InvalidScope(i32),

    /// Memory could not be obtained even after a recovery collection.
    #[error("out of memory allocating {size} bytes")]
    OutOfMemory {
        /// Requested size in bytes.
        size: usize,
    },

    /// A pool worker thread could not be spawned.
    #[error("failed to spawn collector worker: {0}")]
    WorkerSpawn(#[source] io::Error),

    /// The task running the operation panicked on its worker.
    #[error("collector task panicked")]
    TaskPanicked,
}

impl GcError {
    /// The errno-style code for this error.
    #[must_use]
    pub const fn errno(&self) -> i32 {
        match self {
            Self::InvalidThread(_) | Self::InvalidScope(_) => libc::EINVAL,
            Self::OutOfMemory { .. } => libc::ENOMEM,
            Self::WorkerSpawn(_) => libc::EAGAIN,
            Self::TaskPanicked => libc::EIO,
        }
    }

    /// Whether this error signals memory exhaustion.
    #[must_use]
    pub const fn is_out_of_memory(&self) -> bool {
        matches!(self, Self::OutOfMemory { .. })
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, GcError>;
