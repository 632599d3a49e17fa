//! Cooperative pause/resume handshake for stop-the-world runs.
//!
//! Every registered thread owns a [`Participant`] whose state records where
//! the thread is:
//!
//! | State        | Meaning                                              |
//! |--------------|------------------------------------------------------|
//! | `RUNNING`    | Executing mutator code outside the manager           |
//! | `IN_LIBRARY` | Inside a manager call                                |
//! | `HELD`       | Inside a manager call, pinned by a global run        |
//! | `PARKED`     | Spinning inside the pause-signal handler             |
//! | `DEPARTED`   | Detached from its thread; never paused again         |
//!
//! The initiator of a global run pins `IN_LIBRARY` threads directly
//! (`IN_LIBRARY -> HELD`); they block on [`RESUME_CV`] when they try to leave
//! the manager. `RUNNING` threads get a pause signal; the handler moves them to
//! `PARKED`, which is the acknowledgment the initiator waits for. A thread is
//! therefore never parked while holding one of the manager's locks.
//!
//! The handler only touches atomics and `nanosleep`, both async-signal-safe.

use std::cell::Cell;
use std::io;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use crossbeam::utils::Backoff;
use parking_lot::{Condvar, Mutex};

use crate::thread::ThreadKey;

/// Signal used to pause mutator threads.
pub const PAUSE_SIGNAL: libc::c_int = libc::SIGUSR1;

const RUNNING: u8 = 0;
const IN_LIBRARY: u8 = 1;
const HELD: u8 = 2;
const PARKED: u8 = 3;
const DEPARTED: u8 = 4;

/// How long a parked handler or waiting initiator sleeps once spinning is exhausted.
const NAP: Duration = Duration::from_micros(50);

static RESUME_LOCK: Mutex<()> = Mutex::new(());
static RESUME_CV: Condvar = Condvar::new();

thread_local! {
    /// The calling thread's participant. Holds one leaked strong reference.
    static CURRENT: Cell<*const Participant> = const { Cell::new(ptr::null()) };
}

// ============================================================================
// Participant
// ============================================================================

/// Handshake state of one registered thread.
#[derive(Debug)]
pub struct Participant {
    key: ThreadKey,
    state: AtomicU8,
    pausable: bool,
    collecting: Arc<AtomicBool>,
    /// Set by `detach`; the next library exit moves to `DEPARTED`.
    departed: AtomicBool,
}

/// How a participant was stopped by [`Participant::pause`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Paused {
    /// Pinned inside a manager call.
    Held,
    /// Parked in the signal handler.
    Parked,
    /// Already detached from its thread; nothing to resume.
    Departed,
}

impl Participant {
    /// Create a participant for `key`. It starts inside the manager, since
    /// registration itself is a manager call.
    #[must_use]
    pub fn new(key: ThreadKey, pausable: bool, collecting: Arc<AtomicBool>) -> Arc<Self> {
        Arc::new(Self {
            key,
            state: AtomicU8::new(IN_LIBRARY),
            pausable,
            collecting,
            departed: AtomicBool::new(false),
        })
    }

    /// Whether global runs can pause this thread.
    #[must_use]
    pub const fn is_pausable(&self) -> bool {
        self.pausable
    }

    /// Leave the manager, blocking while a global run holds this thread.
    pub fn leave_library(&self) {
        let exit = if self.departed.load(Ordering::SeqCst) {
            DEPARTED
        } else {
            RUNNING
        };
        loop {
            match self.state.compare_exchange(
                IN_LIBRARY,
                exit,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return,
                Err(HELD) => {
                    let mut guard = RESUME_LOCK.lock();
                    while self.state.load(Ordering::SeqCst) == HELD {
                        RESUME_CV.wait(&mut guard);
                    }
                }
                // Already outside the manager.
                Err(_) => return,
            }
        }
    }

    /// Stop this thread for a global run. Called by the initiator only.
    ///
    /// # Errors
    ///
    /// Returns the `pthread_kill` error if the pause signal cannot be delivered.
    pub fn pause(&self) -> io::Result<Paused> {
        let backoff = Backoff::new();
        let mut signalled = false;

        loop {
            match self.state.load(Ordering::SeqCst) {
                IN_LIBRARY => {
                    if self
                        .state
                        .compare_exchange(IN_LIBRARY, HELD, Ordering::SeqCst, Ordering::SeqCst)
                        .is_ok()
                    {
                        return Ok(Paused::Held);
                    }
                    continue;
                }
                HELD => return Ok(Paused::Held),
                PARKED => return Ok(Paused::Parked),
                DEPARTED => return Ok(Paused::Departed),
                _ => {
                    if !signalled {
                        send_pause_signal(self.key)?;
                        signalled = true;
                    }
                }
            }

            if backoff.is_completed() {
                std::thread::sleep(NAP);
            } else {
                backoff.snooze();
            }
        }
    }

    /// Release a thread stopped by [`pause`](Self::pause).
    pub fn resume(&self, how: Paused) {
        match how {
            Paused::Held => {
                let _guard = RESUME_LOCK.lock();
                let _ = self.state.compare_exchange(
                    HELD,
                    IN_LIBRARY,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                );
                RESUME_CV.notify_all();
            }
            Paused::Parked => {
                let _ =
                    self.state
                        .compare_exchange(PARKED, RUNNING, Ordering::SeqCst, Ordering::SeqCst);
            }
            Paused::Departed => {}
        }
    }

    /// Body of the pause-signal handler for this thread.
    fn park_from_signal(&self) {
        if !self.collecting.load(Ordering::SeqCst) {
            return;
        }
        if self
            .state
            .compare_exchange(RUNNING, PARKED, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let backoff = Backoff::new();
        while self.state.load(Ordering::SeqCst) == PARKED && self.collecting.load(Ordering::SeqCst)
        {
            if backoff.is_completed() {
                nap();
            } else {
                backoff.snooze();
            }
        }
        let _ = self
            .state
            .compare_exchange(PARKED, RUNNING, Ordering::SeqCst, Ordering::SeqCst);
    }

    #[cfg(test)]
    fn state(&self) -> u8 {
        self.state.load(Ordering::SeqCst)
    }
}

// ============================================================================
// Thread binding
// ============================================================================

/// Bind `participant` to the calling thread and unblock the pause signal.
pub fn attach(participant: &Arc<Participant>) {
    let new = Arc::into_raw(Arc::clone(participant));
    let old = CURRENT.with(|current| current.replace(new));
    if !old.is_null() {
        // SAFETY: `old` came from `Arc::into_raw` in a previous `attach`.
        drop(unsafe { Arc::from_raw(old) });
    }
    unblock_pause_signal();
}

/// Unbind `participant` from the calling thread if it is the bound one.
///
/// When the calling thread next leaves the manager the participant becomes
/// `DEPARTED`, and global runs stop waiting for it.
pub fn detach(participant: &Arc<Participant>) {
    let bound = CURRENT.with(Cell::get);
    if ptr::eq(bound, Arc::as_ptr(participant)) {
        participant.departed.store(true, Ordering::SeqCst);
        CURRENT.with(|current| current.set(ptr::null()));
        // SAFETY: `bound` came from `Arc::into_raw` in `attach`.
        drop(unsafe { Arc::from_raw(bound) });
    }
}

/// The participant bound to the calling thread, if any.
#[must_use]
pub fn current() -> Option<Arc<Participant>> {
    let bound = CURRENT.with(Cell::get);
    if bound.is_null() {
        return None;
    }
    // SAFETY: `CURRENT` owns one strong reference while non-null.
    unsafe {
        Arc::increment_strong_count(bound);
        Some(Arc::from_raw(bound))
    }
}

/// Marks the calling thread as inside the manager for its lifetime.
///
/// Only the outermost guard on a thread changes state, so nested manager
/// calls are fine.
#[must_use = "the thread leaves the manager when the guard drops"]
pub struct LibraryGuard {
    participant: Option<Arc<Participant>>,
}

impl LibraryGuard {
    /// Enter the manager on the calling thread.
    pub fn enter() -> Self {
        let participant = current().filter(|p| {
            if p.state.load(Ordering::SeqCst) == RUNNING {
                p.state.store(IN_LIBRARY, Ordering::SeqCst);
                true
            } else {
                false
            }
        });
        Self { participant }
    }

    /// Adopt a participant that was created in the `IN_LIBRARY` state.
    pub const fn adopt(participant: Arc<Participant>) -> Self {
        Self {
            participant: Some(participant),
        }
    }
}

impl Drop for LibraryGuard {
    fn drop(&mut self) {
        if let Some(participant) = self.participant.take() {
            participant.leave_library();
        }
    }
}

// ============================================================================
// Signal plumbing
// ============================================================================

/// Install the process-wide pause handler. Only the first call does work.
///
/// # Errors
///
/// Returns the `sigaction` error, on this and every later call, if
/// installation failed.
pub fn install_handler() -> io::Result<()> {
    static INSTALLED: OnceLock<Option<i32>> = OnceLock::new();

    let failure = INSTALLED.get_or_init(|| {
        // SAFETY: the action is fully initialised and the handler is
        // async-signal-safe.
        unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = on_pause_signal as libc::sighandler_t;
            action.sa_flags = libc::SA_RESTART;
            libc::sigemptyset(&raw mut action.sa_mask);

            if libc::sigaction(PAUSE_SIGNAL, &raw const action, ptr::null_mut()) == 0 {
                None
            } else {
                Some(io::Error::last_os_error().raw_os_error().unwrap_or(libc::EINVAL))
            }
        }
    });

    match failure {
        None => Ok(()),
        Some(code) => Err(io::Error::from_raw_os_error(*code)),
    }
}

fn send_pause_signal(key: ThreadKey) -> io::Result<()> {
    // SAFETY: `key` names a registered thread, which must not have exited
    // without stopping its collector.
    let rc = unsafe { libc::pthread_kill(key.as_pthread(), PAUSE_SIGNAL) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::from_raw_os_error(rc))
    }
}

fn unblock_pause_signal() {
    // SAFETY: the set is initialised before use.
    unsafe {
        let mut set: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&raw mut set);
        libc::sigaddset(&raw mut set, PAUSE_SIGNAL);
        libc::pthread_sigmask(libc::SIG_UNBLOCK, &raw const set, ptr::null_mut());
    }
}

extern "C" fn on_pause_signal(_signal: libc::c_int) {
    let _errno = ErrnoGuard::save();
    let bound = CURRENT.try_with(Cell::get).unwrap_or(ptr::null());
    if bound.is_null() {
        return;
    }
    // SAFETY: `CURRENT` owns a strong reference while non-null, and `detach`
    // clears it before releasing that reference.
    let participant = unsafe { &*bound };
    participant.park_from_signal();
}

#[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
fn nap() {
    let ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: NAP.as_nanos() as libc::c_long,
    };
    // SAFETY: `ts` is a valid timespec; the remainder pointer may be null.
    unsafe {
        libc::nanosleep(&raw const ts, ptr::null_mut());
    }
}

/// Restores `errno` on drop so the interrupted code never observes the
/// handler's system calls.
struct ErrnoGuard(Option<libc::c_int>);

impl ErrnoGuard {
    fn save() -> Self {
        Self(errno_location().map(|loc| unsafe { *loc }))
    }
}

impl Drop for ErrnoGuard {
    fn drop(&mut self) {
        if let (Some(saved), Some(loc)) = (self.0, errno_location()) {
            // SAFETY: `loc` is this thread's errno slot.
            unsafe { *loc = saved };
        }
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn errno_location() -> Option<*mut libc::c_int> {
    // SAFETY: always returns this thread's errno slot.
    Some(unsafe { libc::__errno_location() })
}

#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
fn errno_location() -> Option<*mut libc::c_int> {
    // SAFETY: always returns this thread's errno slot.
    Some(unsafe { libc::__error() })
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd"
)))]
const fn errno_location() -> Option<*mut libc::c_int> {
    None
}
