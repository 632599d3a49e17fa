//! OS thread identity.

use std::fmt;

/// Identity of an OS thread, as used to key the collector registry.
///
/// Wraps the thread's `pthread_t`, which is also the target for pause signals.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadKey(usize);

impl ThreadKey {
    /// The calling thread's identity.
    #[must_use]
    pub fn current() -> Self {
        // SAFETY: `pthread_self` has no preconditions.
        #[allow(clippy::cast_possible_truncation, clippy::useless_conversion)]
        let raw = unsafe { libc::pthread_self() } as usize;
        Self(raw)
    }

    /// Build a key from a raw `pthread_t` value.
    #[must_use]
    pub const fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    /// The raw `pthread_t` value.
    #[must_use]
    pub const fn as_raw(self) -> usize {
        self.0
    }

    #[allow(clippy::useless_conversion, clippy::unnecessary_cast)]
    pub(crate) fn as_pthread(self) -> libc::pthread_t {
        self.0 as libc::pthread_t
    }
}

impl fmt::Debug for ThreadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ThreadKey({:#x})", self.0)
    }
}

impl fmt::Display for ThreadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_is_stable_and_distinct() {
        let here = ThreadKey::current();
        assert_eq!(here, ThreadKey::current());

        let there = std::thread::spawn(ThreadKey::current).join().unwrap();
        assert_ne!(here, there);
    }

    #[test]
    fn test_raw_round_trip() {
        let key = ThreadKey::from_raw(0xdead);
        assert_eq!(key.as_raw(), 0xdead);
        assert_eq!(format!("{key}"), "0xdead");
    }
}
