//! Thread-bound handle returned by [`Manager::create`].

use std::fmt;
use std::marker::PhantomData;
use std::ptr::NonNull;

use crate::error::Result;
use crate::manager::{CollectScope, Manager};
use crate::metrics::CollectStats;
use crate::thread::ThreadKey;

/// A registered thread's view of its collector.
///
/// Dropping an owning handle stops the collector and frees everything it
/// still holds. A handle from a duplicate [`Manager::create`] is inert: it
/// operates on the same collector but never stops it.
///
/// The handle cannot leave its thread.
pub struct GcHandle<'m> {
    manager: &'m Manager,
    key: ThreadKey,
    owned: bool,
    _not_send: PhantomData<*const ()>,
}

impl<'m> GcHandle<'m> {
    pub(crate) const fn owned(manager: &'m Manager, key: ThreadKey) -> Self {
        Self {
            manager,
            key,
            owned: true,
            _not_send: PhantomData,
        }
    }

    pub(crate) const fn inert(manager: &'m Manager, key: ThreadKey) -> Self {
        Self {
            manager,
            key,
            owned: false,
            _not_send: PhantomData,
        }
    }

    /// The thread this handle is bound to.
    #[must_use]
    pub const fn key(&self) -> ThreadKey {
        self.key
    }

    /// Whether dropping this handle stops the collector.
    #[must_use]
    pub const fn is_owner(&self) -> bool {
        self.owned
    }

    /// The manager this handle belongs to.
    #[must_use]
    pub const fn manager(&self) -> &'m Manager {
        self.manager
    }

    /// See [`Manager::allocate`].
    ///
    /// # Errors
    ///
    /// As [`Manager::allocate`].
    pub fn allocate(&self, size: usize) -> Result<NonNull<u8>> {
        self.manager.allocate(self.key, size)
    }

    /// See [`Manager::release`].
    ///
    /// # Errors
    ///
    /// As [`Manager::release`].
    pub fn release(&self, ptr: *mut u8) -> Result<bool> {
        self.manager.release(self.key, ptr)
    }

    /// See [`Manager::add_root`].
    ///
    /// # Errors
    ///
    /// As [`Manager::add_root`].
    ///
    /// # Safety
    ///
    /// As [`Manager::add_root`].
    pub unsafe fn add_root(&self, slot: *const *mut u8) -> Result<()> {
        // SAFETY: forwarded to the caller.
        unsafe { self.manager.add_root(self.key, slot) }
    }

    /// See [`Manager::remove_root`].
    ///
    /// # Errors
    ///
    /// As [`Manager::remove_root`].
    pub fn remove_root(&self, slot: *const *mut u8) -> Result<()> {
        self.manager.remove_root(self.key, slot)
    }

    /// See [`Manager::collect`].
    ///
    /// # Errors
    ///
    /// As [`Manager::collect`].
    pub fn collect(&self, scope: CollectScope) -> Result<CollectStats> {
        self.manager.collect(self.key, scope)
    }

    /// Live allocations of this thread's collector.
    #[must_use]
    pub fn allocation_count(&self) -> usize {
        self.manager.allocation_count(self.key).unwrap_or(0)
    }

    /// Registered roots of this thread's collector.
    #[must_use]
    pub fn root_count(&self) -> usize {
        self.manager.root_count(self.key).unwrap_or(0)
    }

    /// Stop the collector now, returning how many allocations were freed.
    ///
    /// An inert handle frees nothing.
    pub fn stop(mut self) -> usize {
        if !self.owned {
            return 0;
        }
        self.owned = false;
        self.manager.stop(self.key)
    }
}

impl Drop for GcHandle<'_> {
    fn drop(&mut self) {
        if self.owned {
            self.manager.stop(self.key);
        }
    }
}

impl fmt::Debug for GcHandle<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GcHandle")
            .field("key", &self.key)
            .field("owned", &self.owned)
            .finish_non_exhaustive()
    }
}
