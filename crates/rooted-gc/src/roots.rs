//! Root tracking through registered storage slots.
//!
//! A root is the address of a mutator-owned slot (a local variable or a
//! field) that may hold a pointer into the collector's heap. The set never
//! owns the slot; marking reads its current contents.

use rustc_hash::FxHashSet;

// ============================================================================
// RootSet - registered slot addresses
// ============================================================================

/// The set of slot addresses registered as roots for one collector.
#[derive(Debug, Default)]
pub struct RootSet {
    slots: FxHashSet<usize>,
}

impl RootSet {
    /// Create a new empty root set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a slot. Registering an existing slot is a no-op.
    pub fn insert(&mut self, slot: usize) -> bool {
        self.slots.insert(slot)
    }

    /// Unregister a slot. Unknown slots are ignored.
    pub fn remove(&mut self, slot: usize) -> bool {
        self.slots.remove(&slot)
    }

    /// Whether `slot` is registered.
    #[must_use]
    pub fn contains(&self, slot: usize) -> bool {
        self.slots.contains(&slot)
    }

    /// Get the number of roots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Check if there are no roots.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Iterate over the registered slot addresses.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.slots.iter().copied()
    }

    /// Read the word currently stored in every slot.
    ///
    /// # Safety
    ///
    /// Every registered slot must still be live and readable for
    /// `size_of::<usize>()` bytes.
    pub unsafe fn read_slots(&self) -> impl Iterator<Item = usize> + '_ {
        // SAFETY: the caller guarantees every slot is live.
        self.slots.iter().map(|&slot| unsafe {
            std::ptr::with_exposed_provenance::<usize>(slot).read_unaligned()
        })
    }

    /// Clear all roots.
    pub fn clear(&mut self) {
        self.slots.clear();
    }
}
