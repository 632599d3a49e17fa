//! Zero-initialised raw memory blocks.
//!
//! A [`RawBlock`] owns exactly one OS-level allocation. Small blocks come from
//! the C heap; blocks of at least [`MAP_THRESHOLD`] bytes are served by an
//! anonymous private mapping so they go straight back to the OS when freed.

use std::io;
use std::ptr::NonNull;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use unix as os;

pub use os::page_size;

/// Requests of this many bytes or more are backed by an anonymous mapping.
pub const MAP_THRESHOLD: usize = 128 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Backing {
    Heap,
    Mapped { mapped_len: usize },
}

/// An owned, zero-filled block of raw memory.
///
/// The block is released when this handle is dropped. Its address never
/// changes for as long as the handle lives.
#[derive(Debug)]
pub struct RawBlock {
    ptr: NonNull<u8>,
    len: usize,
    backing: Backing,
}

impl RawBlock {
    /// Allocates a zeroed block of `len` bytes.
    ///
    /// A zero-length request yields a one-byte block so that every live block
    /// has a distinct address.
    ///
    /// # Errors
    ///
    /// Returns `ErrorKind::OutOfMemory` if the C heap cannot satisfy the
    /// request, or the OS error if the mapping fails.
    pub fn allocate(len: usize) -> io::Result<Self> {
        let len = len.max(1);
        if len >= MAP_THRESHOLD {
            let mapped_len = round_to_page(len)
                .ok_or_else(|| io::Error::from(io::ErrorKind::OutOfMemory))?;
            // SAFETY: `mapped_len` is non-zero and page aligned.
            let ptr = unsafe { os::map_zeroed(mapped_len)? };
            Ok(Self {
                ptr,
                len,
                backing: Backing::Mapped { mapped_len },
            })
        } else {
            let ptr = os::heap_zeroed(len)?;
            Ok(Self {
                ptr,
                len,
                backing: Backing::Heap,
            })
        }
    }

    /// Start of the block.
    #[must_use]
    pub const fn ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Start of the block as a non-null pointer.
    #[must_use]
    pub const fn as_non_null(&self) -> NonNull<u8> {
        self.ptr
    }

    /// Start of the block as an integer address.
    #[must_use]
    pub fn addr(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    /// Usable length of the block in bytes.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Always `false`; zero-length requests are rounded up to one byte.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether this block is served by an anonymous mapping.
    #[must_use]
    pub const fn is_mapped(&self) -> bool {
        matches!(self.backing, Backing::Mapped { .. })
    }
}

impl Drop for RawBlock {
    fn drop(&mut self) {
        // SAFETY: the pointer came from the matching allocation routine and is
        // released exactly once.
        unsafe {
            match self.backing {
                Backing::Heap => os::heap_free(self.ptr),
                Backing::Mapped { mapped_len } => os::unmap(self.ptr, mapped_len),
            }
        }
    }
}

// SAFETY: a `RawBlock` is a uniquely owned allocation with no thread affinity.
unsafe impl Send for RawBlock {}
// SAFETY: shared references only expose the address and length.
unsafe impl Sync for RawBlock {}

fn round_to_page(len: usize) -> Option<usize> {
    let page = page_size();
    len.checked_add(page - 1).map(|n| n & !(page - 1))
}
