use std::io::{self, Error};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Returns the system page size, cached atomically.
pub fn page_size() -> usize {
    static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

    match PAGE_SIZE.load(Ordering::Relaxed) {
        0 => {
            #[allow(clippy::cast_sign_loss)]
            let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize };
            PAGE_SIZE.store(page_size, Ordering::Relaxed);
            page_size
        }
        page_size => page_size,
    }
}

/// Zeroed memory from the C heap.
pub fn heap_zeroed(len: usize) -> io::Result<NonNull<u8>> {
    // SAFETY: `calloc` has no preconditions; a null return is handled below.
    let ptr = unsafe { libc::calloc(1, len) };
    NonNull::new(ptr.cast::<u8>()).ok_or_else(|| Error::from(io::ErrorKind::OutOfMemory))
}

/// # Safety
///
/// `ptr` must come from [`heap_zeroed`] and not have been freed.
pub unsafe fn heap_free(ptr: NonNull<u8>) {
    unsafe { libc::free(ptr.as_ptr().cast()) };
}

/// Zeroed memory from a private anonymous mapping.
///
/// # Safety
///
/// `len` must be non-zero.
pub unsafe fn map_zeroed(len: usize) -> io::Result<NonNull<u8>> {
    let flags = libc::MAP_PRIVATE | libc::MAP_ANON;
    let prot = libc::PROT_READ | libc::PROT_WRITE;

    let ptr = unsafe { libc::mmap(ptr::null_mut(), len, prot, flags, -1, 0) };
    if ptr == libc::MAP_FAILED {
        return Err(Error::last_os_error());
    }

    NonNull::new(ptr.cast::<u8>()).ok_or_else(|| Error::from(io::ErrorKind::OutOfMemory))
}

/// # Safety
///
/// `ptr` and `len` must describe a live mapping from [`map_zeroed`].
pub unsafe fn unmap(ptr: NonNull<u8>, len: usize) {
    unsafe {
        libc::munmap(ptr.as_ptr().cast(), len);
    }
}
