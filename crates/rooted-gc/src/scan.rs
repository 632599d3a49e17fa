//! Conservative scanning of arbitrary memory regions.

const WORD: usize = std::mem::size_of::<usize>();

/// Scan a memory region conservatively for potential heap pointers.
///
/// Every byte offset whose word fits inside the region is read as a candidate
/// pointer and passed to `visit`. No alignment is assumed, so a pointer stored
/// at any offset is found. Regions shorter than one word are skipped.
///
/// # Safety
///
/// `region_ptr` must be valid for reading `region_len` bytes.
pub unsafe fn scan_region<F>(region_ptr: *const u8, region_len: usize, mut visit: F)
where
    F: FnMut(usize),
{
    if region_ptr.is_null() || region_len < WORD {
        return;
    }

    for offset in 0..=region_len - WORD {
        // SAFETY: `offset + WORD <= region_len` and the caller guarantees the
        // region is readable. The read is unaligned on purpose.
        let candidate = unsafe { region_ptr.add(offset).cast::<usize>().read_unaligned() };
        visit(candidate);
    }
}
