//! Alignment arithmetic shared by the reader and writer.

/// Aligns an offset up to the given alignment boundary.
/// Returns `None` if the aligned offset does not fit in a `u64`.
#[inline]
pub fn align_up(offset: u64, alignment: u64) -> Option<u64> {
    if alignment <= 1 {
        return Some(offset);
    }
    match offset % alignment {
        0 => Some(offset),
        rem => offset.checked_add(alignment - rem),
    }
}

/// Aligns an offset up to the given alignment boundary.
/// Returns (aligned_offset, padding_bytes), or `None` on overflow.
#[inline]
pub fn align_offset_to(current_offset: u64, alignment: u64) -> Option<(u64, u64)> {
    let aligned = align_up(current_offset, alignment)?;
    Some((aligned, aligned - current_offset))
}

/// Returns true if `alignment` is a usable container alignment.
#[inline]
pub const fn is_valid_alignment(alignment: u64) -> bool {
    alignment.is_power_of_two()
}
