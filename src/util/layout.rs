//! Alignment helpers.

/// Size of a shadow granule: one shadow byte describes this many bytes.
pub const GRANULE_SIZE: usize = 8;

/// log2 of [`GRANULE_SIZE`].
pub const GRANULE_SHIFT: usize = 3;

/// Align a size up to the given alignment.
#[inline]
pub const fn align_up(size: usize, align: usize) -> usize {
    (size + align - 1) & !(align - 1)
}

/// Align a size down to the given alignment.
#[inline]
pub const fn align_down(size: usize, align: usize) -> usize {
    size & !(align - 1)
}

/// Check whether `value` is a multiple of `align`.
#[inline]
pub const fn is_aligned(value: usize, align: usize) -> bool {
    value & (align - 1) == 0
}

/// Round a size up to a whole number of granules.
#[inline]
pub const fn granule_align(size: usize) -> usize {
    align_up(size, GRANULE_SIZE)
}
