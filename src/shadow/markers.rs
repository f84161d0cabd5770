//! Shadow byte values.
//!
//! A shadow byte of `0` means the whole granule is addressable, `1..=7`
//! means only that many leading bytes are addressable, and every other
//! value marks the whole granule as non-addressable. The distinct
//! non-addressable values let error diagnosis tell redzones, freed memory
//! and runtime-internal memory apart.

/// Every byte of the granule is addressable.
pub const HEAP_ADDRESSABLE: u8 = 0x00;

/// Generic non-addressable granule.
pub const HEAP_NON_ACCESSIBLE: u8 = 0xFF;

/// Memory owned by the runtime itself (stack-cache pages and the like).
pub const ASAN_MEMORY: u8 = 0xF1;

/// Address space that is never valid to touch (the low 64 KiB).
pub const INVALID_ADDRESS: u8 = 0xF2;

/// Left redzone of a heap block, including the block header.
pub const HEAP_LEFT_REDZONE: u8 = 0xFA;

/// Right redzone of a heap block: padding and trailer.
pub const HEAP_RIGHT_REDZONE: u8 = 0xFB;

/// Former user data of a block sitting in quarantine.
pub const HEAP_FREED: u8 = 0xFD;

/// Returns true for the partial-addressability values `1..=7`.
#[inline]
pub const fn is_partially_addressable(marker: u8) -> bool {
    marker >= 1 && marker <= 7
}

/// Short human-readable name of a marker, used by the shadow legend.
pub fn describe(marker: u8) -> &'static str {
    match marker {
        HEAP_ADDRESSABLE => "addressable",
        m if is_partially_addressable(m) => "partially addressable",
        ASAN_MEMORY => "runtime internal memory",
        INVALID_ADDRESS => "invalid address",
        HEAP_LEFT_REDZONE => "heap left redzone",
        HEAP_RIGHT_REDZONE => "heap right redzone",
        HEAP_FREED => "freed heap region",
        _ => "non-addressable",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_range() {
        assert!(!is_partially_addressable(HEAP_ADDRESSABLE));
        for m in 1..=7 {
            assert!(is_partially_addressable(m));
        }
        assert!(!is_partially_addressable(8));
        assert!(!is_partially_addressable(HEAP_FREED));
    }

    #[test]
    fn test_describe_distinguishes_markers() {
        assert_eq!(describe(HEAP_FREED), "freed heap region");
        assert_eq!(describe(3), "partially addressable");
        assert_ne!(describe(HEAP_LEFT_REDZONE), describe(HEAP_RIGHT_REDZONE));
        assert_eq!(describe(0x42), "non-addressable");
    }
}
