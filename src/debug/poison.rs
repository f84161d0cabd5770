//! Byte patterns written into block redzones.
//!
//! Redzone bytes are never valid to read, so their content does not matter
//! to the program. Filling them with fixed patterns makes block boundaries
//! easy to spot in a memory dump and lets corruption of a redzone be
//! detected after the fact. Freed user data is never filled: quarantined
//! blocks keep their last contents.

/// Pattern used for the left redzone, after the header fields.
pub const LEFT_REDZONE_PATTERN: u8 = 0xFA;

/// Pattern used for the right redzone padding.
pub const RIGHT_REDZONE_PATTERN: u8 = 0xFB;

/// Pattern written over a region released back to the system.
pub const RELEASED_PATTERN: u8 = 0xCD;

/// Fill a left redzone region.
///
/// # Safety
///
/// The memory region must be valid and writable.
pub unsafe fn fill_left_redzone(ptr: *mut u8, size: usize) {
    std::ptr::write_bytes(ptr, LEFT_REDZONE_PATTERN, size);
}

/// Fill a right redzone region.
///
/// # Safety
///
/// The memory region must be valid and writable.
pub unsafe fn fill_right_redzone(ptr: *mut u8, size: usize) {
    std::ptr::write_bytes(ptr, RIGHT_REDZONE_PATTERN, size);
}

/// Scribble over a region about to be released to the system.
///
/// # Safety
///
/// The memory region must be valid and writable.
pub unsafe fn poison_released(ptr: *mut u8, size: usize) {
    std::ptr::write_bytes(ptr, RELEASED_PATTERN, size);
}

/// Returns true if every byte of the region equals `pattern`.
///
/// # Safety
///
/// The memory region must be valid for reads.
pub unsafe fn is_filled_with(ptr: *const u8, size: usize, pattern: u8) -> bool {
    std::slice::from_raw_parts(ptr, size)
        .iter()
        .all(|&byte| byte == pattern)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fill_patterns() {
        let mut buf = [0u8; 32];
        unsafe {
            fill_left_redzone(buf.as_mut_ptr(), 16);
            fill_right_redzone(buf.as_mut_ptr().add(16), 16);
            assert!(is_filled_with(buf.as_ptr(), 16, LEFT_REDZONE_PATTERN));
            assert!(is_filled_with(buf.as_ptr().add(16), 16, RIGHT_REDZONE_PATTERN));
            assert!(!is_filled_with(buf.as_ptr(), 32, LEFT_REDZONE_PATTERN));
        }
    }
}
