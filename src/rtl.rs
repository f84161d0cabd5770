//! Process-wide entry points for instrumented code.
//!
//! Instrumented accesses and intercepted memory/string routines only get an
//! address, so they go through a runtime installed once with
//! [`set_up_rtl`]. While none is installed every check passes.
//!
//! The checked routines report a bad access and then carry on with the
//! operation, like the unchecked routine would. Whether the process survives
//! the report is up to the runtime's configuration and error callback.

use std::cmp::Ordering;
use std::ffi::CStr;
use std::sync::Arc;

use crate::runtime::{AccessMode, Runtime};
use crate::sync::mutex::{const_rwlock, RwLock};

static RUNTIME: RwLock<Option<Arc<Runtime>>> = const_rwlock(None);

/// Install `runtime` as the target of every entry point in this module.
pub fn set_up_rtl(runtime: Arc<Runtime>) {
    let previous = RUNTIME.write().replace(runtime);
    if previous.is_some() {
        log::warn!("replacing an already installed runtime");
    }
}

/// Uninstall the current runtime, returning it.
pub fn tear_down_rtl() -> Option<Arc<Runtime>> {
    RUNTIME.write().take()
}

/// The installed runtime, if any.
pub fn runtime() -> Option<Arc<Runtime>> {
    RUNTIME.read().clone()
}

/// Check a `size`-byte access at `addr`, reporting it if it touches
/// poisoned memory. Returns true if the access is valid.
pub fn check_memory_access(addr: usize, mode: AccessMode, size: usize) -> bool {
    match runtime() {
        Some(runtime) => runtime.check_access(addr, mode, size),
        None => true,
    }
}

macro_rules! check_access_functions {
    ($($name:ident: $size:literal, $mode:ident;)*) => {
        $(
            #[doc = concat!("Check a ", stringify!($size), "-byte ", stringify!($mode), " at `addr`.")]
            #[inline]
            pub fn $name(addr: usize) -> bool {
                check_memory_access(addr, AccessMode::$mode, $size)
            }
        )*
    };
}

check_access_functions! {
    check_1_byte_read_access: 1, Read;
    check_2_byte_read_access: 2, Read;
    check_4_byte_read_access: 4, Read;
    check_8_byte_read_access: 8, Read;
    check_10_byte_read_access: 10, Read;
    check_16_byte_read_access: 16, Read;
    check_32_byte_read_access: 32, Read;
    check_1_byte_write_access: 1, Write;
    check_2_byte_write_access: 2, Write;
    check_4_byte_write_access: 4, Write;
    check_8_byte_write_access: 8, Write;
    check_10_byte_write_access: 10, Write;
    check_16_byte_write_access: 16, Write;
    check_32_byte_write_access: 32, Write;
}

/// Check the accesses of a repeated string instruction.
///
/// Walks `length` steps of `access_size` bytes from `dst` and `src`, moving
/// both by `increment` bytes per step. A side whose mode is
/// [`AccessMode::Unknown`] is not checked. With `compare`, the walk stops
/// after the first step whose source and destination values differ.
///
/// # Safety
///
/// With `compare`, every visited element of both sides must be readable.
/// `access_size` must then be 1, 2 or 4.
#[allow(clippy::too_many_arguments)]
pub unsafe fn check_strings_memory_accesses(
    dst: *const u8,
    dst_mode: AccessMode,
    src: *const u8,
    src_mode: AccessMode,
    length: usize,
    access_size: usize,
    increment: isize,
    compare: bool,
) {
    let Some(runtime) = runtime() else {
        return;
    };

    let mut offset: isize = 0;
    for _ in 0..length {
        let src_addr = (src as usize).wrapping_add_signed(offset);
        let dst_addr = (dst as usize).wrapping_add_signed(offset);

        if src_mode != AccessMode::Unknown {
            runtime.check_access(src_addr, src_mode, access_size);
        }
        if dst_mode != AccessMode::Unknown {
            runtime.check_access(dst_addr, dst_mode, access_size);
        }

        if compare && read_element(src_addr, access_size) != read_element(dst_addr, access_size) {
            return;
        }

        offset += increment;
    }
}

unsafe fn read_element(addr: usize, access_size: usize) -> u32 {
    match access_size {
        4 => std::ptr::read_unaligned(addr as *const u32),
        2 => u32::from(std::ptr::read_unaligned(addr as *const u16)),
        1 => u32::from(*(addr as *const u8)),
        _ => {
            debug_assert!(false, "unexpected access size {}", access_size);
            0
        }
    }
}

/// Check that both ends of `[addr, addr + size)` are addressable.
pub fn test_memory_range(addr: usize, size: usize, mode: AccessMode) -> bool {
    if size == 0 {
        return true;
    }
    check_memory_access(addr, mode, size)
}

fn report_bad_access(location: usize, mode: AccessMode) {
    if let Some(runtime) = runtime() {
        runtime.report_bad_memory_access(location, mode, 1);
    }
}

/// Check the null-terminated string at `ptr`, reporting the first byte
/// past its accessible part. Returns its size with the terminator, if the
/// terminator was reached.
unsafe fn check_c_string(ptr: *const u8) -> Option<usize> {
    let runtime = runtime()?;
    match runtime.shadow().get_null_terminated_array_size(ptr, 1) {
        Ok(size) => Some(size),
        Err(size) => {
            drop(runtime);
            report_bad_access(ptr as usize + size, AccessMode::Read);
            None
        }
    }
}

/// Checked `memcpy`.
///
/// # Safety
///
/// Same contract as [`std::ptr::copy_nonoverlapping`].
pub unsafe fn memcpy(dst: *mut u8, src: *const u8, num: usize) -> *mut u8 {
    test_memory_range(src as usize, num, AccessMode::Read);
    test_memory_range(dst as usize, num, AccessMode::Write);
    std::ptr::copy_nonoverlapping(src, dst, num);
    dst
}

/// Checked `memmove`.
///
/// # Safety
///
/// Same contract as [`std::ptr::copy`].
pub unsafe fn memmove(dst: *mut u8, src: *const u8, num: usize) -> *mut u8 {
    test_memory_range(src as usize, num, AccessMode::Read);
    test_memory_range(dst as usize, num, AccessMode::Write);
    std::ptr::copy(src, dst, num);
    dst
}

/// Checked `memset`.
///
/// # Safety
///
/// Same contract as [`std::ptr::write_bytes`].
pub unsafe fn memset(ptr: *mut u8, value: u8, num: usize) -> *mut u8 {
    test_memory_range(ptr as usize, num, AccessMode::Write);
    std::ptr::write_bytes(ptr, value, num);
    ptr
}

/// Checked `memchr`: first occurrence of `value` in `num` bytes at `ptr`.
///
/// # Safety
///
/// `num` bytes at `ptr` must be readable.
pub unsafe fn memchr(ptr: *const u8, value: u8, num: usize) -> Option<*const u8> {
    test_memory_range(ptr as usize, num, AccessMode::Read);
    let bytes = std::slice::from_raw_parts(ptr, num);
    bytes.iter().position(|&b| b == value).map(|index| ptr.add(index))
}

/// Checked `strlen`.
///
/// # Safety
///
/// `ptr` must point to a null-terminated string.
pub unsafe fn strlen(ptr: *const u8) -> usize {
    match check_c_string(ptr) {
        Some(size) => size - 1,
        None => CStr::from_ptr(ptr.cast()).to_bytes().len(),
    }
}

/// Checked `strcmp`.
///
/// # Safety
///
/// Both pointers must point to null-terminated strings.
pub unsafe fn strcmp(a: *const u8, b: *const u8) -> Ordering {
    check_c_string(a);
    check_c_string(b);
    CStr::from_ptr(a.cast()).cmp(CStr::from_ptr(b.cast()))
}

/// Checked `strrchr`: last occurrence of `value` in the string at `ptr`.
/// Searching for 0 finds the terminator.
///
/// # Safety
///
/// `ptr` must point to a null-terminated string.
pub unsafe fn strrchr(ptr: *const u8, value: u8) -> Option<*const u8> {
    check_c_string(ptr);
    let bytes = CStr::from_ptr(ptr.cast()).to_bytes_with_nul();
    bytes.iter().rposition(|&b| b == value).map(|index| ptr.add(index))
}

/// Checked `strncpy`: copies at most `num` bytes of `src`, padding `dst`
/// with zeros up to `num`.
///
/// # Safety
///
/// `src` must be readable up to its terminator or `num` bytes, and `num`
/// bytes at `dst` must be writable. The two must not overlap.
pub unsafe fn strncpy(dst: *mut u8, src: *const u8, num: usize) -> *mut u8 {
    if num == 0 {
        return dst;
    }

    if let Some(runtime) = runtime() {
        if let Err(size) = runtime.shadow().get_null_terminated_array_size(src, 1) {
            // Only bytes strncpy would actually read are bad.
            if size <= num {
                drop(runtime);
                report_bad_access(src as usize + size, AccessMode::Read);
            }
        }
    }
    // The destination need not be terminated, so only its range is tested.
    test_memory_range(dst as usize, num, AccessMode::Write);

    let mut copied = 0;
    while copied < num {
        let byte = *src.add(copied);
        if byte == 0 {
            break;
        }
        *dst.add(copied) = byte;
        copied += 1;
    }
    std::ptr::write_bytes(dst.add(copied), 0, num - copied);
    dst
}
