//! Description of a detected memory error.

use std::fmt;

use crate::heap_proxy::BadAccessKind;
use crate::stack::{StackCapture, StackId};

/// Direction of a memory access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessMode {
    /// The access reads memory.
    Read,
    /// The access writes memory.
    Write,
    /// Not an access (e.g. a bad free).
    Unknown,
}

impl AccessMode {
    /// Name used in reports.
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessMode::Read => "READ",
            AccessMode::Write => "WRITE",
            AccessMode::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Registers of the faulting thread, as far as they can be recovered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuContext {
    /// Instruction pointer of the innermost frame.
    pub instruction_pointer: usize,
    /// Stack pointer of the innermost frame.
    pub stack_pointer: usize,
}

impl CpuContext {
    /// Snapshot the calling thread.
    #[inline(never)]
    pub fn capture() -> Self {
        let mut context = Self::default();
        backtrace::trace(|frame| {
            context.instruction_pointer = frame.ip() as usize;
            context.stack_pointer = frame.sp() as usize;
            false
        });
        context
    }
}

/// Everything known about one memory error.
#[derive(Debug, Clone)]
pub struct AsanErrorInfo {
    /// Faulting address.
    pub location: usize,
    /// Direction of the access.
    pub access_mode: AccessMode,
    /// Width of the access in bytes.
    pub access_size: usize,
    /// Classification.
    pub error_type: BadAccessKind,
    /// Registers at the fault.
    pub context: CpuContext,
    /// Where the block was allocated.
    pub alloc_stack: Option<StackCapture>,
    /// Thread that allocated the block.
    pub alloc_tid: u64,
    /// Where the block was freed.
    pub free_stack: Option<StackCapture>,
    /// Thread that freed the block.
    pub free_tid: u64,
    /// Module-relative hash of the faulting stack.
    pub crash_stack_id: StackId,
    /// Microseconds between the free and the error.
    pub microseconds_since_free: u64,
    /// One-line position of the address within its block.
    pub shadow_info: String,
    /// Shadow bytes around the address.
    pub shadow_memory: String,
}

impl AsanErrorInfo {
    /// A not-yet-classified error.
    pub fn new(location: usize, access_mode: AccessMode, access_size: usize) -> Self {
        Self {
            location,
            access_mode,
            access_size,
            error_type: BadAccessKind::Unknown,
            context: CpuContext::default(),
            alloc_stack: None,
            alloc_tid: 0,
            free_stack: None,
            free_tid: 0,
            crash_stack_id: StackId::default(),
            microseconds_since_free: 0,
            shadow_info: String::new(),
            shadow_memory: String::new(),
        }
    }

    /// Headline of the report.
    pub fn summary(&self) -> String {
        format!(
            "shadowheap error: {} on address 0x{:08x} (stack_id={})",
            self.error_type, self.location, self.crash_stack_id
        )
    }
}
