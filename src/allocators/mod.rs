//! Underlying heaps.
//!
//! A [`HeapProxy`](crate::HeapProxy) carves its blocks out of a [`RawHeap`].
//! The proxy owns every shadow update; raw heaps only hand out and take back
//! plain memory.

pub(crate) mod heap;

pub use heap::{SystemHeap, HEAP_COMPATIBILITY_LFH, HEAP_COMPATIBILITY_STANDARD, SYSTEM_HEAP_ALIGNMENT};

/// One region reported by [`RawHeap::walk`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapWalkEntry {
    /// Start of the region.
    pub address: usize,
    /// Size of the region in bytes.
    pub size: usize,
    /// Whether the region is allocated.
    pub busy: bool,
}

/// Heap settings reachable through `query_information`/`set_information`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapInformationClass {
    /// Front-end allocator flavour (0 standard, 2 low-fragmentation).
    Compatibility,
}

/// A heap that hands out raw memory regions.
///
/// Regions must be aligned to at least 16 bytes.
pub trait RawHeap: Send + Sync {
    /// Allocate `size` bytes. Returns null on failure.
    fn alloc(&self, size: usize) -> *mut u8;

    /// Release a region. Returns false if `ptr` is not a live region.
    ///
    /// # Safety
    ///
    /// No reference into the region may be used afterwards.
    unsafe fn free(&self, ptr: *mut u8) -> bool;

    /// Size of a live region.
    fn size(&self, ptr: *const u8) -> Option<usize>;

    /// Check one region, or the whole heap when `ptr` is `None`.
    fn validate(&self, ptr: Option<*const u8>) -> bool;

    /// Coalesce free memory, returning the largest free block size.
    fn compact(&self) -> usize;

    /// Acquire the heap lock until the matching [`RawHeap::unlock`].
    fn lock(&self) -> bool;

    /// Release a lock taken by [`RawHeap::lock`] on this thread.
    fn unlock(&self) -> bool;

    /// The region after `previous` in address order, or the first one.
    fn walk(&self, previous: Option<usize>) -> Option<HeapWalkEntry>;

    /// Read a heap setting.
    fn query_information(&self, class: HeapInformationClass) -> Option<u32>;

    /// Change a heap setting. Returns false if the value is rejected.
    fn set_information(&self, class: HeapInformationClass, value: u32) -> bool;
}
