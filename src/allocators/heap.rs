//! System heap backing the heap proxies.

use std::alloc::{alloc, dealloc, Layout};
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use crate::sync::mutex::{Mutex, ReentrantMutex};

use super::{HeapInformationClass, HeapWalkEntry, RawHeap};

/// Alignment of every region handed out.
pub const SYSTEM_HEAP_ALIGNMENT: usize = 16;

/// Compatibility value of a standard heap.
pub const HEAP_COMPATIBILITY_STANDARD: u32 = 0;

/// Compatibility value of a low-fragmentation heap.
pub const HEAP_COMPATIBILITY_LFH: u32 = 2;

/// Wrapper around the global system allocator.
///
/// Remembers the size of every live region so regions can be freed, sized,
/// validated and enumerated without a caller-supplied layout.
pub struct SystemHeap {
    /// Held by every operation; `lock`/`unlock` hold it across calls.
    lock: ReentrantMutex<()>,

    /// Live regions, keyed by address.
    regions: Mutex<BTreeMap<usize, usize>>,

    /// Total bytes currently allocated
    allocated_bytes: AtomicUsize,

    /// Total allocation count
    allocation_count: AtomicUsize,

    compatibility: AtomicU32,
}

impl SystemHeap {
    /// Create a new system heap wrapper.
    pub fn new() -> Self {
        Self {
            lock: ReentrantMutex::new(()),
            regions: Mutex::new(BTreeMap::new()),
            allocated_bytes: AtomicUsize::new(0),
            allocation_count: AtomicUsize::new(0),
            compatibility: AtomicU32::new(HEAP_COMPATIBILITY_STANDARD),
        }
    }

    /// Get total bytes currently allocated.
    pub fn allocated_bytes(&self) -> usize {
        self.allocated_bytes.load(Ordering::Relaxed)
    }

    /// Get total allocation count.
    pub fn allocation_count(&self) -> usize {
        self.allocation_count.load(Ordering::Relaxed)
    }

    /// Number of live regions.
    pub fn live_regions(&self) -> usize {
        self.regions.lock().len()
    }

    fn layout(size: usize) -> Option<Layout> {
        Layout::from_size_align(size.max(1), SYSTEM_HEAP_ALIGNMENT).ok()
    }
}

impl Default for SystemHeap {
    fn default() -> Self {
        Self::new()
    }
}

impl RawHeap for SystemHeap {
    fn alloc(&self, size: usize) -> *mut u8 {
        let _guard = self.lock.lock();

        let Some(layout) = Self::layout(size) else {
            return std::ptr::null_mut();
        };

        // SAFETY: the layout has a non-zero size.
        let ptr = unsafe { alloc(layout) };

        if !ptr.is_null() {
            self.regions.lock().insert(ptr as usize, size);
            self.allocated_bytes.fetch_add(size, Ordering::Relaxed);
            self.allocation_count.fetch_add(1, Ordering::Relaxed);
        }

        ptr
    }

    unsafe fn free(&self, ptr: *mut u8) -> bool {
        let _guard = self.lock.lock();

        let Some(size) = self.regions.lock().remove(&(ptr as usize)) else {
            return false;
        };
        let Some(layout) = Self::layout(size) else {
            return false;
        };

        #[cfg(feature = "debug")]
        {
            crate::debug::poison::poison_released(ptr, size);
        }

        dealloc(ptr, layout);

        self.allocated_bytes.fetch_sub(size, Ordering::Relaxed);
        true
    }

    fn size(&self, ptr: *const u8) -> Option<usize> {
        let _guard = self.lock.lock();
        self.regions.lock().get(&(ptr as usize)).copied()
    }

    fn validate(&self, ptr: Option<*const u8>) -> bool {
        let _guard = self.lock.lock();
        let regions = self.regions.lock();
        match ptr {
            Some(ptr) => regions.contains_key(&(ptr as usize)),
            // Whole-heap check: regions must not overlap.
            None => regions
                .iter()
                .zip(regions.iter().skip(1))
                .all(|((&a, &size), (&b, _))| a + size <= b),
        }
    }

    fn compact(&self) -> usize {
        // The global allocator does not expose its free lists; report the
        // largest request it accepts.
        isize::MAX as usize - (SYSTEM_HEAP_ALIGNMENT - 1)
    }

    fn lock(&self) -> bool {
        std::mem::forget(self.lock.lock());
        true
    }

    fn unlock(&self) -> bool {
        if !self.lock.is_owned_by_current_thread() {
            return false;
        }
        // SAFETY: the current thread owns the lock through a guard
        // forgotten by `lock`.
        unsafe { self.lock.force_unlock() };
        true
    }

    fn walk(&self, previous: Option<usize>) -> Option<HeapWalkEntry> {
        let _guard = self.lock.lock();
        let regions = self.regions.lock();
        let lower = match previous {
            Some(address) => Bound::Excluded(address),
            None => Bound::Unbounded,
        };
        regions
            .range((lower, Bound::Unbounded))
            .next()
            .map(|(&address, &size)| HeapWalkEntry {
                address,
                size,
                busy: true,
            })
    }

    fn query_information(&self, class: HeapInformationClass) -> Option<u32> {
        match class {
            HeapInformationClass::Compatibility => Some(self.compatibility.load(Ordering::Relaxed)),
        }
    }

    fn set_information(&self, class: HeapInformationClass, value: u32) -> bool {
        match class {
            HeapInformationClass::Compatibility => {
                if value != HEAP_COMPATIBILITY_STANDARD && value != HEAP_COMPATIBILITY_LFH {
                    return false;
                }
                self.compatibility.store(value, Ordering::Relaxed);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_heap_allocation() {
        let heap = SystemHeap::new();

        let ptr = heap.alloc(24);
        assert!(!ptr.is_null());
        assert_eq!(ptr as usize % SYSTEM_HEAP_ALIGNMENT, 0);
        assert_eq!(heap.allocated_bytes(), 24);
        assert_eq!(heap.size(ptr), Some(24));
        assert!(heap.validate(Some(ptr)));

        unsafe {
            assert!(heap.free(ptr));
            assert!(!heap.free(ptr));
        }

        assert_eq!(heap.allocated_bytes(), 0);
        assert_eq!(heap.allocation_count(), 1);
        assert!(!heap.validate(Some(ptr)));
    }

    #[test]
    fn test_walk_visits_every_region() {
        let heap = SystemHeap::new();
        let ptrs: Vec<_> = (1..=4).map(|i| heap.alloc(i * 32)).collect();

        let mut seen = Vec::new();
        let mut cursor = None;
        while let Some(entry) = heap.walk(cursor) {
            assert!(entry.busy);
            seen.push(entry.address);
            cursor = Some(entry.address);
        }

        let mut expected: Vec<usize> = ptrs.iter().map(|&p| p as usize).collect();
        expected.sort_unstable();
        assert_eq!(seen, expected);
        assert!(heap.validate(None));

        for ptr in ptrs {
            unsafe { heap.free(ptr) };
        }
        assert_eq!(heap.walk(None), None);
    }

    #[test]
    fn test_lock_blocks_other_threads() {
        let heap = Arc::new(SystemHeap::new());
        assert!(heap.lock());
        // Reentrant for the owner.
        let ptr = heap.alloc(8);

        let other = {
            let heap = heap.clone();
            std::thread::spawn(move || {
                assert!(!heap.unlock());
                let p = heap.alloc(8);
                unsafe { heap.free(p) }
            })
        };

        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(!other.is_finished());
        assert!(heap.unlock());
        assert!(other.join().unwrap());

        unsafe { heap.free(ptr) };
        assert!(!heap.unlock());
    }

    #[test]
    fn test_information() {
        let heap = SystemHeap::new();
        let class = HeapInformationClass::Compatibility;
        assert_eq!(heap.query_information(class), Some(HEAP_COMPATIBILITY_STANDARD));
        assert!(heap.set_information(class, HEAP_COMPATIBILITY_LFH));
        assert_eq!(heap.query_information(class), Some(HEAP_COMPATIBILITY_LFH));
        assert!(!heap.set_information(class, 1));
        assert!(heap.compact() > 0);
    }
}
