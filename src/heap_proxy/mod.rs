//! The instrumented heap.
//!
//! A [`HeapProxy`] wraps a [`RawHeap`] and surrounds every allocation with
//! poisoned redzones. Freed blocks are not released right away: they are
//! poisoned as freed memory and parked in a FIFO quarantine so that a later
//! access through a dangling pointer lands on poisoned shadow instead of on
//! a reused block. When the quarantine grows past its cap the oldest block
//! is unpoisoned and handed back to the raw heap.
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use shadowheap::{HeapConfig, HeapFlags, HeapProxy, Shadow, ShadowConfig};
//! use shadowheap::{LogLogger, StackCacheConfig, StackCaptureCache};
//!
//! let shadow = Arc::new(Shadow::new(ShadowConfig::default()));
//! let cache = Arc::new(StackCaptureCache::new(StackCacheConfig::default(), Arc::new(LogLogger)));
//! let heap = HeapProxy::new(HeapConfig::default(), shadow.clone(), cache);
//!
//! let ptr = heap.alloc(HeapFlags::NONE, 10);
//! assert!(shadow.is_accessible(ptr as usize + 9));
//! assert!(!shadow.is_accessible(ptr as usize + 10));
//!
//! assert!(unsafe { heap.free(HeapFlags::NONE, ptr) });
//! assert!(heap.in_quarantine(ptr));
//! ```

mod block;
mod quarantine;

use std::collections::BTreeMap;
use std::fmt;
use std::ops::BitOr;
use std::sync::Arc;

use crate::allocators::{HeapInformationClass, HeapWalkEntry, RawHeap, SystemHeap};
use crate::api::config::HeapConfig;
use crate::api::stats::HeapStats;
use crate::core::{clock, thread};
use crate::runtime::AsanErrorInfo;
use crate::shadow::{markers, Shadow};
use crate::stack::{StackCapture, StackCaptureCache};
use crate::sync::mutex::Mutex;

use block::{BlockHeader, BlockLayout, BlockTrailer, BLOCK_MAGIC};
use quarantine::{Quarantine, QuarantinedBlock};

pub use block::{BlockState, BLOCK_ALIGNMENT, HEADER_SIZE, TRAILER_SIZE};

/// Allocation flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeapFlags(u32);

impl HeapFlags {
    /// No flags.
    pub const NONE: Self = Self(0);
    /// Zero-fill the user data.
    pub const ZERO_MEMORY: Self = Self(0x8);
    /// Only resize in place (never supported: `realloc` fails).
    pub const REALLOC_IN_PLACE_ONLY: Self = Self(0x10);

    /// Raw flag bits.
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Whether every flag in `other` is set.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for HeapFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Classification of a bad memory access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BadAccessKind {
    /// Could not be attributed.
    Unknown,
    /// Inside the former user data of a quarantined block.
    UseAfterFree,
    /// Before a block's user data, in its left redzone.
    HeapBufferUnderflow,
    /// At or after the end of a block's user data.
    HeapBufferOverflow,
    /// Runtime-internal memory or outside the monitored range.
    WildAccess,
    /// Memory that is never valid.
    InvalidAddress,
    /// Free of a block that is not live.
    DoubleFree,
}

impl BadAccessKind {
    /// Name used in reports.
    pub fn as_str(&self) -> &'static str {
        match self {
            BadAccessKind::Unknown => "unknown-crash",
            BadAccessKind::UseAfterFree => "heap-use-after-free",
            BadAccessKind::HeapBufferUnderflow => "heap-buffer-underflow",
            BadAccessKind::HeapBufferOverflow => "heap-buffer-overflow",
            BadAccessKind::WildAccess => "wild-access",
            BadAccessKind::InvalidAddress => "invalid-address",
            BadAccessKind::DoubleFree => "double-free",
        }
    }

    /// Whether the error concerns a heap block, so a shadow dump helps.
    pub fn is_heap_error(&self) -> bool {
        matches!(
            self,
            BadAccessKind::UseAfterFree
                | BadAccessKind::HeapBufferUnderflow
                | BadAccessKind::HeapBufferOverflow
                | BadAccessKind::DoubleFree
        )
    }
}

impl fmt::Display for BadAccessKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded block header and trailer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    /// Start of the block in the raw heap.
    pub base: usize,
    /// Start of the user data.
    pub user: usize,
    /// Requested size.
    pub size: usize,
    /// Size of the whole block.
    pub alloc_size: usize,
    /// Lifecycle state.
    pub state: BlockState,
    /// Thread that allocated the block.
    pub alloc_tid: u64,
    /// Allocation timestamp in microseconds.
    pub alloc_time: u64,
    /// Thread that freed the block (0 if live).
    pub free_tid: u64,
    /// Free timestamp in microseconds (0 if live).
    pub free_time: u64,
    alloc_stack: usize,
    free_stack: usize,
}

impl BlockInfo {
    /// One past the last requested user byte.
    pub fn user_end(&self) -> usize {
        self.user + self.size
    }

    /// One past the end of the block.
    pub fn end(&self) -> usize {
        self.base + self.alloc_size
    }

    /// Whether `addr` lies in the block.
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.end()
    }

    /// Whether the block is in quarantine.
    pub fn is_quarantined(&self) -> bool {
        self.state == BlockState::Quarantined
    }
}

struct HeapState {
    quarantine: Quarantine,
    /// Every block not yet released to the raw heap, by base.
    blocks: BTreeMap<usize, BlockLayout>,
    stats: HeapStats,
}

/// A heap whose blocks are guarded by shadow memory.
pub struct HeapProxy {
    heap: Box<dyn RawHeap>,
    shadow: Arc<Shadow>,
    stack_cache: Arc<StackCaptureCache>,
    trailer_padding_size: usize,
    state: Mutex<HeapState>,
}

impl HeapProxy {
    /// Create a proxy over a fresh [`SystemHeap`].
    pub fn new(config: HeapConfig, shadow: Arc<Shadow>, stack_cache: Arc<StackCaptureCache>) -> Self {
        Self::with_raw_heap(config, shadow, stack_cache, Box::new(SystemHeap::new()))
    }

    /// Create a proxy over the given raw heap.
    pub fn with_raw_heap(
        config: HeapConfig,
        shadow: Arc<Shadow>,
        stack_cache: Arc<StackCaptureCache>,
        heap: Box<dyn RawHeap>,
    ) -> Self {
        log::debug!(
            "creating heap proxy (quarantine {} bytes, trailer padding {} bytes)",
            config.quarantine_size,
            config.trailer_padding_size
        );
        Self {
            heap,
            shadow,
            stack_cache,
            trailer_padding_size: config.trailer_padding_size,
            state: Mutex::new(HeapState {
                quarantine: Quarantine::new(config.quarantine_size),
                blocks: BTreeMap::new(),
                stats: HeapStats::default(),
            }),
        }
    }

    /// Size of the block backing a request of `size` bytes.
    pub fn get_alloc_size(&self, size: usize) -> Option<usize> {
        BlockLayout::for_request(size, self.trailer_padding_size).map(|layout| layout.alloc_size)
    }

    /// Allocate `size` bytes. Returns null if the raw heap fails.
    ///
    /// Zero-byte requests get a distinct pointer with no accessible byte.
    pub fn alloc(&self, flags: HeapFlags, size: usize) -> *mut u8 {
        let Some(layout) = BlockLayout::for_request(size, self.trailer_padding_size) else {
            return std::ptr::null_mut();
        };

        let alloc_stack = self
            .stack_cache
            .capture_current_stack()
            .map_or(0, |stack| stack.as_raw());

        let base = self.heap.alloc(layout.alloc_size);
        if base.is_null() {
            log::warn!("raw heap failed to allocate {} bytes", layout.alloc_size);
            return std::ptr::null_mut();
        }
        let base = base as usize;
        let user = block::user_pointer(base);

        let mut header = BlockHeader {
            magic: BLOCK_MAGIC,
            state: 0,
            size,
            alloc_stack,
            alloc_tid: thread::current_thread_id(),
            alloc_time: clock::now_micros(),
        };
        header.set_state(BlockState::Allocated);

        // SAFETY: the raw heap returned `alloc_size` writable bytes at `base`.
        unsafe {
            block::write_header(base, header);
            block::write_trailer(base, &layout, BlockTrailer::default());

            if flags.contains(HeapFlags::ZERO_MEMORY) {
                std::ptr::write_bytes(user as *mut u8, 0, size);
            }

            #[cfg(feature = "debug")]
            {
                let header_end = base + std::mem::size_of::<BlockHeader>();
                crate::debug::poison::fill_left_redzone(header_end as *mut u8, user - header_end);
                crate::debug::poison::fill_right_redzone(
                    (user + size) as *mut u8,
                    base + layout.trailer_offset - (user + size),
                );
            }
        }

        self.shadow
            .poison_with(base, HEADER_SIZE, markers::HEAP_LEFT_REDZONE);
        self.shadow.unpoison(user, size);
        self.shadow.poison_with(
            user + size,
            base + layout.alloc_size - (user + size),
            markers::HEAP_RIGHT_REDZONE,
        );

        let mut state = self.state.lock();
        state.blocks.insert(base, layout);
        state.stats.allocation_count += 1;

        user as *mut u8
    }

    /// Move a live block into quarantine.
    ///
    /// Returns false, changing nothing, if `ptr` is not a live block of this
    /// heap (double or invalid free).
    ///
    /// # Safety
    ///
    /// `ptr` must not be used after a successful free.
    pub unsafe fn free(&self, _flags: HeapFlags, ptr: *mut u8) -> bool {
        let free_stack = self
            .stack_cache
            .capture_current_stack()
            .map_or(0, |stack| stack.as_raw());

        let mut state = self.state.lock();

        let Some((base, layout)) = Self::live_block(&state, ptr as usize) else {
            state.stats.failed_free_count += 1;
            log::warn!("rejected free of 0x{:08x}: not a live block", ptr as usize);
            return false;
        };

        // SAFETY: `base` is a block of this heap that has not been released.
        let mut header = block::read_header(base);
        header.set_state(BlockState::Quarantined);
        block::write_header(base, header);
        block::write_trailer(
            base,
            &layout,
            BlockTrailer {
                free_stack,
                free_tid: thread::current_thread_id(),
                free_time: clock::now_micros(),
            },
        );

        self.shadow.poison_with(
            block::user_pointer(base),
            layout.user_granules(),
            markers::HEAP_FREED,
        );

        state.quarantine.push(base, layout.alloc_size);
        state.stats.free_count += 1;
        let evicted = Self::take_overage(&mut state);
        drop(state);

        self.release_blocks(evicted);
        true
    }

    /// Resize a block by allocating, copying and freeing.
    ///
    /// A null `ptr` behaves as [`HeapProxy::alloc`]. Always fails with
    /// [`HeapFlags::REALLOC_IN_PLACE_ONLY`]; blocks cannot grow or shrink
    /// in place. Returns null if `ptr` is not a live block.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a pointer returned by this heap and not freed.
    pub unsafe fn realloc(&self, flags: HeapFlags, ptr: *mut u8, size: usize) -> *mut u8 {
        if flags.contains(HeapFlags::REALLOC_IN_PLACE_ONLY) {
            return std::ptr::null_mut();
        }
        if ptr.is_null() {
            return self.alloc(flags, size);
        }

        let Some(old_size) = self.size(ptr) else {
            return std::ptr::null_mut();
        };

        let new_ptr = self.alloc(flags, size);
        if new_ptr.is_null() {
            return new_ptr;
        }

        std::ptr::copy_nonoverlapping(ptr, new_ptr, old_size.min(size));
        if !self.free(flags, ptr) {
            log::warn!("realloc: 0x{:08x} was freed while being resized", ptr as usize);
        }
        new_ptr
    }

    /// Requested size of a live block.
    pub fn size(&self, ptr: *const u8) -> Option<usize> {
        let state = self.state.lock();
        // SAFETY: the block is live.
        Self::live_block(&state, ptr as usize).map(|(base, _)| unsafe { block::read_header(base).size })
    }

    /// Validate one block (by user pointer) or the whole raw heap.
    pub fn validate(&self, ptr: Option<*const u8>) -> bool {
        match ptr {
            Some(ptr) => match block::block_base(ptr as usize) {
                Some(base) => self.heap.validate(Some(base as *const u8)),
                None => false,
            },
            None => self.heap.validate(None),
        }
    }

    /// Compact the raw heap.
    pub fn compact(&self) -> usize {
        self.heap.compact()
    }

    /// Lock the raw heap.
    pub fn lock(&self) -> bool {
        self.heap.lock()
    }

    /// Unlock the raw heap.
    pub fn unlock(&self) -> bool {
        self.heap.unlock()
    }

    /// Walk the raw heap's regions.
    pub fn walk(&self, previous: Option<usize>) -> Option<HeapWalkEntry> {
        self.heap.walk(previous)
    }

    /// Read a raw heap setting.
    pub fn query_information(&self, class: HeapInformationClass) -> Option<u32> {
        self.heap.query_information(class)
    }

    /// Change a raw heap setting.
    pub fn set_information(&self, class: HeapInformationClass, value: u32) -> bool {
        self.heap.set_information(class, value)
    }

    /// Current quarantine cap.
    pub fn quarantine_max_size(&self) -> usize {
        self.state.lock().quarantine.max_size()
    }

    /// Change the quarantine cap, evicting oldest blocks if it shrank.
    pub fn set_quarantine_max_size(&self, max_size: usize) {
        let evicted = {
            let mut state = self.state.lock();
            state.quarantine.set_max_size(max_size);
            Self::take_overage(&mut state)
        };
        self.release_blocks(evicted);
    }

    /// Whether the block of `ptr` is in quarantine.
    pub fn in_quarantine(&self, ptr: *const u8) -> bool {
        let state = self.state.lock();
        let Some(base) = block::block_base(ptr as usize) else {
            return false;
        };
        // SAFETY: the block has not been released.
        state.blocks.contains_key(&base)
            && unsafe { block::read_header(base).state() } == Some(BlockState::Quarantined)
    }

    /// Find the block whose extent contains `addr`.
    pub fn find_address_block(&self, addr: usize) -> Option<BlockInfo> {
        let state = self.state.lock();
        Self::find_block_locked(&state, addr)
    }

    /// Classify an access to `addr` against `block`.
    pub fn get_bad_access_kind(&self, addr: usize, block: &BlockInfo) -> BadAccessKind {
        if block.is_quarantined() && addr >= block.user && addr < block.user_end() {
            BadAccessKind::UseAfterFree
        } else if addr < block.user {
            BadAccessKind::HeapBufferUnderflow
        } else if addr >= block.user_end() {
            BadAccessKind::HeapBufferOverflow
        } else {
            BadAccessKind::Unknown
        }
    }

    /// Microseconds since `block` was freed, or 0 if it is live.
    pub fn get_time_since_free(&self, block: &BlockInfo) -> u64 {
        if !block.is_quarantined() {
            return 0;
        }
        clock::micros_since(block.free_time)
    }

    /// Allocation stack of a block.
    pub fn alloc_stack(&self, block: &BlockInfo) -> Option<StackCapture> {
        // SAFETY: the field only ever holds 0 or a handle from this cache.
        unsafe { self.stack_cache.stack_from_raw(block.alloc_stack) }.map(|stack| stack.to_capture())
    }

    /// Free stack of a block.
    pub fn free_stack(&self, block: &BlockInfo) -> Option<StackCapture> {
        // SAFETY: the field only ever holds 0 or a handle from this cache.
        unsafe { self.stack_cache.stack_from_raw(block.free_stack) }.map(|stack| stack.to_capture())
    }

    /// Fill in the block details of an error at `info.location`.
    ///
    /// Returns false if no block of this heap contains the address. A
    /// [`BadAccessKind::DoubleFree`] classification is kept as is.
    pub fn get_bad_access_information(&self, info: &mut AsanErrorInfo) -> bool {
        let Some(block) = self.find_address_block(info.location) else {
            return false;
        };

        if info.error_type != BadAccessKind::DoubleFree {
            info.error_type = self.get_bad_access_kind(info.location, &block);
        }

        info.alloc_stack = self.alloc_stack(&block);
        info.alloc_tid = block.alloc_tid;
        if block.is_quarantined() {
            info.free_stack = self.free_stack(&block);
            info.free_tid = block.free_tid;
            info.microseconds_since_free = self.get_time_since_free(&block);
        }
        info.shadow_info = describe_location(info.location, &block);
        true
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> HeapStats {
        let state = self.state.lock();
        let mut stats = state.stats.clone();
        stats.quarantined_blocks = state.quarantine.len();
        stats.quarantine_size = state.quarantine.size();
        stats.quarantine_max_size = state.quarantine.max_size();
        stats.live_blocks = state.blocks.len() - stats.quarantined_blocks;
        // SAFETY: every block in the map is unreleased.
        stats.live_bytes = state
            .blocks
            .keys()
            .map(|&base| unsafe { block::read_header(base) })
            .filter(|header| header.state() == Some(BlockState::Allocated))
            .map(|header| header.size)
            .sum();
        stats
    }

    /// Release every block, quarantined or not.
    ///
    /// Returns false if some blocks were still allocated.
    pub fn destroy(&self) -> bool {
        let (blocks, outstanding) = {
            let mut state = self.state.lock();
            let quarantined = state.quarantine.drain().count();
            let blocks = std::mem::take(&mut state.blocks);
            let outstanding = blocks.len() - quarantined;
            (blocks, outstanding)
        };

        for (base, layout) in blocks {
            self.release_block(base, layout.alloc_size);
        }

        if outstanding != 0 {
            log::warn!("heap destroyed with {} outstanding allocations", outstanding);
        } else {
            log::debug!("heap destroyed");
        }
        outstanding == 0
    }

    /// Live block whose user pointer is `user`.
    fn live_block(state: &HeapState, user: usize) -> Option<(usize, BlockLayout)> {
        let base = block::block_base(user)?;
        let layout = *state.blocks.get(&base)?;
        // SAFETY: the block has not been released.
        let header = unsafe { block::read_header(base) };
        (header.is_valid() && header.state() == Some(BlockState::Allocated)).then_some((base, layout))
    }

    fn find_block_locked(state: &HeapState, addr: usize) -> Option<BlockInfo> {
        let (&base, layout) = state.blocks.range(..=addr).next_back()?;
        if addr >= base + layout.alloc_size {
            return None;
        }

        // SAFETY: the block has not been released.
        let (header, trailer) = unsafe { (block::read_header(base), block::read_trailer(base, layout)) };
        let state = header.state()?;
        Some(BlockInfo {
            base,
            user: block::user_pointer(base),
            size: header.size,
            alloc_size: layout.alloc_size,
            state,
            alloc_tid: header.alloc_tid,
            alloc_time: header.alloc_time,
            free_tid: trailer.free_tid,
            free_time: trailer.free_time,
            alloc_stack: header.alloc_stack,
            free_stack: trailer.free_stack,
        })
    }

    /// Pop blocks over the quarantine cap and drop them from the block map.
    ///
    /// The caller releases them with [`HeapProxy::release_blocks`] after
    /// dropping the state lock: the raw heap has its own lock, which a
    /// thread inside `lock()`/`unlock()` holds while it calls `alloc`.
    fn take_overage(state: &mut HeapState) -> Vec<QuarantinedBlock> {
        let evicted: Vec<_> = std::iter::from_fn(|| state.quarantine.pop_overage()).collect();
        for block in &evicted {
            state.blocks.remove(&block.base);
        }
        state.stats.eviction_count += evicted.len() as u64;
        evicted
    }

    fn release_blocks(&self, evicted: Vec<QuarantinedBlock>) {
        for block in evicted {
            self.release_block(block.base, block.alloc_size);
        }
    }

    fn release_block(&self, base: usize, alloc_size: usize) {
        self.shadow.unpoison(base, alloc_size);
        // SAFETY: the block came from this raw heap and left the bookkeeping.
        if !unsafe { self.heap.free(base as *mut u8) } {
            log::error!("raw heap refused to release block 0x{:08x}", base);
        }
    }
}

impl Drop for HeapProxy {
    fn drop(&mut self) {
        if !self.state.get_mut().blocks.is_empty() {
            self.destroy();
        }
    }
}

/// One-line description of where `addr` sits relative to `block`.
pub fn describe_location(addr: usize, block: &BlockInfo) -> String {
    let position = if addr < block.user {
        format!("{} bytes to the left of", block.user - addr)
    } else if addr >= block.user_end() {
        format!("{} bytes to the right of", addr - block.user_end())
    } else {
        format!("{} bytes inside of", addr - block.user)
    };
    format!(
        "0x{:08x} is located {} {}-bytes region [0x{:08x},0x{:08x})\n",
        addr,
        position,
        block.size,
        block.user,
        block.user_end()
    )
}
