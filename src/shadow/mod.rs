//! Shadow memory.
//!
//! One shadow byte describes the accessibility of one 8-byte granule of the
//! monitored address range `[0, 2^address_bits)`. Logically the shadow is a
//! flat byte array of `2^(address_bits - 3)` entries indexed by
//! `address >> 3`. It is backed by fixed-size chunks created on the first
//! write that makes part of a chunk non-zero; reading a granule whose chunk
//! was never created yields [`markers::HEAP_ADDRESSABLE`].
//!
//! Writes to the shadow are not serialized here. Each range is poisoned and
//! unpoisoned only by the heap operation that owns it, so concurrent writers
//! never touch the same granules. The chunk directory has its own lock, held
//! only to look up or insert chunks.
//!
//! ```rust
//! use shadowheap::shadow::{Shadow, ShadowConfig};
//!
//! let shadow = Shadow::new(ShadowConfig::default());
//! let buf = vec![0u64; 4];
//! let addr = buf.as_ptr() as usize;
//!
//! shadow.poison(addr, 32);
//! assert!(!shadow.is_accessible(addr));
//! shadow.unpoison(addr, 20);
//! assert!(shadow.is_accessible(addr + 19));
//! assert!(!shadow.is_accessible(addr + 20));
//! ```

pub mod markers;
mod text;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};

use crate::sync::mutex::RwLock;
use crate::util::layout::{is_aligned, GRANULE_SHIFT, GRANULE_SIZE};
use crate::util::size::kb;

use markers::{HEAP_ADDRESSABLE, HEAP_NON_ACCESSIBLE, INVALID_ADDRESS};

/// Number of shadow bytes per chunk.
const CHUNK_SHADOW_BYTES: usize = 1 << 16;

/// Size of the never-valid region at the bottom of the address space.
const INVALID_LOW_REGION: usize = kb(64);

/// Shadow memory configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShadowConfig {
    /// Width of the monitored address range. Addresses at or above
    /// `2^address_bits` are outside the shadow.
    pub address_bits: u32,
}

impl Default for ShadowConfig {
    fn default() -> Self {
        // 32-bit processes that are not large-address-aware only use the
        // low 2 GiB; 64-bit user space fits in 48 bits.
        let address_bits = if cfg!(target_pointer_width = "64") { 48 } else { 31 };
        Self { address_bits }
    }
}

struct ShadowChunk {
    bytes: Box<[AtomicU8]>,
}

impl ShadowChunk {
    fn new() -> Box<Self> {
        let bytes = (0..CHUNK_SHADOW_BYTES)
            .map(|_| AtomicU8::new(HEAP_ADDRESSABLE))
            .collect();
        Box::new(Self { bytes })
    }

    #[inline]
    fn fill(&self, from: usize, to: usize, marker: u8) {
        for byte in &self.bytes[from..to] {
            byte.store(marker, Ordering::Relaxed);
        }
    }
}

/// The process-wide shadow memory.
pub struct Shadow {
    address_bits: u32,
    /// Exclusive upper bound of monitored addresses.
    limit: usize,
    chunks: RwLock<HashMap<usize, Box<ShadowChunk>>>,
}

impl Shadow {
    /// Create the shadow and apply the setup markers.
    pub fn new(config: ShadowConfig) -> Self {
        assert!(
            config.address_bits > GRANULE_SHIFT as u32 + 16 && config.address_bits < usize::BITS,
            "unsupported shadow address width: {}",
            config.address_bits
        );

        let shadow = Self {
            address_bits: config.address_bits,
            limit: 1usize << config.address_bits,
            chunks: RwLock::new(HashMap::new()),
        };
        shadow.set_up();
        shadow
    }

    /// Mark the low 64 KiB of the address space as invalid.
    pub fn set_up(&self) {
        self.poison_with(0, INVALID_LOW_REGION, INVALID_ADDRESS);
        log::debug!(
            "shadow memory set up for a {}-bit address range",
            self.address_bits
        );
    }

    /// Drop every chunk, returning the whole range to the addressable state.
    pub fn tear_down(&self) {
        self.chunks.write().clear();
    }

    /// Width of the monitored address range.
    pub fn address_bits(&self) -> u32 {
        self.address_bits
    }

    /// Logical size of the shadow byte array.
    pub fn shadow_size(&self) -> usize {
        self.limit >> GRANULE_SHIFT
    }

    /// Number of chunks currently backing the shadow.
    pub fn mapped_chunks(&self) -> usize {
        self.chunks.read().len()
    }

    /// Whether `addr` lies inside the monitored range.
    #[inline]
    pub fn is_in_range(&self, addr: usize) -> bool {
        addr < self.limit
    }

    /// Mark `[addr, addr + size)` as non-addressable.
    ///
    /// The end of the range must be granule aligned. If `addr` is not, the
    /// leading granule is left with its first `addr % 8` bytes addressable.
    pub fn poison(&self, addr: usize, size: usize) {
        self.poison_with(addr, size, HEAP_NON_ACCESSIBLE);
    }

    /// Like [`Shadow::poison`], writing `marker` into every full granule.
    pub fn poison_with(&self, addr: usize, size: usize, marker: u8) {
        debug_assert!(is_aligned(addr + size, GRANULE_SIZE));
        debug_assert!(!markers::is_partially_addressable(marker) && marker != HEAP_ADDRESSABLE);

        let mut start = addr;
        let remaining = addr % GRANULE_SIZE;
        if remaining != 0 {
            self.set_granules(addr >> GRANULE_SHIFT, 1, remaining as u8);
            start = addr - remaining + GRANULE_SIZE;
        }

        let end = addr + size;
        if end > start {
            self.set_granules(start >> GRANULE_SHIFT, (end - start) >> GRANULE_SHIFT, marker);
        }
    }

    /// Mark `[addr, addr + size)` as addressable.
    ///
    /// `addr` must be granule aligned. A trailing partial granule gets the
    /// partial-addressability value `size % 8`.
    pub fn unpoison(&self, addr: usize, size: usize) {
        debug_assert!(is_aligned(addr, GRANULE_SIZE));

        let index = addr >> GRANULE_SHIFT;
        let full = size >> GRANULE_SHIFT;
        self.set_granules(index, full, HEAP_ADDRESSABLE);

        let remainder = size % GRANULE_SIZE;
        if remainder != 0 {
            self.set_granules(index + full, 1, remainder as u8);
        }
    }

    /// Whether the single byte at `addr` may be accessed.
    #[inline]
    pub fn is_accessible(&self, addr: usize) -> bool {
        let marker = self.marker_for_address(addr);
        marker == HEAP_ADDRESSABLE
            || (markers::is_partially_addressable(marker)
                && (addr % GRANULE_SIZE) < marker as usize)
    }

    /// Raw shadow byte for the granule containing `addr`.
    ///
    /// Addresses outside the monitored range report
    /// [`markers::HEAP_NON_ACCESSIBLE`].
    pub fn marker_for_address(&self, addr: usize) -> u8 {
        if !self.is_in_range(addr) {
            return HEAP_NON_ACCESSIBLE;
        }
        self.marker_at(addr >> GRANULE_SHIFT)
    }

    /// Size in bytes of the null-terminated array starting at `ptr`,
    /// terminator included.
    ///
    /// Walks one `element_size`-wide element at a time while every byte of
    /// the element is addressable, stopping at the first all-zero element.
    /// If an inaccessible byte is reached first, returns `Err` with the
    /// number of bytes that were found accessible.
    ///
    /// # Safety
    ///
    /// Every byte the shadow reports as addressable on the way must be
    /// readable.
    pub unsafe fn get_null_terminated_array_size(
        &self,
        ptr: *const u8,
        element_size: usize,
    ) -> Result<usize, usize> {
        debug_assert!(element_size > 0);

        let mut size = 0;
        loop {
            let element = ptr.add(size);
            let base = element as usize;
            if !(0..element_size).all(|i| self.is_accessible(base + i)) {
                return Err(size);
            }

            // SAFETY: every byte of the element is addressable.
            let bytes = std::slice::from_raw_parts(element, element_size);
            size += element_size;
            if bytes.iter().all(|&b| b == 0) {
                return Ok(size);
            }
        }
    }

    /// Append a hex dump of the shadow bytes around `addr` to `output`.
    pub fn append_shadow_memory_text(&self, addr: usize, output: &mut String) {
        text::append_shadow_memory_text(self, addr, output);
    }

    /// Hex dump of the shadow bytes around `addr`.
    pub fn shadow_memory_text(&self, addr: usize) -> String {
        let mut output = String::new();
        self.append_shadow_memory_text(addr, &mut output);
        output
    }

    fn marker_at(&self, index: usize) -> u8 {
        let chunks = self.chunks.read();
        match chunks.get(&(index / CHUNK_SHADOW_BYTES)) {
            Some(chunk) => chunk.bytes[index % CHUNK_SHADOW_BYTES].load(Ordering::Relaxed),
            None => HEAP_ADDRESSABLE,
        }
    }

    /// Write `marker` into `count` consecutive shadow bytes.
    fn set_granules(&self, index: usize, count: usize, marker: u8) {
        let end = (index + count).min(self.shadow_size());
        debug_assert_eq!(end, index + count, "shadow write outside the monitored range");

        let mut current = index;
        while current < end {
            let chunk_index = current / CHUNK_SHADOW_BYTES;
            let from = current % CHUNK_SHADOW_BYTES;
            let to = (from + (end - current)).min(CHUNK_SHADOW_BYTES);

            {
                let chunks = self.chunks.read();
                if let Some(chunk) = chunks.get(&chunk_index) {
                    chunk.fill(from, to, marker);
                } else if marker != HEAP_ADDRESSABLE {
                    drop(chunks);
                    let mut chunks = self.chunks.write();
                    chunks
                        .entry(chunk_index)
                        .or_insert_with(ShadowChunk::new)
                        .fill(from, to, marker);
                }
            }

            current += to - from;
        }
    }
}

impl Drop for Shadow {
    fn drop(&mut self) {
        self.tear_down();
    }
}
