//! Block layout.
//!
//! Every allocation is one region of the raw heap:
//!
//! ```text
//! base                user                       trailer
//! |  BlockHeader  pad  |  user data  pad  | padding |  BlockTrailer  |
//! |<-- HEADER_SIZE --->|<-- granules -->|<-------->|<-TRAILER_SIZE->|
//! ```
//!
//! The header is the left redzone. Everything after the last requested
//! user byte is the right redzone. Header and trailer are read and written
//! as whole `#[repr(C)]` records at their fixed offsets from `base`.

use std::mem::size_of;

use crate::util::layout::{align_up, granule_align};

/// Marks a header written by a heap proxy.
pub(crate) const BLOCK_MAGIC: u32 = 0x5A5A_A5A5;

/// Alignment of user pointers.
pub const BLOCK_ALIGNMENT: usize = 16;

/// Bytes between the start of a block and its user data.
pub const HEADER_SIZE: usize = align_up(size_of::<BlockHeader>(), BLOCK_ALIGNMENT);

/// Bytes of the trailer record.
pub const TRAILER_SIZE: usize = granule_align(size_of::<BlockTrailer>());

/// Lifecycle state of a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    /// Handed out and not yet freed.
    Allocated,
    /// Freed and held in quarantine.
    Quarantined,
}

impl BlockState {
    const ALLOCATED: u32 = 1;
    const QUARANTINED: u32 = 2;

    fn to_raw(self) -> u32 {
        match self {
            BlockState::Allocated => Self::ALLOCATED,
            BlockState::Quarantined => Self::QUARANTINED,
        }
    }

    fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            Self::ALLOCATED => Some(BlockState::Allocated),
            Self::QUARANTINED => Some(BlockState::Quarantined),
            _ => None,
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy)]
pub(crate) struct BlockHeader {
    pub magic: u32,
    pub state: u32,
    pub size: usize,
    pub alloc_stack: usize,
    pub alloc_tid: u64,
    pub alloc_time: u64,
}

impl BlockHeader {
    pub fn state(&self) -> Option<BlockState> {
        BlockState::from_raw(self.state)
    }

    pub fn set_state(&mut self, state: BlockState) {
        self.state = state.to_raw();
    }

    pub fn is_valid(&self) -> bool {
        self.magic == BLOCK_MAGIC && self.state().is_some()
    }
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
pub(crate) struct BlockTrailer {
    pub free_stack: usize,
    pub free_tid: u64,
    pub free_time: u64,
}

/// Geometry of one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BlockLayout {
    pub size: usize,
    pub trailer_offset: usize,
    pub alloc_size: usize,
}

impl BlockLayout {
    /// Layout for a request of `size` bytes with `trailer_padding` extra
    /// right-redzone bytes. `None` if the total overflows.
    pub fn for_request(size: usize, trailer_padding: usize) -> Option<Self> {
        let user = size.max(1).checked_add(7)? & !7;
        let padding = trailer_padding.checked_add(7)? & !7;
        let trailer_offset = HEADER_SIZE.checked_add(user)?.checked_add(padding)?;
        let alloc_size = trailer_offset.checked_add(TRAILER_SIZE)?;
        if alloc_size > isize::MAX as usize {
            return None;
        }
        Some(Self {
            size,
            trailer_offset,
            alloc_size,
        })
    }

    /// Bytes of user data rounded up to whole granules.
    pub fn user_granules(&self) -> usize {
        granule_align(self.size.max(1))
    }
}

/// User pointer of the block at `base`.
#[inline]
pub(crate) fn user_pointer(base: usize) -> usize {
    base + HEADER_SIZE
}

/// Block base of a user pointer.
#[inline]
pub(crate) fn block_base(user: usize) -> Option<usize> {
    user.checked_sub(HEADER_SIZE)
}

/// # Safety
///
/// `base` must be the start of a live block.
pub(crate) unsafe fn read_header(base: usize) -> BlockHeader {
    std::ptr::read(base as *const BlockHeader)
}

/// # Safety
///
/// `base` must be the start of a live block.
pub(crate) unsafe fn write_header(base: usize, header: BlockHeader) {
    std::ptr::write(base as *mut BlockHeader, header);
}

/// # Safety
///
/// `base` must be the start of a live block whose layout is `layout`.
pub(crate) unsafe fn read_trailer(base: usize, layout: &BlockLayout) -> BlockTrailer {
    std::ptr::read((base + layout.trailer_offset) as *const BlockTrailer)
}

/// # Safety
///
/// `base` must be the start of a live block whose layout is `layout`.
pub(crate) unsafe fn write_trailer(base: usize, layout: &BlockLayout, trailer: BlockTrailer) {
    std::ptr::write((base + layout.trailer_offset) as *mut BlockTrailer, trailer);
}
