//! FIFO of freed blocks awaiting release.

use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct QuarantinedBlock {
    pub base: usize,
    pub alloc_size: usize,
}

/// Freed blocks, oldest first, with their running byte total.
#[derive(Debug)]
pub(crate) struct Quarantine {
    blocks: VecDeque<QuarantinedBlock>,
    size: usize,
    max_size: usize,
}

impl Quarantine {
    pub fn new(max_size: usize) -> Self {
        Self {
            blocks: VecDeque::new(),
            size: 0,
            max_size,
        }
    }

    /// Add the newest block.
    pub fn push(&mut self, base: usize, alloc_size: usize) {
        self.blocks.push_back(QuarantinedBlock { base, alloc_size });
        self.size += alloc_size;
    }

    /// Remove the oldest block while the total exceeds the cap.
    pub fn pop_overage(&mut self) -> Option<QuarantinedBlock> {
        if self.size <= self.max_size {
            return None;
        }
        let block = self.blocks.pop_front()?;
        debug_assert!(self.size >= block.alloc_size);
        self.size -= block.alloc_size;
        Some(block)
    }

    /// Remove every block, oldest first.
    pub fn drain(&mut self) -> impl Iterator<Item = QuarantinedBlock> + '_ {
        self.size = 0;
        self.blocks.drain(..)
    }

    pub fn set_max_size(&mut self, max_size: usize) {
        self.max_size = max_size;
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }
}
