//! Middle pages of the address-translation trie.

use super::VersionId;
use super::address::{Address, BLOCKS_PER_SEGMENT};
use super::block::Block;
use super::page::{PageTable, Versioned, promote};
use crate::error::{Fault, HeapError, PageKind, Result};
use std::sync::Arc;

/// A sparse page of blocks owned by one version.
#[derive(Debug, Clone)]
pub struct Segment {
    owner: VersionId,
    blocks: PageTable<Block>,
}

impl Segment {
    pub fn new(owner: VersionId) -> Self {
        Self {
            owner,
            blocks: PageTable::new(BLOCKS_PER_SEGMENT),
        }
    }

    /// Number of populated block slots.
    pub fn size(&self) -> usize {
        self.blocks.len()
    }

    /// Stores `block` at `index`. Returns `true` if the slot was empty.
    pub fn set_block(&mut self, index: usize, block: Block) -> Result<bool> {
        if block.owner() != self.owner {
            return Err(HeapError::DifferentVersionLink {
                page: PageKind::Block,
                expected: self.owner,
                found: block.owner(),
            });
        }
        self.blocks
            .insert(index, Arc::new(block))
            .ok_or(HeapError::PageIndexOutOfRange {
                page: PageKind::Block,
                index,
                capacity: self.blocks.capacity(),
            })
    }

    pub fn block(&self, address: Address) -> Result<&Block> {
        self.blocks
            .get(address.block)
            .map(Arc::as_ref)
            .ok_or_else(|| address.fault(Fault::UnmappedBlock))
    }

    /// Mutable access to an existing block, promoted to this segment's version.
    pub fn block_mut(&mut self, address: Address) -> Result<&mut Block> {
        let owner = self.owner;
        let slot = self
            .blocks
            .get_mut(address.block)
            .ok_or_else(|| address.fault(Fault::UnmappedBlock))?;
        promote(slot, owner)
    }

    /// Like [`Segment::block_mut`], but allocates the block when absent. The
    /// flag is `true` when the block was created by this call.
    pub(crate) fn block_or_insert(&mut self, address: Address) -> Result<(&mut Block, bool)> {
        let owner = self.owner;
        let (slot, created) = self
            .blocks
            .get_or_insert_with(address.block, || Block::new(owner))
            .ok_or_else(|| address.fault(Fault::OutOfRange))?;
        Ok((promote(slot, owner)?, created))
    }

    pub(crate) fn blocks(&self) -> impl Iterator<Item = &Block> {
        self.blocks.iter().map(|(_, block)| block.as_ref())
    }

    #[cfg(test)]
    pub(crate) fn shares_block_with(&self, other: &Segment, address: Address) -> bool {
        match (self.blocks.get(address.block), other.blocks.get(address.block)) {
            (Some(lhs), Some(rhs)) => Arc::ptr_eq(lhs, rhs),
            _ => false,
        }
    }
}

impl Versioned for Segment {
    const KIND: PageKind = PageKind::Segment;

    fn owner(&self) -> VersionId {
        self.owner
    }

    fn clone_for(&self, target: VersionId) -> Result<Self> {
        if target == self.owner {
            return Err(HeapError::CloneOverSameVersion {
                page: PageKind::Segment,
                version: target,
            });
        }
        Ok(Self {
            owner: target,
            blocks: self.blocks.clone(),
        })
    }
}
