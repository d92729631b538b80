//! Leaf pages of the address-translation trie.

use super::address::{Address, CELLS_PER_BLOCK};
use super::cell::Cell;
use super::page::{PageTable, Versioned, promote};
use super::VersionId;
use crate::error::{Fault, HeapError, PageKind, Result};
use std::sync::Arc;

/// A sparse page of cells owned by one version.
#[derive(Debug, Clone)]
pub struct Block {
    owner: VersionId,
    cells: PageTable<Cell>,
}

impl Block {
    pub fn new(owner: VersionId) -> Self {
        Self {
            owner,
            cells: PageTable::new(CELLS_PER_BLOCK),
        }
    }

    /// Number of populated cell slots, live or freed.
    pub fn size(&self) -> usize {
        self.cells.len()
    }

    /// Stores `cell` in its slot. Returns `true` if the slot was empty.
    pub fn set_cell(&mut self, cell: Cell) -> Result<bool> {
        if cell.owner() != self.owner {
            return Err(HeapError::DifferentVersionLink {
                page: PageKind::Cell,
                expected: self.owner,
                found: cell.owner(),
            });
        }
        let address = Address::translate(cell.position())?;
        self.cells
            .insert(address.cell, Arc::new(cell))
            .ok_or_else(|| address.fault(Fault::OutOfRange))
    }

    pub fn cell(&self, address: Address) -> Result<&Cell> {
        self.cells
            .get(address.cell)
            .map(Arc::as_ref)
            .ok_or_else(|| address.fault(Fault::UnmappedCell))
    }

    /// Mutable access to a cell, cloning it into this block's version first
    /// when it is still owned by an ancestor.
    pub fn cell_mut(&mut self, address: Address) -> Result<&mut Cell> {
        let owner = self.owner;
        let slot = self
            .cells
            .get_mut(address.cell)
            .ok_or_else(|| address.fault(Fault::UnmappedCell))?;
        promote(slot, owner)
    }

    /// Cells not owned by this block's version.
    pub(crate) fn shared_cells(&self) -> usize {
        self.cells
            .iter()
            .filter(|(_, cell)| cell.owner() != self.owner)
            .count()
    }

    #[cfg(test)]
    pub(crate) fn shares_cell_with(&self, other: &Block, address: Address) -> bool {
        match (self.cells.get(address.cell), other.cells.get(address.cell)) {
            (Some(lhs), Some(rhs)) => Arc::ptr_eq(lhs, rhs),
            _ => false,
        }
    }
}

impl Versioned for Block {
    const KIND: PageKind = PageKind::Block;

    fn owner(&self) -> VersionId {
        self.owner
    }

    fn clone_for(&self, target: VersionId) -> Result<Self> {
        if target == self.owner {
            return Err(HeapError::CloneOverSameVersion {
                page: PageKind::Block,
                version: target,
            });
        }
        Ok(Self {
            owner: target,
            cells: self.cells.clone(),
        })
    }
}
