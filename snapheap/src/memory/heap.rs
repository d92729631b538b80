//! Per-version root of the address-translation trie.
//!
//! A heap maps positions to cells through two levels of pages:
//! segment → block → cell. Forking a heap copies only the segment table; every
//! page below it is shared with the source heap and tagged with the version
//! that created it. The write path ([`Heap::get_mut`], [`Heap::set`]) clones
//! each page on the way down that belongs to a different version, so a write
//! never reaches a page another version can see.

use super::address::{Address, MAX_POSITION, SEGMENTS_PER_HEAP};
use super::cell::Cell;
use super::page::{PageTable, Versioned, promote};
use super::segment::Segment;
use super::{Position, VersionId};
use crate::error::{Fault, HeapError, PageKind, Result};
use tracing::{debug, trace};

#[derive(Debug, Clone)]
pub struct Heap {
    owner: VersionId,
    segments: PageTable<Segment>,
    /// Cells ever materialized in this lineage. Also the next fresh position.
    cell_count: u32,
}

/// Page ownership summary of a heap.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageCensus {
    pub owned_segments: usize,
    pub shared_segments: usize,
    pub owned_blocks: usize,
    pub shared_blocks: usize,
    pub owned_cells: usize,
    pub shared_cells: usize,
}

impl Heap {
    pub fn new(owner: VersionId) -> Self {
        Self {
            owner,
            segments: PageTable::new(SEGMENTS_PER_HEAP),
            cell_count: 0,
        }
    }

    /// Number of populated segments.
    pub fn size(&self) -> usize {
        self.segments.len()
    }

    pub fn cell_count(&self) -> u32 {
        self.cell_count
    }

    /// Hands out the next never-used position.
    pub fn reserve_position(&mut self) -> Result<Position> {
        let position = self.cell_count;
        if position > MAX_POSITION {
            return Err(HeapError::AddressSpaceExhausted);
        }
        self.cell_count += 1;
        Ok(position)
    }

    /// Stores `cell` at its position, allocating pages lazily.
    ///
    /// Returns `true` when a new segment or block was created. The cell must
    /// belong to this heap's version.
    pub fn set(&mut self, cell: Cell) -> Result<bool> {
        if cell.owner() != self.owner {
            return Err(HeapError::DifferentVersionLink {
                page: PageKind::Cell,
                expected: self.owner,
                found: cell.owner(),
            });
        }
        let address = Address::translate(cell.position())?;
        let owner = self.owner;
        let (slot, new_segment) = self
            .segments
            .get_or_insert_with(address.segment, || Segment::new(owner))
            .ok_or_else(|| address.fault(Fault::OutOfRange))?;
        if new_segment {
            debug!(segment = address.segment, %owner, "new segment");
        }
        let (block, new_block) = promote(slot, owner)?.block_or_insert(address)?;
        if new_block {
            trace!(segment = address.segment, block = address.block, %owner, "new block");
        }
        block.set_cell(cell)?;
        Ok(new_segment || new_block)
    }

    /// Resolves `position` for reading. Never clones.
    pub fn get(&self, position: Position) -> Result<&Cell> {
        let address = Address::translate(position)?;
        self.segments
            .get(address.segment)
            .ok_or_else(|| address.fault(Fault::UnmappedSegment))?
            .block(address)?
            .cell(address)
    }

    /// Resolves `position` for writing.
    ///
    /// The segment, block and cell are cloned into this heap's version when
    /// they belong to another one.
    pub fn get_mut(&mut self, position: Position) -> Result<&mut Cell> {
        // Fault before promoting anything on the way down.
        self.get(position)?;
        let address = Address::translate(position)?;
        let owner = self.owner;
        let slot = self
            .segments
            .get_mut(address.segment)
            .ok_or_else(|| address.fault(Fault::UnmappedSegment))?;
        promote(slot, owner)?
            .block_mut(address)?
            .cell_mut(address)
    }

    pub fn census(&self) -> PageCensus {
        let mut census = PageCensus::default();
        for (_, segment) in self.segments.iter() {
            let owned = segment.owner() == self.owner;
            if owned {
                census.owned_segments += 1;
            } else {
                census.shared_segments += 1;
            }
            for block in segment.blocks() {
                let cells = block.size();
                if owned && block.owner() == self.owner {
                    census.owned_blocks += 1;
                    let shared = block.shared_cells();
                    census.shared_cells += shared;
                    census.owned_cells += cells - shared;
                } else {
                    census.shared_blocks += 1;
                    census.shared_cells += cells;
                }
            }
        }
        census
    }

    #[cfg(test)]
    pub(crate) fn segment(&self, position: Position) -> Option<&Segment> {
        let address = Address::translate(position).ok()?;
        self.segments.get(address.segment).map(|segment| &**segment)
    }
}

impl Versioned for Heap {
    const KIND: PageKind = PageKind::Heap;

    fn owner(&self) -> VersionId {
        self.owner
    }

    /// Returns a heap for `target` that shares every segment with `self`.
    fn clone_for(&self, target: VersionId) -> Result<Self> {
        if target == self.owner {
            return Err(HeapError::CloneOverSameVersion {
                page: PageKind::Heap,
                version: target,
            });
        }
        Ok(Self {
            owner: target,
            segments: self.segments.clone(),
            cell_count: self.cell_count,
        })
    }
}
