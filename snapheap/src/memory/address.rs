//! Address translation.
//!
//! A heap position is split into one index per trie level:
//!
//! ```text
//!  30         20 19         10 9          0
//! +-------------+-------------+------------+
//! |   segment   |    block    |    cell    |
//! +-------------+-------------+------------+
//! ```

use crate::error::{Fault, HeapError, Result};

/// A heap address. Valid positions are `0..=MAX_POSITION`.
pub type Position = u32;

pub const CELL_BITS: u32 = 10;
pub const BLOCK_BITS: u32 = 10;
pub const SEGMENT_BITS: u32 = 11;

pub const CELLS_PER_BLOCK: usize = 1 << CELL_BITS;
pub const BLOCKS_PER_SEGMENT: usize = 1 << BLOCK_BITS;
pub const SEGMENTS_PER_HEAP: usize = 1 << SEGMENT_BITS;

/// Largest addressable position.
pub const MAX_POSITION: Position = (1 << (CELL_BITS + BLOCK_BITS + SEGMENT_BITS)) - 1;

const _: () = assert!(MAX_POSITION == i32::MAX as Position);

/// A position together with its index at each trie level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Address {
    pub position: Position,
    pub segment: usize,
    pub block: usize,
    pub cell: usize,
}

impl Address {
    /// Splits `position` into segment, block and cell indices.
    pub fn translate(position: Position) -> Result<Self> {
        if position > MAX_POSITION {
            return Err(HeapError::fault(position, Fault::OutOfRange));
        }
        let raw = position as usize;
        Ok(Self {
            position,
            segment: raw >> (CELL_BITS + BLOCK_BITS),
            block: (raw >> CELL_BITS) & (BLOCKS_PER_SEGMENT - 1),
            cell: raw & (CELLS_PER_BLOCK - 1),
        })
    }

    pub(crate) fn fault(&self, fault: Fault) -> HeapError {
        HeapError::fault(self.position, fault)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_translate_nearby_positions_share_block() {
        let first = Address::translate(0).unwrap();
        let fifth = Address::translate(5).unwrap();
        assert_eq!((first.segment, first.block), (fifth.segment, fifth.block));
        assert_eq!(fifth.cell, 5);
    }

    #[test]
    fn test_translate_block_boundary() {
        let last = Address::translate(CELLS_PER_BLOCK as Position - 1).unwrap();
        let next = Address::translate(CELLS_PER_BLOCK as Position).unwrap();
        assert_eq!(last.block, 0);
        assert_eq!(last.cell, CELLS_PER_BLOCK - 1);
        assert_eq!(next.block, 1);
        assert_eq!(next.cell, 0);
        assert_eq!(last.segment, next.segment);
    }

    #[test]
    fn test_translate_max_position() {
        let max = Address::translate(MAX_POSITION).unwrap();
        assert_eq!(max.segment, SEGMENTS_PER_HEAP - 1);
        assert_eq!(max.block, BLOCKS_PER_SEGMENT - 1);
        assert_eq!(max.cell, CELLS_PER_BLOCK - 1);
    }

    #[test]
    fn test_translate_out_of_range() {
        let err = Address::translate(MAX_POSITION + 1).unwrap_err();
        assert_eq!(err.as_fault(), Some(Fault::OutOfRange));
    }
}
