//! Heap error taxonomy.
//!
//! Every error here signals a broken invariant in the caller (the evaluator or
//! the memory manager). None of them are retried inside the heap; they are
//! propagated up to whoever drives the interpreted program.

use crate::memory::{Position, VersionId};
use std::fmt;
use thiserror::Error;

/// Result type used across the heap.
pub type Result<T, E = HeapError> = std::result::Result<T, E>;

/// The level of the address-translation trie an error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    Heap,
    Segment,
    Block,
    Cell,
}

impl fmt::Display for PageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PageKind::Heap => "heap",
            PageKind::Segment => "segment",
            PageKind::Block => "block",
            PageKind::Cell => "cell",
        };
        f.write_str(name)
    }
}

/// Why an access produced a segmentation fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// The position is above [`crate::memory::MAX_POSITION`].
    OutOfRange,
    /// No segment was ever populated for this position.
    UnmappedSegment,
    /// The segment exists but the block was never populated.
    UnmappedBlock,
    /// The block exists but the cell slot was never populated.
    UnmappedCell,
    /// The cell has been freed.
    UseAfterFree,
    /// The cell is live but the operation requires a freed cell.
    NotFreed,
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            Fault::OutOfRange => "position out of range",
            Fault::UnmappedSegment => "unmapped segment",
            Fault::UnmappedBlock => "unmapped block",
            Fault::UnmappedCell => "unmapped cell",
            Fault::UseAfterFree => "use after free",
            Fault::NotFreed => "cell is not freed",
        };
        f.write_str(reason)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HeapError {
    #[error("heap segmentation fault at position {position}: {fault}")]
    SegmentationFault { position: Position, fault: Fault },

    #[error("reference count underflow at position {position}")]
    ReferenceCountUnderflow { position: Position },

    #[error("cannot free heap cell at position {position}: still referenced {references} time(s)")]
    FreeReferencedCell { position: Position, references: u32 },

    #[error("cannot clone {page} owned by {version} over the same version")]
    CloneOverSameVersion { page: PageKind, version: VersionId },

    #[error("cannot link {page} owned by {found} into {expected}")]
    DifferentVersionLink {
        page: PageKind,
        expected: VersionId,
        found: VersionId,
    },

    #[error("freed cell at position {position} is not the free list head ({head:?})")]
    FreeListMismatch {
        position: Position,
        head: Option<Position>,
    },

    #[error("heap cell at position {position} holds a frozen value")]
    FrozenValue { position: Position },

    #[error("{page} index {index} is out of range (capacity {capacity})")]
    PageIndexOutOfRange {
        page: PageKind,
        index: usize,
        capacity: usize,
    },

    #[error("heap address space exhausted")]
    AddressSpaceExhausted,

    #[error("unknown version {0}")]
    UnknownVersion(VersionId),

    #[error("version {requested} is not the current version {current}")]
    NotCurrentVersion {
        requested: VersionId,
        current: VersionId,
    },

    #[error("version {0} has no previous version")]
    NoPreviousVersion(VersionId),

    #[error("version chain limit of {limit} reached")]
    VersionLimitExceeded { limit: usize },

    #[error("version ids exhausted")]
    VersionIdsExhausted,
}

impl HeapError {
    pub(crate) fn fault(position: Position, fault: Fault) -> Self {
        HeapError::SegmentationFault { position, fault }
    }

    /// Returns the fault reason if this is a segmentation fault.
    pub fn as_fault(&self) -> Option<Fault> {
        match self {
            HeapError::SegmentationFault { fault, .. } => Some(*fault),
            _ => None,
        }
    }
}
