//! Heap cells and the intrusive free list.
//!
//! A cell is either alive (value, reference count, frozen bit) or freed. A
//! freed cell keeps no value; its only payload is the link to the cell freed
//! before it, which threads the free list of its version through the heap.
//!
//! Reference counts live in an [`AtomicU32`] so a cell shared between
//! versions can be inspected from any thread. Every mutation goes through
//! `&mut Cell`, which the heap only hands out after copy-on-write.

use super::page::Versioned;
use super::{Position, VersionId};
use crate::error::{Fault, HeapError, PageKind, Result};
use crate::value::Value;
use std::mem;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::trace;

/// Head of a version's free list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FreeList {
    head: Option<Position>,
}

impl FreeList {
    /// The most recently freed position, if any.
    pub fn head(&self) -> Option<Position> {
        self.head
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }
}

#[derive(Debug)]
pub enum CellState {
    Alive {
        value: Value,
        references: AtomicU32,
        frozen: bool,
    },
    Freed {
        /// The cell freed before this one, `None` at the end of the list.
        next_free: Option<Position>,
    },
}

impl Clone for CellState {
    fn clone(&self) -> Self {
        match self {
            CellState::Alive {
                value,
                references,
                frozen,
            } => CellState::Alive {
                value: value.clone(),
                references: AtomicU32::new(references.load(Ordering::Acquire)),
                frozen: *frozen,
            },
            CellState::Freed { next_free } => CellState::Freed {
                next_free: *next_free,
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct Cell {
    position: Position,
    owner: VersionId,
    state: CellState,
}

impl Cell {
    /// Creates a live cell with no references.
    pub fn allocate(position: Position, owner: VersionId, value: Value) -> Self {
        Self {
            position,
            owner,
            state: CellState::Alive {
                value,
                references: AtomicU32::new(0),
                frozen: false,
            },
        }
    }

    pub fn position(&self) -> Position {
        self.position
    }

    pub fn state(&self) -> &CellState {
        &self.state
    }

    pub fn is_freed(&self) -> bool {
        matches!(self.state, CellState::Freed { .. })
    }

    /// The stored value, `None` once freed.
    pub fn value(&self) -> Option<&Value> {
        match &self.state {
            CellState::Alive { value, .. } => Some(value),
            CellState::Freed { .. } => None,
        }
    }

    /// The live reference count, `None` once freed.
    pub fn references(&self) -> Option<u32> {
        match &self.state {
            CellState::Alive { references, .. } => Some(references.load(Ordering::Acquire)),
            CellState::Freed { .. } => None,
        }
    }

    pub fn is_frozen(&self) -> bool {
        matches!(self.state, CellState::Alive { frozen: true, .. })
    }

    /// Reads the value, faulting on a freed cell.
    pub fn read(&self) -> Result<&Value> {
        self.value().ok_or_else(|| self.fault(Fault::UseAfterFree))
    }

    /// Mutable access to the value of a live, unfrozen cell.
    pub fn value_mut(&mut self) -> Result<&mut Value> {
        let position = self.position;
        match &mut self.state {
            CellState::Alive { frozen: true, .. } => Err(HeapError::FrozenValue { position }),
            CellState::Alive { value, .. } => Ok(value),
            CellState::Freed { .. } => Err(HeapError::fault(position, Fault::UseAfterFree)),
        }
    }

    /// Marks the value immutable. Freezing twice is allowed.
    pub fn freeze(&mut self) -> Result<()> {
        match &mut self.state {
            CellState::Alive { frozen, .. } => {
                *frozen = true;
                Ok(())
            }
            CellState::Freed { .. } => Err(HeapError::fault(self.position, Fault::UseAfterFree)),
        }
    }

    /// Returns the new reference count.
    pub fn increase_references(&mut self) -> Result<u32> {
        let references = self.live_references()?;
        *references += 1;
        let count = *references;
        trace!(position = self.position, count, "retain");
        Ok(count)
    }

    /// Drops one reference. When the count reaches zero the cell is freed
    /// and its value returned so the caller can release what it referenced.
    pub fn decrease_references(&mut self, free_list: &mut FreeList) -> Result<Option<Value>> {
        let position = self.position;
        let references = self.live_references()?;
        if *references == 0 {
            return Err(HeapError::ReferenceCountUnderflow { position });
        }
        *references -= 1;
        let count = *references;
        trace!(position, count, "release");
        if count == 0 {
            Ok(Some(self.push_free(free_list)))
        } else {
            Ok(None)
        }
    }

    /// Frees a cell that is not referenced, returning its value.
    pub fn free(&mut self, free_list: &mut FreeList) -> Result<Value> {
        let position = self.position;
        let references = *self.live_references()?;
        if references > 0 {
            return Err(HeapError::FreeReferencedCell {
                position,
                references,
            });
        }
        Ok(self.push_free(free_list))
    }

    /// Reuses a freed cell for `value`. The cell must be the free list head.
    pub fn realloc(&mut self, value: Value, free_list: &mut FreeList) -> Result<()> {
        let CellState::Freed { next_free } = self.state else {
            return Err(self.fault(Fault::NotFreed));
        };
        if free_list.head != Some(self.position) {
            return Err(HeapError::FreeListMismatch {
                position: self.position,
                head: free_list.head,
            });
        }
        free_list.head = next_free;
        self.state = CellState::Alive {
            value,
            references: AtomicU32::new(0),
            frozen: false,
        };
        trace!(position = self.position, ?next_free, "realloc");
        Ok(())
    }

    fn live_references(&mut self) -> Result<&mut u32> {
        match &mut self.state {
            CellState::Alive { references, .. } => Ok(references.get_mut()),
            CellState::Freed { .. } => Err(HeapError::fault(self.position, Fault::UseAfterFree)),
        }
    }

    /// Callers must have checked that the cell is alive.
    fn push_free(&mut self, free_list: &mut FreeList) -> Value {
        let freed = CellState::Freed {
            next_free: free_list.head,
        };
        free_list.head = Some(self.position);
        trace!(position = self.position, "free");
        match mem::replace(&mut self.state, freed) {
            CellState::Alive { value, .. } => value,
            CellState::Freed { .. } => Value::Nil,
        }
    }

    fn fault(&self, fault: Fault) -> HeapError {
        HeapError::fault(self.position, fault)
    }
}

impl Versioned for Cell {
    const KIND: PageKind = PageKind::Cell;

    fn owner(&self) -> VersionId {
        self.owner
    }

    fn clone_for(&self, target: VersionId) -> Result<Self> {
        if target == self.owner {
            return Err(HeapError::CloneOverSameVersion {
                page: PageKind::Cell,
                version: target,
            });
        }
        Ok(Self {
            position: self.position,
            owner: target,
            state: self.state.clone(),
        })
    }
}
