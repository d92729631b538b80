//! Heap versions.
//!
//! A version is one node of the timeline kept by the memory manager. It owns a
//! heap and the head of its free list, and knows its neighbours by id only.
//! The cell lifecycle operations are exposed here because they need both the
//! heap and the free list of the same version.

use super::cell::{Cell, CellState, FreeList};
use super::heap::Heap;
use super::page::Versioned;
use super::Position;
use crate::error::{Fault, HeapError, Result};
use crate::value::Value;
use std::fmt;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VersionId(u32);

impl VersionId {
    pub const ROOT: VersionId = VersionId(0);

    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn as_u32(self) -> u32 {
        self.0
    }

    /// The next id, `None` once the id space is used up.
    pub(crate) fn successor(self) -> Option<Self> {
        self.0.checked_add(1).map(Self)
    }
}

impl fmt::Display for VersionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionState {
    /// Receives writes.
    Active,
    /// Superseded by a fork; only read through structural sharing.
    Historical,
}

#[derive(Debug)]
pub struct Version {
    id: VersionId,
    previous: Option<VersionId>,
    next: Option<VersionId>,
    heap: Heap,
    free_list: FreeList,
    state: VersionState,
}

impl Version {
    /// Creates the first version of a timeline with an empty heap.
    pub fn root(id: VersionId) -> Self {
        Self {
            id,
            previous: None,
            next: None,
            heap: Heap::new(id),
            free_list: FreeList::default(),
            state: VersionState::Active,
        }
    }

    /// Creates a new version `id` whose heap shares every page with `self`.
    ///
    /// The new version is linked back to `self`; linking `self` forward is the
    /// caller's job.
    pub fn fork(&self, id: VersionId) -> Result<Version> {
        Ok(Self {
            id,
            previous: Some(self.id),
            next: None,
            heap: self.heap.clone_for(id)?,
            free_list: self.free_list,
            state: VersionState::Active,
        })
    }

    pub fn id(&self) -> VersionId {
        self.id
    }

    pub fn previous(&self) -> Option<VersionId> {
        self.previous
    }

    pub fn next(&self) -> Option<VersionId> {
        self.next
    }

    pub fn state(&self) -> VersionState {
        self.state
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn free_list(&self) -> FreeList {
        self.free_list
    }

    pub(crate) fn set_previous(&mut self, previous: Option<VersionId>) {
        self.previous = previous;
    }

    pub(crate) fn set_next(&mut self, next: Option<VersionId>) {
        self.next = next;
    }

    pub(crate) fn set_state(&mut self, state: VersionState) {
        self.state = state;
    }

    /// Allocates `value`, reusing the most recently freed cell if there is one.
    pub fn allocate(&mut self, value: Value) -> Result<Position> {
        if let Some(position) = self.free_list.head() {
            self.heap
                .get_mut(position)?
                .realloc(value, &mut self.free_list)?;
            trace!(version = %self.id, position, "allocate (recycled)");
            return Ok(position);
        }
        let position = self.heap.reserve_position()?;
        self.heap.set(Cell::allocate(position, self.id, value))?;
        trace!(version = %self.id, position, "allocate");
        Ok(position)
    }

    pub fn cell(&self, position: Position) -> Result<&Cell> {
        self.heap.get(position)
    }

    /// Write access to the value of a live, unfrozen cell. Nothing is copied
    /// when the cell is freed or frozen.
    pub fn value_mut(&mut self, position: Position) -> Result<&mut Value> {
        if self.heap.get(position)?.is_frozen() {
            return Err(HeapError::FrozenValue { position });
        }
        self.live_cell_mut(position)?.value_mut()
    }

    pub fn freeze(&mut self, position: Position) -> Result<()> {
        self.live_cell_mut(position)?.freeze()
    }

    pub fn retain(&mut self, position: Position) -> Result<u32> {
        self.live_cell_mut(position)?.increase_references()
    }

    /// Returns the value of the cell if this release freed it.
    pub fn release(&mut self, position: Position) -> Result<Option<Value>> {
        let cell = self.heap.get(position)?;
        if cell.references() == Some(0) {
            return Err(HeapError::ReferenceCountUnderflow { position });
        }
        // Same checks as `live_cell_mut`, with disjoint field borrows.
        self.heap.get(position)?.read()?;
        self.heap
            .get_mut(position)?
            .decrease_references(&mut self.free_list)
    }

    pub fn free(&mut self, position: Position) -> Result<Value> {
        if let Some(references @ 1..) = self.heap.get(position)?.references() {
            return Err(HeapError::FreeReferencedCell {
                position,
                references,
            });
        }
        // Same checks as `live_cell_mut`, with disjoint field borrows.
        self.heap.get(position)?.read()?;
        self.heap.get_mut(position)?.free(&mut self.free_list)
    }

    pub fn realloc(&mut self, position: Position, value: Value) -> Result<()> {
        let cell = self.heap.get(position)?;
        if !cell.is_freed() {
            return Err(HeapError::fault(position, Fault::NotFreed));
        }
        if self.free_list.head() != Some(position) {
            return Err(HeapError::FreeListMismatch {
                position,
                head: self.free_list.head(),
            });
        }
        self.heap
            .get_mut(position)?
            .realloc(value, &mut self.free_list)
    }

    /// Faults on a freed cell before anything is promoted.
    fn live_cell_mut(&mut self, position: Position) -> Result<&mut Cell> {
        self.heap.get(position)?.read()?;
        self.heap.get_mut(position)
    }

    /// Walks the free list from its head. Stops at the first broken link.
    pub fn free_cells(&self) -> FreeCells<'_> {
        FreeCells {
            heap: &self.heap,
            next: self.free_list.head(),
        }
    }

    /// Cells that are allocated and not freed.
    pub fn live_cells(&self) -> usize {
        self.heap.cell_count() as usize - self.free_cells().count()
    }
}

pub struct FreeCells<'a> {
    heap: &'a Heap,
    next: Option<Position>,
}

impl Iterator for FreeCells<'_> {
    type Item = Position;

    fn next(&mut self) -> Option<Position> {
        let position = self.next.take()?;
        match self.heap.get(position).map(Cell::state) {
            Ok(CellState::Freed { next_free }) => {
                self.next = *next_free;
                Some(position)
            }
            _ => None,
        }
    }
}
