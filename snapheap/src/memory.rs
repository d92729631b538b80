//! Versioned heap memory.
//!
//! The [`MemoryManager`] keeps a timeline of [`Version`]s and routes every
//! allocation, read and write to the current one. Forking a version is cheap:
//! the new heap shares all pages with its source and only copies a page the
//! first time it writes through it. Rolling back discards the versions after
//! the target; committing folds the current version into its predecessor's
//! place in the timeline.

mod address;
mod block;
mod cell;
mod heap;
mod page;
mod segment;
mod version;

pub use address::{
    Address, BLOCKS_PER_SEGMENT, CELLS_PER_BLOCK, MAX_POSITION, Position, SEGMENTS_PER_HEAP,
};
pub use block::Block;
pub use cell::{Cell, CellState, FreeList};
pub use heap::{Heap, PageCensus};
pub use page::Versioned;
pub use segment::Segment;
pub use version::{FreeCells, Version, VersionId, VersionState};

use crate::error::{Fault, HeapError, Result};
use crate::value::{Handle, Value};
use smallvec::SmallVec;
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Tunables for a [`MemoryManager`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryConfig {
    /// Maximum number of versions alive in the timeline at once.
    pub max_versions: usize,
    /// Release the children of a composite value when it is freed.
    pub cascade_release: bool,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_versions: 4096,
            cascade_release: true,
        }
    }
}

/// Snapshot of the manager's state, mostly for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryStats {
    pub versions: usize,
    pub current: VersionId,
    pub cell_count: u32,
    pub live_cells: usize,
    pub free_cells: usize,
    pub segments: usize,
    pub pages: PageCensus,
}

#[derive(Debug)]
pub struct MemoryManager {
    config: MemoryConfig,
    versions: BTreeMap<VersionId, Version>,
    root: VersionId,
    current: VersionId,
    next_id: VersionId,
}

impl Default for MemoryManager {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryManager {
    pub fn new() -> Self {
        Self::with_config(MemoryConfig::default())
    }

    pub fn with_config(config: MemoryConfig) -> Self {
        let root = Version::root(VersionId::ROOT);
        Self {
            config,
            versions: BTreeMap::from([(VersionId::ROOT, root)]),
            root: VersionId::ROOT,
            current: VersionId::ROOT,
            next_id: VersionId::new(VersionId::ROOT.as_u32() + 1),
        }
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    pub fn current_version(&self) -> VersionId {
        self.current
    }

    pub fn version(&self, id: VersionId) -> Option<&Version> {
        self.versions.get(&id)
    }

    /// Iterates the timeline from the oldest live version to the newest.
    pub fn chain(&self) -> impl Iterator<Item = &Version> {
        std::iter::successors(self.versions.get(&self.root), |version| {
            version.next().and_then(|next| self.versions.get(&next))
        })
    }

    /// Allocates `value` in the current version with no references.
    pub fn allocate(&mut self, value: Value) -> Result<Handle> {
        self.active_mut()?.allocate(value).map(Handle::new)
    }

    /// Reads the value behind `handle` without copying anything.
    pub fn dereference(&self, handle: Handle) -> Result<&Value> {
        self.active()?.cell(handle.position())?.read()
    }

    /// Write access to the value behind `handle`.
    ///
    /// Pages shared with older versions are copied first. Fails on frozen
    /// values.
    pub fn dereference_mut(&mut self, handle: Handle) -> Result<&mut Value> {
        self.active_mut()?.value_mut(handle.position())
    }

    /// Replaces the value behind `handle`, returning the previous one.
    ///
    /// Handles held by the previous value are not released; the caller
    /// decides what happens to them.
    pub fn write(&mut self, handle: Handle, value: Value) -> Result<Value> {
        Ok(std::mem::replace(self.dereference_mut(handle)?, value))
    }

    pub fn retain(&mut self, handle: Handle) -> Result<u32> {
        self.active_mut()?.retain(handle.position())
    }

    /// Drops one reference. A cell reaching zero references is freed.
    ///
    /// With cascading enabled, the release is checked against every value it
    /// would free first; if any of them would fail nothing is changed.
    pub fn release(&mut self, handle: Handle) -> Result<()> {
        let cell = self.active()?.cell(handle.position())?;
        if cell.references() == Some(1) {
            self.check_cascade(handle, cell.read()?.children())?;
        }
        let freed = self.active_mut()?.release(handle.position())?;
        match freed {
            Some(value) => self.release_children(value),
            None => Ok(()),
        }
    }

    /// Frees a cell that holds no references. Cascades like
    /// [`MemoryManager::release`].
    pub fn free(&mut self, handle: Handle) -> Result<()> {
        let cell = self.active()?.cell(handle.position())?;
        if cell.references() == Some(0) {
            self.check_cascade(handle, cell.read()?.children())?;
        }
        let value = self.active_mut()?.free(handle.position())?;
        self.release_children(value)
    }

    /// Puts `value` into a freed cell. The cell must be the most recently
    /// freed one in the current version.
    pub fn realloc(&mut self, handle: Handle, value: Value) -> Result<()> {
        self.active_mut()?.realloc(handle.position(), value)
    }

    pub fn is_frozen(&self, handle: Handle) -> Result<bool> {
        let cell = self.active()?.cell(handle.position())?;
        cell.read()?;
        Ok(cell.is_frozen())
    }

    pub fn freeze(&mut self, handle: Handle) -> Result<()> {
        self.active_mut()?.freeze(handle.position())
    }

    /// Forks `base`, which must be the current version, and makes the fork
    /// current.
    pub fn fork_version(&mut self, base: VersionId) -> Result<VersionId> {
        self.ensure_current(base)?;
        if self.versions.len() >= self.config.max_versions {
            return Err(HeapError::VersionLimitExceeded {
                limit: self.config.max_versions,
            });
        }
        let id = self.next_id;
        let next_id = id.successor().ok_or(HeapError::VersionIdsExhausted)?;
        let source = self.version_mut(base)?;
        let fork = source.fork(id)?;
        source.set_next(Some(id));
        source.set_state(VersionState::Historical);
        self.versions.insert(id, fork);
        self.next_id = next_id;
        self.current = id;
        debug!(%base, fork = %id, "forked version");
        Ok(id)
    }

    /// Discards every version after `id` and makes `id` current again.
    pub fn rollback_to(&mut self, id: VersionId) -> Result<()> {
        let mut next = self.version_mut(id)?.next();
        let mut discarded = 0;
        while let Some(detached) = next {
            next = self
                .versions
                .remove(&detached)
                .and_then(|version| version.next());
            discarded += 1;
        }
        let version = self.version_mut(id)?;
        version.set_next(None);
        version.set_state(VersionState::Active);
        self.current = id;
        debug!(version = %id, discarded, "rolled back");
        Ok(())
    }

    /// Keeps the changes of `id`, the current version, and detaches its
    /// predecessor. `id` takes the predecessor's place in the timeline.
    pub fn commit(&mut self, id: VersionId) -> Result<()> {
        self.ensure_current(id)?;
        let previous = self
            .version_mut(id)?
            .previous()
            .ok_or(HeapError::NoPreviousVersion(id))?;
        let detached = self
            .versions
            .remove(&previous)
            .ok_or(HeapError::UnknownVersion(previous))?;
        let before = detached.previous();
        self.version_mut(id)?.set_previous(before);
        match before {
            Some(before) => self.version_mut(before)?.set_next(Some(id)),
            None => self.root = id,
        }
        debug!(version = %id, detached = %previous, "committed");
        Ok(())
    }

    /// Runs `branch` on a fork of the current version.
    ///
    /// The fork is committed when `branch` returns `Ok(true)`. On `Ok(false)`
    /// or an error the heap is rolled back to where it was before the call,
    /// and the error, if any, is returned afterwards.
    pub fn speculate<F>(&mut self, branch: F) -> Result<bool>
    where
        F: FnOnce(&mut MemoryManager) -> Result<bool>,
    {
        let base = self.current;
        let fork = self.fork_version(base)?;
        match branch(self) {
            Ok(true) => {
                // Drop whatever the branch left forked below its own version.
                self.rollback_to(fork)?;
                self.commit(fork)?;
                Ok(true)
            }
            Ok(false) => {
                self.rollback_to(base)?;
                Ok(false)
            }
            Err(err) => {
                self.rollback_to(base)?;
                Err(err)
            }
        }
    }

    pub fn stats(&self) -> Result<MemoryStats> {
        let version = self.active()?;
        let heap = version.heap();
        let free_cells = version.free_cells().count();
        Ok(MemoryStats {
            versions: self.versions.len(),
            current: self.current,
            cell_count: heap.cell_count(),
            live_cells: heap.cell_count() as usize - free_cells,
            free_cells,
            segments: heap.size(),
            pages: heap.census(),
        })
    }

    /// Replays the release cascade of `parent` without touching the heap.
    /// Fails with the error the real cascade would hit.
    fn check_cascade(&self, parent: Handle, children: SmallVec<[Handle; 4]>) -> Result<()> {
        if !self.config.cascade_release {
            return Ok(());
        }
        let version = self.active()?;
        // Remaining references per visited cell, `None` once freed.
        let mut remaining = BTreeMap::from([(parent.position(), None)]);
        let mut pending = children;
        while let Some(child) = pending.pop() {
            let position = child.position();
            let cell = version.cell(position)?;
            let references = remaining
                .entry(position)
                .or_insert_with(|| cell.references());
            match *references {
                None => return Err(HeapError::fault(position, Fault::UseAfterFree)),
                Some(0) => return Err(HeapError::ReferenceCountUnderflow { position }),
                Some(1) => {
                    *references = None;
                    pending.extend(cell.read()?.children());
                }
                Some(count) => *references = Some(count - 1),
            }
        }
        Ok(())
    }

    fn release_children(&mut self, value: Value) -> Result<()> {
        if !self.config.cascade_release {
            return Ok(());
        }
        let mut pending = value.children();
        while let Some(child) = pending.pop() {
            match self.active_mut()?.release(child.position()) {
                Ok(Some(freed)) => pending.extend(freed.children()),
                Ok(None) => {}
                Err(err) => {
                    warn!(%child, %err, "release cascade failed");
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    fn ensure_current(&self, id: VersionId) -> Result<()> {
        if !self.versions.contains_key(&id) {
            return Err(HeapError::UnknownVersion(id));
        }
        if id != self.current {
            return Err(HeapError::NotCurrentVersion {
                requested: id,
                current: self.current,
            });
        }
        Ok(())
    }

    fn active(&self) -> Result<&Version> {
        self.versions
            .get(&self.current)
            .ok_or(HeapError::UnknownVersion(self.current))
    }

    fn active_mut(&mut self) -> Result<&mut Version> {
        let current = self.current;
        self.version_mut(current)
    }

    fn version_mut(&mut self, id: VersionId) -> Result<&mut Version> {
        self.versions
            .get_mut(&id)
            .ok_or(HeapError::UnknownVersion(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::smallvec;

    #[test]
    fn test_allocate_and_dereference() {
        let mut memory = MemoryManager::new();
        let handle = memory.allocate(Value::from("crab")).unwrap();
        assert_eq!(memory.dereference(handle).unwrap(), &Value::from("crab"));
        *memory.dereference_mut(handle).unwrap() = Value::Int(1);
        assert_eq!(memory.write(handle, Value::Int(2)).unwrap(), Value::Int(1));
        assert_eq!(memory.dereference(handle).unwrap(), &Value::Int(2));
    }

    #[test]
    fn test_fork_rollback() {
        let mut memory = MemoryManager::new();
        let handle = memory.allocate(Value::Int(1)).unwrap();
        let base = memory.current_version();

        let fork = memory.fork_version(base).unwrap();
        assert_eq!(memory.version(base).unwrap().state(), VersionState::Historical);
        memory.write(handle, Value::Int(2)).unwrap();
        let extra = memory.allocate(Value::Int(3)).unwrap();
        assert_eq!(memory.version(fork).unwrap().previous(), Some(base));

        memory.rollback_to(base).unwrap();
        assert_eq!(memory.current_version(), base);
        assert!(memory.version(fork).is_none());
        assert_eq!(memory.version(base).unwrap().state(), VersionState::Active);
        assert_eq!(memory.dereference(handle).unwrap(), &Value::Int(1));
        assert_eq!(
            memory.dereference(extra).unwrap_err().as_fault(),
            Some(Fault::UnmappedCell)
        );
    }

    #[test]
    fn test_commit_replaces_previous() {
        let mut memory = MemoryManager::new();
        let handle = memory.allocate(Value::Int(1)).unwrap();
        let base = memory.current_version();
        let first = memory.fork_version(base).unwrap();
        let second = memory.fork_version(first).unwrap();
        memory.write(handle, Value::Int(3)).unwrap();

        memory.commit(second).unwrap();
        let ids: Vec<_> = memory.chain().map(Version::id).collect();
        assert_eq!(ids, vec![base, second]);
        assert_eq!(memory.version(base).unwrap().next(), Some(second));
        assert_eq!(memory.dereference(handle).unwrap(), &Value::Int(3));

        memory.commit(second).unwrap();
        let ids: Vec<_> = memory.chain().map(Version::id).collect();
        assert_eq!(ids, vec![second]);
        assert_eq!(memory.commit(second), Err(HeapError::NoPreviousVersion(second)));
    }

    #[test]
    fn test_fork_requires_current() {
        let mut memory = MemoryManager::new();
        let base = memory.current_version();
        let fork = memory.fork_version(base).unwrap();
        assert_eq!(
            memory.fork_version(base),
            Err(HeapError::NotCurrentVersion {
                requested: base,
                current: fork
            })
        );
        let unknown = VersionId::new(99);
        assert_eq!(
            memory.fork_version(unknown),
            Err(HeapError::UnknownVersion(unknown))
        );
        assert_eq!(
            memory.rollback_to(unknown),
            Err(HeapError::UnknownVersion(unknown))
        );
    }

    #[test]
    fn test_version_limit() {
        let mut memory = MemoryManager::with_config(MemoryConfig {
            max_versions: 2,
            ..MemoryConfig::default()
        });
        assert_eq!(memory.config().max_versions, 2);
        let base = memory.current_version();
        let fork = memory.fork_version(base).unwrap();
        assert_eq!(
            memory.fork_version(fork),
            Err(HeapError::VersionLimitExceeded { limit: 2 })
        );
    }

    #[test]
    fn test_version_ids_exhausted() {
        let mut memory = MemoryManager::new();
        memory.next_id = VersionId::new(u32::MAX - 1);
        let base = memory.current_version();
        let last = memory.fork_version(base).unwrap();
        assert_eq!(last.as_u32(), u32::MAX - 1);
        assert_eq!(
            memory.fork_version(last),
            Err(HeapError::VersionIdsExhausted)
        );
        assert_eq!(memory.current_version(), last);
        assert_eq!(memory.version(last).unwrap().next(), None);
        assert_eq!(memory.chain().count(), 2);
    }

    #[test]
    fn test_release_cascades_to_children() {
        let mut memory = MemoryManager::new();
        let leaf = memory.allocate(Value::Int(1)).unwrap();
        memory.retain(leaf).unwrap();
        let inner = memory.allocate(Value::List(smallvec![leaf])).unwrap();
        memory.retain(inner).unwrap();
        let outer = memory.allocate(Value::Ref(inner)).unwrap();
        memory.retain(outer).unwrap();

        memory.release(outer).unwrap();
        for handle in [outer, inner, leaf] {
            assert_eq!(
                memory.dereference(handle).unwrap_err().as_fault(),
                Some(Fault::UseAfterFree)
            );
        }
        assert_eq!(memory.stats().unwrap().free_cells, 3);
    }

    #[test]
    fn test_failed_cascade_changes_nothing() {
        let mut memory = MemoryManager::new();
        let leaf = memory.allocate(Value::Int(1)).unwrap();
        memory.retain(leaf).unwrap();
        // The list holds `leaf` twice but only one reference was taken.
        let list = memory.allocate(Value::List(smallvec![leaf, leaf])).unwrap();
        memory.retain(list).unwrap();

        assert_eq!(
            memory.release(list).unwrap_err().as_fault(),
            Some(Fault::UseAfterFree)
        );
        let references = |handle: Handle| {
            memory
                .active()
                .unwrap()
                .cell(handle.position())
                .unwrap()
                .references()
        };
        assert_eq!(references(list), Some(1));
        assert_eq!(references(leaf), Some(1));
        assert_eq!(memory.stats().unwrap().free_cells, 0);

        // Same check when the cascade starts from an explicit free.
        let holder = memory.allocate(Value::Ref(list)).unwrap();
        assert_eq!(
            memory.free(holder).unwrap_err().as_fault(),
            Some(Fault::UseAfterFree)
        );
        assert_eq!(memory.dereference(holder).unwrap(), &Value::Ref(list));
        assert_eq!(memory.stats().unwrap().free_cells, 0);
    }

    #[test]
    fn test_cascade_through_cycle_faults_up_front() {
        let mut memory = MemoryManager::new();
        let a = memory.allocate(Value::Nil).unwrap();
        let b = memory.allocate(Value::Ref(a)).unwrap();
        memory.retain(b).unwrap();
        memory.write(a, Value::Ref(b)).unwrap();
        memory.retain(a).unwrap();

        // Freeing `a` through `b` leads back to `a`, which is already gone.
        assert_eq!(
            memory.release(a),
            Err(HeapError::fault(a.position(), Fault::UseAfterFree))
        );
        assert_eq!(memory.dereference(a).unwrap(), &Value::Ref(b));
        assert_eq!(memory.dereference(b).unwrap(), &Value::Ref(a));
    }

    #[test]
    fn test_release_without_cascade() {
        let mut memory = MemoryManager::with_config(MemoryConfig {
            cascade_release: false,
            ..MemoryConfig::default()
        });
        let leaf = memory.allocate(Value::Int(1)).unwrap();
        memory.retain(leaf).unwrap();
        let list = memory.allocate(Value::List(smallvec![leaf])).unwrap();
        memory.free(list).unwrap();
        assert_eq!(memory.dereference(leaf).unwrap(), &Value::Int(1));
    }

    #[test]
    fn test_freeze() {
        let mut memory = MemoryManager::new();
        let handle = memory.allocate(Value::List(smallvec![])).unwrap();
        assert!(!memory.is_frozen(handle).unwrap());
        memory.freeze(handle).unwrap();
        assert!(memory.is_frozen(handle).unwrap());
        assert_eq!(
            memory.write(handle, Value::Nil),
            Err(HeapError::FrozenValue {
                position: handle.position()
            })
        );
        // Frozen values still read normally.
        assert_eq!(memory.dereference(handle).unwrap(), &Value::List(smallvec![]));
    }

    #[test]
    fn test_freeze_in_fork_is_isolated() {
        let mut memory = MemoryManager::new();
        let handle = memory.allocate(Value::Int(1)).unwrap();
        let base = memory.current_version();
        memory.fork_version(base).unwrap();
        memory.freeze(handle).unwrap();
        memory.rollback_to(base).unwrap();
        assert!(!memory.is_frozen(handle).unwrap());
    }

    #[test]
    fn test_speculate() {
        let mut memory = MemoryManager::new();
        let handle = memory.allocate(Value::Int(0)).unwrap();

        let kept = memory
            .speculate(|memory| {
                memory.write(handle, Value::Int(1))?;
                Ok(true)
            })
            .unwrap();
        assert!(kept);
        assert_eq!(memory.dereference(handle).unwrap(), &Value::Int(1));

        let kept = memory
            .speculate(|memory| {
                memory.write(handle, Value::Int(2))?;
                Ok(false)
            })
            .unwrap();
        assert!(!kept);
        assert_eq!(memory.dereference(handle).unwrap(), &Value::Int(1));

        let err = memory
            .speculate(|memory| {
                memory.write(handle, Value::Int(3))?;
                memory.release(handle)?;
                Ok(true)
            })
            .unwrap_err();
        assert_eq!(err, HeapError::ReferenceCountUnderflow { position: 0 });
        assert_eq!(memory.dereference(handle).unwrap(), &Value::Int(1));
        assert_eq!(memory.chain().count(), 1);
    }

    #[test]
    fn test_nested_speculation() {
        let mut memory = MemoryManager::new();
        let handle = memory.allocate(Value::Int(0)).unwrap();
        memory
            .speculate(|memory| {
                memory.write(handle, Value::Int(1))?;
                let inner = memory.speculate(|memory| {
                    memory.write(handle, Value::Int(2))?;
                    Ok(false)
                })?;
                assert!(!inner);
                assert_eq!(memory.dereference(handle)?, &Value::Int(1));
                // Left forked on purpose; the outer commit discards it.
                let current = memory.current_version();
                memory.fork_version(current)?;
                memory.write(handle, Value::Int(5))?;
                Ok(true)
            })
            .unwrap();
        assert_eq!(memory.dereference(handle).unwrap(), &Value::Int(1));
        assert_eq!(memory.stats().unwrap().versions, 1);
    }

    #[test]
    fn test_stats() {
        let mut memory = MemoryManager::new();
        let a = memory.allocate(Value::Int(1)).unwrap();
        memory.allocate(Value::Int(2)).unwrap();
        memory.free(a).unwrap();
        let stats = memory.stats().unwrap();
        assert_eq!(stats.versions, 1);
        assert_eq!(stats.current, VersionId::ROOT);
        assert_eq!(stats.cell_count, 2);
        assert_eq!(stats.live_cells, 1);
        assert_eq!(stats.free_cells, 1);
        assert_eq!(stats.segments, 1);
        assert_eq!(stats.pages.owned_cells, 2);
    }
}
