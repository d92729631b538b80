//! Sparse page tables shared across versions.
//!
//! Every trie level stores its children in a [`PageTable`]: a lazily grown
//! vector of `Option<Arc<T>>` slots. Cloning a table is shallow, so a forked
//! heap shares every child page with its source until one is promoted for a
//! write.

use super::VersionId;
use crate::error::{PageKind, Result};
use std::sync::Arc;
use tracing::trace;

/// Something owned by exactly one version that can be copied into another.
pub trait Versioned: Clone {
    const KIND: PageKind;

    fn owner(&self) -> VersionId;

    /// Copies `self` into `target`. Children stay shared.
    fn clone_for(&self, target: VersionId) -> Result<Self>;
}

/// Returns a mutable reference to the page in `slot`, promoted to `owner`.
///
/// A page owned by another version is cloned into `owner` first. A page that
/// `owner` already owns but that is still shared with a forked heap is copied
/// as well, so the other heap never observes the write.
pub(crate) fn promote<T: Versioned>(slot: &mut Arc<T>, owner: VersionId) -> Result<&mut T> {
    if slot.owner() != owner {
        let kind = T::KIND;
        trace!(%kind, from = %slot.owner(), to = %owner, "promoting page");
        *slot = Arc::new(slot.clone_for(owner)?);
    }
    Ok(Arc::make_mut(slot))
}

#[derive(Debug)]
pub(crate) struct PageTable<T> {
    slots: Vec<Option<Arc<T>>>,
    len: usize,
    capacity: usize,
}

impl<T> Clone for PageTable<T> {
    fn clone(&self) -> Self {
        Self {
            slots: self.slots.clone(),
            len: self.len,
            capacity: self.capacity,
        }
    }
}

impl<T> PageTable<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Vec::new(),
            len: 0,
            capacity,
        }
    }

    /// Number of populated slots.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn get(&self, index: usize) -> Option<&Arc<T>> {
        self.slots.get(index).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Arc<T>> {
        self.slots.get_mut(index).and_then(Option::as_mut)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Stores `page` at `index`. Returns `true` if the slot was empty, `None`
    /// if `index` is past the table's capacity.
    pub fn insert(&mut self, index: usize, page: Arc<T>) -> Option<bool> {
        let slot = self.slot(index)?;
        let populated = slot.replace(page).is_none();
        if populated {
            self.len += 1;
        }
        Some(populated)
    }

    /// Returns the slot at `index`, creating its page with `create` when empty.
    /// The flag is `true` when the page was created by this call. `None` if
    /// `index` is past the table's capacity.
    pub fn get_or_insert_with<F>(&mut self, index: usize, create: F) -> Option<(&mut Arc<T>, bool)>
    where
        F: FnOnce() -> T,
    {
        let created = self.slot(index)?.is_none();
        if created {
            self.len += 1;
        }
        let page = self.slots[index].get_or_insert_with(|| Arc::new(create()));
        Some((page, created))
    }

    fn slot(&mut self, index: usize) -> Option<&mut Option<Arc<T>>> {
        if index >= self.capacity {
            return None;
        }
        if index >= self.slots.len() {
            self.slots.resize_with(index + 1, || None);
        }
        self.slots.get_mut(index)
    }

    /// Iterates over the populated slots.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &Arc<T>)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.as_ref().map(|page| (index, page)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_tracks_population() {
        let mut table = PageTable::new(16);
        assert_eq!(table.insert(3, Arc::new(1)), Some(true));
        assert_eq!(table.insert(9, Arc::new(2)), Some(true));
        assert_eq!(table.insert(3, Arc::new(4)), Some(false));
        assert_eq!(table.len(), 2);
        assert_eq!(table.get(3).map(|v| **v), Some(4));
        assert!(table.get(4).is_none());
        assert!(table.get(100).is_none());
    }

    #[test]
    fn test_get_or_insert_with() {
        let mut table = PageTable::new(4);
        let (_, created) = table.get_or_insert_with(1, || 10).unwrap();
        assert!(created);
        let (slot, created) = table.get_or_insert_with(1, || 20).unwrap();
        assert!(!created);
        assert_eq!(**slot, 10);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_index_past_capacity() {
        let mut table = PageTable::new(4);
        assert_eq!(table.insert(4, Arc::new(1)), None);
        assert!(table.get_or_insert_with(5000, || 2).is_none());
        assert_eq!(table.len(), 0);
        assert_eq!(table.iter().count(), 0);
        assert_eq!(table.insert(3, Arc::new(3)), Some(true));
    }

    #[test]
    fn test_clone_is_shallow() {
        let mut table = PageTable::new(4);
        table.insert(0, Arc::new(String::from("page")));
        let copy = table.clone();
        assert!(Arc::ptr_eq(table.get(0).unwrap(), copy.get(0).unwrap()));
        assert_eq!(copy.iter().count(), 1);
    }
}
