//! Write overlay
//!
//! BTreeMap-based buffer of pending writes and deletes for one table.

use std::collections::btree_map;
use std::collections::BTreeMap;
use std::ops::Bound;

/// Pending change to one key
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OverlayEntry {
    /// A new tag
    Value(Vec<u8>),

    /// A pending delete
    Tombstone,
}

/// Pending changes not yet written into the B-tree, ordered by key
#[derive(Debug, Default)]
pub struct Overlay {
    entries: BTreeMap<Vec<u8>, OverlayEntry>,
    /// Approximate bytes held (keys plus tags)
    size: usize,
}

impl Overlay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &[u8]) -> Option<&OverlayEntry> {
        self.entries.get(key)
    }

    /// Record a new tag, returning the previous pending change
    pub fn put(&mut self, key: Vec<u8>, tag: Vec<u8>) -> Option<OverlayEntry> {
        let key_len = key.len();
        self.size += key_len + tag.len();
        let previous = self.entries.insert(key, OverlayEntry::Value(tag));
        self.forget(key_len, &previous);
        previous
    }

    /// Record a delete, returning the previous pending change
    pub fn delete(&mut self, key: Vec<u8>) -> Option<OverlayEntry> {
        let key_len = key.len();
        self.size += key_len;
        let previous = self.entries.insert(key, OverlayEntry::Tombstone);
        self.forget(key_len, &previous);
        previous
    }

    fn forget(&mut self, key_len: usize, previous: &Option<OverlayEntry>) {
        let freed = match previous {
            Some(OverlayEntry::Value(tag)) => key_len + tag.len(),
            Some(OverlayEntry::Tombstone) => key_len,
            None => 0,
        };
        self.size = self.size.saturating_sub(freed);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Entries with keys `>= from`
    pub fn range_from(&self, from: &[u8]) -> btree_map::Range<'_, Vec<u8>, OverlayEntry> {
        self.entries
            .range::<[u8], _>((Bound::Included(from), Bound::Unbounded))
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.size = 0;
    }

    /// Take every entry in key order, leaving the overlay empty
    pub fn drain(&mut self) -> btree_map::IntoIter<Vec<u8>, OverlayEntry> {
        self.size = 0;
        std::mem::take(&mut self.entries).into_iter()
    }
}
