//! Buffered Table Module
//!
//! One table of the database: a B-tree plus an in-memory overlay of changes
//! that have not been applied yet.
//!
//! ## Responsibilities
//! - Serve reads from the overlay first, then the B-tree
//! - Track the entry count including pending changes
//! - Merge the overlay with the B-tree for ordered scans
//! - Apply the overlay and commit, or discard it
//!
//! ```text
//!   set/delete ──► Overlay (BTreeMap) ──apply(rev)──► Btree::add/del ──► commit(rev)
//!                     │                                   │
//!   get/cursor ───────┴───────── merged view ─────────────┘
//! ```

mod cursor;
mod overlay;

use tracing::{debug, warn};

pub use cursor::MergedCursor;
pub use overlay::{Overlay, OverlayEntry};

use crate::btree::{Btree, MAX_KEY_LEN};
use crate::error::{Result, TesseraError};

/// A B-tree with buffered modifications
#[derive(Debug)]
pub struct BufferedTable {
    btree: Btree,
    overlay: Overlay,
    /// Entries after pending changes are applied
    entry_count: u64,
}

impl BufferedTable {
    pub fn new(btree: Btree) -> Self {
        let entry_count = btree.item_count();
        Self {
            btree,
            overlay: Overlay::new(),
            entry_count,
        }
    }

    /// Tag stored under `key`, taking pending changes into account
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        match self.overlay.get(key) {
            Some(OverlayEntry::Value(tag)) => Ok(Some(tag.clone())),
            Some(OverlayEntry::Tombstone) => Ok(None),
            None => self.btree.find_tag(key),
        }
    }

    pub fn contains(&self, key: &[u8]) -> Result<bool> {
        match self.overlay.get(key) {
            Some(OverlayEntry::Value(_)) => Ok(true),
            Some(OverlayEntry::Tombstone) => Ok(false),
            None => self.btree.find_key(key),
        }
    }

    pub fn set(&mut self, key: &[u8], tag: &[u8]) -> Result<()> {
        self.ensure_writable()?;
        if key.len() > MAX_KEY_LEN {
            return Err(TesseraError::KeyTooLong {
                len: key.len(),
                max: MAX_KEY_LEN,
            });
        }
        if !self.contains(key)? {
            self.entry_count += 1;
        }
        self.overlay.put(key.to_vec(), tag.to_vec());
        Ok(())
    }

    /// Delete `key`. Returns false if it did not exist.
    pub fn delete(&mut self, key: &[u8]) -> Result<bool> {
        self.ensure_writable()?;
        if !self.contains(key)? {
            return Ok(false);
        }
        self.overlay.delete(key.to_vec());
        self.entry_count -= 1;
        Ok(true)
    }

    pub fn get_entry_count(&self) -> u64 {
        self.entry_count
    }

    /// Pending changes exist, or the B-tree session was modified directly
    pub fn is_modified(&self) -> bool {
        !self.overlay.is_empty() || self.btree.is_modified()
    }

    pub fn pending_changes(&self) -> usize {
        self.overlay.len()
    }

    /// Merged view of all entries
    pub fn cursor(&self) -> MergedCursor<'_> {
        MergedCursor::new(self.btree.iter(), self.overlay.range_from(&[]))
    }

    /// Merged view of entries with keys `>= key`
    pub fn cursor_from(&self, key: &[u8]) -> MergedCursor<'_> {
        MergedCursor::new(self.btree.iter_from(key), self.overlay.range_from(key))
    }

    /// Write the overlay into the B-tree and commit it as `revision`.
    ///
    /// On failure the overlay is gone and the B-tree is back at its
    /// committed state.
    pub fn apply(&mut self, revision: u32) -> Result<()> {
        let pending = self.overlay.len();
        let result = self.write_overlay().and_then(|()| self.btree.commit(revision));
        if let Err(e) = &result {
            warn!(table = %self.btree.path(), revision, error = %e, "apply failed, discarding changes");
            self.overlay.clear();
            self.btree.cancel();
        } else {
            debug!(table = %self.btree.path(), revision, pending, "applied changes");
        }
        self.entry_count = self.btree.item_count();
        result
    }

    fn write_overlay(&mut self) -> Result<()> {
        for (key, entry) in self.overlay.drain() {
            match entry {
                OverlayEntry::Value(tag) => {
                    self.btree.add(&key, &tag)?;
                }
                OverlayEntry::Tombstone => {
                    self.btree.del(&key)?;
                }
            }
        }
        Ok(())
    }

    /// Drop all pending changes
    pub fn cancel(&mut self) {
        self.overlay.clear();
        self.btree.cancel();
        self.entry_count = self.btree.item_count();
    }

    pub fn btree(&self) -> &Btree {
        &self.btree
    }

    pub fn btree_mut(&mut self) -> &mut Btree {
        &mut self.btree
    }

    fn ensure_writable(&self) -> Result<()> {
        if !self.btree.is_writable() {
            return Err(TesseraError::InvalidOperation(format!(
                "table {} is open read-only",
                self.btree.path()
            )));
        }
        Ok(())
    }
}
