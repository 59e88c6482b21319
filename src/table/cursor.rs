//! Merged view over a B-tree and its overlay
//!
//! Two-way merge of the committed entries and the pending changes. On equal
//! keys the overlay wins; tombstones hide the committed entry and are never
//! yielded.

use std::cmp::Ordering;
use std::collections::btree_map;
use std::iter::Peekable;

use crate::btree::Entries;
use crate::error::Result;

use super::overlay::OverlayEntry;

enum Source {
    Tree,
    Overlay,
    Both,
}

/// Iterator of `(key, tag)` pairs as they would read after the next apply
pub struct MergedCursor<'a> {
    tree: Peekable<Entries<'a>>,
    overlay: Peekable<btree_map::Range<'a, Vec<u8>, OverlayEntry>>,
}

impl<'a> MergedCursor<'a> {
    pub(super) fn new(
        tree: Entries<'a>,
        overlay: btree_map::Range<'a, Vec<u8>, OverlayEntry>,
    ) -> Self {
        Self {
            tree: tree.peekable(),
            overlay: overlay.peekable(),
        }
    }
}

impl<'a> Iterator for MergedCursor<'a> {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let source = match (self.tree.peek(), self.overlay.peek()) {
                (None, None) => return None,
                (Some(Err(_)), _) => return self.tree.next(),
                (Some(Ok(_)), None) => Source::Tree,
                (None, Some(_)) => Source::Overlay,
                (Some(Ok((tree_key, _))), Some((overlay_key, _))) => {
                    match tree_key.as_slice().cmp(overlay_key.as_slice()) {
                        Ordering::Less => Source::Tree,
                        Ordering::Greater => Source::Overlay,
                        Ordering::Equal => Source::Both,
                    }
                }
            };

            match source {
                Source::Tree => return self.tree.next(),
                Source::Both => {
                    self.tree.next();
                }
                Source::Overlay => {}
            }
            if let Some((key, entry)) = self.overlay.next() {
                if let OverlayEntry::Value(tag) = entry {
                    return Some(Ok((key.clone(), tag.clone())));
                }
            }
        }
    }
}
