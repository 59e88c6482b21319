//! Ordered traversal over a B-tree
//!
//! A cursor holds one root-to-leaf path and moves entry by entry, where an
//! entry is a key together with all the components of its tag. Branch blocks
//! reached by any cursor come from the tree's shared block cache.

use crate::error::{Result, TesseraError};

use super::block::{Item, ItemKey};
use super::tree::{Btree, Frame};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Position {
    Unpositioned,
    At,
    BeforeStart,
    AfterEnd,
}

/// Cursor over one tree
#[derive(Debug, Clone)]
pub struct Cursor<'a> {
    tree: &'a Btree,
    /// Leaf first; `path[0].index` is the current item
    path: Vec<Frame>,
    position: Position,
}

impl<'a> Cursor<'a> {
    pub fn new(tree: &'a Btree) -> Self {
        Self {
            tree,
            path: Vec::new(),
            position: Position::Unpositioned,
        }
    }

    /// Position at the first entry `>= key`. Returns true on an exact match.
    pub fn find_key(&mut self, key: &[u8]) -> Result<bool> {
        let target = ItemKey::new(key, 1);
        self.path = self.tree.descend(target)?;
        self.position = Position::At;
        if self.path[0].index >= self.path[0].block.item_count() && !self.next_leaf()? {
            self.position = Position::AfterEnd;
            return Ok(false);
        }
        self.settle_forward()?;
        Ok(self.current().map(|item| item.sort_key() == target).unwrap_or(false))
    }

    /// Position before the first entry; the next `next()` lands on it
    pub fn rewind(&mut self) {
        self.path.clear();
        self.position = Position::BeforeStart;
    }

    /// Move to the next entry. Returns false once past the end.
    pub fn next(&mut self) -> Result<bool> {
        match self.position {
            Position::AfterEnd => Ok(false),
            Position::Unpositioned | Position::BeforeStart => self.seek_first(),
            Position::At => {
                if !self.step_forward()? {
                    return Ok(false);
                }
                self.settle_forward()?;
                Ok(self.position == Position::At)
            }
        }
    }

    /// Move to the previous entry. Returns false once before the start.
    pub fn prev(&mut self) -> Result<bool> {
        match self.position {
            Position::BeforeStart => Ok(false),
            Position::Unpositioned | Position::AfterEnd => self.seek_last(),
            Position::At => {
                if !self.step_backward()? {
                    return Ok(false);
                }
                self.settle_backward()?;
                Ok(self.position == Position::At)
            }
        }
    }

    pub fn after_end(&self) -> bool {
        self.position == Position::AfterEnd
    }

    /// Key of the current entry
    pub fn key(&self) -> Option<&[u8]> {
        self.current().map(|item| item.key())
    }

    /// Tag of the current entry, with all its components joined
    pub fn read_tag(&self) -> Result<Vec<u8>> {
        let item = self.current().ok_or_else(|| {
            TesseraError::InvalidOperation("cursor is not positioned on an entry".to_string())
        })?;
        let key = item.key();
        let components = item.components();
        let mut tag = item.value().to_vec();

        if components > 1 {
            let mut walker = self.clone();
            for component in 2..=components {
                let next = if walker.step_forward()? {
                    walker.current()
                } else {
                    None
                };
                match next {
                    Some(part) if part.key() == key && part.component() == component => {
                        tag.extend_from_slice(part.value());
                    }
                    _ => {
                        return Err(TesseraError::DatabaseCorrupt(format!(
                            "table {}: component {} of {} missing",
                            self.tree.path(),
                            component,
                            components
                        )))
                    }
                }
            }
        }
        Ok(tag)
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn current(&self) -> Option<Item<'_>> {
        if self.position != Position::At {
            return None;
        }
        let leaf = self.path.first()?;
        if leaf.index < leaf.block.item_count() {
            Some(leaf.block.item(leaf.index))
        } else {
            None
        }
    }

    fn current_component(&self) -> Option<u16> {
        self.current().map(|item| item.component())
    }

    fn seek_first(&mut self) -> Result<bool> {
        self.path = self.tree.descend(ItemKey::MIN)?;
        self.position = Position::At;
        if self.path[0].block.is_empty() && !self.next_leaf()? {
            self.position = Position::AfterEnd;
            return Ok(false);
        }
        self.settle_forward()?;
        Ok(self.position == Position::At)
    }

    fn seek_last(&mut self) -> Result<bool> {
        let mut path = Vec::with_capacity(self.tree.level + 1);
        let mut n = self.tree.root;
        loop {
            let block = self.tree.read_block(n)?;
            let index = block.item_count().saturating_sub(1);
            let child = (!block.is_leaf() && !block.is_empty()).then(|| block.item(index).child());
            path.push(Frame {
                block_no: n,
                block,
                index,
            });
            match child {
                Some(child) => n = child,
                None => break,
            }
        }
        path.reverse();
        self.path = path;
        self.position = Position::At;
        if self.path[0].block.is_empty() {
            self.position = Position::BeforeStart;
            return Ok(false);
        }
        self.settle_backward()?;
        Ok(self.position == Position::At)
    }

    /// Skip continuation components forward
    fn settle_forward(&mut self) -> Result<()> {
        while matches!(self.current_component(), Some(c) if c != 1) {
            if !self.step_forward()? {
                break;
            }
        }
        Ok(())
    }

    /// Back up to the first component of the current entry
    fn settle_backward(&mut self) -> Result<()> {
        while matches!(self.current_component(), Some(c) if c != 1) {
            if !self.step_backward()? {
                break;
            }
        }
        Ok(())
    }

    /// One item forward, across leaves
    fn step_forward(&mut self) -> Result<bool> {
        let leaf = &mut self.path[0];
        if leaf.index + 1 < leaf.block.item_count() {
            leaf.index += 1;
            return Ok(true);
        }
        if self.next_leaf()? {
            Ok(true)
        } else {
            self.position = Position::AfterEnd;
            Ok(false)
        }
    }

    /// One item back, across leaves
    fn step_backward(&mut self) -> Result<bool> {
        let leaf = &mut self.path[0];
        if leaf.index > 0 {
            leaf.index -= 1;
            return Ok(true);
        }
        if self.prev_leaf()? {
            Ok(true)
        } else {
            self.position = Position::BeforeStart;
            Ok(false)
        }
    }

    /// Move to the first item of the next non-empty leaf
    fn next_leaf(&mut self) -> Result<bool> {
        loop {
            let mut lvl = 1;
            while lvl < self.path.len()
                && self.path[lvl].index + 1 >= self.path[lvl].block.item_count()
            {
                lvl += 1;
            }
            if lvl >= self.path.len() {
                return Ok(false);
            }
            self.path[lvl].index += 1;
            while lvl > 0 {
                let child = self.path[lvl].block.item(self.path[lvl].index).child();
                lvl -= 1;
                self.load(lvl, child, |_| 0)?;
            }
            if !self.path[0].block.is_empty() {
                return Ok(true);
            }
        }
    }

    /// Move to the last item of the previous non-empty leaf
    fn prev_leaf(&mut self) -> Result<bool> {
        loop {
            let mut lvl = 1;
            while lvl < self.path.len() && self.path[lvl].index == 0 {
                lvl += 1;
            }
            if lvl >= self.path.len() {
                return Ok(false);
            }
            self.path[lvl].index -= 1;
            while lvl > 0 {
                let child = self.path[lvl].block.item(self.path[lvl].index).child();
                lvl -= 1;
                self.load(lvl, child, |count| count.saturating_sub(1))?;
            }
            if !self.path[0].block.is_empty() {
                return Ok(true);
            }
        }
    }

    fn load(&mut self, lvl: usize, n: u32, index: impl Fn(usize) -> usize) -> Result<()> {
        let block = self.tree.read_block(n)?;
        if block.level() as usize != lvl {
            return Err(TesseraError::DatabaseCorrupt(format!(
                "block {} has level {}, expected {}",
                n,
                block.level(),
                lvl
            )));
        }
        let index = index(block.item_count());
        self.path[lvl] = Frame {
            block_no: n,
            block,
            index,
        };
        Ok(())
    }
}

/// Iterator over `(key, tag)` pairs in key order
#[derive(Debug, Clone)]
pub struct Entries<'a> {
    cursor: Cursor<'a>,
    from: Option<Vec<u8>>,
    started: bool,
    done: bool,
}

impl<'a> Iterator for Entries<'a> {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let moved = if self.started {
            self.cursor.next()
        } else {
            self.started = true;
            match &self.from {
                Some(key) => self
                    .cursor
                    .find_key(key)
                    .map(|_| !self.cursor.after_end()),
                None => self.cursor.next(),
            }
        };
        match moved {
            Ok(true) => {
                let key = self.cursor.key().map(<[u8]>::to_vec).unwrap_or_default();
                match self.cursor.read_tag() {
                    Ok(tag) => Some(Ok((key, tag))),
                    Err(e) => {
                        self.done = true;
                        Some(Err(e))
                    }
                }
            }
            Ok(false) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

impl Btree {
    pub fn cursor(&self) -> Cursor<'_> {
        Cursor::new(self)
    }

    /// All entries in key order
    pub fn iter(&self) -> Entries<'_> {
        Entries {
            cursor: self.cursor(),
            from: None,
            started: false,
            done: false,
        }
    }

    /// Entries with keys `>= key`
    pub fn iter_from(&self, key: &[u8]) -> Entries<'_> {
        Entries {
            cursor: self.cursor(),
            from: Some(key.to_vec()),
            started: false,
            done: false,
        }
    }
}
