//! Delete policy and bulk compaction
//!
//! Deletions leave blocks as sparse as they get unless a merge policy is set.
//! `Btree::compact` rewrites the whole tree into freshly packed blocks inside
//! the current write session; the old blocks are released when it finishes.

use std::sync::Arc;

use tracing::info;

use crate::error::{Result, TesseraError};

use super::block::{shortest_separator, Block, ItemBuf, HEADER_SIZE, SLOT_SIZE};
use super::tree::Btree;
use super::MAX_LEVELS;

/// What `Btree::del` does with blocks that become underfull
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompactionPolicy {
    /// Only empty blocks are removed
    #[default]
    NoMerge,
    /// A leaf below a quarter full is merged into a neighbour when both fit in one block
    MergeUnderfull,
}

/// Packs one level of the new tree, left to right
struct LevelBuilder {
    level: u8,
    block_size: usize,
    revision: u32,
    pending: Vec<ItemBuf>,
    pending_bytes: usize,
    /// Separator and block number of every finished block
    finished: Vec<(Vec<u8>, u16, u32)>,
    /// Separator for the block being filled
    first_key: Option<(Vec<u8>, u16)>,
    last_leaf_item: Option<ItemBuf>,
}

impl LevelBuilder {
    fn new(level: u8, block_size: usize, revision: u32) -> Self {
        Self {
            level,
            block_size,
            revision,
            pending: Vec::new(),
            pending_bytes: HEADER_SIZE,
            finished: Vec::new(),
            first_key: None,
            last_leaf_item: None,
        }
    }

    fn add(&mut self, tree: &mut Btree, mut item: ItemBuf) -> Result<()> {
        let len = item.encoded_len() + SLOT_SIZE;
        if !self.pending.is_empty() && self.pending_bytes + len > self.block_size {
            self.flush(tree)?;
        }
        if self.pending.is_empty() {
            self.first_key = Some(if self.level == 0 {
                match &self.last_leaf_item {
                    Some(last) => shortest_separator(last.sort_key(), item.sort_key()),
                    None => (Vec::new(), 0),
                }
            } else {
                item.take_key()
            });
        }
        self.pending_bytes += item.encoded_len() + SLOT_SIZE;
        if self.level == 0 {
            self.last_leaf_item = Some(item.clone());
        }
        self.pending.push(item);
        Ok(())
    }

    fn flush(&mut self, tree: &mut Btree) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let block = Block::from_items(self.block_size, self.level, self.revision, &self.pending);
        let n = tree.free_map.allocate();
        tree.stash(n, Arc::new(block))?;
        let (key, component) = self.first_key.take().unwrap_or_default();
        self.finished.push((key, component, n));
        self.pending.clear();
        self.pending_bytes = HEADER_SIZE;
        Ok(())
    }

    fn finish(mut self, tree: &mut Btree) -> Result<Vec<(Vec<u8>, u16, u32)>> {
        self.flush(tree)?;
        Ok(self.finished)
    }
}

impl Btree {
    /// Rewrite the tree into fully packed blocks
    pub fn compact(&mut self) -> Result<()> {
        self.ensure_writable()?;
        if self.fake_root {
            return Ok(());
        }

        let (reachable, leaves) = self.reachable_blocks()?;
        let stamp = self.base().revision + 1;

        let mut builder = LevelBuilder::new(0, self.block_size, stamp);
        for n in &leaves {
            let leaf = self.read_block(*n)?;
            for item in leaf.items() {
                builder.add(self, item.to_owned())?;
            }
        }
        let mut level_blocks = builder.finish(self)?;

        if level_blocks.is_empty() {
            let n = self.free_map.allocate();
            self.stash(n, Arc::new(Block::new(self.block_size, 0, stamp)))?;
            level_blocks.push((Vec::new(), 0, n));
        }

        let mut level = 0u8;
        while level_blocks.len() > 1 {
            level += 1;
            if level as usize >= MAX_LEVELS {
                return Err(TesseraError::Database(format!(
                    "table {} reached the maximum depth of {} levels",
                    self.path, MAX_LEVELS
                )));
            }
            let mut builder = LevelBuilder::new(level, self.block_size, stamp);
            for (key, component, child) in level_blocks {
                builder.add(self, ItemBuf::branch(&key, component, child))?;
            }
            level_blocks = builder.finish(self)?;
        }

        let root = level_blocks[0].2;
        let old_count = reachable.len();
        for n in reachable {
            self.release_block(n);
        }
        self.root = root;
        self.level = level as usize;
        self.fake_root = false;
        self.mark_modified();

        info!(
            table = %self.path,
            old_blocks = old_count,
            new_blocks = self.free_map.used_count(),
            level = self.level,
            "compacted table"
        );
        Ok(())
    }

    /// Every block reachable from the root, plus the leaves in key order
    pub(super) fn reachable_blocks(&self) -> Result<(Vec<u32>, Vec<u32>)> {
        let mut all = Vec::new();
        let mut leaves = Vec::new();
        let mut stack = vec![self.root];
        while let Some(n) = stack.pop() {
            all.push(n);
            let block = self.read_block(n)?;
            if block.is_leaf() {
                leaves.push(n);
            } else {
                for i in (0..block.item_count()).rev() {
                    stack.push(block.item(i).child());
                }
            }
        }
        Ok((all, leaves))
    }
}
