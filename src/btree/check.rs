//! Structural verification
//!
//! Walks every block reachable from the root and verifies the invariants the
//! mutation code relies on.
//!
//! ## Checks
//! - Block levels decrease by one from the root down
//! - Items of each block lie within the bounds set by the parent separators
//! - Every branch block starts with a sentinel
//! - No block is reachable twice and every reachable block is marked in use
//! - Component runs are complete and the entry count matches the base

use std::collections::HashSet;

use crate::error::{Result, TesseraError};

use super::block::ItemKey;
use super::tree::Btree;

/// Outcome of `Btree::check`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CheckReport {
    pub revision: u32,
    pub block_size: usize,
    /// Levels including the leaf level
    pub levels: usize,
    pub blocks: u64,
    pub leaf_blocks: u64,
    pub branch_blocks: u64,
    /// Keys
    pub entries: u64,
    /// Leaf items, counting every component
    pub items: u64,
    /// Marked in use but unreachable
    pub leaked_blocks: u64,
    pub leaf_bytes: u64,
}

impl CheckReport {
    /// Average fraction of each leaf block in use
    pub fn leaf_fill(&self) -> f64 {
        if self.leaf_blocks == 0 {
            return 0.0;
        }
        self.leaf_bytes as f64 / (self.leaf_blocks as f64 * self.block_size as f64)
    }
}

type Bound = Option<(Vec<u8>, u16)>;

/// A multi-component tag being walked across leaves
struct Run {
    key: Vec<u8>,
    next: u16,
    total: u16,
}

struct Walk<'a> {
    tree: &'a Btree,
    seen: HashSet<u32>,
    run: Option<Run>,
    report: CheckReport,
}

fn corrupt(tree: &Btree, n: u32, what: impl std::fmt::Display) -> TesseraError {
    TesseraError::DatabaseCorrupt(format!("table {}: block {}: {}", tree.path(), n, what))
}

fn below(key: ItemKey<'_>, bound: &Bound) -> bool {
    match bound {
        Some((k, c)) => key < ItemKey::new(k, *c),
        None => false,
    }
}

impl<'a> Walk<'a> {
    fn block(&mut self, n: u32, level: usize, lower: Bound, upper: Bound) -> Result<()> {
        let tree = self.tree;
        if !self.seen.insert(n) {
            return Err(corrupt(tree, n, "reachable more than once"));
        }
        if !tree.fake_root && !tree.free_map.is_used(n) {
            return Err(corrupt(tree, n, "in use but not marked in the bitmap"));
        }
        let block = tree.read_block(n)?;
        if block.level() as usize != level {
            return Err(corrupt(
                tree,
                n,
                format!("level {}, expected {}", block.level(), level),
            ));
        }
        if n != tree.root && block.is_empty() {
            return Err(corrupt(tree, n, "empty non-root block"));
        }
        self.report.blocks += 1;

        for item in block.items() {
            let key = item.sort_key();
            let before_lower = below(key, &lower) && !(level > 0 && key == ItemKey::MIN);
            if before_lower || (upper.is_some() && !below(key, &upper)) {
                return Err(corrupt(tree, n, "item outside separator bounds"));
            }
        }

        if block.is_leaf() {
            self.report.leaf_blocks += 1;
            self.report.leaf_bytes += block.used_bytes() as u64;
            for item in block.items() {
                self.report.items += 1;
                match self.run.take() {
                    Some(run) => {
                        if item.key() != run.key.as_slice()
                            || item.component() != run.next
                            || item.components() != run.total
                        {
                            return Err(corrupt(tree, n, "component run broken"));
                        }
                        if run.next < run.total {
                            self.run = Some(Run {
                                next: run.next + 1,
                                ..run
                            });
                        }
                    }
                    None => {
                        if item.component() != 1 || item.components() == 0 {
                            return Err(corrupt(tree, n, "entry does not start at component 1"));
                        }
                        self.report.entries += 1;
                        if item.components() > 1 {
                            self.run = Some(Run {
                                key: item.key().to_vec(),
                                next: 2,
                                total: item.components(),
                            });
                        }
                    }
                }
            }
            return Ok(());
        }

        self.report.branch_blocks += 1;
        if block.item(0).sort_key() != ItemKey::MIN {
            return Err(corrupt(tree, n, "branch block without sentinel"));
        }
        let count = block.item_count();
        for i in 0..count {
            let child_lower = if i == 0 {
                lower.clone()
            } else {
                let item = block.item(i);
                Some((item.key().to_vec(), item.component()))
            };
            let child_upper = if i + 1 < count {
                let item = block.item(i + 1);
                Some((item.key().to_vec(), item.component()))
            } else {
                upper.clone()
            };
            let child = block.item(i).child();
            self.block(child, level - 1, child_lower, child_upper)?;
        }
        Ok(())
    }
}

impl Btree {
    /// Verify the tree's structure, returning block and entry statistics
    pub fn check(&self) -> Result<CheckReport> {
        let mut walk = Walk {
            tree: self,
            seen: HashSet::new(),
            run: None,
            report: CheckReport {
                revision: self.revision(),
                block_size: self.block_size,
                levels: self.level + 1,
                ..CheckReport::default()
            },
        };
        walk.block(self.root, self.level, None, None)?;

        if walk.run.is_some() {
            return Err(TesseraError::DatabaseCorrupt(format!(
                "table {}: last entry is missing components",
                self.path()
            )));
        }
        if walk.report.entries != self.item_count {
            return Err(TesseraError::DatabaseCorrupt(format!(
                "table {}: {} entries found, base records {}",
                self.path(),
                walk.report.entries,
                self.item_count
            )));
        }
        if !self.fake_root {
            let used = self.free_map.used_count() as u64;
            walk.report.leaked_blocks = used.saturating_sub(walk.seen.len() as u64);
        } else {
            walk.report.blocks = 0;
        }
        Ok(walk.report)
    }
}
