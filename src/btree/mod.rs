//! Copy-on-write B-tree
//!
//! One B-tree per table, stored in a data file of fixed-size blocks plus two
//! alternating base files that record the committed revisions.
//!
//! ## Responsibilities
//! - Fixed-size block I/O (`store`)
//! - Typed slotted-page view over block bytes (`block`)
//! - Base file A/B rotation and free-space bookkeeping (`base`)
//! - Lookup, insert, delete, split, commit and cancel (`tree`)
//! - Ordered traversal (`cursor`)
//! - Delete policy and bulk compaction (`compact`)
//! - Offline structural verification (`check`)
//!
//! ## File Layout (per table)
//! ```text
//! {dir}/{name}DB      blocks, addressed by block number
//! {dir}/{name}baseA   base record for one revision
//! {dir}/{name}baseB   base record for the other revision
//! ```

mod base;
mod block;
mod check;
mod compact;
mod cursor;
mod store;
mod tree;

use std::path::{Path, PathBuf};

pub use base::{BaseLetter, BaseRecord, FORMAT_VERSION};
pub use block::{max_item_size, shortest_separator, Block, Item, ItemBuf, ItemKey};
pub use check::CheckReport;
pub use compact::CompactionPolicy;
pub use cursor::{Cursor, Entries};
pub use tree::{Btree, InsertStrategy};

/// Smallest supported block size
pub const MIN_BLOCK_SIZE: usize = 2048;

/// Largest supported block size
pub const MAX_BLOCK_SIZE: usize = 65536;

/// Block size used when creating a table without an explicit size
pub const DEFAULT_BLOCK_SIZE: usize = 8192;

/// Longest key accepted by `Btree::add`
pub const MAX_KEY_LEN: usize = 252;

/// Maximum depth of a tree, counting the leaf level
pub const MAX_LEVELS: usize = 10;

/// Minimum number of maximum-size items a block must be able to hold
pub const BLOCK_CAPACITY: usize = 4;

/// Location of one table's files: a directory plus a filename prefix
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TablePath {
    dir: PathBuf,
    name: String,
}

impl TablePath {
    pub fn new(dir: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            name: name.into(),
        }
    }

    /// Split a full prefix such as `db/postlist_` into directory and name
    pub fn from_prefix(prefix: &Path) -> Self {
        let dir = match prefix.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let name = prefix
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self { dir, name }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// `{dir}/{name}DB`
    pub fn db_file(&self) -> PathBuf {
        self.dir.join(format!("{}DB", self.name))
    }

    /// `{dir}/{name}base{A|B}`
    pub fn base_file(&self, letter: BaseLetter) -> PathBuf {
        self.dir.join(format!("{}base{}", self.name, letter.as_char()))
    }
}

impl std::fmt::Display for TablePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.dir.join(&self.name).display())
    }
}
