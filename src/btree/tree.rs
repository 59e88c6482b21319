//! B-tree handle
//!
//! A `Btree` is opened either read-only at one committed revision, or for
//! writing. A write session copies every block it touches to a fresh block
//! number, so the blocks of the committed revisions stay intact until the
//! session commits.
//!
//! ## Write Session
//! ```text
//! open_to_write ──► add / del ──► commit(R+1) ──► add / del ──► ...
//!                       │              │
//!                       │              ├─ write dirty blocks, fsync DB file
//!                       │              └─ replace the other base slot
//!                       └─ cancel() ──► back to the committed state
//! ```

use std::collections::HashMap;
use std::fs;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, error, info, warn};

use crate::config::validate_block_size;
use crate::error::{Result, TesseraError};

use super::base::{remove_base, write_base, BaseLetter, BasePair, BaseRecord, BaseSlot, FreeSpaceMap};
use super::block::{
    max_item_size, shortest_separator, Block, ItemBuf, ItemKey, ITEM_OVERHEAD, SLOT_SIZE,
};
use super::compact::CompactionPolicy;
use super::store::BlockStore;
use super::{TablePath, MAX_KEY_LEN, MAX_LEVELS};

/// Appends needed in a row before the tree switches to sequential mode
const SEQ_START_POINT: i32 = -10;

/// How inserts at the right edge are split
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertStrategy {
    /// Split full blocks at their byte midpoint
    Default,
    /// Keys are arriving in order: keep left blocks full and the right edge hot
    Sequential,
}

/// One step of a root-to-leaf path
#[derive(Debug, Clone)]
pub(super) struct Frame {
    pub block_no: u32,
    pub block: Arc<Block>,
    /// Child taken (branch) or item position (leaf)
    pub index: usize,
}

/// A table's B-tree
pub struct Btree {
    pub(super) path: TablePath,
    pub(super) store: BlockStore,
    pub(super) block_size: usize,
    writable: bool,

    // -------------------------------------------------------------------------
    // Committed State
    // -------------------------------------------------------------------------
    base: BaseRecord,
    base_letter: BaseLetter,

    // -------------------------------------------------------------------------
    // Session State
    // -------------------------------------------------------------------------
    pub(super) root: u32,
    pub(super) level: usize,
    pub(super) item_count: u64,
    pub(super) fake_root: bool,
    strategy: InsertStrategy,
    seq_count: i32,
    pub(super) free_map: FreeSpaceMap,
    /// Session blocks not yet written to disk
    pub(super) dirty: HashMap<u32, Arc<Block>>,
    /// Rightmost path after the last append (leaf first)
    hot_path: Vec<u32>,
    modified: bool,

    compaction: CompactionPolicy,
    full_compaction: bool,
    max_dirty_blocks: usize,

    /// Branch blocks of committed revisions, shared by all cursors
    cache: RwLock<HashMap<u32, Arc<Block>>>,
}

impl std::fmt::Debug for Btree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Btree")
            .field("path", &self.path)
            .field("revision", &self.base.revision)
            .field("root", &self.root)
            .field("level", &self.level)
            .field("item_count", &self.item_count)
            .field("writable", &self.writable)
            .finish()
    }
}

impl Btree {
    // =========================================================================
    // Creating and Opening
    // =========================================================================

    /// Create an empty table at revision 0
    pub fn create(path: &TablePath, block_size: usize) -> Result<()> {
        validate_block_size(block_size)?;
        fs::create_dir_all(path.dir())?;
        BlockStore::create(&path.db_file())?;
        remove_base(&path.base_file(BaseLetter::B))?;
        write_base(&path.base_file(BaseLetter::A), &BaseRecord::empty(block_size))?;
        info!(table = %path, block_size, "created table");
        Ok(())
    }

    /// Whether the table's block file and at least one base file exist
    pub fn exists(path: &TablePath) -> bool {
        path.db_file().exists()
            && (path.base_file(BaseLetter::A).exists() || path.base_file(BaseLetter::B).exists())
    }

    /// Newest committed revision on disk
    pub fn latest_revision(path: &TablePath) -> Result<u32> {
        let bases = BasePair::load(path)?;
        Ok(bases.latest(path)?.1.revision)
    }

    /// Open read-only at `revision`, or at the latest revision
    pub fn open_to_read(path: &TablePath, revision: Option<u32>) -> Result<Self> {
        let bases = BasePair::load(path)?;
        let (letter, record) = match revision {
            None => bases.latest(path)?,
            Some(rev) => bases
                .at_revision(path, rev)?
                .ok_or(TesseraError::RevisionNotAvailable { revision: rev })?,
        };
        debug!(table = %path, revision = record.revision, "opened table for reading");
        Self::from_base(path, letter, record, Vec::new(), false)
    }

    /// Open for writing at `revision`, or at the latest revision.
    ///
    /// Returns `Ok(None)` when the requested revision is in neither base slot.
    pub fn open_to_write(path: &TablePath, revision: Option<u32>) -> Result<Option<Self>> {
        let bases = BasePair::load(path)?;
        let (letter, record) = match revision {
            None => bases.latest(path)?,
            Some(rev) => match bases.at_revision(path, rev)? {
                Some(found) => found,
                None => return Ok(None),
            },
        };

        let other = letter.other();
        let mut protected = Vec::new();
        match bases.slot(other) {
            BaseSlot::Valid(newer) if newer.revision > record.revision => {
                warn!(
                    table = %path,
                    stale = newer.revision,
                    revision = record.revision,
                    "removing base left by an interrupted commit"
                );
                remove_base(&path.base_file(other))?;
            }
            BaseSlot::Valid(older) => protected = older.bitmap.clone(),
            BaseSlot::Invalid(reason) => {
                warn!(table = %path, slot = %other.as_char(), reason = %reason, "ignoring invalid base file");
            }
            BaseSlot::Missing => {}
        }

        debug!(table = %path, revision = record.revision, "opened table for writing");
        Self::from_base(path, letter, record, protected, true).map(Some)
    }

    fn from_base(
        path: &TablePath,
        letter: BaseLetter,
        record: BaseRecord,
        protected: Vec<u8>,
        writable: bool,
    ) -> Result<Self> {
        let block_size = record.block_size as usize;
        let store = BlockStore::open(&path.db_file(), block_size, writable)?;
        let sequential = record.sequential;
        Ok(Self {
            path: path.clone(),
            store,
            block_size,
            writable,
            root: record.root,
            level: record.level as usize,
            item_count: record.item_count,
            fake_root: record.fake_root,
            strategy: if sequential {
                InsertStrategy::Sequential
            } else {
                InsertStrategy::Default
            },
            seq_count: if sequential { 0 } else { SEQ_START_POINT },
            free_map: FreeSpaceMap::new(record.bitmap.clone(), protected),
            dirty: HashMap::new(),
            hot_path: Vec::new(),
            modified: false,
            compaction: CompactionPolicy::default(),
            full_compaction: false,
            max_dirty_blocks: 1024,
            cache: RwLock::new(HashMap::new()),
            base: record,
            base_letter: letter,
        })
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn path(&self) -> &TablePath {
        &self.path
    }

    /// Committed revision this handle is at
    pub fn revision(&self) -> u32 {
        self.base.revision
    }

    /// Number of keys, including uncommitted changes
    pub fn item_count(&self) -> u64 {
        self.item_count
    }

    /// Number of branch levels above the leaves
    pub fn level(&self) -> usize {
        self.level
    }

    pub fn root_block(&self) -> u32 {
        self.root
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Changed since the last commit
    pub fn is_modified(&self) -> bool {
        self.modified
    }

    pub fn strategy(&self) -> InsertStrategy {
        self.strategy
    }

    /// The committed base record this handle started from
    pub fn base(&self) -> &BaseRecord {
        &self.base
    }

    /// Slot holding the committed base; the next commit writes the other one
    pub fn base_letter(&self) -> BaseLetter {
        self.base_letter
    }

    pub fn set_compaction_policy(&mut self, policy: CompactionPolicy) {
        self.compaction = policy;
    }

    pub fn set_full_compaction(&mut self, enabled: bool) {
        self.full_compaction = enabled;
    }

    pub fn set_max_dirty_blocks(&mut self, count: usize) {
        self.max_dirty_blocks = count.max(1);
    }

    /// Largest tag chunk stored in one item for `key`
    fn chunk_size(&self, key: &[u8]) -> usize {
        max_item_size(self.block_size) - ITEM_OVERHEAD - key.len()
    }

    pub(super) fn ensure_writable(&self) -> Result<()> {
        if !self.writable {
            return Err(TesseraError::InvalidOperation(format!(
                "table {} is open read-only",
                self.path
            )));
        }
        Ok(())
    }

    // =========================================================================
    // Block Access
    // =========================================================================

    /// Fetch a block: session blocks, then the branch cache, then disk
    pub(super) fn read_block(&self, n: u32) -> Result<Arc<Block>> {
        if self.fake_root && n == self.root {
            return Ok(Arc::new(Block::new(self.block_size, 0, self.base.revision)));
        }
        if let Some(block) = self.dirty.get(&n) {
            return Ok(Arc::clone(block));
        }
        if let Some(block) = self.cache.read().get(&n) {
            return Ok(Arc::clone(block));
        }

        let block = self.store.read_block(n)?;
        let session = self.free_map.is_session_block(n);
        if !session && block.revision() > self.base.revision {
            return Err(TesseraError::RevisionNotAvailable {
                revision: self.base.revision,
            });
        }
        let block = Arc::new(block);
        if !session && !block.is_leaf() {
            self.cache.write().insert(n, Arc::clone(&block));
        }
        Ok(block)
    }

    /// Root-to-leaf path for `target`, leaf first
    pub(super) fn descend(&self, target: ItemKey<'_>) -> Result<Vec<Frame>> {
        let mut frames = Vec::with_capacity(self.level + 1);
        let mut n = self.root;
        let mut expected = self.level;
        loop {
            let block = self.read_block(n)?;
            if block.level() as usize != expected {
                return Err(TesseraError::DatabaseCorrupt(format!(
                    "block {} has level {}, expected {}",
                    n,
                    block.level(),
                    expected
                )));
            }
            if block.is_leaf() {
                let index = match block.search(target) {
                    Ok(i) | Err(i) => i,
                };
                frames.push(Frame {
                    block_no: n,
                    block,
                    index,
                });
                break;
            }
            if block.is_empty() {
                return Err(TesseraError::DatabaseCorrupt(format!(
                    "branch block {} is empty",
                    n
                )));
            }
            let index = block.child_index(target);
            let child = block.item(index).child();
            frames.push(Frame {
                block_no: n,
                block,
                index,
            });
            n = child;
            expected -= 1;
        }
        frames.reverse();
        Ok(frames)
    }

    /// Copy every committed block on the path to a new block number
    fn cow_path(&mut self, path: &mut [Frame]) {
        let stamp = self.base.revision + 1;
        let top = path.len() - 1;
        for lvl in 0..path.len() {
            let old = path[lvl].block_no;
            if self.free_map.is_session_block(old) && !(self.fake_root && lvl == top) {
                break;
            }
            let fresh = self.free_map.allocate();
            if !(self.fake_root && lvl == top) {
                self.free_map.free(old);
                self.cache.get_mut().remove(&old);
            }
            Arc::make_mut(&mut path[lvl].block).set_revision(stamp);
            path[lvl].block_no = fresh;
            if lvl < top {
                let parent = &mut path[lvl + 1];
                Arc::make_mut(&mut parent.block).set_child(parent.index, fresh);
            } else {
                self.root = fresh;
                self.fake_root = false;
            }
        }
    }

    /// Put the path's blocks back into the session, writing out early if too many are held
    fn store_path(&mut self, path: Vec<Frame>) -> Result<()> {
        for frame in path {
            self.dirty.insert(frame.block_no, frame.block);
        }
        self.evict_if_needed()
    }

    /// Add one session block
    pub(super) fn stash(&mut self, n: u32, block: Arc<Block>) -> Result<()> {
        self.dirty.insert(n, block);
        self.evict_if_needed()
    }

    fn evict_if_needed(&mut self) -> Result<()> {
        if self.dirty.len() > self.max_dirty_blocks {
            debug!(table = %self.path, blocks = self.dirty.len(), "writing dirty blocks early");
            self.write_dirty()?;
            self.dirty.clear();
            self.hot_path.clear();
        }
        Ok(())
    }

    fn write_dirty(&self) -> Result<()> {
        for (n, block) in &self.dirty {
            self.store.write_block(*n, block)?;
        }
        Ok(())
    }

    /// Drop a block from the tree
    pub(super) fn release_block(&mut self, n: u32) {
        self.free_map.free(n);
        self.dirty.remove(&n);
        self.cache.get_mut().remove(&n);
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    /// Component count of `key`, if present
    fn components_of(&self, key: &[u8]) -> Result<Option<(u16, Vec<u8>)>> {
        let target = ItemKey::new(key, 1);
        let path = self.descend(target)?;
        let leaf = &path[0];
        if leaf.index < leaf.block.item_count() {
            let item = leaf.block.item(leaf.index);
            if item.sort_key() == target {
                return Ok(Some((item.components(), item.value().to_vec())));
            }
        }
        Ok(None)
    }

    pub fn find_key(&self, key: &[u8]) -> Result<bool> {
        if key.len() > MAX_KEY_LEN {
            return Ok(false);
        }
        Ok(self.components_of(key)?.is_some())
    }

    /// Full tag stored under `key`
    pub fn find_tag(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if key.len() > MAX_KEY_LEN {
            return Ok(None);
        }
        let mut cursor = self.cursor();
        if cursor.find_key(key)? {
            Ok(Some(cursor.read_tag()?))
        } else {
            Ok(None)
        }
    }

    // =========================================================================
    // Insert
    // =========================================================================

    /// Insert or replace `key`. Returns false if the identical tag was already stored.
    pub fn add(&mut self, key: &[u8], tag: &[u8]) -> Result<bool> {
        self.ensure_writable()?;
        if key.len() > MAX_KEY_LEN {
            return Err(TesseraError::KeyTooLong {
                len: key.len(),
                max: MAX_KEY_LEN,
            });
        }
        let chunk = self.chunk_size(key);
        let needed = tag.len().div_ceil(chunk).max(1);
        if needed > u16::MAX as usize {
            return Err(TesseraError::TagTooLong {
                len: tag.len(),
                max: chunk * u16::MAX as usize,
            });
        }
        let components = needed as u16;

        let existing = self.components_of(key)?;
        if let Some((1, first)) = &existing {
            if components == 1 && first.as_slice() == tag {
                return Ok(false);
            }
        }

        for (i, piece) in tag.chunks(chunk).enumerate() {
            self.insert_item(ItemBuf::leaf(key, i as u16 + 1, components, piece))?;
        }
        if tag.is_empty() {
            self.insert_item(ItemBuf::leaf(key, 1, 1, &[]))?;
        }

        match existing {
            Some((old, _)) => {
                for c in components + 1..=old {
                    self.delete_item(ItemKey::new(key, c))?;
                }
            }
            None => self.item_count += 1,
        }
        self.modified = true;
        Ok(true)
    }

    fn note_insert(&mut self, appended: bool) {
        if appended {
            if self.seq_count < 0 {
                self.seq_count += 1;
                if self.seq_count == 0 {
                    debug!(table = %self.path, "switching to sequential inserts");
                    self.strategy = InsertStrategy::Sequential;
                }
            }
        } else {
            self.seq_count = SEQ_START_POINT;
            self.strategy = InsertStrategy::Default;
        }
    }

    /// Rebuild the rightmost path from session blocks, if `target` is an append to it
    fn hot_frames(&self, target: ItemKey<'_>) -> Option<Vec<Frame>> {
        if self.strategy != InsertStrategy::Sequential
            || self.hot_path.len() != self.level + 1
            || self.hot_path[self.level] != self.root
        {
            return None;
        }
        let mut frames = Vec::with_capacity(self.hot_path.len());
        for (lvl, &n) in self.hot_path.iter().enumerate() {
            let block = Arc::clone(self.dirty.get(&n)?);
            if block.level() as usize != lvl {
                return None;
            }
            let index = if lvl == 0 {
                if let Some(last) = block.last_item() {
                    if last.sort_key() >= target {
                        return None;
                    }
                }
                block.item_count()
            } else {
                let last = block.item_count().checked_sub(1)?;
                if block.item(last).child() != self.hot_path[lvl - 1] {
                    return None;
                }
                last
            };
            frames.push(Frame {
                block_no: n,
                block,
                index,
            });
        }
        Some(frames)
    }

    fn is_right_edge(path: &[Frame]) -> bool {
        path.iter()
            .skip(1)
            .all(|frame| frame.index + 1 == frame.block.item_count())
    }

    fn insert_item(&mut self, item: ItemBuf) -> Result<()> {
        let key = item.key.clone();
        let target = ItemKey::new(&key, item.component);

        let mut path = match self.hot_frames(target) {
            Some(frames) => frames,
            None => self.descend(target)?,
        };
        let (pos, exact) = match path[0].block.search(target) {
            Ok(i) => (i, true),
            Err(i) => (i, false),
        };
        let appended =
            !exact && pos == path[0].block.item_count() && Self::is_right_edge(&path);
        self.note_insert(appended);

        self.cow_path(&mut path);
        if exact {
            Arc::make_mut(&mut path[0].block).remove(pos);
        }
        let split = self.insert_at(&mut path, 0, pos, item, appended)?;

        self.hot_path = if split {
            Vec::new()
        } else {
            path.iter().map(|frame| frame.block_no).collect()
        };
        self.store_path(path)
    }

    /// Insert into `path[lvl]`, splitting upward as needed. Returns true on a split.
    fn insert_at(
        &mut self,
        path: &mut Vec<Frame>,
        lvl: usize,
        pos: usize,
        item: ItemBuf,
        appending: bool,
    ) -> Result<bool> {
        if path[lvl].block.fits(item.encoded_len()) {
            Arc::make_mut(&mut path[lvl].block).insert(pos, &item);
            return Ok(false);
        }
        let at_root = lvl + 1 == path.len();
        if at_root && self.level + 1 >= MAX_LEVELS {
            return Err(TesseraError::Database(format!(
                "table {} reached the maximum depth of {} levels",
                self.path, MAX_LEVELS
            )));
        }

        let level = path[lvl].block.level();
        let mut left: Vec<ItemBuf> = path[lvl].block.items().map(|i| i.to_owned()).collect();
        left.insert(pos, item);
        let split = self.split_point(&left, appending && pos + 1 == left.len());
        let mut right = left.split_off(split);

        let (sep_key, sep_component) = if level == 0 {
            match left.last() {
                Some(last) => shortest_separator(last.sort_key(), right[0].sort_key()),
                None => (right[0].key.clone(), right[0].component),
            }
        } else {
            right[0].take_key()
        };

        let stamp = self.base.revision + 1;
        let right_no = self.free_map.allocate();
        self.dirty.insert(
            right_no,
            Arc::new(Block::from_items(self.block_size, level, stamp, &right)),
        );
        path[lvl].block = Arc::new(Block::from_items(self.block_size, level, stamp, &left));
        debug!(
            table = %self.path,
            level,
            left = path[lvl].block_no,
            right = right_no,
            "split block"
        );

        let separator = ItemBuf::branch(&sep_key, sep_component, right_no);
        if at_root {
            self.split_root(path, separator);
        } else {
            let parent_pos = path[lvl + 1].index + 1;
            self.insert_at(path, lvl + 1, parent_pos, separator, appending)?;
        }
        Ok(true)
    }

    /// Where to divide an overfull run of items
    fn split_point(&self, items: &[ItemBuf], appending: bool) -> usize {
        let n = items.len();
        if appending && (self.strategy == InsertStrategy::Sequential || self.full_compaction) {
            return n - 1;
        }
        let total: usize = items.iter().map(|i| i.encoded_len() + SLOT_SIZE).sum();
        let mut acc = 0;
        for (i, item) in items.iter().enumerate() {
            acc += item.encoded_len() + SLOT_SIZE;
            if acc * 2 >= total {
                return (i + 1).clamp(1, n - 1);
            }
        }
        n / 2
    }

    /// New root above the current one
    fn split_root(&mut self, path: &mut Vec<Frame>, separator: ItemBuf) {
        let old_root = path[path.len() - 1].block_no;
        let new_root = self.free_map.allocate();
        self.level += 1;
        let block = Block::from_items(
            self.block_size,
            self.level as u8,
            self.base.revision + 1,
            &[ItemBuf::sentinel(old_root), separator],
        );
        path.push(Frame {
            block_no: new_root,
            block: Arc::new(block),
            index: 0,
        });
        self.root = new_root;
        debug!(table = %self.path, root = new_root, level = self.level, "split root");
    }

    // =========================================================================
    // Delete
    // =========================================================================

    /// Remove `key` and all its components. Returns false if it was absent.
    pub fn del(&mut self, key: &[u8]) -> Result<bool> {
        self.ensure_writable()?;
        if key.len() > MAX_KEY_LEN {
            return Ok(false);
        }
        let components = match self.components_of(key)? {
            Some((components, _)) => components,
            None => return Ok(false),
        };

        self.strategy = InsertStrategy::Default;
        self.seq_count = SEQ_START_POINT;
        self.hot_path.clear();

        for c in 1..=components {
            self.delete_item(ItemKey::new(key, c))?;
        }
        self.item_count -= 1;
        self.modified = true;
        Ok(true)
    }

    fn delete_item(&mut self, target: ItemKey<'_>) -> Result<()> {
        let mut path = self.descend(target)?;
        let pos = match path[0].block.search(target) {
            Ok(i) => i,
            Err(_) => {
                return Err(TesseraError::DatabaseCorrupt(format!(
                    "table {}: component {} of a key is missing",
                    self.path, target.component
                )))
            }
        };
        self.cow_path(&mut path);
        Arc::make_mut(&mut path[0].block).remove(pos);
        self.hot_path.clear();

        // Unlink empty blocks bottom-up
        while path.len() > 1 && path[0].block.is_empty() {
            let gone = path.remove(0);
            self.release_block(gone.block_no);
            let parent = &mut path[0];
            let index = parent.index;
            let block = Arc::make_mut(&mut parent.block);
            block.remove(index);
            if index == 0 {
                block.null_first_key();
            }
        }

        if path.len() > 1
            && path[0].block.is_leaf()
            && self.compaction == CompactionPolicy::MergeUnderfull
        {
            self.merge_underfull(&mut path)?;
        }
        self.collapse_root(&mut path)?;
        self.store_path(path)
    }

    /// Fold an underfull leaf and an adjacent sibling into the leaf's block
    fn merge_underfull(&mut self, path: &mut [Frame]) -> Result<()> {
        if path[0].block.used_bytes() * 4 >= self.block_size {
            return Ok(());
        }
        let index = path[1].index;
        let count = path[1].block.item_count();
        let sibling_index = if index + 1 < count {
            index + 1
        } else if index > 0 {
            index - 1
        } else {
            return Ok(());
        };
        let sibling_no = path[1].block.item(sibling_index).child();
        let sibling = self.read_block(sibling_no)?;
        if !sibling.is_leaf() {
            return Err(TesseraError::DatabaseCorrupt(format!(
                "sibling block {} of a leaf is not a leaf",
                sibling_no
            )));
        }
        if path[0].block.used_bytes() + sibling.used_bytes() - super::block::HEADER_SIZE
            > self.block_size
        {
            return Ok(());
        }

        let (first, second) = if sibling_index > index {
            (&path[0].block, &sibling)
        } else {
            (&sibling, &path[0].block)
        };
        let items: Vec<ItemBuf> = first
            .items()
            .chain(second.items())
            .map(|i| i.to_owned())
            .collect();
        let merged = Block::from_items(self.block_size, 0, self.base.revision + 1, &items);

        path[0].block = Arc::new(merged);
        self.release_block(sibling_no);
        let leaf_no = path[0].block_no;
        let parent = Arc::make_mut(&mut path[1].block);
        if sibling_index > index {
            parent.remove(sibling_index);
        } else {
            parent.set_child(sibling_index, leaf_no);
            parent.remove(index);
            path[1].index = sibling_index;
        }
        debug!(table = %self.path, leaf = leaf_no, sibling = sibling_no, "merged underfull leaf");
        Ok(())
    }

    /// Remove branch roots with a single child; an empty branch root becomes an empty leaf
    fn collapse_root(&mut self, path: &mut Vec<Frame>) -> Result<()> {
        let mut top = match path.last() {
            Some(frame) if frame.block_no == self.root => Arc::clone(&frame.block),
            _ => return Ok(()),
        };
        while !top.is_leaf() {
            match top.item_count() {
                0 => {
                    if let Some(frame) = path.last_mut() {
                        if frame.block_no == self.root {
                            frame.block = Arc::new(Block::new(
                                self.block_size,
                                0,
                                self.base.revision + 1,
                            ));
                            self.level = 0;
                        }
                    }
                    break;
                }
                1 => {
                    let child = top.item(0).child();
                    if path.last().map(|f| f.block_no) == Some(self.root) {
                        path.pop();
                    }
                    let old_root = self.root;
                    self.release_block(old_root);
                    self.root = child;
                    self.level -= 1;
                    debug!(table = %self.path, root = child, level = self.level, "collapsed root");
                    top = match path.last() {
                        Some(frame) if frame.block_no == child => Arc::clone(&frame.block),
                        _ => self.read_block(child)?,
                    };
                }
                _ => break,
            }
        }
        Ok(())
    }

    // =========================================================================
    // Commit / Cancel
    // =========================================================================

    /// Make the session durable as `new_revision`
    pub fn commit(&mut self, new_revision: u32) -> Result<()> {
        self.ensure_writable()?;
        if new_revision <= self.base.revision {
            return Err(TesseraError::Database(format!(
                "table {}: new revision {} must exceed current revision {}",
                self.path, new_revision, self.base.revision
            )));
        }
        match self.write_commit(new_revision) {
            Ok(()) => Ok(()),
            Err(e) => {
                error!(table = %self.path, revision = new_revision, error = %e, "commit failed");
                self.cancel();
                Err(e)
            }
        }
    }

    fn write_commit(&mut self, new_revision: u32) -> Result<()> {
        self.write_dirty()?;
        self.store.sync()?;

        let record = BaseRecord {
            revision: new_revision,
            block_size: self.block_size as u32,
            root: self.root,
            level: self.level as u32,
            item_count: self.item_count,
            block_count: self.free_map.block_count(),
            fake_root: self.fake_root,
            sequential: self.strategy == InsertStrategy::Sequential,
            bitmap: self.free_map.bitmap(),
        };
        let letter = self.base_letter.other();
        write_base(&self.path.base_file(letter), &record)?;

        self.dirty.clear();
        self.hot_path.clear();
        self.free_map.rebase();
        self.base = record;
        self.base_letter = letter;
        self.modified = false;
        info!(
            table = %self.path,
            revision = new_revision,
            root = self.root,
            entries = self.item_count,
            "committed table"
        );
        Ok(())
    }

    /// Discard the session and return to the committed revision
    pub fn cancel(&mut self) {
        self.dirty.clear();
        self.hot_path.clear();
        self.free_map.reset();
        self.root = self.base.root;
        self.level = self.base.level as usize;
        self.item_count = self.base.item_count;
        self.fake_root = self.base.fake_root;
        if self.base.sequential {
            self.strategy = InsertStrategy::Sequential;
            self.seq_count = 0;
        } else {
            self.strategy = InsertStrategy::Default;
            self.seq_count = SEQ_START_POINT;
        }
        self.modified = false;
        debug!(table = %self.path, revision = self.base.revision, "cancelled session");
    }

    /// Mark the session modified after a structural rewrite
    pub(super) fn mark_modified(&mut self) {
        self.modified = true;
        self.hot_path.clear();
    }
}
