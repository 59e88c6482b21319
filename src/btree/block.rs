//! Typed block view
//!
//! A block is a fixed-size byte arena: a header, a slot directory of item
//! offsets sorted by key, and an item heap packed from the end of the block.
//!
//! ```text
//! ┌─────────┬──────────────────────┬────────────┬───────────────────────┐
//! │ Header  │ Slots (u16 offsets)  │    free    │  Items (heap, ← grows)│
//! │ 20 bytes│ 2 bytes per item     │            │                       │
//! └─────────┴──────────────────────┴────────────┴───────────────────────┘
//!
//! Header: CRC32 (4) | Revision (4) | Level (1) | pad (1) | Count (2)
//!         | DataStart (4) | LiveBytes (4)
//! Item:   KeyLen (1) | Component (2) | Components (2) | ValueLen (2) | Key | Value
//! ```
//!
//! Leaf items (level 0) carry a chunk of a tag as their value. Branch items
//! carry a 4-byte child block number; the first item of every branch block is
//! a sentinel with an empty key and component 0, which sorts before every real
//! item. All integers are big-endian.

use std::cmp::Ordering;

use crate::error::{Result, TesseraError};

use super::{BLOCK_CAPACITY, MAX_KEY_LEN, MAX_LEVELS};

/// Size of the block header in bytes
pub const HEADER_SIZE: usize = 20;

/// Size of one slot directory entry
pub const SLOT_SIZE: usize = 2;

/// Fixed bytes of an encoded item besides its key and value
pub const ITEM_OVERHEAD: usize = 7;

/// Size of a branch item's value (child block number)
pub const CHILD_SIZE: usize = 4;

const CHECKSUM: usize = 0;
const REVISION: usize = 4;
const LEVEL: usize = 8;
const ITEM_COUNT: usize = 10;
const DATA_START: usize = 12;
const LIVE_BYTES: usize = 16;

fn get_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([buf[at], buf[at + 1]])
}

fn put_u16(buf: &mut [u8], at: usize, value: u16) {
    buf[at..at + 2].copy_from_slice(&value.to_be_bytes());
}

fn get_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn put_u32(buf: &mut [u8], at: usize, value: u32) {
    buf[at..at + 4].copy_from_slice(&value.to_be_bytes());
}

/// Largest encoded item allowed in a block of this size.
///
/// Chosen so at least `BLOCK_CAPACITY` items always fit, which guarantees a
/// byte-midpoint split leaves both halves within one block.
pub fn max_item_size(block_size: usize) -> usize {
    (block_size - HEADER_SIZE - BLOCK_CAPACITY * SLOT_SIZE) / BLOCK_CAPACITY
}

/// Sort key of an item: the user key, then the component number
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ItemKey<'a> {
    pub key: &'a [u8],
    pub component: u16,
}

impl<'a> ItemKey<'a> {
    /// Sorts before every item, including empty keys
    pub const MIN: ItemKey<'static> = ItemKey {
        key: &[],
        component: 0,
    };

    pub fn new(key: &'a [u8], component: u16) -> Self {
        Self { key, component }
    }
}

/// Shortest separator `s` with `left < s <= right`.
///
/// Used to enter a leaf split into the parent without copying whole keys.
pub fn shortest_separator(left: ItemKey<'_>, right: ItemKey<'_>) -> (Vec<u8>, u16) {
    if left.key == right.key {
        return (right.key.to_vec(), right.component);
    }
    for len in 1..right.key.len() {
        let prefix = &right.key[..len];
        if prefix > left.key {
            return (prefix.to_vec(), 1);
        }
    }
    (right.key.to_vec(), right.component)
}

// =============================================================================
// Items
// =============================================================================

/// Borrowed view of one item inside a block
#[derive(Debug, Clone, Copy)]
pub struct Item<'a> {
    key: &'a [u8],
    component: u16,
    components: u16,
    value: &'a [u8],
}

impl<'a> Item<'a> {
    fn decode(data: &'a [u8], offset: usize) -> Self {
        let key_len = data[offset] as usize;
        let component = get_u16(data, offset + 1);
        let components = get_u16(data, offset + 3);
        let value_len = get_u16(data, offset + 5) as usize;
        let key_start = offset + ITEM_OVERHEAD;
        let value_start = key_start + key_len;
        Self {
            key: &data[key_start..value_start],
            component,
            components,
            value: &data[value_start..value_start + value_len],
        }
    }

    pub fn key(&self) -> &'a [u8] {
        self.key
    }

    /// 1-based component number (0 for branch sentinels)
    pub fn component(&self) -> u16 {
        self.component
    }

    /// Total number of components of the tag this item belongs to
    pub fn components(&self) -> u16 {
        self.components
    }

    pub fn value(&self) -> &'a [u8] {
        self.value
    }

    pub fn sort_key(&self) -> ItemKey<'a> {
        ItemKey::new(self.key, self.component)
    }

    /// Child block number of a branch item
    pub fn child(&self) -> u32 {
        get_u32(self.value, 0)
    }

    pub fn encoded_len(&self) -> usize {
        ITEM_OVERHEAD + self.key.len() + self.value.len()
    }

    pub fn to_owned(&self) -> ItemBuf {
        ItemBuf {
            key: self.key.to_vec(),
            component: self.component,
            components: self.components,
            value: self.value.to_vec(),
        }
    }
}

/// Owned item, used while building, splitting and merging blocks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemBuf {
    pub key: Vec<u8>,
    pub component: u16,
    pub components: u16,
    pub value: Vec<u8>,
}

impl ItemBuf {
    pub fn leaf(key: &[u8], component: u16, components: u16, chunk: &[u8]) -> Self {
        Self {
            key: key.to_vec(),
            component,
            components,
            value: chunk.to_vec(),
        }
    }

    pub fn branch(key: &[u8], component: u16, child: u32) -> Self {
        Self {
            key: key.to_vec(),
            component,
            components: 0,
            value: child.to_be_bytes().to_vec(),
        }
    }

    /// First item of a branch block
    pub fn sentinel(child: u32) -> Self {
        Self::branch(&[], 0, child)
    }

    /// Turn this branch item into a sentinel, returning the key it carried
    pub fn take_key(&mut self) -> (Vec<u8>, u16) {
        let component = std::mem::replace(&mut self.component, 0);
        (std::mem::take(&mut self.key), component)
    }

    pub fn sort_key(&self) -> ItemKey<'_> {
        ItemKey::new(&self.key, self.component)
    }

    pub fn child(&self) -> u32 {
        get_u32(&self.value, 0)
    }

    pub fn encoded_len(&self) -> usize {
        ITEM_OVERHEAD + self.key.len() + self.value.len()
    }

    fn encode_into(&self, out: &mut [u8]) {
        out[0] = self.key.len() as u8;
        put_u16(out, 1, self.component);
        put_u16(out, 3, self.components);
        put_u16(out, 5, self.value.len() as u16);
        let key_end = ITEM_OVERHEAD + self.key.len();
        out[ITEM_OVERHEAD..key_end].copy_from_slice(&self.key);
        out[key_end..key_end + self.value.len()].copy_from_slice(&self.value);
    }
}

// =============================================================================
// Block
// =============================================================================

/// One B-tree block.
///
/// Handles are passed around as `Arc<Block>`: shared and read-only while a
/// block belongs to a committed revision, owned for write (via
/// `Arc::make_mut`) once it has been copied into the current session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    data: Vec<u8>,
}

impl Block {
    /// An empty block at `level`
    pub fn new(block_size: usize, level: u8, revision: u32) -> Self {
        let mut data = vec![0u8; block_size];
        put_u32(&mut data, REVISION, revision);
        data[LEVEL] = level;
        put_u16(&mut data, ITEM_COUNT, 0);
        put_u32(&mut data, DATA_START, block_size as u32);
        put_u32(&mut data, LIVE_BYTES, 0);
        Self { data }
    }

    /// Build a block from items already in sort order.
    ///
    /// The caller guarantees the items fit.
    pub fn from_items(block_size: usize, level: u8, revision: u32, items: &[ItemBuf]) -> Self {
        let mut block = Self::new(block_size, level, revision);
        for (i, item) in items.iter().enumerate() {
            block.insert(i, item);
        }
        block
    }

    /// Parse and verify raw bytes read from disk
    pub fn from_bytes(data: Vec<u8>, block_no: u32) -> Result<Self> {
        let corrupt =
            |what: &str| TesseraError::DatabaseCorrupt(format!("block {}: {}", block_no, what));

        let block_size = data.len();
        if block_size < HEADER_SIZE {
            return Err(corrupt("short block"));
        }
        if get_u32(&data, CHECKSUM) != crc32fast::hash(&data[REVISION..]) {
            return Err(corrupt("checksum mismatch"));
        }
        if data[LEVEL] as usize >= MAX_LEVELS {
            return Err(corrupt("level out of range"));
        }

        let count = get_u16(&data, ITEM_COUNT) as usize;
        let data_start = get_u32(&data, DATA_START) as usize;
        let dir_end = HEADER_SIZE + count * SLOT_SIZE;
        if dir_end > data_start || data_start > block_size {
            return Err(corrupt("slot directory overlaps item heap"));
        }

        let is_leaf = data[LEVEL] == 0;
        let mut live = 0usize;
        for i in 0..count {
            let offset = get_u16(&data, HEADER_SIZE + i * SLOT_SIZE) as usize;
            if offset < data_start || offset + ITEM_OVERHEAD > block_size {
                return Err(corrupt("item offset out of range"));
            }
            let key_len = data[offset] as usize;
            let value_len = get_u16(&data, offset + 5) as usize;
            if key_len > MAX_KEY_LEN {
                return Err(corrupt("key too long"));
            }
            if !is_leaf && value_len != CHILD_SIZE {
                return Err(corrupt("branch item without child pointer"));
            }
            let len = ITEM_OVERHEAD + key_len + value_len;
            if offset + len > block_size {
                return Err(corrupt("item runs past end of block"));
            }
            live += len;
        }
        if live != get_u32(&data, LIVE_BYTES) as usize {
            return Err(corrupt("live byte count mismatch"));
        }

        let block = Self { data };
        for i in 1..count {
            if block.item(i - 1).sort_key() >= block.item(i).sort_key() {
                return Err(corrupt("items out of order"));
            }
        }
        Ok(block)
    }

    /// Bytes to write to disk, with the checksum filled in
    pub fn sealed(&self) -> Vec<u8> {
        let mut out = self.data.clone();
        let crc = crc32fast::hash(&out[REVISION..]);
        put_u32(&mut out, CHECKSUM, crc);
        out
    }

    // =========================================================================
    // Header Accessors
    // =========================================================================

    pub fn block_size(&self) -> usize {
        self.data.len()
    }

    pub fn level(&self) -> u8 {
        self.data[LEVEL]
    }

    pub fn is_leaf(&self) -> bool {
        self.level() == 0
    }

    /// Revision this block was written for
    pub fn revision(&self) -> u32 {
        get_u32(&self.data, REVISION)
    }

    pub fn set_revision(&mut self, revision: u32) {
        put_u32(&mut self.data, REVISION, revision);
    }

    pub fn item_count(&self) -> usize {
        get_u16(&self.data, ITEM_COUNT) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.item_count() == 0
    }

    fn data_start(&self) -> usize {
        get_u32(&self.data, DATA_START) as usize
    }

    fn live_bytes(&self) -> usize {
        get_u32(&self.data, LIVE_BYTES) as usize
    }

    /// Header, slots and live items
    pub fn used_bytes(&self) -> usize {
        HEADER_SIZE + self.item_count() * SLOT_SIZE + self.live_bytes()
    }

    /// Free bytes, counting fragmented holes in the heap
    pub fn free_space(&self) -> usize {
        self.block_size() - self.used_bytes()
    }

    pub fn fits(&self, item_len: usize) -> bool {
        self.free_space() >= item_len + SLOT_SIZE
    }

    // =========================================================================
    // Item Access
    // =========================================================================

    fn slot(&self, index: usize) -> usize {
        get_u16(&self.data, HEADER_SIZE + index * SLOT_SIZE) as usize
    }

    fn item_len_at(&self, offset: usize) -> usize {
        ITEM_OVERHEAD + self.data[offset] as usize + get_u16(&self.data, offset + 5) as usize
    }

    pub fn item(&self, index: usize) -> Item<'_> {
        Item::decode(&self.data, self.slot(index))
    }

    pub fn items(&self) -> impl Iterator<Item = Item<'_>> + '_ {
        (0..self.item_count()).map(move |i| self.item(i))
    }

    pub fn last_item(&self) -> Option<Item<'_>> {
        self.item_count().checked_sub(1).map(|i| self.item(i))
    }

    /// Binary search: `Ok(index)` on an exact match, `Err(insert_at)` otherwise
    pub fn search(&self, target: ItemKey<'_>) -> std::result::Result<usize, usize> {
        let mut low = 0;
        let mut high = self.item_count();
        while low < high {
            let mid = low + (high - low) / 2;
            match self.item(mid).sort_key().cmp(&target) {
                Ordering::Less => low = mid + 1,
                Ordering::Greater => high = mid,
                Ordering::Equal => return Ok(mid),
            }
        }
        Err(low)
    }

    /// Branch search: index of the last item `<= target`
    pub fn child_index(&self, target: ItemKey<'_>) -> usize {
        match self.search(target) {
            Ok(i) => i,
            Err(0) => 0,
            Err(i) => i - 1,
        }
    }

    // =========================================================================
    // Mutation
    // =========================================================================

    /// Insert `item` at slot `index`. The caller checks `fits` first.
    pub fn insert(&mut self, index: usize, item: &ItemBuf) {
        let len = item.encoded_len();
        debug_assert!(self.fits(len));

        let count = self.item_count();
        if self.data_start() < HEADER_SIZE + (count + 1) * SLOT_SIZE + len {
            self.compact_heap();
        }

        let start = self.data_start() - len;
        item.encode_into(&mut self.data[start..start + len]);

        let slot_at = HEADER_SIZE + index * SLOT_SIZE;
        let dir_end = HEADER_SIZE + count * SLOT_SIZE;
        self.data.copy_within(slot_at..dir_end, slot_at + SLOT_SIZE);
        put_u16(&mut self.data, slot_at, start as u16);

        put_u16(&mut self.data, ITEM_COUNT, (count + 1) as u16);
        put_u32(&mut self.data, DATA_START, start as u32);
        let live = self.live_bytes() + len;
        put_u32(&mut self.data, LIVE_BYTES, live as u32);
    }

    /// Remove the item at slot `index`; its heap bytes become a hole
    pub fn remove(&mut self, index: usize) {
        let count = self.item_count();
        let len = self.item_len_at(self.slot(index));

        let slot_at = HEADER_SIZE + index * SLOT_SIZE;
        let dir_end = HEADER_SIZE + count * SLOT_SIZE;
        self.data.copy_within(slot_at + SLOT_SIZE..dir_end, slot_at);

        put_u16(&mut self.data, ITEM_COUNT, (count - 1) as u16);
        let live = self.live_bytes() - len;
        put_u32(&mut self.data, LIVE_BYTES, live as u32);
        if count == 1 {
            let size = self.block_size() as u32;
            put_u32(&mut self.data, DATA_START, size);
        }
    }

    /// Point branch item `index` at a different child
    pub fn set_child(&mut self, index: usize, child: u32) {
        let offset = self.slot(index);
        let key_len = self.data[offset] as usize;
        put_u32(&mut self.data, offset + ITEM_OVERHEAD + key_len, child);
    }

    /// Restore the sentinel invariant after the first branch item was removed
    pub fn null_first_key(&mut self) {
        if self.is_empty() {
            return;
        }
        let first = self.item(0);
        if first.key().is_empty() && first.component() == 0 {
            return;
        }
        let child = first.child();
        self.remove(0);
        self.insert(0, &ItemBuf::sentinel(child));
    }

    /// Rewrite the heap so all free space is contiguous
    fn compact_heap(&mut self) {
        let block_size = self.block_size();
        let mut fresh = vec![0u8; block_size];
        fresh[..HEADER_SIZE].copy_from_slice(&self.data[..HEADER_SIZE]);

        let mut start = block_size;
        for i in 0..self.item_count() {
            let offset = self.slot(i);
            let len = self.item_len_at(offset);
            start -= len;
            fresh[start..start + len].copy_from_slice(&self.data[offset..offset + len]);
            put_u16(&mut fresh, HEADER_SIZE + i * SLOT_SIZE, start as u16);
        }
        put_u32(&mut fresh, DATA_START, start as u32);
        self.data = fresh;
    }
}
