//! Base files and free-space bookkeeping
//!
//! Each table keeps two base files, A and B. A commit always rewrites the slot
//! that does not hold the revision the session started from, so a crash at any
//! point leaves at least one intact base.
//!
//! ## Base File Format
//! ```text
//! ┌──────────┬─────────────┬─────────────────────────┬──────────┐
//! │ Magic(8) │ Version (4) │ BaseRecord (bincode)    │ CRC32 (4)│
//! └──────────┴─────────────┴─────────────────────────┴──────────┘
//! ```
//! The checksum covers everything before it. A slot that is short, fails its
//! checksum or does not decode is treated as invalid, never as an error, so
//! a torn write falls back to the other slot.

use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::validate_block_size;
use crate::error::{Result, TesseraError};

use super::{TablePath, MAX_LEVELS};

const BASE_MAGIC: &[u8; 8] = b"TSRBASE\0";

/// Version of the base and block format written by this crate
pub const FORMAT_VERSION: u32 = 1;

const PREFIX_LEN: usize = 12;
const CRC_LEN: usize = 4;

/// Which of the two base slots
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BaseLetter {
    A,
    B,
}

impl BaseLetter {
    pub fn other(self) -> Self {
        match self {
            BaseLetter::A => BaseLetter::B,
            BaseLetter::B => BaseLetter::A,
        }
    }

    pub fn as_char(self) -> char {
        match self {
            BaseLetter::A => 'A',
            BaseLetter::B => 'B',
        }
    }
}

/// Committed state of one revision of a table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaseRecord {
    pub revision: u32,
    pub block_size: u32,
    pub root: u32,
    pub level: u32,
    pub item_count: u64,
    /// One past the highest block number in use
    pub block_count: u32,
    /// The root has never been written; the tree is empty
    pub fake_root: bool,
    pub sequential: bool,
    /// One bit per block, set while the block belongs to this revision
    pub bitmap: Vec<u8>,
}

impl BaseRecord {
    /// State of a freshly created, empty table
    pub fn empty(block_size: usize) -> Self {
        Self {
            revision: 0,
            block_size: block_size as u32,
            root: 0,
            level: 0,
            item_count: 0,
            block_count: 0,
            fake_root: true,
            sequential: true,
            bitmap: Vec::new(),
        }
    }

    fn inconsistency(&self) -> Option<String> {
        if validate_block_size(self.block_size as usize).is_err() {
            return Some(format!("bad block size {}", self.block_size));
        }
        if self.level as usize >= MAX_LEVELS {
            return Some(format!("level {} out of range", self.level));
        }
        if self.fake_root {
            if self.level != 0 || self.item_count != 0 {
                return Some("fake root on a non-empty tree".to_string());
            }
        } else if !bit_is_set(&self.bitmap, self.root) {
            return Some(format!("root block {} not marked in use", self.root));
        }
        if self.bitmap.len() * 8 < self.block_count as usize {
            return Some("bitmap shorter than block count".to_string());
        }
        None
    }
}

/// Contents of one base slot on disk
#[derive(Debug, Clone)]
pub enum BaseSlot {
    Missing,
    Invalid(String),
    Valid(BaseRecord),
}

impl BaseSlot {
    /// Read and verify one base file.
    ///
    /// A format version mismatch is the only content problem that is
    /// reported as an error instead of an invalid slot.
    pub fn read(path: &Path) -> Result<Self> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(BaseSlot::Missing),
            Err(e) => return Err(e.into()),
        };

        if bytes.len() < PREFIX_LEN + CRC_LEN {
            return Ok(BaseSlot::Invalid("short base file".to_string()));
        }
        let (body, crc_bytes) = bytes.split_at(bytes.len() - CRC_LEN);
        let stored = u32::from_le_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);
        if crc32fast::hash(body) != stored {
            return Ok(BaseSlot::Invalid("base checksum mismatch".to_string()));
        }
        if &body[..8] != BASE_MAGIC {
            return Ok(BaseSlot::Invalid("not a base file".to_string()));
        }
        let version = u32::from_le_bytes([body[8], body[9], body[10], body[11]]);
        if version != FORMAT_VERSION {
            return Err(TesseraError::DatabaseVersion(format!(
                "{}: format version {} (expected {})",
                path.display(),
                version,
                FORMAT_VERSION
            )));
        }

        let record: BaseRecord = match bincode::deserialize(&body[PREFIX_LEN..]) {
            Ok(record) => record,
            Err(e) => return Ok(BaseSlot::Invalid(format!("undecodable base record: {}", e))),
        };
        if let Some(problem) = record.inconsistency() {
            return Ok(BaseSlot::Invalid(problem));
        }
        Ok(BaseSlot::Valid(record))
    }

    pub fn record(&self) -> Option<&BaseRecord> {
        match self {
            BaseSlot::Valid(record) => Some(record),
            _ => None,
        }
    }

    pub fn exists(&self) -> bool {
        !matches!(self, BaseSlot::Missing)
    }
}

/// Atomically replace a base file: write a temp file, sync, rename, sync the directory
pub fn write_base(path: &Path, record: &BaseRecord) -> Result<()> {
    let mut bytes = Vec::with_capacity(PREFIX_LEN + record.bitmap.len() + 64);
    bytes.extend_from_slice(BASE_MAGIC);
    bytes.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    bytes.extend_from_slice(&bincode::serialize(record)?);
    let crc = crc32fast::hash(&bytes);
    bytes.extend_from_slice(&crc.to_le_bytes());

    let tmp = temp_path(path);
    if let Err(e) = write_temp(&tmp, &bytes).and_then(|()| fs::rename(&tmp, path)) {
        discard_temp(&tmp);
        return Err(e.into());
    }
    sync_parent_dir(path)?;

    debug!(
        path = %path.display(),
        revision = record.revision,
        root = record.root,
        "wrote base file"
    );
    Ok(())
}

/// Delete a base file if present
pub fn remove_base(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => {
            sync_parent_dir(path)?;
            Ok(())
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn write_temp(tmp: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(tmp)?;
    file.write_all(bytes)?;
    file.sync_all()
}

fn discard_temp(tmp: &Path) {
    match fs::remove_file(tmp) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => warn!(path = %tmp.display(), error = %e, "failed to remove temp base file"),
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

#[cfg(unix)]
fn sync_parent_dir(path: &Path) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    File::open(dir)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn sync_parent_dir(_path: &Path) -> Result<()> {
    Ok(())
}

// =============================================================================
// Both Slots
// =============================================================================

/// The A and B slots of one table, as read at open time
#[derive(Debug, Clone)]
pub struct BasePair {
    pub a: BaseSlot,
    pub b: BaseSlot,
}

impl BasePair {
    pub fn load(path: &TablePath) -> Result<Self> {
        Ok(Self {
            a: BaseSlot::read(&path.base_file(BaseLetter::A))?,
            b: BaseSlot::read(&path.base_file(BaseLetter::B))?,
        })
    }

    pub fn slot(&self, letter: BaseLetter) -> &BaseSlot {
        match letter {
            BaseLetter::A => &self.a,
            BaseLetter::B => &self.b,
        }
    }

    fn unusable(&self, path: &TablePath) -> TesseraError {
        if !self.a.exists() && !self.b.exists() {
            return TesseraError::DatabaseOpening(format!("no base files for table {}", path));
        }
        for (letter, slot) in [(BaseLetter::A, &self.a), (BaseLetter::B, &self.b)] {
            if let BaseSlot::Invalid(reason) = slot {
                warn!(table = %path, slot = %letter.as_char(), reason = %reason, "invalid base file");
            }
        }
        TesseraError::DatabaseCorrupt(format!("no valid base file for table {}", path))
    }

    /// The slot holding the newest valid revision
    pub fn latest(&self, path: &TablePath) -> Result<(BaseLetter, BaseRecord)> {
        let (letter, record) = match (self.a.record(), self.b.record()) {
            (Some(a), Some(b)) if b.revision > a.revision => (BaseLetter::B, b),
            (Some(a), _) => (BaseLetter::A, a),
            (None, Some(b)) => (BaseLetter::B, b),
            (None, None) => return Err(self.unusable(path)),
        };
        Ok((letter, record.clone()))
    }

    /// The slot holding exactly `revision`, if either does
    pub fn at_revision(
        &self,
        path: &TablePath,
        revision: u32,
    ) -> Result<Option<(BaseLetter, BaseRecord)>> {
        if self.a.record().is_none() && self.b.record().is_none() {
            return Err(self.unusable(path));
        }
        for letter in [BaseLetter::A, BaseLetter::B] {
            if let Some(record) = self.slot(letter).record() {
                if record.revision == revision {
                    return Ok(Some((letter, record.clone())));
                }
            }
        }
        Ok(None)
    }
}

// =============================================================================
// Free Space
// =============================================================================

fn bit_is_set(map: &[u8], n: u32) -> bool {
    let byte = (n / 8) as usize;
    byte < map.len() && map[byte] & (1 << (n % 8)) != 0
}

fn set_bit(map: &mut Vec<u8>, n: u32) {
    let byte = (n / 8) as usize;
    if byte >= map.len() {
        map.resize(byte + 1, 0);
    }
    map[byte] |= 1 << (n % 8);
}

fn clear_bit(map: &mut [u8], n: u32) {
    let byte = (n / 8) as usize;
    if byte < map.len() {
        map[byte] &= !(1 << (n % 8));
    }
}

/// Block allocator for one write session.
///
/// A block may be handed out only if it is free in all three maps, which keeps
/// the blocks of the two newest committed revisions intact while a third is
/// being written.
#[derive(Debug, Clone, Default)]
pub struct FreeSpaceMap {
    /// Blocks of the revision this session started from
    at_start: Vec<u8>,
    /// Blocks in use by the session
    current: Vec<u8>,
    /// Blocks of the older base slot, while that slot exists
    protected: Vec<u8>,
    /// No free block below this number
    low: u32,
}

impl FreeSpaceMap {
    pub fn new(at_start: Vec<u8>, protected: Vec<u8>) -> Self {
        Self {
            current: at_start.clone(),
            at_start,
            protected,
            low: 0,
        }
    }

    pub fn allocate(&mut self) -> u32 {
        let mut n = self.low;
        while bit_is_set(&self.current, n)
            || bit_is_set(&self.at_start, n)
            || bit_is_set(&self.protected, n)
        {
            n += 1;
        }
        set_bit(&mut self.current, n);
        self.low = n + 1;
        n
    }

    pub fn free(&mut self, n: u32) {
        clear_bit(&mut self.current, n);
        self.low = self.low.min(n);
    }

    /// In use now
    pub fn is_used(&self, n: u32) -> bool {
        bit_is_set(&self.current, n)
    }

    /// Allocated since the session began, so it can be modified in place
    pub fn is_session_block(&self, n: u32) -> bool {
        bit_is_set(&self.current, n) && !bit_is_set(&self.at_start, n)
    }

    /// A commit made the session the new base; the old start becomes the older slot
    pub fn rebase(&mut self) {
        self.protected = std::mem::replace(&mut self.at_start, self.current.clone());
        self.low = 0;
    }

    /// Discard the session's allocations
    pub fn reset(&mut self) {
        self.current = self.at_start.clone();
        self.low = 0;
    }

    /// One past the highest block in use
    pub fn block_count(&self) -> u32 {
        for (i, byte) in self.current.iter().enumerate().rev() {
            if *byte != 0 {
                return (i as u32) * 8 + (8 - byte.leading_zeros());
            }
        }
        0
    }

    pub fn used_count(&self) -> u32 {
        self.current.iter().map(|b| b.count_ones()).sum()
    }

    /// Session bitmap trimmed to `block_count`, as stored in a base record
    pub fn bitmap(&self) -> Vec<u8> {
        let bytes = (self.block_count() as usize).div_ceil(8);
        self.current[..bytes].to_vec()
    }
}
