//! Table Manager
//!
//! Keeps the five tables of a database consistent with each other.
//!
//! ## Responsibilities
//! - Create a new database (tables first, metafile last)
//! - Open every table at one consistent revision
//! - Apply pending changes to all tables in a fixed order
//! - Recover from a failed apply by reopening at the previous revision
//!
//! ## Commit Order
//! ```text
//! postlist_ ──► position_ ──► termlist_ ──► value_ ──► record_
//! ```
//! The record table commits last, so its revision is the database revision.
//! A crash part-way through leaves the earlier tables one revision ahead of
//! the record table; opening at the record table's revision discards that
//! half-finished revision.

use std::fmt;
use std::fs;

use tracing::{debug, error, info, warn};

use crate::btree::{Btree, TablePath};
use crate::config::Config;
use crate::error::{Result, TesseraError};
use crate::lock::WriteLock;
use crate::metafile;
use crate::table::{BufferedTable, MergedCursor};

/// The tables of a database, in commit order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TableId {
    Postlist,
    Position,
    Termlist,
    Value,
    Record,
}

impl TableId {
    /// Every table, in commit order
    pub const ALL: [TableId; 5] = [
        TableId::Postlist,
        TableId::Position,
        TableId::Termlist,
        TableId::Value,
        TableId::Record,
    ];

    pub fn name(self) -> &'static str {
        match self {
            TableId::Postlist => "postlist",
            TableId::Position => "position",
            TableId::Termlist => "termlist",
            TableId::Value => "value",
            TableId::Record => "record",
        }
    }

    /// Filename prefix of the table's files
    pub fn prefix(self) -> String {
        format!("{}_", self.name())
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for TableId {
    type Err = TesseraError;

    fn from_str(s: &str) -> Result<Self> {
        TableId::ALL
            .into_iter()
            .find(|id| id.name() == s.trim_end_matches('_'))
            .ok_or_else(|| TesseraError::InvalidOperation(format!("unknown table {:?}", s)))
    }
}

/// Opens, applies and cancels all tables together
///
/// ## Concurrency:
/// - One writable manager per database, enforced by the lock file
/// - Any number of read-only managers; each sees one revision until `reopen`
pub struct TableManager {
    config: Config,
    writable: bool,
    /// Indexed by `TableId`, in commit order
    tables: Vec<BufferedTable>,
    /// Revision all tables are open at
    revision: u32,
    /// Released when the manager is dropped
    lock: Option<WriteLock>,
}

impl fmt::Debug for TableManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TableManager")
            .field("data_dir", &self.config.data_dir)
            .field("writable", &self.writable)
            .field("revision", &self.revision)
            .finish()
    }
}

impl TableManager {
    /// Open for writing, creating the database if allowed by the config
    pub fn open(config: Config) -> Result<Self> {
        config.validate()?;
        let dir = config.data_dir.clone();

        let exists = metafile::exists(&dir);
        if !exists && !config.create {
            return Err(TesseraError::DatabaseOpening(format!(
                "no database at {}",
                dir.display()
            )));
        }
        fs::create_dir_all(&dir)?;
        let lock = WriteLock::acquire(&dir)?;

        if exists {
            metafile::check(&dir)?;
        } else {
            Self::create_tables(&config)?;
        }

        let mut manager = Self {
            config,
            writable: true,
            tables: Vec::new(),
            revision: 0,
            lock: Some(lock),
        };
        manager.open_tables_consistent()?;
        info!(dir = %dir.display(), revision = manager.revision, "opened database for writing");
        Ok(manager)
    }

    /// Open an existing database read-only
    pub fn open_read_only(config: Config) -> Result<Self> {
        metafile::check(&config.data_dir)?;
        let mut manager = Self {
            config,
            writable: false,
            tables: Vec::new(),
            revision: 0,
            lock: None,
        };
        manager.open_tables_consistent()?;
        info!(
            dir = %manager.config.data_dir.display(),
            revision = manager.revision,
            "opened database for reading"
        );
        Ok(manager)
    }

    fn create_tables(config: &Config) -> Result<()> {
        for id in TableId::ALL {
            Btree::create(&Self::path_for(config, id), config.block_size)?;
        }
        metafile::create(&config.data_dir)?;
        info!(dir = %config.data_dir.display(), block_size = config.block_size, "created database");
        Ok(())
    }

    fn path_for(config: &Config, id: TableId) -> TablePath {
        TablePath::new(&config.data_dir, id.prefix())
    }

    pub fn table_path(&self, id: TableId) -> TablePath {
        Self::path_for(&self.config, id)
    }

    // =========================================================================
    // Revisions
    // =========================================================================

    /// Open every table at exactly `revision`
    pub fn open_tables(&mut self, revision: u32) -> Result<()> {
        let mut tables = Vec::with_capacity(TableId::ALL.len());
        for id in TableId::ALL {
            let path = self.table_path(id);
            let mut btree = if self.writable {
                Btree::open_to_write(&path, Some(revision))?
                    .ok_or(TesseraError::RevisionNotAvailable { revision })?
            } else {
                Btree::open_to_read(&path, Some(revision))?
            };
            btree.set_compaction_policy(self.config.compaction);
            btree.set_full_compaction(self.config.full_compaction);
            btree.set_max_dirty_blocks(self.config.max_dirty_blocks);
            tables.push(BufferedTable::new(btree));
        }
        self.tables = tables;
        self.revision = revision;
        debug!(revision, "opened tables");
        Ok(())
    }

    /// Open every table at the record table's latest revision
    pub fn open_tables_consistent(&mut self) -> Result<()> {
        let record = self.table_path(TableId::Record);
        let revision = Btree::latest_revision(&record)?;
        self.open_tables(revision).map_err(|e| match e {
            TesseraError::RevisionNotAvailable { revision } => TesseraError::DatabaseCorrupt(
                format!("not every table has revision {}", revision),
            ),
            other => other,
        })
    }

    pub fn revision_number(&self) -> u32 {
        self.revision
    }

    /// Revision the next apply will commit
    pub fn next_revision_number(&self) -> Result<u32> {
        match self.revision.checked_add(1) {
            Some(next) if next < u32::MAX => Ok(next),
            _ => Err(TesseraError::Database("revision numbers exhausted".to_string())),
        }
    }

    // =========================================================================
    // Apply / Cancel
    // =========================================================================

    pub fn is_modified(&self) -> bool {
        self.tables.iter().any(BufferedTable::is_modified)
    }

    /// Commit pending changes of every table as the next revision
    pub fn apply(&mut self) -> Result<()> {
        self.ensure_writable()?;
        if !self.is_modified() {
            debug!(revision = self.revision, "nothing to apply");
            return Ok(());
        }
        let old = self.revision;
        let new = self.next_revision_number()?;

        for i in 0..self.tables.len() {
            if let Err(e) = self.tables[i].apply(new) {
                error!(table = %TableId::ALL[i], revision = new, error = %e, "apply failed");
                for table in &mut self.tables[i + 1..] {
                    table.cancel();
                }
                if let Err(reopen) = self.open_tables(old) {
                    error!(revision = old, error = %reopen, "reopen after failed apply failed");
                }
                return Err(e);
            }
        }
        self.revision = new;
        info!(revision = new, "applied changes");
        Ok(())
    }

    /// Discard pending changes of every table
    pub fn cancel(&mut self) {
        for table in &mut self.tables {
            table.cancel();
        }
        debug!(revision = self.revision, "cancelled pending changes");
    }

    /// Reload at the latest consistent revision, dropping pending changes
    pub fn reopen(&mut self) -> Result<()> {
        if self.is_modified() {
            warn!(revision = self.revision, "reopen discards pending changes");
        }
        self.open_tables_consistent()
    }

    // =========================================================================
    // Table Access
    // =========================================================================

    pub fn table(&self, id: TableId) -> &BufferedTable {
        &self.tables[id.index()]
    }

    pub fn table_mut(&mut self, id: TableId) -> &mut BufferedTable {
        &mut self.tables[id.index()]
    }

    pub fn get(&self, id: TableId, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.table(id).get(key)
    }

    pub fn set(&mut self, id: TableId, key: &[u8], tag: &[u8]) -> Result<()> {
        self.table_mut(id).set(key, tag)
    }

    pub fn delete(&mut self, id: TableId, key: &[u8]) -> Result<bool> {
        self.table_mut(id).delete(key)
    }

    pub fn cursor(&self, id: TableId) -> MergedCursor<'_> {
        self.table(id).cursor()
    }

    pub fn cursor_from(&self, id: TableId, key: &[u8]) -> MergedCursor<'_> {
        self.table(id).cursor_from(key)
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Whether this manager holds the write lock
    pub fn holds_lock(&self) -> bool {
        self.lock.is_some()
    }

    fn ensure_writable(&self) -> Result<()> {
        if !self.writable {
            return Err(TesseraError::InvalidOperation(
                "database is open read-only".to_string(),
            ));
        }
        Ok(())
    }
}
