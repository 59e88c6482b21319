//! Engine Module
//!
//! The interface the indexing layer talks to.
//!
//! ## Responsibilities
//! - Route reads and writes to the right table
//! - Apply pending changes automatically every `changes_before_apply` writes
//! - Group changes into explicit transactions
//! - Cancel pending changes when a write fails
//!
//! ## Write Path
//! ```text
//! set/delete ──► TableManager ──► BufferedTable overlay
//!                     │
//!   pending >= changes_before_apply (outside a transaction)
//!                     │
//!                     ▼
//!              TableManager::apply ──► postlist → ... → record
//! ```

use std::path::Path;

use parking_lot::RwLock;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{Result, TesseraError};
use crate::manager::{TableId, TableManager};
use crate::table::MergedCursor;

/// Manager plus the write session bookkeeping
struct Session {
    manager: TableManager,
    /// Writes since the last apply
    changes: usize,
    in_transaction: bool,
    closed: bool,
}

impl Session {
    /// Drop pending changes after a failed write
    fn abandon(&mut self, err: &TesseraError) {
        warn!(error = %err, pending = self.changes, "write failed, cancelling pending changes");
        self.manager.cancel();
        self.changes = 0;
        self.in_transaction = false;
    }

    fn apply(&mut self) -> Result<()> {
        let result = self.manager.apply();
        self.changes = 0;
        result
    }

    fn record_change(&mut self, limit: usize) -> Result<()> {
        self.changes += 1;
        if !self.in_transaction && self.changes >= limit {
            debug!(changes = self.changes, "automatic apply");
            self.apply()?;
        }
        Ok(())
    }
}

/// The storage engine
///
/// ## Concurrency Model: Single-Writer / Multiple-Reader (SWMR)
///
/// - **Writes** (set/delete/commit): take the write half of `session`
/// - **Reads** (get/scan/cursor): share the read half
/// - Across processes, the lock file allows one writable engine per database
pub struct Engine {
    config: Config,
    session: RwLock<Session>,
}

impl Engine {
    /// Open or create a database for writing
    pub fn open(config: Config) -> Result<Self> {
        let manager = TableManager::open(config.clone())?;
        Ok(Self::with_manager(config, manager))
    }

    /// Open an existing database read-only
    pub fn open_read_only(config: Config) -> Result<Self> {
        let manager = TableManager::open_read_only(config.clone())?;
        Ok(Self::with_manager(config, manager))
    }

    /// Open with a path (convenience method)
    ///
    /// Uses default config with the specified data directory
    pub fn open_path(path: &Path) -> Result<Self> {
        Self::open(Config::builder().data_dir(path).build())
    }

    fn with_manager(config: Config, manager: TableManager) -> Self {
        Self {
            config,
            session: RwLock::new(Session {
                manager,
                changes: 0,
                in_transaction: false,
                closed: false,
            }),
        }
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub fn get(&self, table: TableId, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.session.read().manager.get(table, key)
    }

    /// Up to `limit` entries with keys `>= from`, pending changes included
    pub fn scan(
        &self,
        table: TableId,
        from: Option<&[u8]>,
        limit: usize,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.with_cursor(table, from, |cursor| cursor.take(limit).collect())?
    }

    /// Run `f` over a merged cursor while holding the read lock
    pub fn with_cursor<T>(
        &self,
        table: TableId,
        from: Option<&[u8]>,
        f: impl FnOnce(&mut MergedCursor<'_>) -> T,
    ) -> Result<T> {
        let session = self.session.read();
        let mut cursor = match from {
            Some(key) => session.manager.cursor_from(table, key),
            None => session.manager.cursor(table),
        };
        Ok(f(&mut cursor))
    }

    pub fn entry_count(&self, table: TableId) -> u64 {
        self.session.read().manager.table(table).get_entry_count()
    }

    /// Revision of the last applied changes
    pub fn revision(&self) -> u32 {
        self.session.read().manager.revision_number()
    }

    /// Writes not yet applied
    pub fn pending_changes(&self) -> usize {
        self.session.read().changes
    }

    pub fn in_transaction(&self) -> bool {
        self.session.read().in_transaction
    }

    // =========================================================================
    // Writes
    // =========================================================================

    pub fn set(&self, table: TableId, key: &[u8], tag: &[u8]) -> Result<()> {
        let mut session = self.session.write();
        if let Err(e) = session.manager.set(table, key, tag) {
            session.abandon(&e);
            return Err(e);
        }
        session.record_change(self.config.changes_before_apply)
    }

    /// Delete `key`. Returns false if it did not exist.
    pub fn delete(&self, table: TableId, key: &[u8]) -> Result<bool> {
        let mut session = self.session.write();
        let removed = match session.manager.delete(table, key) {
            Ok(removed) => removed,
            Err(e) => {
                session.abandon(&e);
                return Err(e);
            }
        };
        if removed {
            session.record_change(self.config.changes_before_apply)?;
        }
        Ok(removed)
    }

    // =========================================================================
    // Transactions
    // =========================================================================

    /// Start a transaction; earlier pending changes are applied first
    pub fn begin_transaction(&self) -> Result<()> {
        let mut session = self.session.write();
        if session.in_transaction {
            return Err(TesseraError::InvalidOperation(
                "transaction already in progress".to_string(),
            ));
        }
        session.apply()?;
        session.in_transaction = true;
        debug!(revision = session.manager.revision_number(), "began transaction");
        Ok(())
    }

    /// Apply every change made since `begin_transaction` as one revision
    pub fn commit_transaction(&self) -> Result<()> {
        let mut session = self.session.write();
        if !session.in_transaction {
            return Err(TesseraError::InvalidOperation(
                "no transaction in progress".to_string(),
            ));
        }
        session.in_transaction = false;
        session.apply()?;
        info!(revision = session.manager.revision_number(), "committed transaction");
        Ok(())
    }

    /// Discard every change made since `begin_transaction`
    pub fn cancel_transaction(&self) -> Result<()> {
        let mut session = self.session.write();
        if !session.in_transaction {
            return Err(TesseraError::InvalidOperation(
                "no transaction in progress".to_string(),
            ));
        }
        session.manager.cancel();
        session.changes = 0;
        session.in_transaction = false;
        debug!("cancelled transaction");
        Ok(())
    }

    /// Apply pending changes now
    pub fn flush(&self) -> Result<()> {
        let mut session = self.session.write();
        if session.in_transaction {
            return Err(TesseraError::InvalidOperation(
                "cannot flush inside a transaction".to_string(),
            ));
        }
        session.apply()
    }

    /// Move to the latest committed revision, dropping pending changes
    pub fn reopen(&self) -> Result<()> {
        let mut session = self.session.write();
        session.changes = 0;
        session.in_transaction = false;
        session.manager.reopen()
    }

    /// Close the engine gracefully
    ///
    /// Applies pending changes outside a transaction; an open transaction is
    /// discarded.
    pub fn close(self) -> Result<()> {
        self.finish()
    }

    fn finish(&self) -> Result<()> {
        let mut session = self.session.write();
        if session.closed {
            return Ok(());
        }
        session.closed = true;
        if !session.manager.is_writable() {
            return Ok(());
        }
        if session.in_transaction {
            warn!("closing with a transaction in progress, discarding it");
            session.manager.cancel();
            session.in_transaction = false;
            return Ok(());
        }
        session.apply()
    }

    // =========================================================================
    // Accessors (for testing and debugging)
    // =========================================================================

    /// Get the data directory path
    pub fn data_dir(&self) -> &Path {
        &self.config.data_dir
    }

    /// Get the configuration
    pub fn config(&self) -> &Config {
        &self.config
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Err(e) = self.finish() {
            error!(error = %e, "failed to apply pending changes on drop");
        }
    }
}
