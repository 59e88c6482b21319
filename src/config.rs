//! Configuration for Tessera
//!
//! Centralized configuration with sensible defaults.

use std::path::PathBuf;

use crate::btree::{CompactionPolicy, DEFAULT_BLOCK_SIZE, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE};
use crate::error::{Result, TesseraError};

/// Main configuration for a Tessera database
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Storage Configuration
    // -------------------------------------------------------------------------
    /// Root directory for all database files
    /// Internal structure:
    ///   {data_dir}/
    ///     ├── meta                 (format marker)
    ///     ├── db_lock              (present while a writer is open)
    ///     ├── postlist_DB          (blocks)
    ///     ├── postlist_baseA|B     (alternating base files)
    ///     └── ... position_, termlist_, value_, record_
    pub data_dir: PathBuf,

    /// Block size in bytes for newly created tables.
    /// Ignored when the database already exists.
    pub block_size: usize,

    /// Create the database if it does not exist yet
    pub create: bool,

    // -------------------------------------------------------------------------
    // Write Session Configuration
    // -------------------------------------------------------------------------
    /// Apply pending modifications automatically after this many changes
    /// (outside explicit transactions)
    pub changes_before_apply: usize,

    /// Dirty blocks a write session may hold in memory before writing them out early
    pub max_dirty_blocks: usize,

    /// What deletions do with underfull blocks
    pub compaction: CompactionPolicy,

    /// Keep left-hand blocks full when appending at the right edge
    pub full_compaction: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./tessera_data"),
            block_size: DEFAULT_BLOCK_SIZE,
            create: true,
            changes_before_apply: 1000,
            max_dirty_blocks: 1024,
            compaction: CompactionPolicy::NoMerge,
            full_compaction: false,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Check the values that would otherwise fail deep inside table creation
    pub fn validate(&self) -> Result<()> {
        validate_block_size(self.block_size)?;
        if self.changes_before_apply == 0 {
            return Err(TesseraError::Config(
                "changes_before_apply must be at least 1".to_string(),
            ));
        }
        if self.max_dirty_blocks == 0 {
            return Err(TesseraError::Config(
                "max_dirty_blocks must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Block sizes must be a power of two in [2048, 65536]
pub fn validate_block_size(block_size: usize) -> Result<()> {
    if !block_size.is_power_of_two() || !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&block_size) {
        return Err(TesseraError::Config(format!(
            "block size {} is not a power of two between {} and {}",
            block_size, MIN_BLOCK_SIZE, MAX_BLOCK_SIZE
        )));
    }
    Ok(())
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the data directory (root for all storage)
    pub fn data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.data_dir = path.into();
        self
    }

    /// Set the block size used when creating tables
    pub fn block_size(mut self, size: usize) -> Self {
        self.config.block_size = size;
        self
    }

    /// Whether to create a missing database
    pub fn create(mut self, create: bool) -> Self {
        self.config.create = create;
        self
    }

    /// Set the automatic apply threshold
    pub fn changes_before_apply(mut self, count: usize) -> Self {
        self.config.changes_before_apply = count;
        self
    }

    /// Set the in-memory dirty block limit
    pub fn max_dirty_blocks(mut self, count: usize) -> Self {
        self.config.max_dirty_blocks = count;
        self
    }

    /// Set the delete compaction policy
    pub fn compaction(mut self, policy: CompactionPolicy) -> Self {
        self.config.compaction = policy;
        self
    }

    /// Enable or disable full compaction on right-edge splits
    pub fn full_compaction(mut self, enabled: bool) -> Self {
        self.config.full_compaction = enabled;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
