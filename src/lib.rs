//! # Tessera
//!
//! Storage engine for a search-index database:
//! - One copy-on-write B-tree per table
//! - Two alternating base files per table for crash-safe commits without a WAL
//! - In-memory write overlays with merged cursors
//! - Five tables committed in a fixed order as one database revision
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Engine                               │
//! │        (Single Writer / Multi Reader, transactions)          │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │
//! ┌─────────────────────▼───────────────────────────────────────┐
//! │                     TableManager                             │
//! │   postlist_ → position_ → termlist_ → value_ → record_      │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │
//!          ┌────────────┴────────────┐
//!          │                         │
//!          ▼                         ▼
//!   ┌─────────────┐          ┌─────────────┐
//!   │   Overlay   │          │    Btree    │
//!   │ (BTreeMap)  │          │ (CoW blocks)│
//!   └─────────────┘          └──────┬──────┘
//!                                   │
//!                         ┌─────────┴─────────┐
//!                         ▼                   ▼
//!                  ┌────────────┐     ┌──────────────┐
//!                  │  {name}DB  │     │ baseA / baseB│
//!                  └────────────┘     └──────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;

pub mod btree;
pub mod table;
pub mod manager;
pub mod metafile;
pub mod lock;
pub mod engine;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{Result, TesseraError};
pub use config::Config;
pub use btree::{Btree, CompactionPolicy, TablePath};
pub use table::BufferedTable;
pub use manager::{TableId, TableManager};
pub use engine::Engine;

// =============================================================================
// Version Info
// =============================================================================

/// Current version of Tessera
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
