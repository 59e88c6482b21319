//! Database metafile
//!
//! `{dir}/meta` marks a directory as a Tessera database and records the format
//! version of everything in it. It is written last when a database is
//! created, so a directory without it holds no complete database.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::btree::FORMAT_VERSION;
use crate::error::{Result, TesseraError};

const META_MAGIC: &[u8; 12] = b"TesseraMeta\n";
const META_FILENAME: &str = "meta";

pub fn meta_path(dir: &Path) -> PathBuf {
    dir.join(META_FILENAME)
}

pub fn exists(dir: &Path) -> bool {
    meta_path(dir).exists()
}

/// Write the metafile for a new database
pub fn create(dir: &Path) -> Result<()> {
    let path = meta_path(dir);
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&path)?;
    file.write_all(META_MAGIC)?;
    file.write_all(&FORMAT_VERSION.to_le_bytes())?;
    file.sync_all()?;
    debug!(path = %path.display(), "wrote metafile");
    Ok(())
}

/// Verify the metafile of an existing database
pub fn check(dir: &Path) -> Result<()> {
    let path = meta_path(dir);
    let bytes = match fs::read(&path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Err(TesseraError::DatabaseOpening(format!(
                "no database at {}",
                dir.display()
            )))
        }
        Err(e) => return Err(e.into()),
    };

    let magic_len = META_MAGIC.len();
    if bytes.len() != magic_len + 4 || &bytes[..magic_len] != META_MAGIC {
        return Err(TesseraError::DatabaseOpening(format!(
            "{} is not a tessera metafile",
            path.display()
        )));
    }
    let version = u32::from_le_bytes([
        bytes[magic_len],
        bytes[magic_len + 1],
        bytes[magic_len + 2],
        bytes[magic_len + 3],
    ]);
    if version != FORMAT_VERSION {
        return Err(TesseraError::DatabaseVersion(format!(
            "{}: format version {} (expected {})",
            path.display(),
            version,
            FORMAT_VERSION
        )));
    }
    Ok(())
}
