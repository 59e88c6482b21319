//! Single-writer lock
//!
//! A writer holds an OS advisory lock on `{dir}/db_lock` for as long as the
//! database is open. The operating system releases it when the process exits,
//! so a crashed writer never blocks the next one. The file holds the owner's
//! process id for diagnostics and is left in place when the lock is released.

use std::fs::{self, File, OpenOptions, TryLockError};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{Result, TesseraError};

const LOCK_FILENAME: &str = "db_lock";

/// Held for the lifetime of a writable database handle
#[derive(Debug)]
pub struct WriteLock {
    path: PathBuf,
    file: File,
}

impl WriteLock {
    pub fn acquire(dir: &Path) -> Result<Self> {
        let path = dir.join(LOCK_FILENAME);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        match file.try_lock() {
            Ok(()) => {}
            Err(TryLockError::WouldBlock) => {
                let holder = fs::read_to_string(&path).unwrap_or_default();
                return Err(TesseraError::DatabaseLock(format!(
                    "{} is locked by process {}",
                    dir.display(),
                    holder.trim()
                )));
            }
            Err(TryLockError::Error(e)) => return Err(e.into()),
        }

        // A previous owner may have left its pid behind
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        writeln!(file, "{}", std::process::id())?;
        file.sync_all()?;
        debug!(path = %path.display(), "acquired write lock");
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for WriteLock {
    fn drop(&mut self) {
        // Closing the file releases the lock as well
        let _ = self.file.unlock();
        debug!(path = %self.path.display(), "released write lock");
    }
}
