//! Block file I/O
//!
//! Reads and writes whole blocks of the `{name}DB` file by block number.

use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::Path;

use parking_lot::Mutex;

use crate::error::{Result, TesseraError};

use super::block::Block;

#[cfg(unix)]
use std::os::unix::fs::FileExt;

/// Handle on a table's block file
#[derive(Debug)]
pub struct BlockStore {
    file: Mutex<File>,
    block_size: usize,
}

impl BlockStore {
    /// Open an existing block file
    pub fn open(path: &Path, block_size: usize, writable: bool) -> Result<Self> {
        let file = match OpenOptions::new().read(true).write(writable).open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(TesseraError::DatabaseOpening(format!(
                    "block file {} missing",
                    path.display()
                )))
            }
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            file: Mutex::new(file),
            block_size,
        })
    }

    /// Create (or truncate) an empty block file
    pub fn create(path: &Path) -> Result<()> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.sync_all()?;
        Ok(())
    }

    /// Read and verify block `n`
    pub fn read_block(&self, n: u32) -> Result<Block> {
        let mut buf = vec![0u8; self.block_size];
        let offset = n as u64 * self.block_size as u64;
        let file = self.file.lock();
        match read_exact_at(&file, &mut buf, offset) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                return Err(TesseraError::DatabaseCorrupt(format!(
                    "block {} past end of file",
                    n
                )))
            }
            Err(e) => return Err(e.into()),
        }
        drop(file);
        Block::from_bytes(buf, n)
    }

    pub fn write_block(&self, n: u32, block: &Block) -> Result<()> {
        debug_assert_eq!(block.block_size(), self.block_size);
        let offset = n as u64 * self.block_size as u64;
        let file = self.file.lock();
        write_all_at(&file, &block.sealed(), offset)?;
        Ok(())
    }

    /// Flush written blocks to stable storage
    pub fn sync(&self) -> Result<()> {
        self.file.lock().sync_all()?;
        Ok(())
    }
}

#[cfg(unix)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
    file.read_exact_at(buf, offset)
}

#[cfg(unix)]
fn write_all_at(file: &File, buf: &[u8], offset: u64) -> std::io::Result<()> {
    file.write_all_at(buf, offset)
}

#[cfg(not(unix))]
fn read_exact_at(mut file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
    use std::io::{Read, Seek, SeekFrom};
    file.seek(SeekFrom::Start(offset))?;
    file.read_exact(buf)
}

#[cfg(not(unix))]
fn write_all_at(mut file: &File, buf: &[u8], offset: u64) -> std::io::Result<()> {
    use std::io::{Seek, SeekFrom, Write};
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(buf)
}
