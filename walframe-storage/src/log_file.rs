//! Log file access.
//!
//! The WAL core talks to its backing file through [`LogFile`]:
//! - `read_at` / `append` / `write_at` for data
//! - `sync` for durability barriers
//! - `truncate` for restart and repair
//!
//! The same trait describes the main database file that checkpoints copy
//! pages into.

use crate::error::{StorageError, StorageResult};
use parking_lot::RwLock;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A byte-addressed file used as a log or database image.
///
/// # Invariants
///
/// - `append` returns the offset where the data was written, which equals
///   `size()` before the call
/// - `read_at` returns exactly the bytes previously written at that offset
/// - `write_at` past the end zero-fills the gap, like a sparse file
/// - `sync` makes everything written so far durable
pub trait LogFile: Send {
    /// Reads `len` bytes starting at `offset`.
    fn read_at(&mut self, offset: u64, len: usize) -> StorageResult<Vec<u8>>;

    /// Appends data at the end of the file and returns its offset.
    fn append(&mut self, data: &[u8]) -> StorageResult<u64>;

    /// Writes data at an absolute offset, extending the file if needed.
    fn write_at(&mut self, offset: u64, data: &[u8]) -> StorageResult<()>;

    /// Flushes all written data to durable storage.
    fn sync(&mut self) -> StorageResult<()>;

    /// Shrinks the file to `len` bytes.
    ///
    /// Fails with [`StorageError::InvalidTruncate`] if `len` exceeds the
    /// current size.
    fn truncate(&mut self, len: u64) -> StorageResult<()>;

    /// Returns the current size in bytes.
    fn size(&self) -> u64;
}

/// A log file backed by the local filesystem.
pub struct FsLogFile {
    path: PathBuf,
    file: File,
    size: u64,
    sync_pending: bool,
}

impl FsLogFile {
    /// Opens the file at `path`, creating it if it doesn't exist.
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)?;

        let size = file.metadata()?.len();

        Ok(Self {
            path,
            file,
            size,
            sync_pending: false,
        })
    }

    /// Returns the file path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LogFile for FsLogFile {
    fn read_at(&mut self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        if offset.saturating_add(len as u64) > self.size {
            return Err(StorageError::ReadPastEnd {
                offset,
                len,
                size: self.size,
            });
        }

        let mut buf = vec![0u8; len];
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        let offset = self.size;

        self.file.seek(SeekFrom::End(0))?;
        self.file.write_all(data)?;
        self.size += data.len() as u64;
        self.sync_pending = true;

        Ok(offset)
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> StorageResult<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)?;
        self.size = self.size.max(offset + data.len() as u64);
        self.sync_pending = true;
        Ok(())
    }

    fn sync(&mut self) -> StorageResult<()> {
        if self.sync_pending {
            self.file.sync_data()?;
            self.sync_pending = false;
        }
        Ok(())
    }

    fn truncate(&mut self, len: u64) -> StorageResult<()> {
        if len > self.size {
            return Err(StorageError::InvalidTruncate {
                requested: len,
                size: self.size,
            });
        }
        self.file.set_len(len)?;
        self.size = len;
        self.sync_pending = true;
        Ok(())
    }

    fn size(&self) -> u64 {
        self.size
    }
}

/// An in-memory log file.
///
/// Clones share the same buffer, so a test can hand one clone to the WAL and
/// keep another to inspect or corrupt the bytes.
#[derive(Debug, Clone, Default)]
pub struct MemoryLogFile {
    data: Arc<RwLock<Vec<u8>>>,
    syncs: Arc<AtomicU64>,
}

impl MemoryLogFile {
    /// Creates an empty in-memory file.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an in-memory file holding `data`.
    pub fn with_data(data: Vec<u8>) -> Self {
        Self {
            data: Arc::new(RwLock::new(data)),
            syncs: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Returns a copy of the current contents.
    pub fn data(&self) -> Vec<u8> {
        self.data.read().clone()
    }

    /// Returns how many times `sync` has been called on any clone.
    pub fn sync_count(&self) -> u64 {
        self.syncs.load(Ordering::Relaxed)
    }
}

impl LogFile for MemoryLogFile {
    fn read_at(&mut self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let data = self.data.read();
        let size = data.len() as u64;
        if offset.saturating_add(len as u64) > size {
            return Err(StorageError::ReadPastEnd { offset, len, size });
        }

        let start = offset as usize;
        Ok(data[start..start + len].to_vec())
    }

    fn append(&mut self, new_data: &[u8]) -> StorageResult<u64> {
        let mut data = self.data.write();
        let offset = data.len() as u64;
        data.extend_from_slice(new_data);
        Ok(offset)
    }

    fn write_at(&mut self, offset: u64, new_data: &[u8]) -> StorageResult<()> {
        let mut data = self.data.write();
        let start = offset as usize;
        let end = start + new_data.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(new_data);
        Ok(())
    }

    fn sync(&mut self) -> StorageResult<()> {
        self.syncs.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn truncate(&mut self, len: u64) -> StorageResult<()> {
        let mut data = self.data.write();
        let size = data.len() as u64;
        if len > size {
            return Err(StorageError::InvalidTruncate {
                requested: len,
                size,
            });
        }
        data.truncate(len as usize);
        Ok(())
    }

    fn size(&self) -> u64 {
        self.data.read().len() as u64
    }
}
