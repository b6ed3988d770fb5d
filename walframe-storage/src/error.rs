//! Storage error types.

use crate::lock::LockRange;
use thiserror::Error;

/// Errors from the storage layer.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("read past end: offset {offset}, len {len}, size {size}")]
    ReadPastEnd { offset: u64, len: usize, size: u64 },

    #[error("cannot truncate to {requested} bytes (size is {size})")]
    InvalidTruncate { requested: u64, size: u64 },

    #[error("lock busy: {0}")]
    Busy(LockRange),
}

/// Result alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;
