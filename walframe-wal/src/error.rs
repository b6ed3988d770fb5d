//! WAL error types.

use thiserror::Error;
use walframe_storage::StorageError;

/// Coarse error classes callers branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A lock is held elsewhere; retry later.
    Busy,
    /// Frame length or checksum is wrong; the log is corrupt from here on.
    MalformedFrame,
    /// The underlying file failed.
    Io,
    /// Misuse or configuration problems.
    Other,
}

/// Errors that can occur during WAL operations.
#[derive(Debug, Error)]
pub enum WalError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage error: {0}")]
    Storage(StorageError),

    #[error("busy: {0}")]
    Busy(String),

    #[error("malformed frame: expected {expected} bytes, got {actual}")]
    MalformedFrame { expected: usize, actual: usize },

    #[error("checksum mismatch in frame {frame}")]
    ChecksumMismatch { frame: u32 },

    #[error("invalid WAL header: {0}")]
    InvalidHeader(String),

    #[error("invalid page size field: {0}")]
    InvalidPageSize(u32),

    #[error("page size mismatch: configured {configured}, log has {on_disk}")]
    PageSizeMismatch { configured: u32, on_disk: u32 },

    #[error("no write transaction is open")]
    NotWriting,

    #[error("invalid WAL state: {0}")]
    InvalidState(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl From<StorageError> for WalError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Busy(range) => WalError::Busy(format!("{range} lock is held")),
            StorageError::Io(e) => WalError::Io(e),
            other => WalError::Storage(other),
        }
    }
}

impl WalError {
    /// Maps this error onto its coarse class.
    pub fn kind(&self) -> ErrorKind {
        match self {
            WalError::Busy(_) => ErrorKind::Busy,
            WalError::MalformedFrame { .. } | WalError::ChecksumMismatch { .. } => {
                ErrorKind::MalformedFrame
            }
            WalError::Io(_) | WalError::Storage(_) => ErrorKind::Io,
            _ => ErrorKind::Other,
        }
    }

    /// Returns whether this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Busy | ErrorKind::Io)
    }
}
