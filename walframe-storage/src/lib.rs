//! # walframe-storage
//!
//! Storage collaborators for walframe.
//!
//! This crate provides the pieces the WAL core calls but does not own:
//! - Byte-level file access (read at offset, append, positional write, sync, truncate)
//! - Advisory lock slots shared between one writer and many readers
//!
//! Log files are opaque byte stores. They know nothing about WAL headers,
//! frames or checksums.

pub mod error;
pub mod lock;
pub mod log_file;

pub use error::{StorageError, StorageResult};
pub use lock::{LockPrimitive, LockRange, ShmLocks, NUM_LOCK_SLOTS, NUM_READ_SLOTS};
pub use log_file::{FsLogFile, LogFile, MemoryLogFile};
