//! # walframe-wal
//!
//! Write-ahead log for page-oriented databases.
//!
//! This crate provides:
//! - A fixed-layout frame format with chained two-word checksums
//! - An in-memory page -> frame index bounded by reader snapshots
//! - Single-writer transactions with commit markers and savepoints
//! - Reader snapshots pinned through read marks
//! - Checkpointing back into the database file, and log restart
//! - Recovery that ignores torn or corrupt tails

pub mod checkpoint;
pub mod checksum;
pub mod config;
pub mod error;
pub mod frame;
pub mod header;
pub mod index;
pub mod recovery;
pub mod snapshot;
pub mod txn;
pub mod wal;

pub use checkpoint::{CheckpointMode, CheckpointResult};
pub use checksum::{ByteOrder, WalChecksum};
pub use config::{FsyncPolicy, WalConfig};
pub use error::{ErrorKind, WalError};
pub use frame::{decode_page_size, encode_page_size, Frame, FrameCodec, FrameHeader};
pub use header::WalHeader;
pub use index::{FrameNo, WalIndex};
pub use recovery::{repair_log, verify_log, RecoveryReport};
pub use snapshot::SnapshotHandle;
pub use txn::{TxnState, WalContext, WalSavepoint};
pub use wal::{Wal, WalStats};

/// WAL header size in bytes.
pub const WAL_HEADER_SIZE: usize = 32;

/// Frame header size in bytes.
pub const FRAME_HEADER_SIZE: usize = 24;

/// Default database page size.
pub const DEFAULT_PAGE_SIZE: u32 = 4096;

/// Smallest supported page size.
pub const MIN_PAGE_SIZE: u32 = 512;

/// Largest supported page size.
pub const MAX_PAGE_SIZE: u32 = 65536;
