//! WAL recovery utilities.
//!
//! A log is trusted up to its last valid commit frame. Scanning stops at the
//! first frame that:
//! - is cut short by the end of the file
//! - carries the salt of an older generation
//! - breaks the checksum chain
//!
//! Everything after the last commit before that point is a torn tail.

use crate::checksum::WalChecksum;
use crate::error::WalError;
use crate::frame::FrameCodec;
use crate::header::WalHeader;
use crate::index::FrameNo;
use crate::WAL_HEADER_SIZE;
use walframe_storage::LogFile;

/// What a scan found in a log file.
#[derive(Debug, Clone, Default)]
pub(crate) struct LogScan {
    /// Valid header, if any.
    pub header: Option<WalHeader>,
    /// Page number of every committed frame, in frame order.
    pub pages: Vec<u32>,
    /// Frames that validate, committed or not.
    pub valid_frames: FrameNo,
    /// Running checksum through the last commit.
    pub last_checksum: WalChecksum,
    /// Database size recorded by the last commit.
    pub db_size: u32,
    /// Byte offset just past the last commit frame.
    pub committed_end: u64,
    /// Bytes after `committed_end`.
    pub torn_bytes: u64,
}

impl LogScan {
    pub fn committed_frames(&self) -> FrameNo {
        self.pages.len() as FrameNo
    }
}

/// Walks the log from its header through the last valid commit.
pub(crate) fn scan(log: &mut dyn LogFile) -> Result<LogScan, WalError> {
    let size = log.size();
    if size < WAL_HEADER_SIZE as u64 {
        return Ok(LogScan {
            torn_bytes: size,
            ..LogScan::default()
        });
    }

    let header = match WalHeader::decode(&log.read_at(0, WAL_HEADER_SIZE)?) {
        Ok(header) => header,
        Err(e) => {
            tracing::debug!("WAL header rejected: {}", e);
            return Ok(LogScan {
                torn_bytes: size,
                ..LogScan::default()
            });
        }
    };

    let codec = FrameCodec::new(header.page_size()?);
    let order = header.byte_order();
    let frame_size = codec.frame_size() as u64;

    let mut running = WalChecksum::from(header.checksum);
    let mut pages = Vec::new();
    let mut result = LogScan {
        header: Some(header),
        last_checksum: running,
        committed_end: WAL_HEADER_SIZE as u64,
        ..LogScan::default()
    };

    let mut frame: FrameNo = 1;
    while codec.frame_offset(frame) + frame_size <= size {
        let offset = codec.frame_offset(frame);
        let buf = log.read_at(offset, frame_size as usize)?;
        let Some(next) = codec.verify(&buf, header.salt, running, order)? else {
            break;
        };
        let frame_header = codec.decode_header(&buf)?;
        if frame_header.page_number == 0 {
            break;
        }

        running = next;
        pages.push(frame_header.page_number);
        result.valid_frames = frame;

        if frame_header.is_commit() {
            result.pages.extend_from_slice(&pages);
            pages.clear();
            result.last_checksum = running;
            result.db_size = frame_header.db_size_after_commit;
            result.committed_end = offset + frame_size;
        }
        frame += 1;
    }

    result.torn_bytes = size - result.committed_end;
    Ok(result)
}

/// Result of a log scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Whether the log starts with a valid header.
    pub header_valid: bool,
    /// Page size from the header.
    pub page_size: Option<u32>,
    /// Checkpoint sequence from the header.
    pub checkpoint_seq: u32,
    /// Frames whose checksums validate.
    pub valid_frames: u64,
    /// Frames up to and including the last commit.
    pub committed_frames: u64,
    /// Valid frames after the last commit.
    pub discarded_frames: u64,
    /// Bytes after the last commit.
    pub torn_bytes: u64,
}

impl RecoveryReport {
    fn from_scan(scan: &LogScan) -> Result<Self, WalError> {
        let page_size = scan.header.map(|h| h.page_size()).transpose()?;
        let committed = u64::from(scan.committed_frames());
        Ok(Self {
            header_valid: scan.header.is_some(),
            page_size,
            checkpoint_seq: scan.header.map_or(0, |h| h.checkpoint_seq),
            valid_frames: u64::from(scan.valid_frames),
            committed_frames: committed,
            discarded_frames: u64::from(scan.valid_frames) - committed,
            torn_bytes: scan.torn_bytes,
        })
    }
}

/// Verifies a log without modifying anything.
pub fn verify_log(log: &mut dyn LogFile) -> Result<RecoveryReport, WalError> {
    let scan = scan(log)?;
    RecoveryReport::from_scan(&scan)
}

/// Repairs a log by truncating everything after the last valid commit.
///
/// A log with no valid header is truncated to zero bytes. Must not be run on
/// a log a [`crate::Wal`] currently has open.
pub fn repair_log(log: &mut dyn LogFile) -> Result<RecoveryReport, WalError> {
    let scan = scan(log)?;
    let report = RecoveryReport::from_scan(&scan)?;

    if scan.torn_bytes > 0 {
        let keep = if scan.header.is_some() {
            scan.committed_end
        } else {
            0
        };
        log.truncate(keep)?;
        log.sync()?;
        tracing::warn!(
            "Truncated WAL at offset {} (removed {} bytes, {} uncommitted frames)",
            keep,
            scan.torn_bytes,
            report.discarded_frames
        );
    }

    Ok(report)
}
