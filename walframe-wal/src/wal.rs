//! Shared WAL state.
//!
//! A [`Wal`] is shared through `Arc` by every connection to one log. It owns
//! the log file, the page index, the committed header and the read marks.
//! Per-connection transaction state lives in [`crate::txn::WalContext`].

use crate::checksum::WalChecksum;
use crate::config::{FsyncPolicy, WalConfig};
use crate::error::WalError;
use crate::frame::{Frame, FrameCodec, FrameHeader};
use crate::header::{random_salt, WalHeader};
use crate::index::{FrameNo, WalIndex};
use crate::recovery;
use crate::snapshot::ReadMarks;
use crate::FRAME_HEADER_SIZE;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use walframe_storage::{FsLogFile, LockPrimitive, LockRange, LogFile, ShmLocks};

/// I/O statistics for the WAL.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WalStats {
    /// Frames written to the log.
    pub frames_written: u64,
    /// Bytes written to the log, headers included.
    pub bytes_written: u64,
    /// Frame reads served from the log.
    pub frames_read: u64,
    /// Bytes read from the log.
    pub bytes_read: u64,
    /// Commit frames written.
    pub commits: u64,
    /// Fsync operations on the log.
    pub fsyncs: u64,
    /// Checkpoints that copied frames into the database.
    pub checkpoints: u64,
}

/// Committed state visible to every connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SharedHeader {
    /// Header of the current generation.
    pub header: WalHeader,
    /// Last committed frame; 0 if the generation has no commits.
    pub mx_frame: FrameNo,
    /// Running checksum through `mx_frame`.
    pub last_checksum: WalChecksum,
    /// Database size in pages as of the last commit.
    pub db_size: u32,
    /// Frames already copied into the database file.
    pub n_backfill: FrameNo,
}

/// Lock held until dropped.
pub(crate) struct HeldLock<'a> {
    locks: &'a dyn LockPrimitive,
    range: LockRange,
}

impl Drop for HeldLock<'_> {
    fn drop(&mut self) {
        self.locks.release(self.range);
    }
}

/// Write-ahead log shared by one writer and many readers.
pub struct Wal {
    config: WalConfig,
    codec: FrameCodec,
    log: Mutex<Box<dyn LogFile>>,
    locks: Arc<dyn LockPrimitive>,
    index: WalIndex,
    shared: RwLock<SharedHeader>,
    pub(crate) read_marks: ReadMarks,
    /// Commits since last fsync (for EveryN policy).
    commits_since_sync: AtomicU64,
    stats_frames_written: AtomicU64,
    stats_bytes_written: AtomicU64,
    stats_frames_read: AtomicU64,
    stats_bytes_read: AtomicU64,
    stats_commits: AtomicU64,
    stats_fsyncs: AtomicU64,
    stats_checkpoints: AtomicU64,
}

impl Wal {
    /// Opens or creates the log file named by the configuration.
    pub fn open(config: WalConfig) -> Result<Self, WalError> {
        if let Some(dir) = config.path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)?;
            }
        }

        let log = FsLogFile::open(&config.path)?;
        Self::with_parts(config, Box::new(log), Arc::new(ShmLocks::new()))
    }

    /// Opens a WAL over an arbitrary log file with a private lock table.
    pub fn with_log(config: WalConfig, log: Box<dyn LogFile>) -> Result<Self, WalError> {
        Self::with_parts(config, log, Arc::new(ShmLocks::new()))
    }

    /// Opens a WAL over the given log file and lock primitive.
    ///
    /// Committed frames already in the log are indexed. A missing or invalid
    /// header starts a fresh generation.
    pub fn with_parts(
        config: WalConfig,
        mut log: Box<dyn LogFile>,
        locks: Arc<dyn LockPrimitive>,
    ) -> Result<Self, WalError> {
        config.validate()?;

        locks.acquire_exclusive(LockRange::RECOVER)?;
        let scan = recovery::scan(log.as_mut());
        locks.release(LockRange::RECOVER);
        let scan = scan?;

        let shared = match scan.header {
            Some(header) => {
                let on_disk = header.page_size()?;
                if on_disk != config.page_size {
                    return Err(WalError::PageSizeMismatch {
                        configured: config.page_size,
                        on_disk,
                    });
                }
                SharedHeader {
                    header,
                    mx_frame: scan.committed_frames(),
                    last_checksum: scan.last_checksum,
                    db_size: scan.db_size,
                    n_backfill: 0,
                }
            }
            None => {
                let header = WalHeader::new(
                    config.page_size,
                    config.checksum_order,
                    0,
                    [random_salt(), random_salt()],
                )?;
                SharedHeader {
                    header,
                    mx_frame: 0,
                    last_checksum: header.checksum.into(),
                    db_size: 0,
                    n_backfill: 0,
                }
            }
        };

        let index = WalIndex::new();
        for (i, &page) in scan.pages.iter().enumerate() {
            index.put(page, i as FrameNo + 1)?;
        }

        if scan.torn_bytes > 0 {
            tracing::warn!(
                "WAL {} has {} bytes past the last commit; ignoring them",
                config.path.display(),
                scan.torn_bytes
            );
        }
        tracing::info!(
            "WAL opened: {} committed frames, checkpoint_seq={}, page_size={}",
            shared.mx_frame,
            shared.header.checkpoint_seq,
            config.page_size
        );

        let read_marks = ReadMarks::new(shared.mx_frame);
        Ok(Self {
            codec: FrameCodec::new(config.page_size),
            config,
            log: Mutex::new(log),
            locks,
            index,
            shared: RwLock::new(shared),
            read_marks,
            commits_since_sync: AtomicU64::new(0),
            stats_frames_written: AtomicU64::new(0),
            stats_bytes_written: AtomicU64::new(0),
            stats_frames_read: AtomicU64::new(0),
            stats_bytes_read: AtomicU64::new(0),
            stats_commits: AtomicU64::new(0),
            stats_fsyncs: AtomicU64::new(0),
            stats_checkpoints: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &WalConfig {
        &self.config
    }

    pub fn codec(&self) -> FrameCodec {
        self.codec
    }

    pub fn page_size(&self) -> u32 {
        self.config.page_size
    }

    pub fn index(&self) -> &WalIndex {
        &self.index
    }

    /// Last committed frame.
    pub fn max_frame(&self) -> FrameNo {
        self.shared.read().mx_frame
    }

    /// Frames already copied into the database file.
    pub fn backfilled(&self) -> FrameNo {
        self.shared.read().n_backfill
    }

    /// Database size in pages as of the last commit.
    pub fn db_size(&self) -> u32 {
        self.shared.read().db_size
    }

    pub fn checkpoint_seq(&self) -> u32 {
        self.shared.read().header.checkpoint_seq
    }

    /// Header of the current generation.
    pub fn header(&self) -> WalHeader {
        self.shared.read().header
    }

    /// Reads up to `out.len()` bytes of the page image stored in `frame`.
    ///
    /// Returns the number of bytes copied, which never exceeds the page size.
    /// Fails with `InvalidState` for a frame the index doesn't hold.
    pub fn read_frame(&self, frame: FrameNo, out: &mut [u8]) -> Result<usize, WalError> {
        if self.index.page_for_frame(frame).is_none() {
            return Err(WalError::InvalidState(format!(
                "frame {frame} is not in the log"
            )));
        }

        let n = out.len().min(self.codec.page_size());
        let offset = self.codec.frame_offset(frame) + FRAME_HEADER_SIZE as u64;
        let data = self.log.lock().read_at(offset, n)?;
        out[..n].copy_from_slice(&data);

        self.stats_frames_read.fetch_add(1, Ordering::Relaxed);
        self.stats_bytes_read.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }

    /// Reads and decodes a whole frame.
    pub(crate) fn read_frame_full(&self, frame: FrameNo) -> Result<Frame, WalError> {
        let offset = self.codec.frame_offset(frame);
        let buf = self.log.lock().read_at(offset, self.codec.frame_size())?;

        self.stats_frames_read.fetch_add(1, Ordering::Relaxed);
        self.stats_bytes_read
            .fetch_add(buf.len() as u64, Ordering::Relaxed);
        self.codec.decode(&buf)
    }

    pub(crate) fn read_frame_header(&self, frame: FrameNo) -> Result<FrameHeader, WalError> {
        let offset = self.codec.frame_offset(frame);
        let buf = self.log.lock().read_at(offset, FRAME_HEADER_SIZE)?;
        FrameHeader::decode(&buf)
    }

    /// Writes an encoded frame at its slot.
    ///
    /// The generation header goes to offset 0 together with frame 1.
    pub(crate) fn write_frame(
        &self,
        frame: FrameNo,
        buf: &[u8],
        header: &WalHeader,
    ) -> Result<(), WalError> {
        let mut log = self.log.lock();
        let mut written = buf.len() as u64;

        if frame == 1 {
            let encoded = header.encode();
            write_positional(log.as_mut(), 0, &encoded)?;
            written += encoded.len() as u64;
        }
        write_positional(log.as_mut(), self.codec.frame_offset(frame), buf)?;

        self.stats_frames_written.fetch_add(1, Ordering::Relaxed);
        self.stats_bytes_written
            .fetch_add(written, Ordering::Relaxed);

        if self.config.fsync_policy == FsyncPolicy::EveryFrame {
            log.sync()?;
            self.stats_fsyncs.fetch_add(1, Ordering::Relaxed);
        }

        tracing::debug!("WAL frame {} written", frame);
        Ok(())
    }

    /// Makes a commit durable per the fsync policy, then visible to readers.
    pub(crate) fn publish_commit(
        &self,
        frame: FrameNo,
        checksum: WalChecksum,
        db_size: u32,
    ) -> Result<(), WalError> {
        let commits = self.commits_since_sync.fetch_add(1, Ordering::Relaxed) + 1;
        match self.config.fsync_policy {
            FsyncPolicy::OnCommit => self.sync()?,
            FsyncPolicy::EveryN(n) if commits >= u64::from(n) => self.sync()?,
            _ => {}
        }

        {
            let mut shared = self.shared.write();
            shared.mx_frame = frame;
            shared.last_checksum = checksum;
            shared.db_size = db_size;
        }
        self.stats_commits.fetch_add(1, Ordering::Relaxed);

        tracing::debug!("WAL commit at frame {} (db_size={})", frame, db_size);
        Ok(())
    }

    /// Forces a sync of the log to disk.
    pub fn sync(&self) -> Result<(), WalError> {
        self.log.lock().sync()?;
        self.stats_fsyncs.fetch_add(1, Ordering::Relaxed);
        self.commits_since_sync.store(0, Ordering::Relaxed);
        Ok(())
    }

    /// Shrinks the log file to `len` bytes if it is longer.
    pub(crate) fn truncate_log(&self, len: u64) -> Result<(), WalError> {
        let mut log = self.log.lock();
        if log.size() > len {
            log.truncate(len)?;
            log.sync()?;
            self.stats_fsyncs.fetch_add(1, Ordering::Relaxed);
            tracing::info!("WAL truncated to {} bytes", len);
        }
        Ok(())
    }

    pub(crate) fn shared(&self) -> SharedHeader {
        *self.shared.read()
    }

    pub(crate) fn set_backfilled(&self, frame: FrameNo) {
        self.shared.write().n_backfill = frame;
        self.stats_checkpoints.fetch_add(1, Ordering::Relaxed);
    }

    /// Starts a new generation.
    ///
    /// The caller must hold the write lock and exclusive locks on read marks
    /// 1 and up, so no reader can still see the old frames.
    pub(crate) fn restart_log(&self) {
        let header = {
            let mut shared = self.shared.write();
            shared.header = shared.header.restarted(random_salt());
            shared.mx_frame = 0;
            shared.last_checksum = shared.header.checksum.into();
            shared.n_backfill = 0;
            shared.header
        };
        self.index.reset();
        self.read_marks.restart();

        tracing::info!(
            "WAL restarted: checkpoint_seq={}, salt={:08x}{:08x}",
            header.checkpoint_seq,
            header.salt[0],
            header.salt[1]
        );
    }

    pub(crate) fn locks(&self) -> &dyn LockPrimitive {
        self.locks.as_ref()
    }

    pub(crate) fn lock_exclusive(&self, range: LockRange) -> Result<HeldLock<'_>, WalError> {
        self.locks.acquire_exclusive(range)?;
        Ok(HeldLock {
            locks: self.locks.as_ref(),
            range,
        })
    }

    /// Returns the current I/O statistics.
    pub fn stats(&self) -> WalStats {
        WalStats {
            frames_written: self.stats_frames_written.load(Ordering::Relaxed),
            bytes_written: self.stats_bytes_written.load(Ordering::Relaxed),
            frames_read: self.stats_frames_read.load(Ordering::Relaxed),
            bytes_read: self.stats_bytes_read.load(Ordering::Relaxed),
            commits: self.stats_commits.load(Ordering::Relaxed),
            fsyncs: self.stats_fsyncs.load(Ordering::Relaxed),
            checkpoints: self.stats_checkpoints.load(Ordering::Relaxed),
        }
    }
}

fn write_positional(log: &mut dyn LogFile, offset: u64, data: &[u8]) -> Result<(), WalError> {
    if offset == log.size() {
        log.append(data)?;
    } else {
        log.write_at(offset, data)?;
    }
    Ok(())
}
