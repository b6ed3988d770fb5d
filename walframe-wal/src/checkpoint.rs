//! Checkpointing committed frames back into the database file.

use crate::error::WalError;
use crate::index::FrameNo;
use crate::snapshot::READMARK_NOT_USED;
use crate::txn::WalContext;
use walframe_storage::{LockRange, LogFile, NUM_READ_SLOTS};

/// How hard a checkpoint tries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CheckpointMode {
    /// Copy what readers allow; never wait for the writer.
    #[default]
    Passive,
    /// Take the write lock and require every frame to be copied.
    Full,
    /// Like `Full`, then restart the log from frame 1.
    Restart,
    /// Like `Restart`, then truncate the log file to zero bytes.
    Truncate,
}

impl CheckpointMode {
    fn needs_writer(self) -> bool {
        !matches!(self, CheckpointMode::Passive)
    }

    fn restarts(self) -> bool {
        matches!(self, CheckpointMode::Restart | CheckpointMode::Truncate)
    }
}

/// Outcome of a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CheckpointResult {
    /// Committed frames in the log when the checkpoint ran.
    pub log_frames: FrameNo,
    /// Frames now copied into the database file.
    pub backfilled_frames: FrameNo,
}

impl WalContext {
    /// Copies committed frames into `db`.
    ///
    /// Each page is written at `(page - 1) * page_size`. Frames a reader may
    /// still need from the log are left alone. `Full`, `Restart` and
    /// `Truncate` fail with `Busy` if the writer or a reader is in the way.
    pub fn checkpoint(
        &mut self,
        db: &mut dyn LogFile,
        mode: CheckpointMode,
    ) -> Result<CheckpointResult, WalError> {
        if self.txn_state().write_lock_held {
            return Err(WalError::InvalidState(
                "cannot checkpoint inside a write transaction".to_string(),
            ));
        }

        let wal = std::sync::Arc::clone(self.wal());
        let _ckpt = wal.lock_exclusive(LockRange::CHECKPOINT)?;
        let _writer = if mode.needs_writer() {
            Some(wal.lock_exclusive(LockRange::WRITE)?)
        } else {
            None
        };

        let shared = wal.shared();
        let mut result = CheckpointResult {
            log_frames: shared.mx_frame,
            backfilled_frames: shared.n_backfill,
        };

        let mut safe_frame = shared.mx_frame;
        for slot in 1..NUM_READ_SLOTS {
            let mark = wal.read_marks.get(slot);
            if mark < safe_frame {
                match wal.locks().acquire_exclusive(LockRange::read(slot)) {
                    Ok(()) => {
                        let reset = if slot == 1 { safe_frame } else { READMARK_NOT_USED };
                        wal.read_marks.set(slot, reset);
                        wal.locks().release(LockRange::read(slot));
                    }
                    Err(_) => safe_frame = mark,
                }
            }
        }

        if safe_frame > shared.n_backfill {
            match wal.lock_exclusive(LockRange::read(0)) {
                Ok(_readers) => {
                    self.backfill(
                        db,
                        shared.n_backfill,
                        safe_frame,
                        shared.mx_frame,
                        shared.db_size,
                    )?;
                    result.backfilled_frames = safe_frame;
                }
                Err(WalError::Busy(_)) => {
                    tracing::debug!("checkpoint skipped backfill: database readers active");
                }
                Err(e) => return Err(e),
            }
        }

        if mode.needs_writer() && result.backfilled_frames < shared.mx_frame {
            return Err(WalError::Busy(format!(
                "checkpoint stopped at frame {} of {}",
                result.backfilled_frames, shared.mx_frame
            )));
        }

        if mode.restarts() {
            let _readers = wal.lock_exclusive(LockRange::readers_from(1))?;
            wal.restart_log();
            if mode == CheckpointMode::Truncate {
                wal.truncate_log(0)?;
            }
        }

        tracing::info!(
            "checkpoint ({:?}): {} of {} frames in database",
            mode,
            result.backfilled_frames,
            result.log_frames
        );
        Ok(result)
    }

    fn backfill(
        &self,
        db: &mut dyn LogFile,
        after: FrameNo,
        safe_frame: FrameNo,
        mx_frame: FrameNo,
        db_size: u32,
    ) -> Result<(), WalError> {
        let wal = self.wal();
        let page_size = wal.page_size() as u64;

        // Frames must be durable in the log before the database changes.
        wal.sync()?;

        let mut buf = vec![0u8; page_size as usize];
        let pages = wal.index().latest_frames(after, safe_frame);
        for &(page, frame) in &pages {
            wal.read_frame(frame, &mut buf)?;
            db.write_at(u64::from(page - 1) * page_size, &buf)?;
        }

        if safe_frame == mx_frame {
            let len = u64::from(db_size) * page_size;
            if db.size() > len {
                db.truncate(len)?;
            }
        }
        db.sync()?;

        wal.set_backfilled(safe_frame);
        tracing::debug!(
            "backfilled {} pages from frames {}..={}",
            pages.len(),
            after + 1,
            safe_frame
        );
        Ok(())
    }
}
