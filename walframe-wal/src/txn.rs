//! Write transactions.
//!
//! One [`WalContext`] per connection. At most one context holds the write
//! lock at a time; it appends frames after the last commit and publishes each
//! commit frame to readers.

use crate::checksum::WalChecksum;
use crate::error::WalError;
use crate::header::WalHeader;
use crate::index::FrameNo;
use crate::wal::Wal;
use std::sync::Arc;
use walframe_storage::LockRange;

/// Transaction-scoped flags of one connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxnState {
    /// This connection holds the write lock.
    pub write_lock_held: bool,
    /// If non-zero, the next frame written is this frame number and its
    /// checksum must be reseeded from the frame before it.
    pub re_cksum_frame: FrameNo,
    /// The log restarted in this transaction; shrink it on the next commit.
    pub truncate_on_commit: bool,
    /// Frames written since `begin_write`.
    pub frame_count: u32,
}

/// A rewind point inside an open write transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalSavepoint {
    frame: FrameNo,
    salt: [u32; 2],
}

impl WalSavepoint {
    /// Last frame written before the savepoint.
    pub fn frame(&self) -> FrameNo {
        self.frame
    }
}

/// Per-connection handle onto a shared [`Wal`].
pub struct WalContext {
    wal: Arc<Wal>,
    state: TxnState,
    /// Generation header as of `begin_write`.
    header: WalHeader,
    /// Frame number the next write goes to.
    next_frame: FrameNo,
    /// Running checksum through `next_frame - 1`.
    checksum: WalChecksum,
    /// Last committed frame; savepoints cannot rewind past it.
    committed: FrameNo,
}

impl WalContext {
    pub fn new(wal: Arc<Wal>) -> Self {
        let shared = wal.shared();
        Self {
            wal,
            state: TxnState::default(),
            header: shared.header,
            next_frame: shared.mx_frame + 1,
            checksum: shared.last_checksum,
            committed: shared.mx_frame,
        }
    }

    pub fn wal(&self) -> &Arc<Wal> {
        &self.wal
    }

    pub fn txn_state(&self) -> TxnState {
        self.state
    }

    #[cfg(test)]
    pub(crate) fn txn_state_mut(&mut self) -> &mut TxnState {
        &mut self.state
    }

    /// Takes the write lock without blocking.
    ///
    /// Frames left behind by an aborted writer are dropped from the index.
    /// If every frame has been checkpointed and no reader is using the log,
    /// the log restarts and the next commit may shrink the file.
    pub fn begin_write(&mut self) -> Result<(), WalError> {
        if self.state.write_lock_held {
            return Err(WalError::InvalidState(
                "write transaction already open".to_string(),
            ));
        }

        self.wal.locks().acquire_exclusive(LockRange::WRITE)?;
        self.state.write_lock_held = true;
        self.state.frame_count = 0;

        let mut shared = self.wal.shared();
        self.wal.index().truncate_after(shared.mx_frame);

        if shared.mx_frame > 0 && shared.n_backfill == shared.mx_frame {
            let readers = LockRange::readers_from(1);
            if self.wal.locks().acquire_exclusive(readers).is_ok() {
                self.wal.restart_log();
                self.wal.locks().release(readers);
                self.state.truncate_on_commit = true;
                shared = self.wal.shared();
            }
        }

        self.header = shared.header;
        self.next_frame = shared.mx_frame + 1;
        self.checksum = shared.last_checksum;
        self.committed = shared.mx_frame;

        tracing::debug!("write transaction started at frame {}", self.next_frame);
        Ok(())
    }

    /// Appends one frame.
    ///
    /// A commit frame records `db_size_after_commit` and makes every frame of
    /// the transaction visible to new readers. For other frames the size is
    /// ignored.
    ///
    /// If the sync after a commit frame fails, the error is returned and the
    /// commit stays invisible in this process. The frame itself is already in
    /// the file, so reopening the log will treat the transaction as committed.
    pub fn write_frame(
        &mut self,
        page_number: u32,
        page: &[u8],
        is_commit: bool,
        db_size_after_commit: u32,
    ) -> Result<FrameNo, WalError> {
        if !self.state.write_lock_held {
            return Err(WalError::NotWriting);
        }
        if page_number == 0 {
            return Err(WalError::InvalidState("page number 0".to_string()));
        }
        if is_commit && db_size_after_commit == 0 {
            return Err(WalError::InvalidState(
                "commit frame needs a database size".to_string(),
            ));
        }

        let frame = self.next_frame;
        if self.state.re_cksum_frame != 0 {
            let prev = self.state.re_cksum_frame - 1;
            self.checksum = if prev == 0 {
                self.header.checksum.into()
            } else {
                self.wal.read_frame_header(prev)?.checksum.into()
            };
            self.state.re_cksum_frame = 0;
        }

        let db_size = if is_commit { db_size_after_commit } else { 0 };
        let (header, buf) = self.wal.codec().seal(
            page_number,
            db_size,
            self.header.salt,
            page,
            self.checksum,
            self.header.byte_order(),
        )?;

        self.wal.write_frame(frame, &buf, &self.header)?;
        self.wal.index().put(page_number, frame)?;
        self.checksum = header.checksum.into();
        self.next_frame += 1;
        self.state.frame_count += 1;

        if is_commit {
            self.wal.publish_commit(frame, self.checksum, db_size)?;
            self.committed = frame;

            if self.state.truncate_on_commit {
                if let Some(limit) = self.wal.config().max_wal_size {
                    let codec = self.wal.codec();
                    let end = codec.frame_offset(frame) + codec.frame_size() as u64;
                    self.wal.truncate_log(limit.max(end))?;
                }
                self.state.truncate_on_commit = false;
            }
        }

        Ok(frame)
    }

    /// Writes a batch of pages and commits with the last one.
    pub fn write_frames(
        &mut self,
        pages: &[(u32, &[u8])],
        db_size_after_commit: u32,
    ) -> Result<FrameNo, WalError> {
        let Some((last, rest)) = pages.split_last() else {
            return Err(WalError::InvalidState("empty frame batch".to_string()));
        };

        for &(page_number, data) in rest {
            self.write_frame(page_number, data, false, 0)?;
        }
        self.write_frame(last.0, last.1, true, db_size_after_commit)
    }

    /// Ends the write transaction.
    ///
    /// Releases the write lock and clears the transaction flags if the lock
    /// is held; otherwise does nothing. Never fails. Frames written without a
    /// commit stay in the file but are never visible to readers.
    pub fn end_write_transaction(&mut self, commit: bool) -> Result<(), WalError> {
        if self.state.write_lock_held {
            self.wal.locks().release(LockRange::WRITE);
            self.state.write_lock_held = false;
            self.state.re_cksum_frame = 0;
            self.state.truncate_on_commit = false;

            tracing::debug!(
                "write transaction ended (commit={}, frames={})",
                commit,
                self.state.frame_count
            );
        }
        Ok(())
    }

    /// Marks the current position in the open transaction.
    pub fn savepoint(&self) -> Result<WalSavepoint, WalError> {
        if !self.state.write_lock_held {
            return Err(WalError::NotWriting);
        }
        Ok(WalSavepoint {
            frame: self.next_frame - 1,
            salt: self.header.salt,
        })
    }

    /// Discards frames written after `savepoint`.
    ///
    /// The next frame overwrites the first discarded one, with its checksum
    /// reseeded from the frame before it.
    pub fn savepoint_undo(&mut self, savepoint: WalSavepoint) -> Result<(), WalError> {
        if !self.state.write_lock_held {
            return Err(WalError::NotWriting);
        }
        if savepoint.salt != self.header.salt
            || savepoint.frame < self.committed
            || savepoint.frame >= self.next_frame
        {
            return Err(WalError::InvalidState(format!(
                "savepoint at frame {} is outside the open transaction",
                savepoint.frame
            )));
        }

        let discarded = self.next_frame - 1 - savepoint.frame;
        self.wal.index().truncate_after(savepoint.frame);
        self.next_frame = savepoint.frame + 1;
        self.state.re_cksum_frame = self.next_frame;
        self.state.frame_count = self.state.frame_count.saturating_sub(discarded);

        tracing::debug!("rolled back {} frames to savepoint", discarded);
        Ok(())
    }
}
