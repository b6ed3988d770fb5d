//! Reader snapshots.
//!
//! A reader pins the committed frame count it started from by holding a
//! shared lock on one of five read-mark slots:
//!
//! ```text
//! slot 0      every frame is in the database file; read only the database
//! slot 1..5   WAL frames up to the slot's mark are in use
//! ```
//!
//! The checkpointer never copies frames beyond a pinned mark, and the log
//! cannot restart while any of slots 1..5 is pinned.

use crate::error::WalError;
use crate::index::FrameNo;
use crate::txn::WalContext;
use crate::wal::Wal;
use bytes::Bytes;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use walframe_storage::{LockRange, NUM_READ_SLOTS};

/// Mark value of a slot no reader uses.
pub(crate) const READMARK_NOT_USED: u32 = u32::MAX;

const MAX_OPEN_ATTEMPTS: usize = 100;

/// Frame counts recorded in each read-mark slot.
#[derive(Debug)]
pub(crate) struct ReadMarks {
    marks: Mutex<[u32; NUM_READ_SLOTS]>,
}

impl ReadMarks {
    pub(crate) fn new(mx_frame: FrameNo) -> Self {
        let mut marks = [READMARK_NOT_USED; NUM_READ_SLOTS];
        marks[0] = 0;
        marks[1] = mx_frame;
        Self {
            marks: Mutex::new(marks),
        }
    }

    pub(crate) fn get(&self, slot: usize) -> u32 {
        self.marks.lock()[slot]
    }

    /// Caller must hold `READ(slot)` exclusively.
    pub(crate) fn set(&self, slot: usize, mark: u32) {
        self.marks.lock()[slot] = mark;
    }

    pub(crate) fn restart(&self) {
        let mut marks = self.marks.lock();
        marks[1] = 0;
        for mark in &mut marks[2..] {
            *mark = READMARK_NOT_USED;
        }
    }
}

/// A reader's frozen view of the log.
///
/// Releases its read mark when closed or dropped.
pub struct SnapshotHandle {
    wal: Arc<Wal>,
    slot: usize,
    max_frame: FrameNo,
    salt: [u32; 2],
    released: bool,
}

impl SnapshotHandle {
    /// Opens a snapshot of the last committed state.
    ///
    /// Fails with `Busy` if no read mark could be pinned after repeated
    /// attempts.
    pub fn open(wal: &Arc<Wal>) -> Result<Self, WalError> {
        for attempt in 0..MAX_OPEN_ATTEMPTS {
            if let Some(handle) = Self::try_open(wal) {
                return Ok(handle);
            }
            if attempt > 5 {
                std::thread::yield_now();
            }
        }
        Err(WalError::Busy("no read mark could be pinned".to_string()))
    }

    fn try_open(wal: &Arc<Wal>) -> Option<Self> {
        let locks = wal.locks();
        let marks = &wal.read_marks;
        let shared = wal.shared();
        let mx_frame = shared.mx_frame;

        if mx_frame == shared.n_backfill {
            locks.acquire_shared(LockRange::read(0)).ok()?;
            if wal.shared() != shared {
                locks.release(LockRange::read(0));
                return None;
            }
            return Some(Self::pinned(wal, 0, 0, shared.header.salt));
        }

        // Largest mark not beyond the committed frame.
        let mut best: Option<(usize, u32)> = None;
        for slot in 1..NUM_READ_SLOTS {
            let mark = marks.get(slot);
            if mark <= mx_frame && best.map_or(true, |(_, b)| mark > b) {
                best = Some((slot, mark));
            }
        }

        if best.map_or(true, |(_, mark)| mark < mx_frame) {
            for slot in 1..NUM_READ_SLOTS {
                if locks.acquire_exclusive(LockRange::read(slot)).is_ok() {
                    marks.set(slot, mx_frame);
                    locks.release(LockRange::read(slot));
                    best = Some((slot, mx_frame));
                    break;
                }
            }
        }

        let (slot, mark) = best?;
        locks.acquire_shared(LockRange::read(slot)).ok()?;

        let now = wal.shared();
        if marks.get(slot) != mark || now.header != shared.header || now.mx_frame != mx_frame {
            locks.release(LockRange::read(slot));
            return None;
        }

        Some(Self::pinned(wal, slot, mx_frame, shared.header.salt))
    }

    fn pinned(wal: &Arc<Wal>, slot: usize, max_frame: FrameNo, salt: [u32; 2]) -> Self {
        tracing::debug!("read snapshot opened: slot={}, max_frame={}", slot, max_frame);
        Self {
            wal: Arc::clone(wal),
            slot,
            max_frame,
            salt,
            released: false,
        }
    }

    /// Last frame visible to this snapshot.
    pub fn max_frame(&self) -> FrameNo {
        self.max_frame
    }

    /// Read-mark slot pinned by this snapshot.
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Reads the version of `page` visible to this snapshot.
    ///
    /// `None` means the page is not in the log and should be read from the
    /// database file.
    pub fn read_page(&self, page: u32) -> Result<Option<Bytes>, WalError> {
        let Some(frame_no) = self.wal.index().lookup(page, self.max_frame) else {
            return Ok(None);
        };

        let frame = self.wal.read_frame_full(frame_no)?;
        if frame.header.salt != self.salt || frame.header.page_number != page {
            return Err(WalError::ChecksumMismatch { frame: frame_no });
        }
        Ok(Some(frame.page))
    }

    /// Releases the snapshot's read mark.
    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.wal.locks().release(LockRange::read(self.slot));
            tracing::debug!("read snapshot closed: slot={}", self.slot);
        }
    }
}

impl Drop for SnapshotHandle {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for SnapshotHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnapshotHandle")
            .field("slot", &self.slot)
            .field("max_frame", &self.max_frame)
            .finish()
    }
}

impl WalContext {
    /// Opens a read snapshot at the last committed frame.
    pub fn open_read_snapshot(&self) -> Result<SnapshotHandle, WalError> {
        SnapshotHandle::open(self.wal())
    }

    /// Reads `page` as seen by `snapshot`.
    pub fn read_page(
        &self,
        snapshot: &SnapshotHandle,
        page: u32,
    ) -> Result<Option<Bytes>, WalError> {
        snapshot.read_page(page)
    }

    /// Closes a read snapshot.
    pub fn close_read_snapshot(&self, snapshot: SnapshotHandle) {
        snapshot.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WalConfig;
    use std::thread;
    use walframe_storage::{MemoryLogFile, ShmLocks};

    fn open_wal() -> (Arc<Wal>, Arc<ShmLocks>) {
        let locks = Arc::new(ShmLocks::new());
        let wal = Wal::with_parts(
            WalConfig::new("snap-wal").with_page_size(1024),
            Box::new(MemoryLogFile::new()),
            locks.clone(),
        )
        .unwrap();
        (Arc::new(wal), locks)
    }

    fn page(fill: u8) -> Vec<u8> {
        vec![fill; 1024]
    }

    #[test]
    fn test_uncommitted_frames_are_invisible() {
        let (wal, _) = open_wal();
        let reader = WalContext::new(Arc::clone(&wal));
        let before = reader.open_read_snapshot().unwrap();

        let mut writer = WalContext::new(Arc::clone(&wal));
        writer.begin_write().unwrap();
        for pgno in 1..=3 {
            writer.write_frame(pgno, &page(pgno as u8), false, 0).unwrap();
        }

        let during = reader.open_read_snapshot().unwrap();
        for pgno in 1..=3 {
            assert!(reader.read_page(&before, pgno).unwrap().is_none());
            assert!(reader.read_page(&during, pgno).unwrap().is_none());
        }
        writer.end_write_transaction(false).unwrap();
    }

    #[test]
    fn test_commit_visible_only_to_later_snapshots() {
        let (wal, _) = open_wal();
        let reader = WalContext::new(Arc::clone(&wal));
        let before = reader.open_read_snapshot().unwrap();

        let mut writer = WalContext::new(Arc::clone(&wal));
        writer.begin_write().unwrap();
        writer.write_frame(1, &page(1), false, 0).unwrap();
        writer.write_frame(2, &page(2), false, 0).unwrap();
        writer.write_frame(3, &page(3), true, 3).unwrap();
        writer.end_write_transaction(true).unwrap();

        let after = reader.open_read_snapshot().unwrap();
        assert_eq!(after.max_frame(), 3);
        for pgno in 1..=3u32 {
            let data = reader.read_page(&after, pgno).unwrap().unwrap();
            assert_eq!(&data[..], &page(pgno as u8)[..]);
            assert!(reader.read_page(&before, pgno).unwrap().is_none());
        }

        reader.close_read_snapshot(before);
        reader.close_read_snapshot(after);
    }

    #[test]
    fn test_snapshot_keeps_old_page_version() {
        let (wal, _) = open_wal();
        let mut writer = WalContext::new(Arc::clone(&wal));
        writer.begin_write().unwrap();
        writer.write_frame(1, &page(10), true, 1).unwrap();
        writer.end_write_transaction(true).unwrap();

        let old = SnapshotHandle::open(&wal).unwrap();

        writer.begin_write().unwrap();
        writer.write_frame(1, &page(20), true, 1).unwrap();
        writer.end_write_transaction(true).unwrap();

        let new = SnapshotHandle::open(&wal).unwrap();
        assert_eq!(old.read_page(1).unwrap().unwrap()[0], 10);
        assert_eq!(new.read_page(1).unwrap().unwrap()[0], 20);
        assert_ne!(old.max_frame(), new.max_frame());
    }

    #[test]
    fn test_empty_log_uses_slot_zero() {
        let (wal, locks) = open_wal();
        let snapshot = SnapshotHandle::open(&wal).unwrap();
        assert_eq!(snapshot.slot(), 0);
        assert_eq!(snapshot.max_frame(), 0);
        assert!(locks.is_held(LockRange::read(0)));

        drop(snapshot);
        assert!(!locks.is_held(LockRange::read(0)));
    }

    #[test]
    fn test_close_releases_read_mark() {
        let (wal, locks) = open_wal();
        let mut writer = WalContext::new(Arc::clone(&wal));
        writer.begin_write().unwrap();
        writer.write_frame(1, &page(1), true, 1).unwrap();
        writer.end_write_transaction(true).unwrap();

        let snapshot = SnapshotHandle::open(&wal).unwrap();
        let slot = snapshot.slot();
        assert!(slot >= 1);
        assert!(locks.is_held(LockRange::read(slot)));

        snapshot.close();
        assert!(!locks.is_held(LockRange::read(slot)));
    }

    #[test]
    fn test_readers_share_marks() {
        let (wal, _) = open_wal();
        let mut writer = WalContext::new(Arc::clone(&wal));
        writer.begin_write().unwrap();
        writer.write_frame(1, &page(1), true, 1).unwrap();
        writer.end_write_transaction(true).unwrap();

        // More readers than slots at the same frame all get in.
        let snapshots: Vec<_> = (0..16)
            .map(|_| SnapshotHandle::open(&wal).unwrap())
            .collect();
        assert!(snapshots.iter().all(|s| s.max_frame() == 1));
        assert!(snapshots.iter().all(|s| s.slot() == snapshots[0].slot()));
    }

    #[test]
    fn test_readers_during_concurrent_commits() {
        let (wal, _) = open_wal();

        let writer = {
            let wal = Arc::clone(&wal);
            thread::spawn(move || {
                let mut ctx = WalContext::new(wal);
                for round in 1..=50u8 {
                    ctx.begin_write().unwrap();
                    ctx.write_frame(1, &page(round), false, 0).unwrap();
                    ctx.write_frame(2, &page(round), true, 2).unwrap();
                    ctx.end_write_transaction(true).unwrap();
                }
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let wal = Arc::clone(&wal);
                thread::spawn(move || {
                    for _ in 0..50 {
                        let snapshot = match SnapshotHandle::open(&wal) {
                            Ok(s) => s,
                            Err(e) => {
                                assert!(e.is_retryable());
                                continue;
                            }
                        };
                        let one = snapshot.read_page(1).unwrap();
                        let two = snapshot.read_page(2).unwrap();
                        // Both pages come from the same transaction.
                        match (one, two) {
                            (Some(a), Some(b)) => assert_eq!(a[0], b[0]),
                            (None, None) => {}
                            _ => panic!("snapshot saw half a transaction"),
                        }
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
    }
}
