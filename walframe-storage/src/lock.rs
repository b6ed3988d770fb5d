//! Advisory lock slots.
//!
//! The WAL locking protocol uses eight slots:
//!
//! ```text
//! slot 0      WRITE        held exclusively by the single writer
//! slot 1      CHECKPOINT   held exclusively by a running checkpoint
//! slot 2      RECOVER      held exclusively while rebuilding the index
//! slot 3..8   READ(0..5)   shared by readers pinning a read mark
//! ```
//!
//! All acquisitions are non-blocking: a conflict is reported as
//! [`StorageError::Busy`] and the caller decides whether to retry.

use crate::error::{StorageError, StorageResult};
use parking_lot::Mutex;
use std::fmt;

/// Number of read-mark slots.
pub const NUM_READ_SLOTS: usize = 5;

/// Total number of lock slots.
pub const NUM_LOCK_SLOTS: usize = 3 + NUM_READ_SLOTS;

/// A contiguous range of lock slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockRange {
    start: u8,
    len: u8,
}

impl LockRange {
    pub const WRITE: LockRange = LockRange::slot(0);
    pub const CHECKPOINT: LockRange = LockRange::slot(1);
    pub const RECOVER: LockRange = LockRange::slot(2);

    const fn slot(index: u8) -> Self {
        Self {
            start: index,
            len: 1,
        }
    }

    /// The lock slot for read mark `i`.
    pub const fn read(i: usize) -> Self {
        assert!(i < NUM_READ_SLOTS, "read mark out of range");
        Self::slot(3 + i as u8)
    }

    /// Read marks `first..NUM_READ_SLOTS` as one range.
    pub const fn readers_from(first: usize) -> Self {
        assert!(first < NUM_READ_SLOTS, "read mark out of range");
        Self {
            start: 3 + first as u8,
            len: (NUM_READ_SLOTS - first) as u8,
        }
    }

    /// Slot indices covered by this range.
    pub fn slots(&self) -> std::ops::Range<usize> {
        self.start as usize..(self.start + self.len) as usize
    }
}

impl fmt::Display for LockRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.start, self.len) {
            (0, 1) => write!(f, "WRITE"),
            (1, 1) => write!(f, "CHECKPOINT"),
            (2, 1) => write!(f, "RECOVER"),
            (start, 1) => write!(f, "READ({})", start - 3),
            (start, len) => write!(f, "READ({}..{})", start - 3, start - 3 + len),
        }
    }
}

/// Byte-range style lock primitive.
///
/// `release` drops whatever the caller holds on the range: an exclusive lock,
/// or one shared reference.
pub trait LockPrimitive: Send + Sync {
    /// Takes every slot in `range` exclusively, or none of them.
    fn acquire_exclusive(&self, range: LockRange) -> StorageResult<()>;

    /// Takes a shared reference on every slot in `range`, or none of them.
    fn acquire_shared(&self, range: LockRange) -> StorageResult<()>;

    /// Releases the caller's hold on `range`.
    fn release(&self, range: LockRange);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Free,
    Shared(u32),
    Exclusive,
}

/// In-process lock table shared by every connection to one WAL.
#[derive(Debug)]
pub struct ShmLocks {
    slots: Mutex<[SlotState; NUM_LOCK_SLOTS]>,
}

impl Default for ShmLocks {
    fn default() -> Self {
        Self {
            slots: Mutex::new([SlotState::Free; NUM_LOCK_SLOTS]),
        }
    }
}

impl ShmLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if any slot in `range` is held in any mode.
    pub fn is_held(&self, range: LockRange) -> bool {
        let slots = self.slots.lock();
        range.slots().any(|i| slots[i] != SlotState::Free)
    }
}

impl LockPrimitive for ShmLocks {
    fn acquire_exclusive(&self, range: LockRange) -> StorageResult<()> {
        let mut slots = self.slots.lock();
        if range.slots().any(|i| slots[i] != SlotState::Free) {
            return Err(StorageError::Busy(range));
        }
        for i in range.slots() {
            slots[i] = SlotState::Exclusive;
        }
        tracing::trace!(%range, "exclusive lock acquired");
        Ok(())
    }

    fn acquire_shared(&self, range: LockRange) -> StorageResult<()> {
        let mut slots = self.slots.lock();
        if range.slots().any(|i| slots[i] == SlotState::Exclusive) {
            return Err(StorageError::Busy(range));
        }
        for i in range.slots() {
            slots[i] = match slots[i] {
                SlotState::Shared(n) => SlotState::Shared(n + 1),
                _ => SlotState::Shared(1),
            };
        }
        tracing::trace!(%range, "shared lock acquired");
        Ok(())
    }

    fn release(&self, range: LockRange) {
        let mut slots = self.slots.lock();
        for i in range.slots() {
            slots[i] = match slots[i] {
                SlotState::Shared(n) if n > 1 => SlotState::Shared(n - 1),
                _ => SlotState::Free,
            };
        }
        tracing::trace!(%range, "lock released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_range_display() {
        assert_eq!(LockRange::WRITE.to_string(), "WRITE");
        assert_eq!(LockRange::CHECKPOINT.to_string(), "CHECKPOINT");
        assert_eq!(LockRange::read(2).to_string(), "READ(2)");
        assert_eq!(LockRange::readers_from(1).to_string(), "READ(1..5)");
    }

    #[test]
    fn test_exclusive_excludes_everything() {
        let locks = ShmLocks::new();
        locks.acquire_exclusive(LockRange::WRITE).unwrap();

        assert!(matches!(
            locks.acquire_exclusive(LockRange::WRITE),
            Err(StorageError::Busy(_))
        ));
        assert!(locks.acquire_shared(LockRange::WRITE).is_err());

        locks.release(LockRange::WRITE);
        assert!(!locks.is_held(LockRange::WRITE));
        locks.acquire_exclusive(LockRange::WRITE).unwrap();
    }

    #[test]
    fn test_shared_is_counted() {
        let locks = ShmLocks::new();
        let slot = LockRange::read(1);
        locks.acquire_shared(slot).unwrap();
        locks.acquire_shared(slot).unwrap();
        assert!(locks.acquire_exclusive(slot).is_err());

        locks.release(slot);
        assert!(locks.acquire_exclusive(slot).is_err());

        locks.release(slot);
        locks.acquire_exclusive(slot).unwrap();
    }

    #[test]
    fn test_range_is_all_or_nothing() {
        let locks = ShmLocks::new();
        locks.acquire_shared(LockRange::read(3)).unwrap();

        assert!(locks.acquire_exclusive(LockRange::readers_from(1)).is_err());
        // The failed range acquisition must not leave slot 1 behind.
        locks.acquire_exclusive(LockRange::read(1)).unwrap();
    }

    #[test]
    fn test_slots_are_independent() {
        let locks = ShmLocks::new();
        locks.acquire_exclusive(LockRange::WRITE).unwrap();
        locks.acquire_exclusive(LockRange::CHECKPOINT).unwrap();
        locks.acquire_shared(LockRange::read(0)).unwrap();
        assert!(locks.is_held(LockRange::read(0)));
        assert!(!locks.is_held(LockRange::RECOVER));
    }
}
