//! In-memory page -> frame index.
//!
//! Every frame of the current generation is recorded, so a lookup bounded by
//! an old snapshot still finds the version that snapshot should see. The
//! newest frame not beyond the bound wins.

use crate::error::WalError;
use dashmap::DashMap;
use parking_lot::RwLock;

/// 1-based frame number within one WAL generation.
pub type FrameNo = u32;

/// Page -> frame index for one WAL generation.
#[derive(Debug, Default)]
pub struct WalIndex {
    /// Page number -> frames holding that page, ascending.
    pages: DashMap<u32, Vec<FrameNo>>,
    /// Page number of each frame; `frames[n - 1]` is frame `n`.
    frames: RwLock<Vec<u32>>,
}

impl WalIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `frame` holds `page`.
    ///
    /// Frames must be added in order. Putting a frame that is already
    /// indexed first drops it and every later frame, which is how a rewound
    /// writer overwrites its own uncommitted tail.
    pub fn put(&self, page: u32, frame: FrameNo) -> Result<(), WalError> {
        let mut frames = self.frames.write();
        let next = frames.len() as FrameNo + 1;

        if frame == 0 || frame > next {
            return Err(WalError::InvalidState(format!(
                "frame {frame} is not contiguous with the index (next is {next})"
            )));
        }
        if frame < next {
            self.drop_frames_after(&mut frames, frame - 1);
        }

        frames.push(page);
        self.pages.entry(page).or_default().push(frame);
        Ok(())
    }

    /// Returns the newest frame holding `page` that is not beyond `max_frame`.
    pub fn lookup(&self, page: u32, max_frame: FrameNo) -> Option<FrameNo> {
        let frames = self.pages.get(&page)?;
        let visible = frames.partition_point(|&f| f <= max_frame);
        visible.checked_sub(1).map(|i| frames[i])
    }

    /// Forgets every frame after `frame`.
    pub fn truncate_after(&self, frame: FrameNo) {
        let mut frames = self.frames.write();
        self.drop_frames_after(&mut frames, frame);
    }

    /// Clears the index for a new generation.
    pub fn reset(&self) {
        let mut frames = self.frames.write();
        frames.clear();
        self.pages.clear();
    }

    /// Page number stored in `frame`, if indexed.
    pub fn page_for_frame(&self, frame: FrameNo) -> Option<u32> {
        let idx = (frame as usize).checked_sub(1)?;
        self.frames.read().get(idx).copied()
    }

    /// Number of indexed frames.
    pub fn frame_count(&self) -> FrameNo {
        self.frames.read().len() as FrameNo
    }

    /// Number of distinct pages.
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Newest version of every page written in `(after, max_frame]`, sorted
    /// by page number.
    pub fn latest_frames(&self, after: FrameNo, max_frame: FrameNo) -> Vec<(u32, FrameNo)> {
        let mut out: Vec<(u32, FrameNo)> = self
            .pages
            .iter()
            .filter_map(|entry| {
                let frames = entry.value();
                let visible = frames.partition_point(|&f| f <= max_frame);
                let frame = *frames.get(visible.checked_sub(1)?)?;
                (frame > after).then_some((*entry.key(), frame))
            })
            .collect();
        out.sort_unstable();
        out
    }

    fn drop_frames_after(&self, frames: &mut Vec<u32>, keep: FrameNo) {
        let keep = keep as usize;
        if frames.len() <= keep {
            return;
        }

        let mut touched: Vec<u32> = frames.drain(keep..).collect();
        touched.sort_unstable();
        touched.dedup();

        for page in touched {
            if let Some(mut list) = self.pages.get_mut(&page) {
                let retain = list.partition_point(|&f| (f as usize) <= keep);
                list.truncate(retain);
            }
            self.pages.remove_if(&page, |_, list| list.is_empty());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_put_and_lookup() {
        let index = WalIndex::new();
        index.put(5, 1).unwrap();
        index.put(7, 2).unwrap();
        index.put(5, 3).unwrap();

        assert_eq!(index.lookup(5, 3), Some(3));
        assert_eq!(index.lookup(7, 3), Some(2));
        assert_eq!(index.lookup(9, 3), None);
        assert_eq!(index.len(), 2);
        assert_eq!(index.frame_count(), 3);
    }

    #[test]
    fn test_lookup_is_bounded() {
        let index = WalIndex::new();
        index.put(1, 1).unwrap();
        index.put(1, 2).unwrap();
        index.put(1, 3).unwrap();

        assert_eq!(index.lookup(1, 0), None);
        assert_eq!(index.lookup(1, 1), Some(1));
        assert_eq!(index.lookup(1, 2), Some(2));
        assert_eq!(index.lookup(1, 100), Some(3));
    }

    #[test]
    fn test_put_rejects_gaps() {
        let index = WalIndex::new();
        assert!(matches!(index.put(1, 0), Err(WalError::InvalidState(_))));
        assert!(matches!(index.put(1, 2), Err(WalError::InvalidState(_))));
        index.put(1, 1).unwrap();
        assert!(index.put(1, 3).is_err());
    }

    #[test]
    fn test_put_over_existing_frame_drops_tail() {
        let index = WalIndex::new();
        index.put(1, 1).unwrap();
        index.put(2, 2).unwrap();
        index.put(3, 3).unwrap();

        // Rewind to frame 2 and write a different page there.
        index.put(4, 2).unwrap();

        assert_eq!(index.frame_count(), 2);
        assert_eq!(index.lookup(2, 10), None);
        assert_eq!(index.lookup(3, 10), None);
        assert_eq!(index.lookup(4, 10), Some(2));
        assert_eq!(index.page_for_frame(2), Some(4));
    }

    #[test]
    fn test_truncate_after() {
        let index = WalIndex::new();
        for (frame, page) in [(1, 10), (2, 11), (3, 10), (4, 12)] {
            index.put(page, frame).unwrap();
        }

        index.truncate_after(2);
        assert_eq!(index.frame_count(), 2);
        assert_eq!(index.lookup(10, 10), Some(1));
        assert_eq!(index.lookup(12, 10), None);
        assert_eq!(index.len(), 2);

        // No-op past the end.
        index.truncate_after(9);
        assert_eq!(index.frame_count(), 2);
    }

    #[test]
    fn test_reset() {
        let index = WalIndex::new();
        index.put(1, 1).unwrap();
        index.reset();
        assert!(index.is_empty());
        assert_eq!(index.frame_count(), 0);
        assert_eq!(index.page_for_frame(1), None);
        index.put(2, 1).unwrap();
        assert_eq!(index.lookup(2, 1), Some(1));
    }

    #[test]
    fn test_latest_frames() {
        let index = WalIndex::new();
        for (frame, page) in [(1, 3), (2, 1), (3, 3), (4, 2), (5, 1)] {
            index.put(page, frame).unwrap();
        }

        assert_eq!(index.latest_frames(0, 5), vec![(1, 5), (2, 4), (3, 3)]);
        assert_eq!(index.latest_frames(0, 3), vec![(1, 2), (3, 3)]);
        // Pages whose newest visible frame is already backfilled are skipped.
        assert_eq!(index.latest_frames(3, 5), vec![(1, 5), (2, 4)]);
        assert!(index.latest_frames(5, 5).is_empty());
    }

    #[test]
    fn test_concurrent_lookups_see_whole_puts() {
        let index = Arc::new(WalIndex::new());
        let total = 2_000u32;

        let writer = {
            let index = Arc::clone(&index);
            thread::spawn(move || {
                for frame in 1..=total {
                    index.put(frame % 16, frame).unwrap();
                }
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let index = Arc::clone(&index);
                thread::spawn(move || {
                    for bound in (1..=total).step_by(7) {
                        for page in 0..16 {
                            if let Some(frame) = index.lookup(page, bound) {
                                assert!(frame <= bound);
                                assert_eq!(frame % 16, page);
                            }
                        }
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }

        assert_eq!(index.frame_count(), total);
        assert_eq!(index.lookup(0, total), Some(total));
    }
}
