//! Window management for session data files.
//!
//! Each session stores its pages in a single data file. A [`PageWindow`] describes the range of
//! bytes within that file that holds one serialized page. The [`PageWindowManager`] decides where
//! new windows go and which windows are evicted when the session grows beyond its size budget.
//!
//! The budget is advisory. When a new window would push the total size of all live windows over
//! the budget, the oldest windows are evicted until the new window fits (or until there is nothing
//! left to evict). A write is never rejected; a single page that is larger than the whole budget
//! evicts everything else and is still stored.

use anyhow::bail;
use std::collections::VecDeque;
use tracing::{trace, trace_span};

/// A contiguous range of bytes within a session data file that holds one serialized page.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct PageWindow {
    /// The page stored in this window.
    pub page_id: u32,
    /// Byte offset of the window within the data file.
    pub file_part_offset: u64,
    /// Length of the window, in bytes.
    pub file_part_size: u32,
}

impl PageWindow {
    /// The byte offset immediately after the end of this window.
    pub fn end(&self) -> u64 {
        self.file_part_offset + self.file_part_size as u64
    }
}

/// A range of bytes within a session data file that is not used by any window.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct FreeRange {
    /// Byte offset of the free range within the data file.
    pub offset: u64,
    /// Length of the free range, in bytes.
    pub size: u64,
}

impl FreeRange {
    fn end(&self) -> u64 {
        self.offset + self.size
    }
}

/// The state of a [`PageWindowManager`], as plain data.
///
/// This is what the index file stores for each session. It contains no references to any runtime
/// object; [`PageWindowManager::from_snapshot`] turns it back into a live manager.
#[derive(Clone, Default, Eq, PartialEq, Debug)]
pub struct WindowSnapshot {
    /// Live windows, oldest first.
    pub windows: Vec<PageWindow>,
    /// Reclaimable ranges, sorted by offset.
    pub free_ranges: Vec<FreeRange>,
    /// The offset where the next appended window would start.
    pub file_end: u64,
}

/// Tracks the windows of one session data file.
///
/// Invariants:
///
/// * each page id has at most one window
/// * windows and free ranges never overlap each other, and all of them end at or before `file_end`
/// * `free_ranges` is sorted by offset and no two free ranges are adjacent
/// * `total_size` is the sum of the sizes of all windows
pub struct PageWindowManager {
    /// Live windows, in the order they were created. The front is the oldest window, which is the
    /// first candidate for eviction.
    windows: VecDeque<PageWindow>,

    /// Ranges that used to hold windows and can be reused.
    free_ranges: Vec<FreeRange>,

    /// The offset where the next appended window would start.
    file_end: u64,

    /// Sum of `file_part_size` over `windows`.
    total_size: u64,

    /// The size budget for this session.
    max_size: u64,
}

impl PageWindowManager {
    /// Creates a manager for an empty data file.
    pub fn new(max_size: u64) -> Self {
        Self {
            windows: VecDeque::new(),
            free_ranges: Vec::new(),
            file_end: 0,
            total_size: 0,
            max_size,
        }
    }

    /// Rebuilds a manager from the state saved in the index file.
    ///
    /// The size budget is taken from the current configuration, not from the snapshot. If the
    /// budget has shrunk, nothing is evicted until the next window is created.
    pub fn from_snapshot(snapshot: WindowSnapshot, max_size: u64) -> anyhow::Result<Self> {
        let total_size = snapshot
            .windows
            .iter()
            .map(|w| w.file_part_size as u64)
            .sum();

        let manager = Self {
            windows: snapshot.windows.into(),
            free_ranges: snapshot.free_ranges,
            file_end: snapshot.file_end,
            total_size,
            max_size,
        };

        manager.check_invariants()?;
        Ok(manager)
    }

    /// Captures the state of this manager as plain data.
    pub fn snapshot(&self) -> WindowSnapshot {
        WindowSnapshot {
            windows: self.windows.iter().copied().collect(),
            free_ranges: self.free_ranges.clone(),
            file_end: self.file_end,
        }
    }

    /// Allocates a window of exactly `size` bytes for `page_id`.
    ///
    /// Any existing window for `page_id` is released first. If the new window would push the
    /// total size over the budget, the oldest windows are evicted. The new window is placed in the
    /// first free range that is large enough; if there is none, it is appended at the end of the
    /// file.
    ///
    /// This function does not do any disk I/O. It only updates in-memory state.
    pub fn create_page_window(&mut self, page_id: u32, size: u32) -> PageWindow {
        let _span = trace_span!("create_page_window").entered();
        trace!(page_id, size);

        self.remove_page(page_id);

        let size64 = size as u64;
        while self.total_size + size64 > self.max_size {
            let Some(oldest) = self.windows.pop_front() else {
                break;
            };
            trace!(
                page_id = oldest.page_id,
                size = oldest.file_part_size,
                "evicting page window"
            );
            self.total_size -= oldest.file_part_size as u64;
            self.release(oldest);
        }

        let offset = self.allocate(size64);
        let window = PageWindow {
            page_id,
            file_part_offset: offset,
            file_part_size: size,
        };

        self.windows.push_back(window);
        self.total_size += size64;

        trace!(offset, total_size = self.total_size, "allocated page window");
        window
    }

    /// Returns the window for `page_id`, if the page is still stored.
    pub fn get_page_window(&self, page_id: u32) -> Option<PageWindow> {
        self.windows.iter().find(|w| w.page_id == page_id).copied()
    }

    /// Forgets the window for `page_id`. Its byte range becomes reclaimable.
    ///
    /// Returns the removed window, if there was one.
    pub fn remove_page(&mut self, page_id: u32) -> Option<PageWindow> {
        let i = self.windows.iter().position(|w| w.page_id == page_id)?;
        let window = self.windows.remove(i)?;
        trace!(page_id, "removed page window");
        self.total_size -= window.file_part_size as u64;
        self.release(window);
        Some(window)
    }

    /// Iterates the live windows, oldest first.
    pub fn windows(&self) -> impl Iterator<Item = &PageWindow> {
        self.windows.iter()
    }

    /// The number of live windows.
    pub fn num_windows(&self) -> usize {
        self.windows.len()
    }

    /// The sum of the sizes of all live windows.
    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// The offset where the next appended window would start.
    pub fn file_end(&self) -> u64 {
        self.file_end
    }

    /// The size budget for this session.
    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    /// Finds room for `size` bytes. First fit among the free ranges, otherwise append.
    fn allocate(&mut self, size: u64) -> u64 {
        if size == 0 {
            return self.file_end;
        }

        if let Some(i) = self.free_ranges.iter().position(|r| r.size >= size) {
            let range = &mut self.free_ranges[i];
            let offset = range.offset;
            if range.size == size {
                self.free_ranges.remove(i);
            } else {
                range.offset += size;
                range.size -= size;
            }
            trace!(offset, size, "reusing free range");
            return offset;
        }

        let offset = self.file_end;
        self.file_end += size;
        offset
    }

    /// Returns the range of `window` to the free list.
    fn release(&mut self, window: PageWindow) {
        if window.file_part_size == 0 {
            return;
        }

        let freed = FreeRange {
            offset: window.file_part_offset,
            size: window.file_part_size as u64,
        };

        let i = self.free_ranges.partition_point(|r| r.offset < freed.offset);
        self.free_ranges.insert(i, freed);

        // Coalesce with the following range, then with the preceding range.
        if i + 1 < self.free_ranges.len()
            && self.free_ranges[i].end() == self.free_ranges[i + 1].offset
        {
            let next = self.free_ranges.remove(i + 1);
            self.free_ranges[i].size += next.size;
        }
        if i > 0 && self.free_ranges[i - 1].end() == self.free_ranges[i].offset {
            let this = self.free_ranges.remove(i);
            self.free_ranges[i - 1].size += this.size;
        }

        // A free range at the end of the file just shortens the file.
        if let Some(&tail) = self.free_ranges.last() {
            if tail.end() == self.file_end {
                trace!(
                    old_file_end = self.file_end,
                    new_file_end = tail.offset,
                    "trimming file end"
                );
                self.free_ranges.pop();
                self.file_end = tail.offset;
            }
        }
    }

    /// Checks the invariants described on [`PageWindowManager`].
    pub fn check_invariants(&self) -> anyhow::Result<()> {
        let mut ranges: Vec<(u64, u64)> =
            Vec::with_capacity(self.windows.len() + self.free_ranges.len());

        let mut total_size: u64 = 0;
        for (i, w) in self.windows.iter().enumerate() {
            if self.windows.iter().skip(i + 1).any(|other| other.page_id == w.page_id) {
                bail!("Page {} has more than one window.", w.page_id);
            }
            total_size += w.file_part_size as u64;
            if w.file_part_size != 0 {
                ranges.push((w.file_part_offset, w.end()));
            }
        }

        if total_size != self.total_size {
            bail!(
                "Total window size is wrong. Recorded: {}, actual: {}",
                self.total_size,
                total_size
            );
        }

        for pair in self.free_ranges.windows(2) {
            if pair[0].end() >= pair[1].offset {
                bail!(
                    "Free ranges are unsorted, overlapping or not coalesced: {:?} {:?}",
                    pair[0],
                    pair[1]
                );
            }
        }

        for r in self.free_ranges.iter() {
            if r.size == 0 {
                bail!("Free range at offset {} is empty.", r.offset);
            }
            ranges.push((r.offset, r.end()));
        }

        ranges.sort_unstable();
        for pair in ranges.windows(2) {
            if pair[0].1 > pair[1].0 {
                bail!(
                    "Byte ranges overlap: {:#x}..{:#x} and {:#x}..{:#x}",
                    pair[0].0,
                    pair[0].1,
                    pair[1].0,
                    pair[1].1
                );
            }
        }

        if let Some(last) = ranges.last() {
            if last.1 > self.file_end {
                bail!(
                    "Byte range {:#x}..{:#x} extends past the end of the file ({:#x}).",
                    last.0,
                    last.1,
                    self.file_end
                );
            }
        }

        Ok(())
    }
}

#[test]
fn test_windows_are_appended() {
    let mut m = PageWindowManager::new(1000);
    let a = m.create_page_window(1, 10);
    let b = m.create_page_window(2, 20);
    let c = m.create_page_window(3, 5);

    assert_eq!((a.file_part_offset, a.file_part_size), (0, 10));
    assert_eq!((b.file_part_offset, b.file_part_size), (10, 20));
    assert_eq!((c.file_part_offset, c.file_part_size), (30, 5));
    assert_eq!(m.file_end(), 35);
    assert_eq!(m.total_size(), 35);
    m.check_invariants().unwrap();
}

#[test]
fn test_oldest_window_is_evicted() {
    let mut m = PageWindowManager::new(100);
    m.create_page_window(1, 60);
    m.create_page_window(2, 60);

    assert_eq!(m.get_page_window(1), None);
    let w2 = m.get_page_window(2).unwrap();
    assert_eq!(w2.file_part_size, 60);
    assert_eq!(m.total_size(), 60);
    m.check_invariants().unwrap();
}

#[test]
fn test_eviction_is_oldest_first() {
    let mut m = PageWindowManager::new(100);
    for page in 1..=4 {
        m.create_page_window(page, 25);
    }
    assert_eq!(m.total_size(), 100);

    m.create_page_window(5, 40);

    // 40 bytes are needed, so the two oldest windows go.
    assert_eq!(m.get_page_window(1), None);
    assert_eq!(m.get_page_window(2), None);
    assert!(m.get_page_window(3).is_some());
    assert!(m.get_page_window(4).is_some());
    assert!(m.get_page_window(5).is_some());
    assert_eq!(m.total_size(), 90);
    m.check_invariants().unwrap();
}

#[test]
fn test_restoring_page_replaces_window() {
    let mut m = PageWindowManager::new(1000);
    m.create_page_window(1, 10);
    m.create_page_window(2, 10);
    let again = m.create_page_window(1, 30);

    assert_eq!(m.num_windows(), 2);
    assert_eq!(m.get_page_window(1), Some(again));
    assert_eq!(m.total_size(), 40);

    // The old 10-byte range is too small for 30 bytes, so the new window is appended.
    assert_eq!(again.file_part_offset, 20);

    // Re-storing makes page 1 the newest window.
    let order: Vec<u32> = m.windows().map(|w| w.page_id).collect();
    assert_eq!(order, vec![2, 1]);
    m.check_invariants().unwrap();
}

#[test]
fn test_free_range_first_fit() {
    let mut m = PageWindowManager::new(1000);
    m.create_page_window(1, 10);
    m.create_page_window(2, 20);
    m.create_page_window(3, 10);
    m.remove_page(2);

    let w4 = m.create_page_window(4, 15);
    assert_eq!(w4.file_part_offset, 10);

    let w5 = m.create_page_window(5, 5);
    assert_eq!(w5.file_part_offset, 25);

    // The hole is used up now, so the next window grows the file.
    let w6 = m.create_page_window(6, 1);
    assert_eq!(w6.file_part_offset, 40);
    assert_eq!(m.file_end(), 41);
    m.check_invariants().unwrap();
}

#[test]
fn test_free_ranges_coalesce() {
    let mut m = PageWindowManager::new(1000);
    for page in 1..=5 {
        m.create_page_window(page, 10);
    }
    m.remove_page(2);
    m.remove_page(4);
    m.remove_page(3);

    let snapshot = m.snapshot();
    assert_eq!(
        snapshot.free_ranges,
        vec![FreeRange {
            offset: 10,
            size: 30
        }]
    );

    // Removing the last window trims the file rather than leaving a free range at the end.
    m.remove_page(5);
    assert_eq!(m.file_end(), 10);
    assert!(m.snapshot().free_ranges.is_empty());
    m.check_invariants().unwrap();
}

#[test]
fn test_oversized_page_is_still_stored() {
    let mut m = PageWindowManager::new(100);
    m.create_page_window(1, 30);
    m.create_page_window(2, 30);
    let big = m.create_page_window(3, 150);

    assert_eq!(m.num_windows(), 1);
    assert_eq!(m.get_page_window(3), Some(big));
    assert_eq!(big.file_part_offset, 0);
    m.check_invariants().unwrap();
}

#[test]
fn test_zero_sized_window() {
    let mut m = PageWindowManager::new(100);
    m.create_page_window(1, 10);
    let empty = m.create_page_window(2, 0);
    assert_eq!(empty.file_part_offset, 10);
    assert_eq!(m.file_end(), 10);
    m.remove_page(2);
    m.check_invariants().unwrap();
}

#[test]
fn test_budget_holds_over_many_windows() {
    const MAX: u64 = 4096;
    let mut m = PageWindowManager::new(MAX);

    // A small linear congruential generator keeps this test deterministic.
    let mut seed: u32 = 0x1234_5678;
    let mut next = move || {
        seed = seed.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
        seed >> 8
    };

    for i in 0..2000u32 {
        let page_id = next() % 64;
        let size = next() % 900;
        if i % 7 == 0 {
            m.remove_page(next() % 64);
        }
        m.create_page_window(page_id, size);

        assert!(m.total_size() <= MAX, "iteration {i}: {}", m.total_size());
        m.check_invariants().unwrap();
    }
}

#[test]
fn test_snapshot_round_trip() {
    let mut m = PageWindowManager::new(1000);
    m.create_page_window(7, 10);
    m.create_page_window(8, 20);
    m.create_page_window(9, 30);
    m.remove_page(8);

    let snapshot = m.snapshot();
    let restored = PageWindowManager::from_snapshot(snapshot.clone(), 500).unwrap();
    assert_eq!(restored.snapshot(), snapshot);
    assert_eq!(restored.total_size(), 40);
    assert_eq!(restored.max_size(), 500);
    assert_eq!(restored.get_page_window(9), m.get_page_window(9));
}

#[test]
fn test_snapshot_with_overlap_is_rejected() {
    let snapshot = WindowSnapshot {
        windows: vec![
            PageWindow {
                page_id: 1,
                file_part_offset: 0,
                file_part_size: 10,
            },
            PageWindow {
                page_id: 2,
                file_part_offset: 5,
                file_part_size: 10,
            },
        ],
        free_ranges: Vec::new(),
        file_end: 15,
    };
    assert!(PageWindowManager::from_snapshot(snapshot, 100).is_err());
}
