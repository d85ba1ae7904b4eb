//! Free-page bookkeeping for one index.
//!
//! An index owns two segments, both anchored on its root page: the leaf
//! segment holds the level-0 pages, the top segment everything above.
//! Keeping them apart lets a whole level be dropped without fragmenting
//! the other.
//!
//! The allocator itself is in-memory state rebuilt when the index is
//! opened. A capacity cap makes allocation fail deterministically, which
//! the structural operations must survive without touching the tree.

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::PageId;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashSet};

/// Which of the index's two segments a page belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Segment {
    /// Level 0.
    Leaf,
    /// Every level above 0, the root included.
    Top,
}

/// Placement hint for a new page relative to the hint page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocDirection {
    /// The new page will be the right half of a split; prefer a higher
    /// page number.
    Up,
    /// The new page will be the left half; prefer a lower page number.
    Down,
    /// No ordering preference; prefer proximity to the hint.
    Any,
}

#[derive(Debug, Default)]
struct AllocState {
    leaf: HashSet<PageId>,
    top: HashSet<PageId>,
    /// Pages freed earlier, reusable before extending the file.
    free: BTreeSet<u64>,
    /// High-water mark: the next never-allocated page number.
    next_page: u64,
    /// Hard cap on total pages, None for unbounded.
    capacity: Option<u64>,
}

/// Page allocator shared by every operation on one index.
#[derive(Debug)]
pub struct SegmentAllocator {
    state: Mutex<AllocState>,
}

impl SegmentAllocator {
    /// Start allocating from `first_page` (pages below it are owned by
    /// someone else, typically the root itself).
    pub fn new(first_page: u64) -> Self {
        Self {
            state: Mutex::new(AllocState {
                next_page: first_page,
                ..AllocState::default()
            }),
        }
    }

    /// Cap the total number of pages this allocator may hand out.
    pub fn set_capacity(&self, capacity: Option<u64>) {
        self.state.lock().capacity = capacity;
    }

    /// Record a page as already belonging to a segment, for rebuilding
    /// state from an existing file.
    pub fn adopt(&self, segment: Segment, page_id: PageId) {
        let mut state = self.state.lock();
        match segment {
            Segment::Leaf => state.leaf.insert(page_id),
            Segment::Top => state.top.insert(page_id),
        };
        if page_id.0 >= state.next_page {
            state.next_page = page_id.0 + 1;
        }
    }

    /// Allocate one page, reusing a freed page near the hint when one
    /// exists. Fails with `OutOfSpace` before any tree page is touched.
    pub fn allocate(
        &self,
        segment: Segment,
        direction: AllocDirection,
        hint: PageId,
    ) -> StorageResult<PageId> {
        let mut state = self.state.lock();

        let reused = match direction {
            AllocDirection::Up => state.free.range(hint.0..).next().copied(),
            AllocDirection::Down => state.free.range(..hint.0).next_back().copied(),
            AllocDirection::Any => {
                let above = state.free.range(hint.0..).next().copied();
                let below = state.free.range(..hint.0).next_back().copied();
                match (above, below) {
                    (Some(a), Some(b)) => {
                        if a - hint.0 <= hint.0 - b {
                            Some(a)
                        } else {
                            Some(b)
                        }
                    }
                    (a, b) => a.or(b),
                }
            }
        }
        // Fall back to any free page before extending the file.
        .or_else(|| state.free.iter().next().copied());

        let page_num = match reused {
            Some(n) => {
                state.free.remove(&n);
                n
            }
            None => {
                if let Some(cap) = state.capacity {
                    if state.next_page >= cap {
                        return Err(StorageError::OutOfSpace {
                            allocated: state.next_page,
                            capacity: cap,
                        });
                    }
                }
                let n = state.next_page;
                state.next_page += 1;
                n
            }
        };

        let page_id = PageId(page_num);
        match segment {
            Segment::Leaf => state.leaf.insert(page_id),
            Segment::Top => state.top.insert(page_id),
        };
        Ok(page_id)
    }

    /// Return a page to the free pool.
    pub fn free(&self, segment: Segment, page_id: PageId) {
        let mut state = self.state.lock();
        let removed = match segment {
            Segment::Leaf => state.leaf.remove(&page_id),
            Segment::Top => state.top.remove(&page_id),
        };
        if removed {
            state.free.insert(page_id.0);
        }
    }

    /// Release every page of a segment at once.
    pub fn free_segment(&self, segment: Segment) {
        let mut state = self.state.lock();
        let pages = match segment {
            Segment::Leaf => std::mem::take(&mut state.leaf),
            Segment::Top => std::mem::take(&mut state.top),
        };
        for page_id in pages {
            state.free.insert(page_id.0);
        }
    }

    /// Whether the page is currently on the free pool.
    pub fn is_free(&self, page_id: PageId) -> bool {
        self.state.lock().free.contains(&page_id.0)
    }

    /// Whether the page is live in either segment.
    pub fn is_allocated(&self, page_id: PageId) -> bool {
        let state = self.state.lock();
        state.leaf.contains(&page_id) || state.top.contains(&page_id)
    }

    pub fn segment_size(&self, segment: Segment) -> usize {
        let state = self.state.lock();
        match segment {
            Segment::Leaf => state.leaf.len(),
            Segment::Top => state.top.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_extends_from_first_page() {
        let alloc = SegmentAllocator::new(1);
        let a = alloc
            .allocate(Segment::Leaf, AllocDirection::Any, PageId(0))
            .unwrap();
        let b = alloc
            .allocate(Segment::Leaf, AllocDirection::Any, PageId(0))
            .unwrap();
        assert_eq!(a, PageId(1));
        assert_eq!(b, PageId(2));
        assert!(alloc.is_allocated(a));
        assert_eq!(alloc.segment_size(Segment::Leaf), 2);
    }

    #[test]
    fn test_freed_page_is_reused() {
        let alloc = SegmentAllocator::new(1);
        let a = alloc
            .allocate(Segment::Leaf, AllocDirection::Any, PageId(0))
            .unwrap();
        let _b = alloc
            .allocate(Segment::Leaf, AllocDirection::Any, PageId(0))
            .unwrap();
        alloc.free(Segment::Leaf, a);
        assert!(alloc.is_free(a));

        let c = alloc
            .allocate(Segment::Top, AllocDirection::Any, PageId(0))
            .unwrap();
        assert_eq!(c, a);
        assert!(!alloc.is_free(a));
    }

    #[test]
    fn test_direction_hint_prefers_side() {
        let alloc = SegmentAllocator::new(1);
        let mut pages = Vec::new();
        for _ in 0..5 {
            pages.push(
                alloc
                    .allocate(Segment::Leaf, AllocDirection::Any, PageId(0))
                    .unwrap(),
            );
        }
        // Free pages 1 and 5, hint in the middle.
        alloc.free(Segment::Leaf, pages[0]);
        alloc.free(Segment::Leaf, pages[4]);

        let up = alloc
            .allocate(Segment::Leaf, AllocDirection::Up, PageId(3))
            .unwrap();
        assert_eq!(up, PageId(5));
        let down = alloc
            .allocate(Segment::Leaf, AllocDirection::Down, PageId(3))
            .unwrap();
        assert_eq!(down, PageId(1));
    }

    #[test]
    fn test_capacity_exhaustion() {
        let alloc = SegmentAllocator::new(1);
        alloc.set_capacity(Some(3));
        alloc
            .allocate(Segment::Leaf, AllocDirection::Any, PageId(0))
            .unwrap();
        alloc
            .allocate(Segment::Leaf, AllocDirection::Any, PageId(0))
            .unwrap();
        let res = alloc.allocate(Segment::Leaf, AllocDirection::Any, PageId(0));
        assert!(matches!(res, Err(StorageError::OutOfSpace { .. })));
    }

    #[test]
    fn test_free_segment_releases_everything() {
        let alloc = SegmentAllocator::new(1);
        for _ in 0..4 {
            alloc
                .allocate(Segment::Leaf, AllocDirection::Any, PageId(0))
                .unwrap();
        }
        alloc
            .allocate(Segment::Top, AllocDirection::Any, PageId(0))
            .unwrap();

        alloc.free_segment(Segment::Leaf);
        assert_eq!(alloc.segment_size(Segment::Leaf), 0);
        assert_eq!(alloc.segment_size(Segment::Top), 1);
        assert!(alloc.is_free(PageId(1)));
    }
}
