//! Positions within the tree.

use crate::storage::PageId;

/// An insert position on a leaf page: the record will occupy `slot`,
/// shifting the current occupant (if any) right.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeCursor {
    pub page_id: PageId,
    pub slot: usize,
}

impl TreeCursor {
    pub fn new(page_id: PageId, slot: usize) -> Self {
        Self { page_id, slot }
    }
}

/// Where a record landed after an insert, splits included.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHandle {
    pub page_id: PageId,
    pub slot: usize,
}
