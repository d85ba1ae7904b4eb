pub mod tree_page;

use std::fmt;

/// Page number inside the backing file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[derive(serde::Serialize, serde::Deserialize)]
pub struct PageId(pub u64);

/// On-disk null: sibling links at the extremes of a level carry this.
pub const NULL_PAGE_ID: PageId = PageId(u64::MAX);

impl PageId {
    pub fn is_null(self) -> bool {
        self == NULL_PAGE_ID
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub use tree_page::TreePage;
