//! Tree layer error types.
//!
//! Two failure classes matter to callers. Resource exhaustion is
//! recoverable: it is raised before any page is modified, so the tree is
//! untouched and the caller may free space and retry. Structural
//! corruption is fatal: the on-disk tree contradicts its own invariants
//! and no further structural operation is safe.

use crate::storage::{PageId, StorageError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TreeError {
    /// A page or frame could not be allocated. Raised before the tree is
    /// mutated; the operation can be retried after space is freed.
    #[error("resource exhaustion during {operation}: {source}")]
    ResourceExhaustion {
        operation: &'static str,
        #[source]
        source: StorageError,
    },

    /// The tree violates its own invariants. Not recoverable.
    #[error("structural corruption at page {page_id}: {detail}")]
    StructuralCorruption { page_id: PageId, detail: String },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl TreeError {
    pub(crate) fn corrupt(page_id: PageId, detail: impl Into<String>) -> Self {
        TreeError::StructuralCorruption {
            page_id,
            detail: detail.into(),
        }
    }

    pub fn is_recoverable(&self) -> bool {
        matches!(self, TreeError::ResourceExhaustion { .. })
    }
}

pub type TreeResult<T> = Result<T, TreeError>;

/// One defect found by [`crate::tree::Tree::validate_index`]. Validation keeps
/// going after the first hit so a damaged index reports everything wrong
/// with it in one pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inconsistency {
    /// `page.next.prev != page` or vice versa.
    BrokenSiblingLink {
        page_id: PageId,
        sibling: PageId,
        backlink: PageId,
    },
    /// Records on a page are not in strictly ascending key order.
    KeyOrderViolation { page_id: PageId, slot: usize },
    /// Keys do not ascend across a sibling boundary.
    SiblingOrderViolation { left: PageId, right: PageId },
    /// A parent node pointer disagrees with its child page.
    NodePointerMismatch {
        parent: PageId,
        child: PageId,
        detail: String,
    },
    /// A reachable page is stamped with another index's id.
    ForeignPage { page_id: PageId, index_id: u64 },
    /// A page's stored level does not match its position.
    LevelMismatch {
        page_id: PageId,
        expected: u32,
        found: u32,
    },
    /// The leftmost page of a non-leaf level lacks the minimum-record
    /// mark on its first record.
    MinRecordMarkMissing { page_id: PageId },
    /// A minimum-record mark appears where it must not.
    MinRecordMarkUnexpected { page_id: PageId, slot: usize },
    /// A page sits in a sibling chain without a node pointer filing it.
    UnfiledPage { page_id: PageId },
    /// A reachable page is on the allocator's free pool.
    FreePageReachable { page_id: PageId },
    /// An empty non-root page is still linked into the tree.
    EmptyPageRetained { page_id: PageId },
}

impl std::fmt::Display for Inconsistency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Inconsistency::BrokenSiblingLink {
                page_id,
                sibling,
                backlink,
            } => write!(
                f,
                "page {page_id} links to sibling {sibling} whose backlink is {backlink}"
            ),
            Inconsistency::KeyOrderViolation { page_id, slot } => {
                write!(f, "page {page_id} slot {slot} breaks key order")
            }
            Inconsistency::SiblingOrderViolation { left, right } => {
                write!(f, "keys do not ascend from page {left} to page {right}")
            }
            Inconsistency::NodePointerMismatch {
                parent,
                child,
                detail,
            } => write!(
                f,
                "node pointer in page {parent} disagrees with child {child}: {detail}"
            ),
            Inconsistency::ForeignPage { page_id, index_id } => {
                write!(f, "page {page_id} belongs to index {index_id}")
            }
            Inconsistency::LevelMismatch {
                page_id,
                expected,
                found,
            } => write!(
                f,
                "page {page_id} stores level {found}, expected {expected}"
            ),
            Inconsistency::MinRecordMarkMissing { page_id } => {
                write!(f, "leftmost page {page_id} first record lacks the minimum mark")
            }
            Inconsistency::MinRecordMarkUnexpected { page_id, slot } => {
                write!(f, "page {page_id} slot {slot} carries an unexpected minimum mark")
            }
            Inconsistency::UnfiledPage { page_id } => {
                write!(f, "page {page_id} is in a sibling chain but filed by no parent")
            }
            Inconsistency::FreePageReachable { page_id } => {
                write!(f, "page {page_id} is reachable but marked free")
            }
            Inconsistency::EmptyPageRetained { page_id } => {
                write!(f, "empty page {page_id} is still linked into the tree")
            }
        }
    }
}
