//! Storage layer for pagetree.
//!
//! This module provides everything the tree core sits on top of:
//!
//! - **TreePage**: slotted 4KB page format holding opaque, ordered records
//! - **PageManager**: reads/writes pages to the backing file
//! - **BufferPool**: in-memory page cache with pin counts and LRU eviction
//! - **SegmentAllocator**: two-segment (leaf / top) free-page bookkeeping
//! - **Journal**: mini-transaction log giving atomic multi-page writes
//!
//! The tree core never touches the file directly; every page image flows
//! through the buffer pool, and every structural mutation is journaled as
//! one record before it becomes visible.

pub mod alloc;
pub mod buffer;
pub mod disk;
pub mod error;
pub mod journal;
pub mod page;

pub use alloc::{AllocDirection, Segment, SegmentAllocator};
pub use buffer::{BufferPool, PageReadGuard, PageWriteGuard};
pub use disk::{PageManager, PAGE_SIZE};
pub use error::{StorageError, StorageResult};
pub use journal::{Journal, Lsn};
pub use page::{PageId, NULL_PAGE_ID};
