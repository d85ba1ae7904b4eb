//! Storage layer error types.

use crate::storage::page::PageId;
use thiserror::Error;

/// Errors that can occur in the storage layer.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("page {0} does not exist in the backing file")]
    PageNotFound(PageId),

    #[error("page {page_id} is full: requires {required} bytes but only {available} available")]
    PageFull {
        page_id: PageId,
        required: usize,
        available: usize,
    },

    #[error("invalid slot {slot} on page {page_id} (record count {record_count})")]
    InvalidSlot {
        page_id: PageId,
        slot: usize,
        record_count: usize,
    },

    #[error("buffer pool is full: cannot allocate a frame")]
    BufferPoolFull,

    #[error("no space left in the file: {allocated} pages allocated, capacity {capacity}")]
    OutOfSpace { allocated: u64, capacity: u64 },

    #[error("journal serialization failed: {0}")]
    JournalEncode(#[from] bincode::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;
