//! pagetree: structural maintenance for an on-disk, page-organized
//! B-tree.
//!
//! The crate keeps the shape of an index consistent as records come and
//! go: splitting full pages, merging drained ones, raising and lowering
//! the root, and validating the whole structure. It treats records as
//! opaque ordered byte strings; storage sits on a fixed-size page file
//! behind a buffer pool, and every structural change is journaled as one
//! atomic mini-transaction.

pub mod storage;
pub mod tree;
