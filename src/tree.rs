//! B-tree structural maintenance.
//!
//! The tree core owns the shape of one index: how pages split when they
//! fill, merge when they drain, and how the singly-rooted, level-linked
//! page graph stays consistent while it happens. Record contents are
//! opaque byte strings ordered by byte-wise comparison; what the records
//! mean is the caller's business.
//!
//! Structural operations run under the tree-wide [`latch::TreeLatch`] in
//! X mode and inside a [`mtr::MiniTransaction`], which makes every
//! multi-page change atomic. The operation entry points take the latch
//! guard by reference as proof of the required mode.

pub mod cursor;
pub mod discard;
pub mod error;
pub mod latch;
pub mod link;
pub mod merge;
pub mod mtr;
pub mod node_ptr;
pub mod split;
pub mod validate;

use crate::storage::alloc::Segment;
use crate::storage::page::tree_page::{TreePage, SLOT_SIZE};
use crate::storage::{
    AllocDirection, BufferPool, Journal, PageId, SegmentAllocator, StorageError,
};
use std::sync::Arc;

pub use cursor::{RecordHandle, TreeCursor};
pub use error::{Inconsistency, TreeError, TreeResult};
pub use latch::{SLatchGuard, SxLatchGuard, TreeLatch, XLatchGuard};
pub use mtr::MiniTransaction;
pub use node_ptr::{NodePointerCodec, OrderedKeyCodec, RecordMoveObserver};

use node_ptr::node_pointer_child;

/// Marker stored in the root's segment header fields.
const SEGMENT_ANCHOR: u64 = 1;

/// One B-tree index.
pub struct Tree {
    pub(crate) buffer_pool: BufferPool,
    pub(crate) allocator: Arc<SegmentAllocator>,
    pub(crate) journal: Arc<Journal>,
    pub(crate) latch: TreeLatch,
    pub(crate) index_id: u64,
    pub(crate) root_page_id: PageId,
    pub(crate) codec: Box<dyn NodePointerCodec>,
    pub(crate) observers: Vec<Box<dyn RecordMoveObserver>>,
}

impl Tree {
    /// Create a new, empty index: a single root page that is also the
    /// leaf level, carrying the anchors of both page segments.
    pub fn create(
        buffer_pool: BufferPool,
        journal: Arc<Journal>,
        index_id: u64,
        codec: Box<dyn NodePointerCodec>,
    ) -> TreeResult<Self> {
        let allocator = Arc::new(SegmentAllocator::new(0));

        let mut mtr =
            MiniTransaction::new(buffer_pool.clone(), Arc::clone(&allocator), Arc::clone(&journal));
        let mut root = mtr
            .allocate_page(Segment::Top, AllocDirection::Any, PageId(0), index_id, 0)
            .map_err(|e| exhausted("create", e))?;
        root.set_leaf_segment(SEGMENT_ANCHOR);
        root.set_top_segment(SEGMENT_ANCHOR);
        let root_page_id = root.page_id;
        mtr.put_page(root);
        mtr.commit()?;

        log::debug!("created index {index_id} with root page {root_page_id}");

        Ok(Self {
            buffer_pool,
            allocator,
            journal,
            latch: TreeLatch::new(),
            index_id,
            root_page_id,
            codec,
            observers: Vec::new(),
        })
    }

    /// Open an existing index rooted at `root_page_id`, rebuilding the
    /// allocator's segment bookkeeping by walking every level.
    pub fn open(
        buffer_pool: BufferPool,
        journal: Arc<Journal>,
        index_id: u64,
        root_page_id: PageId,
        codec: Box<dyn NodePointerCodec>,
    ) -> TreeResult<Self> {
        let allocator = Arc::new(SegmentAllocator::new(0));
        let tree = Self {
            buffer_pool,
            allocator,
            journal,
            latch: TreeLatch::new(),
            index_id,
            root_page_id,
            codec,
            observers: Vec::new(),
        };

        let mut mtr = tree.begin();
        let root_level = mtr.page(root_page_id)?.level();
        for level in (0..=root_level).rev() {
            let mut cur = tree.leftmost_page_at(&mut mtr, level)?;
            loop {
                if cur != root_page_id {
                    tree.allocator.adopt(segment_for(level), cur);
                }
                let next = mtr.page(cur)?.next_page_id();
                if next.is_null() {
                    break;
                }
                cur = next;
            }
        }
        // The root always lives in the top segment, leaf or not.
        tree.allocator.adopt(Segment::Top, root_page_id);
        drop(mtr);

        Ok(tree)
    }

    /// Register a hook to be told when records change pages.
    pub fn add_observer(&mut self, observer: Box<dyn RecordMoveObserver>) {
        self.observers.push(observer);
    }

    pub fn index_id(&self) -> u64 {
        self.index_id
    }

    pub fn root_page_id(&self) -> PageId {
        self.root_page_id
    }

    pub fn allocator(&self) -> &Arc<SegmentAllocator> {
        &self.allocator
    }

    /// Start a mini-transaction against this index's storage.
    pub fn begin(&self) -> MiniTransaction {
        MiniTransaction::new(
            self.buffer_pool.clone(),
            Arc::clone(&self.allocator),
            Arc::clone(&self.journal),
        )
    }

    pub fn latch(&self) -> &TreeLatch {
        &self.latch
    }

    /// Distance from the root to the leaf level. A one-page tree has
    /// height 0.
    pub fn height(&self, mtr: &mut MiniTransaction) -> TreeResult<u32> {
        Ok(mtr.page(self.root_page_id)?.level())
    }

    /// Descend to the leaf where `key` belongs and return the slot the
    /// record would occupy.
    pub fn search_to_leaf(
        &self,
        mtr: &mut MiniTransaction,
        key: &[u8],
    ) -> TreeResult<TreeCursor> {
        let mut cur = self.root_page_id;
        loop {
            let page = mtr.page(cur)?;
            if page.is_leaf() {
                let slot = page.lower_bound(key);
                return Ok(TreeCursor::new(cur, slot));
            }
            if page.record_count() == 0 {
                return Err(TreeError::corrupt(cur, "empty non-leaf page on descent"));
            }
            let slot = page.child_slot_for(key);
            cur = node_pointer_child(page.record(slot));
        }
    }

    /// Insert a record, splitting as needed. The common case is a single
    /// in-page insert; the slow path hands over to the split machinery.
    pub fn insert(
        &self,
        guard: &XLatchGuard<'_>,
        mtr: &mut MiniTransaction,
        rec: &[u8],
    ) -> TreeResult<RecordHandle> {
        let mut cursor = self.search_to_leaf(mtr, rec)?;
        let mut page = mtr.page_clone(cursor.page_id)?;

        match page.insert_record_at(cursor.slot, rec, 0) {
            Ok(()) => {
                let handle = RecordHandle {
                    page_id: cursor.page_id,
                    slot: cursor.slot,
                };
                mtr.put_page(page);
                Ok(handle)
            }
            Err(StorageError::PageFull { .. }) => {
                // Compaction may be enough to avoid a split.
                if page.free_space_after_reorganize() >= rec.len() + SLOT_SIZE {
                    page.reorganize();
                    page.insert_record_at(cursor.slot, rec, 0)?;
                    let handle = RecordHandle {
                        page_id: cursor.page_id,
                        slot: cursor.slot,
                    };
                    mtr.put_page(page);
                    return Ok(handle);
                }
                self.split_and_insert(guard, mtr, &mut cursor, rec)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Delete the record equal to `key` from its leaf. A leaf that
    /// drains completely is discarded from the tree. Returns whether a
    /// record was removed.
    pub fn delete(
        &self,
        guard: &XLatchGuard<'_>,
        mtr: &mut MiniTransaction,
        key: &[u8],
    ) -> TreeResult<bool> {
        let cursor = self.search_to_leaf(mtr, key)?;
        let mut page = mtr.page_clone(cursor.page_id)?;
        if cursor.slot >= page.record_count() || page.record_key(cursor.slot) != key {
            return Ok(false);
        }

        page.delete_record(cursor.slot)?;
        let drained = page.is_empty() && cursor.page_id != self.root_page_id;
        mtr.put_page(page);

        if drained {
            self.discard_page(guard, mtr, cursor.page_id)?;
        }
        Ok(true)
    }

    /// Release every page of the index back to the allocator, the leaf
    /// level first. The tree handle is consumed; the root goes with the
    /// top segment.
    pub fn free(self) {
        let _x = self.latch.lock_x();
        self.allocator.free_segment(Segment::Leaf);
        self.allocator.free_segment(Segment::Top);
        log::debug!("freed index {}", self.index_id);
    }

    pub(crate) fn notify_records_moved(&self, from: PageId, to: PageId, count: usize) {
        for observer in &self.observers {
            observer.records_moved(from, to, count);
        }
    }

    pub(crate) fn notify_page_discarded(&self, page_id: PageId) {
        for observer in &self.observers {
            observer.page_discarded(page_id);
        }
    }

    pub(crate) fn route_key_for(&self, page: &TreePage) -> Vec<u8> {
        self.codec.route_key(page.record(0), page.level())
    }
}

/// Which segment holds pages of a given level.
pub(crate) fn segment_for(level: u32) -> Segment {
    if level == 0 {
        Segment::Leaf
    } else {
        Segment::Top
    }
}

/// Wrap an allocation failure as recoverable exhaustion; anything else
/// passes through.
pub(crate) fn exhausted(operation: &'static str, source: StorageError) -> TreeError {
    match source {
        StorageError::OutOfSpace { .. } | StorageError::BufferPoolFull => {
            TreeError::ResourceExhaustion { operation, source }
        }
        other => other.into(),
    }
}
