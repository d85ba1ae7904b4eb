//! Mini-transactions.
//!
//! A structural operation touches several pages; none of the changes may
//! become visible unless all of them do. A [`MiniTransaction`] buffers
//! working copies of every page it reads or writes, and on commit
//! journals the dirty after-images as one record before publishing them
//! to the buffer pool.
//!
//! Reads inside a mini-transaction see its own writes. Dropping one
//! without committing abandons every change and returns freshly
//! allocated pages to the allocator, which is what makes a failed
//! operation leave the tree exactly as it found it.

use crate::storage::alloc::Segment;
use crate::storage::page::tree_page::TreePage;
use crate::storage::{
    AllocDirection, BufferPool, Journal, Lsn, PageId, SegmentAllocator, StorageResult,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

pub struct MiniTransaction {
    buffer_pool: BufferPool,
    allocator: Arc<SegmentAllocator>,
    journal: Arc<Journal>,
    /// Working copies, reads and writes alike.
    pages: HashMap<PageId, TreePage>,
    dirty: HashSet<PageId>,
    /// Pages that do not exist on disk yet.
    created: HashSet<PageId>,
    /// Allocations to roll back if the transaction aborts.
    allocated: Vec<(Segment, PageId)>,
    /// Frees deferred to commit.
    freed: Vec<(Segment, PageId)>,
    committed: bool,
}

impl MiniTransaction {
    pub fn new(
        buffer_pool: BufferPool,
        allocator: Arc<SegmentAllocator>,
        journal: Arc<Journal>,
    ) -> Self {
        Self {
            buffer_pool,
            allocator,
            journal,
            pages: HashMap::new(),
            dirty: HashSet::new(),
            created: HashSet::new(),
            allocated: Vec::new(),
            freed: Vec::new(),
            committed: false,
        }
    }

    /// Read a page, loading it into the working set on first access.
    pub fn page(&mut self, page_id: PageId) -> StorageResult<&TreePage> {
        if !self.pages.contains_key(&page_id) {
            let guard = self.buffer_pool.fetch_page(page_id)?;
            let page = TreePage::from_data(page_id, &guard);
            drop(guard);
            self.pages.insert(page_id, page);
        }
        // Just inserted above if it was absent.
        Ok(&self.pages[&page_id])
    }

    /// Clone a page's working copy for mutation; write it back with
    /// [`put_page`](Self::put_page).
    pub fn page_clone(&mut self, page_id: PageId) -> StorageResult<TreePage> {
        Ok(self.page(page_id)?.clone())
    }

    /// Install a mutated page image and mark it dirty.
    pub fn put_page(&mut self, page: TreePage) {
        self.dirty.insert(page.page_id);
        self.pages.insert(page.page_id, page);
    }

    /// Allocate a page and hand back a fresh image for it. The
    /// allocation is undone if the transaction aborts.
    pub fn allocate_page(
        &mut self,
        segment: Segment,
        direction: AllocDirection,
        hint: PageId,
        index_id: u64,
        level: u32,
    ) -> StorageResult<TreePage> {
        let page_id = self.allocator.allocate(segment, direction, hint)?;
        self.allocated.push((segment, page_id));
        self.created.insert(page_id);
        Ok(TreePage::new(page_id, index_id, level))
    }

    /// Schedule a page to be returned to the allocator at commit.
    pub fn free_page(&mut self, segment: Segment, page_id: PageId) {
        self.freed.push((segment, page_id));
    }

    pub fn is_dirty(&self) -> bool {
        !self.dirty.is_empty() || !self.freed.is_empty()
    }

    /// Journal the dirty after-images as one record, publish them to the
    /// buffer pool, then apply the deferred frees.
    pub fn commit(mut self) -> StorageResult<Lsn> {
        let mut dirty_ids: Vec<PageId> = self.dirty.iter().copied().collect();
        dirty_ids.sort();

        let images: Vec<(PageId, Vec<u8>)> = dirty_ids
            .iter()
            .map(|id| (*id, self.pages[id].data().to_vec()))
            .collect();
        let freed_ids: Vec<PageId> = self.freed.iter().map(|(_, id)| *id).collect();

        let lsn = self.journal.append(images, freed_ids)?;

        for page_id in dirty_ids {
            let page = &self.pages[&page_id];
            let mut guard = if self.created.contains(&page_id) {
                self.buffer_pool.create_page(page_id)?
            } else {
                self.buffer_pool.fetch_page_write(page_id)?
            };
            guard.copy_from_slice(page.data());
        }

        for (segment, page_id) in self.freed.drain(..) {
            self.allocator.free(segment, page_id);
        }

        self.committed = true;
        Ok(lsn)
    }
}

impl Drop for MiniTransaction {
    fn drop(&mut self) {
        if !self.committed {
            for (segment, page_id) in self.allocated.drain(..) {
                self.allocator.free(segment, page_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::buffer::lru::LruReplacer;
    use crate::storage::PageManager;
    use anyhow::Result;
    use tempfile::TempDir;

    fn setup() -> Result<(TempDir, BufferPool, Arc<SegmentAllocator>, Arc<Journal>)> {
        let dir = TempDir::new()?;
        let pm = PageManager::create(&dir.path().join("tree.db"))?;
        let pool = BufferPool::new(pm, Box::new(LruReplacer::new(16)), 16);
        let allocator = Arc::new(SegmentAllocator::new(0));
        let journal = Arc::new(Journal::create(dir.path().join("journal.log"))?);
        Ok((dir, pool, allocator, journal))
    }

    #[test]
    fn test_commit_publishes_pages() -> Result<()> {
        let (_dir, pool, allocator, journal) = setup()?;

        let mut mtr = MiniTransaction::new(pool.clone(), allocator.clone(), journal.clone());
        let mut page = mtr.allocate_page(Segment::Leaf, AllocDirection::Any, PageId(0), 1, 0)?;
        page.insert_sorted(b"hello", 0)?;
        let page_id = page.page_id;
        mtr.put_page(page);
        mtr.commit()?;

        // Visible to a later transaction.
        let mut mtr2 = MiniTransaction::new(pool, allocator, journal.clone());
        let page = mtr2.page(page_id)?;
        assert_eq!(page.record(0), b"hello");

        assert_eq!(journal.records()?.len(), 1);
        Ok(())
    }

    #[test]
    fn test_reads_see_own_writes() -> Result<()> {
        let (_dir, pool, allocator, journal) = setup()?;

        let mut mtr = MiniTransaction::new(pool, allocator, journal);
        let mut page = mtr.allocate_page(Segment::Leaf, AllocDirection::Any, PageId(0), 1, 0)?;
        page.insert_sorted(b"abc", 0)?;
        let page_id = page.page_id;
        mtr.put_page(page);

        let reread = mtr.page(page_id)?;
        assert_eq!(reread.record_count(), 1);
        Ok(())
    }

    #[test]
    fn test_abort_discards_everything() -> Result<()> {
        let (_dir, pool, allocator, journal) = setup()?;

        let page_id = {
            let mut mtr =
                MiniTransaction::new(pool.clone(), allocator.clone(), journal.clone());
            let page =
                mtr.allocate_page(Segment::Leaf, AllocDirection::Any, PageId(0), 1, 0)?;
            let id = page.page_id;
            mtr.put_page(page);
            id
            // Dropped without commit.
        };

        // The allocation was rolled back and nothing was journaled.
        assert!(allocator.is_free(page_id));
        assert_eq!(journal.records()?.len(), 0);
        Ok(())
    }

    #[test]
    fn test_deferred_free_applies_at_commit() -> Result<()> {
        let (_dir, pool, allocator, journal) = setup()?;

        let page_id = {
            let mut mtr =
                MiniTransaction::new(pool.clone(), allocator.clone(), journal.clone());
            let page =
                mtr.allocate_page(Segment::Leaf, AllocDirection::Any, PageId(0), 1, 0)?;
            let id = page.page_id;
            mtr.put_page(page);
            mtr.commit()?;
            id
        };

        let mut mtr = MiniTransaction::new(pool, allocator.clone(), journal);
        mtr.free_page(Segment::Leaf, page_id);
        assert!(!allocator.is_free(page_id));
        mtr.commit()?;
        assert!(allocator.is_free(page_id));
        Ok(())
    }
}
