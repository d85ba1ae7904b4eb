//! Sibling chains and father lookup.
//!
//! Every level of the tree is a doubly linked list of pages. The
//! helpers here splice pages in and out of a chain, and find the node
//! pointer record in the level above that files a given page.

use crate::storage::page::tree_page::TreePage;
use crate::storage::{PageId, StorageResult};
use crate::tree::node_ptr::node_pointer_child;
use crate::tree::{MiniTransaction, Tree, TreeError, TreeResult};

impl Tree {
    /// Page id of the leftmost page at `level`, following the first node
    /// pointer of every page on the way down.
    pub(crate) fn leftmost_page_at(
        &self,
        mtr: &mut MiniTransaction,
        level: u32,
    ) -> TreeResult<PageId> {
        let mut cur = self.root_page_id;
        loop {
            let page = mtr.page(cur)?;
            if page.level() == level {
                return Ok(cur);
            }
            if page.level() < level || page.record_count() == 0 {
                return Err(TreeError::corrupt(cur, "level unreachable on descent"));
            }
            cur = node_pointer_child(page.record(0));
        }
    }

    /// Locate the node pointer filing `child_id`: the page one level up
    /// that holds it, and the slot within that page.
    pub(crate) fn father_of(
        &self,
        mtr: &mut MiniTransaction,
        child_id: PageId,
    ) -> TreeResult<(PageId, usize)> {
        if child_id == self.root_page_id {
            return Err(TreeError::corrupt(child_id, "the root has no father"));
        }

        let (child_level, key) = {
            let child = mtr.page(child_id)?;
            let key = if child.record_count() > 0 && !child.is_min_record(0) {
                Some(child.record_key(0).to_vec())
            } else {
                None
            };
            (child.level(), key)
        };
        let parent_level = child_level + 1;

        // Key-guided descent lands on or left of the father in the
        // common case; a rightward scan finds it from there.
        let mut cur = self.root_page_id;
        loop {
            let page = mtr.page(cur)?;
            if page.level() < parent_level {
                return Err(TreeError::corrupt(cur, "descent passed the parent level"));
            }
            if page.level() == parent_level {
                break;
            }
            if page.record_count() == 0 {
                return Err(TreeError::corrupt(cur, "empty non-leaf page on descent"));
            }
            let slot = match &key {
                Some(k) => page.child_slot_for(k),
                None => 0,
            };
            cur = node_pointer_child(page.record(slot));
        }

        if let Some(found) = self.scan_level_for_child(mtr, cur, child_id)? {
            return Ok(found);
        }

        // Duplicate routing keys can make the guided descent overshoot;
        // fall back to a full sweep of the parent level.
        let leftmost = self.leftmost_page_at(mtr, parent_level)?;
        if let Some(found) = self.scan_level_for_child(mtr, leftmost, child_id)? {
            return Ok(found);
        }

        Err(TreeError::corrupt(
            child_id,
            format!("no node pointer at level {parent_level} files this page"),
        ))
    }

    fn scan_level_for_child(
        &self,
        mtr: &mut MiniTransaction,
        start: PageId,
        child_id: PageId,
    ) -> TreeResult<Option<(PageId, usize)>> {
        let mut cur = start;
        loop {
            let page = mtr.page(cur)?;
            for slot in 0..page.record_count() {
                if node_pointer_child(page.record(slot)) == child_id {
                    return Ok(Some((cur, slot)));
                }
            }
            let next = page.next_page_id();
            if next.is_null() {
                return Ok(None);
            }
            cur = next;
        }
    }
}

/// Delete a node pointer from a parent page. If the deleted pointer
/// carried the minimum mark, the mark moves to the pointer that is now
/// first.
pub(crate) fn delete_node_pointer(parent: &mut TreePage, slot: usize) -> StorageResult<()> {
    let was_marked = parent.is_min_record(slot);
    parent.delete_record(slot)?;
    if was_marked && parent.record_count() > 0 {
        parent.set_min_record(0, true);
    }
    Ok(())
}

/// Splice `new_page` into the chain immediately after `left`. Both pages
/// are held by the caller; the old right neighbor, if any, goes through
/// the mini-transaction.
pub(crate) fn link_after(
    mtr: &mut MiniTransaction,
    left: &mut TreePage,
    new_page: &mut TreePage,
) -> StorageResult<()> {
    new_page.set_prev_page_id(left.page_id);
    new_page.set_next_page_id(left.next_page_id());
    if !left.next_page_id().is_null() {
        let mut right = mtr.page_clone(left.next_page_id())?;
        right.set_prev_page_id(new_page.page_id);
        mtr.put_page(right);
    }
    left.set_next_page_id(new_page.page_id);
    Ok(())
}

/// Splice `new_page` into the chain immediately before `right`.
pub(crate) fn link_before(
    mtr: &mut MiniTransaction,
    right: &mut TreePage,
    new_page: &mut TreePage,
) -> StorageResult<()> {
    new_page.set_next_page_id(right.page_id);
    new_page.set_prev_page_id(right.prev_page_id());
    if !right.prev_page_id().is_null() {
        let mut left = mtr.page_clone(right.prev_page_id())?;
        left.set_next_page_id(new_page.page_id);
        mtr.put_page(left);
    }
    right.set_prev_page_id(new_page.page_id);
    Ok(())
}

/// Remove `page` from its chain. Neighbors the caller already holds as
/// working copies must be passed in so the edits land on those copies.
pub(crate) fn unlink(
    mtr: &mut MiniTransaction,
    page: &TreePage,
    held_prev: Option<&mut TreePage>,
    held_next: Option<&mut TreePage>,
) -> StorageResult<()> {
    let prev_id = page.prev_page_id();
    let next_id = page.next_page_id();

    if !prev_id.is_null() {
        match held_prev {
            Some(prev) => {
                debug_assert_eq!(prev.page_id, prev_id);
                prev.set_next_page_id(next_id);
            }
            None => {
                let mut prev = mtr.page_clone(prev_id)?;
                prev.set_next_page_id(next_id);
                mtr.put_page(prev);
            }
        }
    }

    if !next_id.is_null() {
        match held_next {
            Some(next) => {
                debug_assert_eq!(next.page_id, next_id);
                next.set_prev_page_id(prev_id);
            }
            None => {
                let mut next = mtr.page_clone(next_id)?;
                next.set_prev_page_id(prev_id);
                mtr.put_page(next);
            }
        }
    }

    Ok(())
}
