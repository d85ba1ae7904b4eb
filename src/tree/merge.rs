//! Page merges.
//!
//! `compress` tries to undo fragmentation around one page: its records
//! move wholesale into a sibling that can hold them, and the emptied
//! page leaves the tree. The left sibling is preferred; merging right
//! instead refiles the right sibling under the absorbed page's routing
//! position. A page with no siblings at all is the only page of its
//! level, and lifting it into the root shrinks the tree by at least one
//! level.
//!
//! Merging never allocates, so it cannot fail for lack of space; a page
//! whose neither neighbor can absorb it simply stays put.

use crate::storage::page::tree_page::TreePage;
use crate::storage::PageId;
use crate::tree::cursor::TreeCursor;
use crate::tree::link::{self, delete_node_pointer};
use crate::tree::node_ptr::{node_pointer_child, repoint_node_pointer};
use crate::tree::{segment_for, MiniTransaction, Tree, TreeError, TreeResult, XLatchGuard};

impl Tree {
    /// Try to merge the cursor's page into one of its siblings. Returns
    /// whether the tree changed. The root is never compressed. With
    /// `adjust_cursor` the cursor follows its record (by ordinal) into
    /// the surviving page.
    pub fn compress(
        &self,
        _guard: &XLatchGuard<'_>,
        mtr: &mut MiniTransaction,
        cursor: &mut TreeCursor,
        adjust_cursor: bool,
    ) -> TreeResult<bool> {
        let page_id = cursor.page_id;
        if page_id == self.root_page_id {
            return Ok(false);
        }

        let page = mtr.page_clone(page_id)?;
        if !page.has_siblings() {
            // Records keep their ordinals when the page moves into the
            // root.
            self.lift_page_up(mtr, page_id)?;
            if adjust_cursor {
                cursor.page_id = self.root_page_id;
            }
            return Ok(true);
        }

        let needed = TreePage::occupied_by(page.records_data_size(), page.record_count());

        if !page.prev_page_id().is_null() {
            let left = mtr.page(page.prev_page_id())?;
            if left.free_space_after_reorganize() >= needed {
                let (survivor, slot_base) = self.merge_into_left(mtr, page)?;
                if adjust_cursor {
                    cursor.page_id = survivor;
                    cursor.slot += slot_base;
                }
                return Ok(true);
            }
        }

        if !page.next_page_id().is_null() {
            let right = mtr.page(page.next_page_id())?;
            if right.free_space_after_reorganize() >= needed {
                // Prepending preserves the ordinals of the moved records.
                let survivor = self.merge_into_right(mtr, page)?;
                if adjust_cursor {
                    cursor.page_id = survivor;
                }
                return Ok(true);
            }
        }

        Ok(false)
    }

    /// Append the page's records to its left sibling and drop the page.
    /// Returns the sibling's id and the ordinal its first appended record
    /// landed on.
    fn merge_into_left(
        &self,
        mtr: &mut MiniTransaction,
        page: TreePage,
    ) -> TreeResult<(PageId, usize)> {
        let page_id = page.page_id;
        let left_id = page.prev_page_id();
        let count = page.record_count();
        let needed = TreePage::occupied_by(page.records_data_size(), count);

        let (father_id, father_slot) = self.father_of(mtr, page_id)?;

        let mut left = mtr.page_clone(left_id)?;
        if left.free_space() < needed {
            left.reorganize();
        }
        let slot_base = left.record_count();
        for (rec, flags) in page.extract_records(0, count) {
            let at = left.record_count();
            left.insert_record_at(at, &rec, flags)?;
        }
        self.notify_records_moved(page_id, left_id, count);

        let mut father = mtr.page_clone(father_id)?;
        delete_node_pointer(&mut father, father_slot)?;
        let father_drained = father.is_empty();

        link::unlink(mtr, &page, Some(&mut left), None)?;
        left.reset_last_insert();

        log::debug!("merged page {page_id} into left sibling {left_id}");

        mtr.put_page(left);
        mtr.put_page(father);
        mtr.free_page(segment_for(page.level()), page_id);
        self.notify_page_discarded(page_id);

        if father_drained {
            self.handle_drained_father(mtr, father_id)?;
        }
        Ok((left_id, slot_base))
    }

    /// Prepend the page's records to its right sibling, which inherits
    /// the page's filing in the level above; the sibling's own node
    /// pointer is deleted. Returns the sibling's id.
    fn merge_into_right(&self, mtr: &mut MiniTransaction, page: TreePage) -> TreeResult<PageId> {
        let page_id = page.page_id;
        let right_id = page.next_page_id();
        let count = page.record_count();
        let needed = TreePage::occupied_by(page.records_data_size(), count);

        let (father_id, father_slot) = self.father_of(mtr, page_id)?;
        let (rfather_id, rfather_slot) = self.father_of(mtr, right_id)?;

        let mut right = mtr.page_clone(right_id)?;
        if right.free_space() < needed {
            right.reorganize();
        }
        for (i, (rec, flags)) in page.extract_records(0, count).into_iter().enumerate() {
            right.insert_record_at(i, &rec, flags)?;
        }
        self.notify_records_moved(page_id, right_id, count);

        // The page's pointer now files the merged sibling; it keeps the
        // page's routing key and minimum mark.
        let mut father = mtr.page_clone(father_id)?;
        let mut ptr = father.record(father_slot).to_vec();
        debug_assert_eq!(node_pointer_child(&ptr), page_id);
        repoint_node_pointer(&mut ptr, right_id);
        father.overwrite_record(father_slot, &ptr)?;

        let mut rfather_drained = None;
        if rfather_id == father_id {
            // Same parent: the sibling's pointer sits after the page's.
            debug_assert!(rfather_slot > father_slot);
            delete_node_pointer(&mut father, rfather_slot)?;
        } else {
            let mut rfather = mtr.page_clone(rfather_id)?;
            delete_node_pointer(&mut rfather, rfather_slot)?;
            if rfather.is_empty() {
                rfather_drained = Some(rfather_id);
            }
            mtr.put_page(rfather);
        }

        link::unlink(mtr, &page, None, Some(&mut right))?;
        right.reset_last_insert();

        log::debug!("merged page {page_id} into right sibling {right_id}");

        mtr.put_page(right);
        mtr.put_page(father);
        mtr.free_page(segment_for(page.level()), page_id);
        self.notify_page_discarded(page_id);

        if let Some(drained_id) = rfather_drained {
            self.handle_drained_father(mtr, drained_id)?;
        }
        Ok(right_id)
    }

    /// Replace the root's contents with the only page of the level
    /// below, shrinking the tree. Every level between the root and that
    /// page holds a single node pointer; all of those pages are freed.
    pub(crate) fn lift_page_up(&self, mtr: &mut MiniTransaction, page_id: PageId) -> TreeResult<()> {
        if page_id == self.root_page_id {
            return Err(TreeError::corrupt(page_id, "cannot lift the root"));
        }

        let page = mtr.page_clone(page_id)?;
        let level = page.level();
        debug_assert!(!page.has_siblings());

        // Walk from the root down to the page, checking the chain is as
        // degenerate as a sibling-less page implies.
        let mut doomed: Vec<(PageId, u32)> = Vec::new();
        let mut cur = self.root_page_id;
        while cur != page_id {
            let ancestor = mtr.page(cur)?;
            if ancestor.record_count() != 1 {
                return Err(TreeError::corrupt(
                    cur,
                    "page without siblings below a multi-pointer ancestor",
                ));
            }
            let child = node_pointer_child(ancestor.record(0));
            let ancestor_level = ancestor.level();
            if cur != self.root_page_id {
                doomed.push((cur, ancestor_level));
            }
            cur = child;
        }

        let count = page.record_count();
        let mut root = mtr.page_clone(self.root_page_id)?;
        root.empty_page(level);
        for (i, (rec, flags)) in page.extract_records(0, count).into_iter().enumerate() {
            root.insert_record_at(i, &rec, flags)?;
        }
        self.notify_records_moved(page_id, self.root_page_id, count);

        log::debug!(
            "lifted page {page_id} into the root of index {}; tree height now {}",
            self.index_id,
            level
        );

        mtr.put_page(root);
        mtr.free_page(segment_for(level), page_id);
        self.notify_page_discarded(page_id);
        for (doomed_id, doomed_level) in doomed {
            mtr.free_page(segment_for(doomed_level), doomed_id);
            self.notify_page_discarded(doomed_id);
        }
        Ok(())
    }

    /// A parent page that lost its last pointer leaves the tree too.
    fn handle_drained_father(&self, mtr: &mut MiniTransaction, father_id: PageId) -> TreeResult<()> {
        if father_id == self.root_page_id {
            return Err(TreeError::corrupt(
                father_id,
                "root drained while children remain",
            ));
        }
        self.discard_page_inner(mtr, father_id)
    }
}
