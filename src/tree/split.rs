//! Page splits.
//!
//! A split turns one full page into two half pages on the same level,
//! files the new half in the level above, and places the pending record
//! into whichever half it belongs to. The split point is chosen by three
//! heuristics in order:
//!
//! 1. ascending runs split just past the insert point, keeping one
//!    record on the left, so sequential loads fill pages almost full;
//! 2. descending runs split at the insert point;
//! 3. otherwise the page is split by accumulated record size, so both
//!    halves carry about half the bytes.
//!
//! After a failed placement the page is reorganized and retried; if the
//! record still does not fit the half is split again, from the second
//! attempt on always in the middle.

use crate::storage::page::tree_page::{
    TreePage, REC_MIN_FLAG, SLOT_SIZE, TREE_PAGE_HEADER_SIZE,
};
use crate::storage::{AllocDirection, PageId, StorageError, PAGE_SIZE};
use crate::tree::cursor::{RecordHandle, TreeCursor};
use crate::tree::node_ptr::{encode_node_pointer, node_pointer_child, repoint_node_pointer};
use crate::tree::{
    exhausted, link, segment_for, MiniTransaction, Tree, TreeError, TreeResult, XLatchGuard,
};

/// Which half of the key range the newly allocated page takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SplitSide {
    /// New page takes the upper half and sits to the right.
    Upper,
    /// New page takes the lower half and sits to the left.
    Lower,
}

#[derive(Debug, Clone, Copy)]
struct SplitPlan {
    /// First slot of the upper half.
    split_slot: usize,
    side: SplitSide,
    /// The pending record belongs in the upper half.
    insert_upper: bool,
}

impl Tree {
    /// Split the cursor's page and insert the record. The cursor is
    /// repositioned onto the record's final location.
    pub fn split_and_insert(
        &self,
        _guard: &XLatchGuard<'_>,
        mtr: &mut MiniTransaction,
        cursor: &mut TreeCursor,
        rec: &[u8],
    ) -> TreeResult<RecordHandle> {
        check_record_size(cursor.page_id, rec)?;
        let handle = self.split_any(mtr, cursor.page_id, cursor.slot, rec, 0)?;
        cursor.page_id = handle.page_id;
        cursor.slot = handle.slot;
        Ok(handle)
    }

    /// Grow the tree by one level: the root's records move to a fresh
    /// page, the emptied root files that page as its only child, and an
    /// ordinary split of the moved page places the record. The root page
    /// id never changes.
    pub fn root_raise_and_insert(
        &self,
        _guard: &XLatchGuard<'_>,
        mtr: &mut MiniTransaction,
        cursor: &mut TreeCursor,
        rec: &[u8],
    ) -> TreeResult<RecordHandle> {
        check_record_size(cursor.page_id, rec)?;
        let handle = self.root_raise_inner(mtr, cursor.slot, rec)?;
        cursor.page_id = handle.page_id;
        cursor.slot = handle.slot;
        Ok(handle)
    }

    fn root_raise_inner(
        &self,
        mtr: &mut MiniTransaction,
        slot: usize,
        rec: &[u8],
    ) -> TreeResult<RecordHandle> {
        let mut root = mtr.page_clone(self.root_page_id)?;
        let level = root.level();
        let count = root.record_count();
        debug_assert!(count > 0);

        // Allocation comes first; failure here leaves the tree intact.
        let mut moved_to = mtr
            .allocate_page(
                segment_for(level),
                AllocDirection::Any,
                self.root_page_id,
                self.index_id,
                level,
            )
            .map_err(|e| exhausted("root_raise_and_insert", e))?;

        for (moved_rec, flags) in root.extract_records(0, count) {
            let at = moved_to.record_count();
            moved_to.insert_record_at(at, &moved_rec, flags)?;
        }
        self.notify_records_moved(self.root_page_id, moved_to.page_id, count);

        root.empty_page(level + 1);
        let ptr = encode_node_pointer(&self.route_key_for(&moved_to), moved_to.page_id);
        root.insert_record_at(0, &ptr, REC_MIN_FLAG)?;

        log::debug!(
            "root raise: index {} now level {}, old contents on page {}",
            self.index_id,
            level + 1,
            moved_to.page_id
        );

        let moved_to_id = moved_to.page_id;
        mtr.put_page(root);
        mtr.put_page(moved_to);

        // The moved page is as full as the root was; split it normally.
        self.split_any(mtr, moved_to_id, slot, rec, 0)
    }

    /// Split a non-root page (root pages are raised instead) and insert
    /// the record, recursing when a half still cannot take it.
    pub(crate) fn split_any(
        &self,
        mtr: &mut MiniTransaction,
        page_id: PageId,
        slot: usize,
        rec: &[u8],
        n_iterations: u32,
    ) -> TreeResult<RecordHandle> {
        if page_id == self.root_page_id {
            return self.root_raise_inner(mtr, slot, rec);
        }

        let page = mtr.page_clone(page_id)?;
        let level = page.level();

        if n_iterations == 0 && level == 0 {
            if let Some(handle) = self.try_insert_into_right_sibling(mtr, &page, slot, rec)? {
                return Ok(handle);
            }
        }

        let plan = choose_split(&page, slot, rec, n_iterations);
        let (direction, hint) = match plan.side {
            SplitSide::Upper => (AllocDirection::Up, PageId(page_id.0 + 1)),
            SplitSide::Lower => (AllocDirection::Down, PageId(page_id.0.saturating_sub(1))),
        };

        // Resolve the father before mutating anything; for a lower-side
        // split its pointer will be redirected to the new page.
        let father = match plan.side {
            SplitSide::Lower => Some(self.father_of(mtr, page_id)?),
            SplitSide::Upper => None,
        };

        let mut new_page = mtr
            .allocate_page(segment_for(level), direction, hint, self.index_id, level)
            .map_err(|e| exhausted("split_and_insert", e))?;

        log::debug!(
            "splitting page {} at slot {} ({:?} side, new page {}, attempt {})",
            page_id,
            plan.split_slot,
            plan.side,
            new_page.page_id,
            n_iterations
        );

        let mut page = page;
        let count = page.record_count();
        let had_min_mark = level > 0 && count > 0 && page.is_min_record(0);

        let (moved_from, moved_to) = (page.page_id, new_page.page_id);
        match plan.side {
            SplitSide::Upper => {
                for (moved_rec, flags) in page.extract_records(plan.split_slot, count) {
                    let at = new_page.record_count();
                    new_page.insert_record_at(at, &moved_rec, flags)?;
                }
                page.delete_range(plan.split_slot, count)?;
                link::link_after(mtr, &mut page, &mut new_page)?;
            }
            SplitSide::Lower => {
                for (moved_rec, flags) in page.extract_records(0, plan.split_slot) {
                    let at = new_page.record_count();
                    new_page.insert_record_at(at, &moved_rec, flags)?;
                }
                page.delete_range(0, plan.split_slot)?;
                link::link_before(mtr, &mut page, &mut new_page)?;
            }
        }
        self.notify_records_moved(moved_from, moved_to, match plan.side {
            SplitSide::Upper => count - plan.split_slot,
            SplitSide::Lower => plan.split_slot,
        });

        page.reset_last_insert();
        new_page.reset_last_insert();

        // The minimum mark stays with whichever half is now leftmost.
        let (mut lower, mut upper) = match plan.side {
            SplitSide::Upper => (page, new_page),
            SplitSide::Lower => (new_page, page),
        };
        if had_min_mark {
            if upper.record_count() > 0 && upper.is_min_record(0) {
                upper.set_min_record(0, false);
            }
            if lower.record_count() > 0 {
                lower.set_min_record(0, true);
            }
        }

        // File the halves in the level above. An upper-side split keeps
        // the father pointer on the old page and adds one for the new
        // upper half; a lower-side split redirects the father pointer to
        // the new lower half first.
        let upper_ptr = if plan.insert_upper && slot == plan.split_slot {
            // The pending record will lead the upper half; file the page
            // under its key, not under the record it is about to displace.
            encode_node_pointer(&self.codec.route_key(rec, level), upper.page_id)
        } else {
            debug_assert!(upper.record_count() > 0);
            encode_node_pointer(&self.route_key_for(&upper), upper.page_id)
        };
        let lower_id = lower.page_id;
        let upper_id = upper.page_id;
        mtr.put_page(lower);
        mtr.put_page(upper);

        if let Some((father_id, father_slot)) = father {
            let mut father_page = mtr.page_clone(father_id)?;
            let mut ptr_rec = father_page.record(father_slot).to_vec();
            debug_assert_eq!(node_pointer_child(&ptr_rec), page_id);
            repoint_node_pointer(&mut ptr_rec, lower_id);
            father_page.overwrite_record(father_slot, &ptr_rec)?;
            mtr.put_page(father_page);
        }
        self.insert_node_pointer(mtr, level + 1, &upper_ptr)?;

        // Place the record, reorganize-and-retry, and as a last resort
        // split the half it belongs to again.
        let (target_id, target_slot) = if plan.insert_upper {
            (upper_id, slot - plan.split_slot)
        } else {
            (lower_id, slot)
        };
        let mut target = mtr.page_clone(target_id)?;
        match target.insert_record_at(target_slot, rec, 0) {
            Ok(()) => {
                mtr.put_page(target);
                Ok(RecordHandle {
                    page_id: target_id,
                    slot: target_slot,
                })
            }
            Err(StorageError::PageFull { .. }) => {
                if target.free_space_after_reorganize() >= rec.len() + SLOT_SIZE {
                    target.reorganize();
                    target.insert_record_at(target_slot, rec, 0)?;
                    mtr.put_page(target);
                    return Ok(RecordHandle {
                        page_id: target_id,
                        slot: target_slot,
                    });
                }
                drop(target);
                self.split_any(mtr, target_id, target_slot, rec, n_iterations + 1)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Fast path for rightward-growing workloads: a record that would go
    /// past the end of a full leaf can often just become the first
    /// record of the right sibling, at the cost of refiling that sibling
    /// under its new key. Returns None when any precondition fails and
    /// the ordinary split should run.
    fn try_insert_into_right_sibling(
        &self,
        mtr: &mut MiniTransaction,
        page: &TreePage,
        slot: usize,
        rec: &[u8],
    ) -> TreeResult<Option<RecordHandle>> {
        if slot < page.record_count() || page.next_page_id().is_null() {
            return Ok(None);
        }
        let next_id = page.next_page_id();
        let mut next = mtr.page_clone(next_id)?;
        let needed = rec.len() + SLOT_SIZE;
        if next.free_space_after_reorganize() < needed {
            return Ok(None);
        }

        // The sibling's routing key changes; make sure its father can
        // take the replacement pointer before touching anything.
        let (father_id, father_slot) = self.father_of(mtr, next_id)?;
        let new_ptr = encode_node_pointer(&self.codec.route_key(rec, 0), next_id);
        let mut father = mtr.page_clone(father_id)?;
        let old_ptr_len = father.record(father_slot).len();
        let reclaimed = old_ptr_len + SLOT_SIZE;
        if father.free_space_after_reorganize() + reclaimed < new_ptr.len() + SLOT_SIZE {
            return Ok(None);
        }

        if next.free_space() < needed {
            next.reorganize();
        }
        next.insert_record_at(0, rec, 0)?;

        father.delete_record(father_slot)?;
        if father.free_space() < new_ptr.len() + SLOT_SIZE {
            father.reorganize();
        }
        father.insert_sorted(&new_ptr, 0)?;

        log::debug!(
            "insert past end of page {} went to right sibling {}",
            page.page_id,
            next_id
        );

        mtr.put_page(next);
        mtr.put_page(father);
        Ok(Some(RecordHandle {
            page_id: next_id,
            slot: 0,
        }))
    }

    /// Insert a node pointer at the given level, splitting the target
    /// page (or raising the root) when it is full.
    pub(crate) fn insert_node_pointer(
        &self,
        mtr: &mut MiniTransaction,
        level: u32,
        ptr_rec: &[u8],
    ) -> TreeResult<()> {
        let key = &ptr_rec[..ptr_rec.len() - 8];

        let mut cur = self.root_page_id;
        loop {
            let page = mtr.page(cur)?;
            if page.level() < level {
                return Err(TreeError::corrupt(cur, "descent passed the target level"));
            }
            if page.level() == level {
                break;
            }
            if page.record_count() == 0 {
                return Err(TreeError::corrupt(cur, "empty non-leaf page on descent"));
            }
            let slot = page.child_slot_for(key);
            cur = node_pointer_child(page.record(slot));
        }

        let mut page = mtr.page_clone(cur)?;
        let slot = page.lower_bound(key);
        match page.insert_record_at(slot, ptr_rec, 0) {
            Ok(()) => {
                mtr.put_page(page);
                Ok(())
            }
            Err(StorageError::PageFull { .. }) => {
                if page.free_space_after_reorganize() >= ptr_rec.len() + SLOT_SIZE {
                    page.reorganize();
                    page.insert_record_at(slot, ptr_rec, 0)?;
                    mtr.put_page(page);
                    return Ok(());
                }
                drop(page);
                self.split_any(mtr, cur, slot, ptr_rec, 0)?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Pick the split point. `slot` is where the record would go on the
/// unsplit page.
fn choose_split(page: &TreePage, slot: usize, rec: &[u8], n_iterations: u32) -> SplitPlan {
    let count = page.record_count();

    // Repeat splits stop guessing and cut in the middle. A one-record
    // page has no middle; the new record takes a page of its own.
    if n_iterations > 0 {
        return if count >= 2 {
            let split_slot = count / 2;
            SplitPlan {
                split_slot,
                side: SplitSide::Upper,
                insert_upper: slot >= split_slot,
            }
        } else if slot == 0 {
            SplitPlan {
                split_slot: 0,
                side: SplitSide::Lower,
                insert_upper: false,
            }
        } else {
            SplitPlan {
                split_slot: count,
                side: SplitSide::Upper,
                insert_upper: true,
            }
        };
    }

    // Ascending run: the insert point is right after the previous
    // insert. Keep one record past the insert point on the left so the
    // left page stays nearly full.
    if slot >= 1 && page.last_insert_slot() == Some(slot - 1) {
        return if slot + 1 >= count {
            // Nothing (or one record) follows; the new record leads the
            // upper half.
            SplitPlan {
                split_slot: slot,
                side: SplitSide::Upper,
                insert_upper: true,
            }
        } else {
            SplitPlan {
                split_slot: slot + 1,
                side: SplitSide::Upper,
                insert_upper: false,
            }
        };
    }

    // Descending run: repeated inserts at the same slot.
    if page.last_insert_slot() == Some(slot) {
        return if slot >= 2 {
            SplitPlan {
                split_slot: slot - 1,
                side: SplitSide::Lower,
                insert_upper: true,
            }
        } else {
            SplitPlan {
                split_slot: slot,
                side: SplitSide::Lower,
                insert_upper: false,
            }
        };
    }

    // Size-balanced: walk the would-be record sequence until half the
    // bytes are behind us.
    let total: usize = page.records_data_size() + rec.len() + (count + 1) * SLOT_SIZE;
    let half = total / 2;
    let mut acc = 0;
    let mut virt = 0; // index in the sequence with the new record at `slot`
    while virt < count + 1 {
        let len = if virt == slot {
            rec.len()
        } else {
            let old = if virt < slot { virt } else { virt - 1 };
            page.record(old).len()
        };
        acc += len + SLOT_SIZE;
        if acc > half {
            break;
        }
        virt += 1;
    }
    // The upper half starts at the record that crossed the midpoint.
    let split_virt = virt.min(count);

    if split_virt <= slot {
        let split_slot = split_virt.max(1);
        SplitPlan {
            split_slot,
            side: SplitSide::Upper,
            insert_upper: slot >= split_slot,
        }
    } else {
        // Map the virtual index back to a slot on the unsplit page; the
        // new record stays in the lower half.
        SplitPlan {
            split_slot: (split_virt - 1).max(1),
            side: SplitSide::Upper,
            insert_upper: false,
        }
    }
}

fn check_record_size(page_id: PageId, rec: &[u8]) -> TreeResult<()> {
    if rec.len() + SLOT_SIZE > PAGE_SIZE - TREE_PAGE_HEADER_SIZE {
        return Err(TreeError::corrupt(
            page_id,
            format!("record of {} bytes cannot fit any page", rec.len()),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page_with(keys: &[&[u8]]) -> TreePage {
        let mut page = TreePage::new(PageId(1), 1, 0);
        for key in keys {
            page.insert_sorted(key, 0).unwrap();
        }
        page
    }

    #[test]
    fn test_ascending_run_splits_past_insert_point() {
        // Sequential inserts: last insert at slot 3, new record at 4.
        let page = page_with(&[b"a", b"b", b"c", b"d", b"e", b"f"]);
        // Simulate the run by inserting in order: last_insert_slot is 5.
        let plan = choose_split(&page, 6, b"g", 0);
        assert_eq!(plan.side, SplitSide::Upper);
        assert!(plan.insert_upper);
        assert_eq!(plan.split_slot, 6);
    }

    #[test]
    fn test_ascending_mid_page_keeps_one_record_left() {
        let mut page = TreePage::new(PageId(1), 1, 0);
        for key in [b"a".as_ref(), b"b", b"c", b"x", b"y", b"z"] {
            page.insert_sorted(key, 0).unwrap();
        }
        // Force the tracked run: insert "d" (slot 3), then plan "e" (slot 4).
        page.insert_sorted(b"d", 0).unwrap();
        assert_eq!(page.last_insert_slot(), Some(3));
        let plan = choose_split(&page, 4, b"e", 0);
        assert_eq!(plan.side, SplitSide::Upper);
        assert_eq!(plan.split_slot, 5);
        assert!(!plan.insert_upper);
    }

    #[test]
    fn test_descending_run_splits_at_insert_point() {
        let mut page = TreePage::new(PageId(1), 1, 0);
        for key in [b"z".as_ref(), b"y", b"x", b"w"] {
            page.insert_sorted(key, 0).unwrap();
        }
        assert_eq!(page.last_insert_slot(), Some(0));
        let plan = choose_split(&page, 0, b"v", 0);
        assert_eq!(plan.side, SplitSide::Lower);
        assert!(!plan.insert_upper);
        assert_eq!(plan.split_slot, 0);
    }

    #[test]
    fn test_size_balanced_split_near_middle() {
        let mut page = TreePage::new(PageId(1), 1, 0);
        for i in 0..10u8 {
            page.insert_sorted(&[i; 50], 0).unwrap();
        }
        page.reset_last_insert();
        let plan = choose_split(&page, 3, &[3u8; 50], 0);
        // Even records: the split lands close to the middle.
        assert!(plan.split_slot >= 4 && plan.split_slot <= 7, "{plan:?}");
    }

    #[test]
    fn test_desperate_split_is_middle() {
        let page = page_with(&[b"a", b"b", b"c", b"d"]);
        let plan = choose_split(&page, 4, b"e", 1);
        assert_eq!(plan.split_slot, 2);
        assert!(plan.insert_upper);
    }
}
