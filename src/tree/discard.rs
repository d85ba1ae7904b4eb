//! Page discard.
//!
//! A page that has drained completely is cut out of the tree: its node
//! pointer goes, its sibling links close over it, and the page returns
//! to the allocator. Discarding the last page of a level degenerates
//! into resetting the root to an empty leaf, since a level with one
//! empty page implies a single-pointer chain all the way up.

use crate::storage::PageId;
use crate::tree::link::{self, delete_node_pointer};
use crate::tree::node_ptr::node_pointer_child;
use crate::tree::{segment_for, MiniTransaction, Tree, TreeError, TreeResult, XLatchGuard};

impl Tree {
    /// Remove an empty non-root page from the tree.
    pub fn discard_page(
        &self,
        _guard: &XLatchGuard<'_>,
        mtr: &mut MiniTransaction,
        page_id: PageId,
    ) -> TreeResult<()> {
        self.discard_page_inner(mtr, page_id)
    }

    pub(crate) fn discard_page_inner(
        &self,
        mtr: &mut MiniTransaction,
        page_id: PageId,
    ) -> TreeResult<()> {
        if page_id == self.root_page_id {
            return Err(TreeError::corrupt(page_id, "cannot discard the root"));
        }

        let page = mtr.page_clone(page_id)?;
        debug_assert!(page.is_empty());

        if !page.has_siblings() {
            return self.discard_only_page_on_level(mtr, page_id);
        }

        let (father_id, father_slot) = self.father_of(mtr, page_id)?;
        let mut father = mtr.page_clone(father_id)?;
        delete_node_pointer(&mut father, father_slot)?;
        let father_drained = father.is_empty();

        // Discarding the leftmost page of a node pointer level makes the
        // right sibling leftmost; its first record takes over the
        // minimum mark.
        if page.prev_page_id().is_null() && page.level() > 0 {
            let mut right = mtr.page_clone(page.next_page_id())?;
            right.set_min_record(0, true);
            link::unlink(mtr, &page, None, Some(&mut right))?;
            mtr.put_page(right);
        } else {
            link::unlink(mtr, &page, None, None)?;
        }

        log::debug!("discarded page {page_id} at level {}", page.level());

        mtr.put_page(father);
        mtr.free_page(segment_for(page.level()), page_id);
        self.notify_page_discarded(page_id);

        if father_drained {
            if father_id == self.root_page_id {
                return Err(TreeError::corrupt(
                    father_id,
                    "root drained while children remain",
                ));
            }
            self.discard_page_inner(mtr, father_id)?;
            return Ok(());
        }

        // A father left holding a single pointer with no siblings keeps
        // the tree one level taller than its contents need; lift its
        // surviving child into the root.
        let survivor = {
            let father = mtr.page(father_id)?;
            if father.record_count() == 1 && !father.has_siblings() {
                Some(node_pointer_child(father.record(0)))
            } else {
                None
            }
        };
        if let Some(survivor) = survivor {
            self.lift_page_up(mtr, survivor)?;
        }
        Ok(())
    }

    /// The page is the only one on its level, so every level above holds
    /// a single pointer. Free the whole chain below the root and reset
    /// the root to an empty leaf.
    fn discard_only_page_on_level(
        &self,
        mtr: &mut MiniTransaction,
        page_id: PageId,
    ) -> TreeResult<()> {
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
            let level = ancestor.level();
            if cur != self.root_page_id {
                mtr.free_page(segment_for(level), cur);
                self.notify_page_discarded(cur);
            }
            cur = child;
        }

        let level = mtr.page(page_id)?.level();
        mtr.free_page(segment_for(level), page_id);
        self.notify_page_discarded(page_id);

        let mut root = mtr.page_clone(self.root_page_id)?;
        root.empty_page(0);
        mtr.put_page(root);

        log::debug!(
            "discarded the last page of index {}; root is an empty leaf again",
            self.index_id
        );
        Ok(())
    }
}
