//! Whole-index consistency checking.
//!
//! Validation walks the tree level by level under a shared latch and
//! accumulates every defect it can find rather than stopping at the
//! first, so one pass over a damaged index describes all of the damage.
//! A clean index yields an empty report.

use crate::storage::PageId;
use crate::tree::node_ptr::node_pointer_child;
use crate::tree::{Inconsistency, MiniTransaction, Tree, TreeResult};

impl Tree {
    /// Check every structural invariant of the index. Returns the list
    /// of inconsistencies found; an empty list means the index is sound.
    /// IO failures abort the walk and surface as errors.
    pub fn validate_index(&self) -> TreeResult<Vec<Inconsistency>> {
        let _latch = self.latch.lock_s();
        let mut mtr = self.begin();
        let mut issues = Vec::new();

        let root_level = mtr.page(self.root_page_id)?.level();

        // Children of the level above, in pointer order, with the parent
        // that filed each one.
        let mut filed: Option<Vec<(PageId, PageId)>> = None;

        for level in (0..=root_level).rev() {
            let start = match &filed {
                None => self.root_page_id,
                Some(children) => match children.first() {
                    Some((_, first_child)) => *first_child,
                    None => break,
                },
            };

            let chain = self.validate_level(&mut mtr, start, level, &mut issues)?;

            if let Some(children) = &filed {
                self.compare_filing(children, &chain, &mut issues);
            }

            if level > 0 {
                let mut next_filed = Vec::new();
                for page_id in &chain {
                    let page = mtr.page(*page_id)?;
                    for slot in 0..page.record_count() {
                        next_filed.push((*page_id, node_pointer_child(page.record(slot))));
                    }
                }
                filed = Some(next_filed);
            }
        }

        Ok(issues)
    }

    /// Walk one level left to right, checking per-page and cross-sibling
    /// invariants, and return the chain in order.
    fn validate_level(
        &self,
        mtr: &mut MiniTransaction,
        start: PageId,
        level: u32,
        issues: &mut Vec<Inconsistency>,
    ) -> TreeResult<Vec<PageId>> {
        let mut chain = Vec::new();
        let mut cur = start;
        let mut leftmost = true;

        loop {
            chain.push(cur);
            self.validate_page(mtr, cur, level, leftmost, issues)?;

            let (next, last_key) = {
                let page = mtr.page(cur)?;
                let last_key = if page.record_count() > 0 {
                    Some(page.record_key(page.record_count() - 1).to_vec())
                } else {
                    None
                };
                (page.next_page_id(), last_key)
            };

            if next.is_null() {
                break;
            }

            let next_page = mtr.page(next)?;
            if next_page.prev_page_id() != cur {
                issues.push(Inconsistency::BrokenSiblingLink {
                    page_id: cur,
                    sibling: next,
                    backlink: next_page.prev_page_id(),
                });
            }
            if let Some(last) = &last_key {
                if next_page.record_count() > 0
                    && !next_page.is_min_record(0)
                    && next_page.record_key(0) < last.as_slice()
                {
                    issues.push(Inconsistency::SiblingOrderViolation {
                        left: cur,
                        right: next,
                    });
                }
            }

            leftmost = false;
            cur = next;
        }

        Ok(chain)
    }

    fn validate_page(
        &self,
        mtr: &mut MiniTransaction,
        page_id: PageId,
        level: u32,
        leftmost: bool,
        issues: &mut Vec<Inconsistency>,
    ) -> TreeResult<()> {
        if self.allocator.is_free(page_id) {
            issues.push(Inconsistency::FreePageReachable { page_id });
        }

        let (count, page_level, page_index_id) = {
            let page = mtr.page(page_id)?;
            (page.record_count(), page.level(), page.index_id())
        };

        if page_index_id != self.index_id {
            issues.push(Inconsistency::ForeignPage {
                page_id,
                index_id: page_index_id,
            });
        }

        if page_level != level {
            issues.push(Inconsistency::LevelMismatch {
                page_id,
                expected: level,
                found: page_level,
            });
        }

        if count == 0 && page_id != self.root_page_id {
            issues.push(Inconsistency::EmptyPageRetained { page_id });
        }

        // Key order and minimum mark placement.
        for slot in 0..count {
            let page = mtr.page(page_id)?;
            let marked = page.is_min_record(slot);
            if marked && (level == 0 || slot > 0 || !leftmost) {
                issues.push(Inconsistency::MinRecordMarkUnexpected { page_id, slot });
            }
            if slot > 0 && !page.is_min_record(slot - 1) {
                let prev_key = page.record_key(slot - 1).to_vec();
                if prev_key.as_slice() > page.record_key(slot) {
                    issues.push(Inconsistency::KeyOrderViolation { page_id, slot });
                }
            }
        }
        if level > 0 && leftmost && count > 0 && !mtr.page(page_id)?.is_min_record(0) {
            issues.push(Inconsistency::MinRecordMarkMissing { page_id });
        }

        // Node pointers: children must sit one level down, keyed at or
        // above their routing key.
        if level > 0 {
            for slot in 0..count {
                let (child_id, ptr_key, marked) = {
                    let page = mtr.page(page_id)?;
                    (
                        node_pointer_child(page.record(slot)),
                        page.record_key(slot).to_vec(),
                        page.is_min_record(slot),
                    )
                };
                let child = mtr.page(child_id)?;
                if child.level() + 1 != level {
                    issues.push(Inconsistency::LevelMismatch {
                        page_id: child_id,
                        expected: level - 1,
                        found: child.level(),
                    });
                }
                if !marked
                    && child.record_count() > 0
                    && !child.is_min_record(0)
                    && child.record_key(0) < ptr_key.as_slice()
                {
                    issues.push(Inconsistency::NodePointerMismatch {
                        parent: page_id,
                        child: child_id,
                        detail: "child's first key is below its routing key".to_string(),
                    });
                }
            }
        }

        Ok(())
    }

    /// The children filed by the level above must be exactly the sibling
    /// chain, in order.
    fn compare_filing(
        &self,
        filed: &[(PageId, PageId)],
        chain: &[PageId],
        issues: &mut Vec<Inconsistency>,
    ) {
        for (i, (parent, child)) in filed.iter().enumerate() {
            match chain.get(i) {
                Some(actual) if actual == child => {}
                _ => {
                    issues.push(Inconsistency::NodePointerMismatch {
                        parent: *parent,
                        child: *child,
                        detail: format!("pointer {i} does not match the sibling chain"),
                    });
                    break;
                }
            }
        }
        for extra in chain.iter().skip(filed.len()) {
            issues.push(Inconsistency::UnfiledPage { page_id: *extra });
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::storage::buffer::lru::LruReplacer;
    use crate::storage::page::tree_page::TreePage;
    use crate::storage::{BufferPool, Journal, PageManager};
    use crate::tree::{Inconsistency, OrderedKeyCodec, Tree};
    use anyhow::Result;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn make_tree(dir: &TempDir) -> Result<Tree> {
        let pm = PageManager::create(&dir.path().join("tree.db"))?;
        let pool = BufferPool::new(pm, Box::new(LruReplacer::new(64)), 64);
        let journal = Arc::new(Journal::create(dir.path().join("journal.log"))?);
        Ok(Tree::create(pool, journal, 1, Box::new(OrderedKeyCodec))?)
    }

    fn fill(tree: &Tree, n: u32) -> Result<()> {
        for i in 0..n {
            let x = tree.latch.lock_x();
            let mut mtr = tree.begin();
            let mut rec = format!("{i:06}").into_bytes();
            rec.resize(120, b'x');
            tree.insert(&x, &mut mtr, &rec)?;
            mtr.commit()?;
        }
        Ok(())
    }

    #[test]
    fn test_clean_tree_reports_nothing() -> Result<()> {
        let dir = TempDir::new()?;
        let tree = make_tree(&dir)?;
        fill(&tree, 80)?;
        assert!(tree.validate_index()?.is_empty());
        Ok(())
    }

    #[test]
    fn test_damaged_stamps_are_reported() -> Result<()> {
        let dir = TempDir::new()?;
        let tree = make_tree(&dir)?;
        fill(&tree, 80)?;

        let leaf_id = {
            let _s = tree.latch.lock_s();
            let mut mtr = tree.begin();
            tree.search_to_leaf(&mut mtr, b"")?.page_id
        };

        // Clobber the leaf's level and index stamps behind the tree's back.
        {
            let mut guard = tree.buffer_pool.fetch_page_write(leaf_id)?;
            let mut page = TreePage::from_data(leaf_id, &guard);
            page.set_level(7);
            page.set_index_id(99);
            guard.copy_from_slice(page.data());
        }

        let issues = tree.validate_index()?;
        assert!(issues
            .iter()
            .any(|i| matches!(i, Inconsistency::ForeignPage { page_id, index_id: 99 } if *page_id == leaf_id)));
        assert!(issues
            .iter()
            .any(|i| matches!(i, Inconsistency::LevelMismatch { page_id, .. } if *page_id == leaf_id)));
        Ok(())
    }
}
