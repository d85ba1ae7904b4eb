//! Slotted page format for tree pages.
//!
//! Every page of an index, leaf or not, uses the same layout: a 64-byte
//! header, a slot directory growing up from the header, and a record heap
//! growing down from the end of the page. Records are opaque byte ranges;
//! the tree core only copies, deletes, and splits them at slot boundaries.
//!
//! Header layout (little endian):
//!
//! ```text
//! off size field
//!   0    1 page_type (0x03)
//!   1    1 reserved
//!   2    2 lower (end of slot directory)
//!   4    2 upper (start of record heap)
//!   6    2 record_count
//!   8    8 index_id
//!  16    4 level (0 = leaf)
//!  20    8 prev_page_id
//!  28    8 next_page_id
//!  36    2 last_insert_slot (0xFFFF = none)
//!  38    1 insert_direction (0 none / 1 right / 2 left)
//!  39    1 reserved
//!  40    2 n_direction
//!  42    8 leaf segment header (root page only)
//!  50    8 top segment header (root page only)
//!  58    6 reserved
//! ```
//!
//! Each slot is 6 bytes: record offset, record length, flags. Flag bit 0
//! marks the distinguished minimum record, which compares below every key.

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::{PageId, NULL_PAGE_ID};
use crate::storage::PAGE_SIZE;
use byteorder::{ByteOrder, LittleEndian};
use std::cmp::Ordering;

pub const TREE_PAGE_TYPE: u8 = 0x03;
pub const TREE_PAGE_HEADER_SIZE: usize = 64;
pub const SLOT_SIZE: usize = 6;

/// Flag bit marking the minimum record of a level.
pub const REC_MIN_FLAG: u16 = 0x0001;

/// Sentinel for "no last insert recorded".
const NO_LAST_INSERT: u16 = 0xFFFF;

/// Direction of the most recent run of inserts on a page; feeds the
/// split-point heuristics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertDirection {
    None,
    Right,
    Left,
}

impl InsertDirection {
    fn to_byte(self) -> u8 {
        match self {
            InsertDirection::None => 0,
            InsertDirection::Right => 1,
            InsertDirection::Left => 2,
        }
    }

    fn from_byte(b: u8) -> Self {
        match b {
            1 => InsertDirection::Right,
            2 => InsertDirection::Left,
            _ => InsertDirection::None,
        }
    }
}

/// An in-memory working copy of one tree page.
///
/// Mutations happen on the copy; the mini-transaction writes the image
/// back when the operation commits.
#[derive(Clone)]
pub struct TreePage {
    pub page_id: PageId,
    data: [u8; PAGE_SIZE],
}

impl TreePage {
    /// Initialize a fresh page at the given level.
    pub fn new(page_id: PageId, index_id: u64, level: u32) -> Self {
        let mut page = Self {
            page_id,
            data: [0u8; PAGE_SIZE],
        };
        page.data[0] = TREE_PAGE_TYPE;
        page.set_lower(TREE_PAGE_HEADER_SIZE as u16);
        page.set_upper(PAGE_SIZE as u16);
        page.set_record_count(0);
        page.set_index_id(index_id);
        page.set_level(level);
        page.set_prev_page_id(NULL_PAGE_ID);
        page.set_next_page_id(NULL_PAGE_ID);
        page.reset_last_insert();
        page
    }

    pub fn from_data(page_id: PageId, data: &[u8; PAGE_SIZE]) -> Self {
        Self {
            page_id,
            data: *data,
        }
    }

    pub fn data(&self) -> &[u8; PAGE_SIZE] {
        &self.data
    }

    pub fn is_tree_page(&self) -> bool {
        self.data[0] == TREE_PAGE_TYPE
    }

    // Header accessors.

    fn lower(&self) -> u16 {
        LittleEndian::read_u16(&self.data[2..4])
    }

    fn set_lower(&mut self, val: u16) {
        LittleEndian::write_u16(&mut self.data[2..4], val);
    }

    fn upper(&self) -> u16 {
        LittleEndian::read_u16(&self.data[4..6])
    }

    fn set_upper(&mut self, val: u16) {
        LittleEndian::write_u16(&mut self.data[4..6], val);
    }

    pub fn record_count(&self) -> usize {
        LittleEndian::read_u16(&self.data[6..8]) as usize
    }

    fn set_record_count(&mut self, val: u16) {
        LittleEndian::write_u16(&mut self.data[6..8], val);
    }

    pub fn index_id(&self) -> u64 {
        LittleEndian::read_u64(&self.data[8..16])
    }

    pub fn set_index_id(&mut self, val: u64) {
        LittleEndian::write_u64(&mut self.data[8..16], val);
    }

    pub fn level(&self) -> u32 {
        LittleEndian::read_u32(&self.data[16..20])
    }

    pub fn set_level(&mut self, val: u32) {
        LittleEndian::write_u32(&mut self.data[16..20], val);
    }

    pub fn is_leaf(&self) -> bool {
        self.level() == 0
    }

    pub fn prev_page_id(&self) -> PageId {
        PageId(LittleEndian::read_u64(&self.data[20..28]))
    }

    pub fn set_prev_page_id(&mut self, val: PageId) {
        LittleEndian::write_u64(&mut self.data[20..28], val.0);
    }

    pub fn next_page_id(&self) -> PageId {
        PageId(LittleEndian::read_u64(&self.data[28..36]))
    }

    pub fn set_next_page_id(&mut self, val: PageId) {
        LittleEndian::write_u64(&mut self.data[28..36], val.0);
    }

    pub fn has_siblings(&self) -> bool {
        !self.prev_page_id().is_null() || !self.next_page_id().is_null()
    }

    pub fn last_insert_slot(&self) -> Option<usize> {
        let raw = LittleEndian::read_u16(&self.data[36..38]);
        if raw == NO_LAST_INSERT {
            None
        } else {
            Some(raw as usize)
        }
    }

    pub fn insert_direction(&self) -> InsertDirection {
        InsertDirection::from_byte(self.data[38])
    }

    pub fn n_direction(&self) -> u16 {
        LittleEndian::read_u16(&self.data[40..42])
    }

    pub fn reset_last_insert(&mut self) {
        LittleEndian::write_u16(&mut self.data[36..38], NO_LAST_INSERT);
        self.data[38] = InsertDirection::None.to_byte();
        LittleEndian::write_u16(&mut self.data[40..42], 0);
    }

    /// Segment headers live only on the root page; on every other page
    /// these bytes stay zero.
    pub fn leaf_segment(&self) -> u64 {
        LittleEndian::read_u64(&self.data[42..50])
    }

    pub fn set_leaf_segment(&mut self, val: u64) {
        LittleEndian::write_u64(&mut self.data[42..50], val);
    }

    pub fn top_segment(&self) -> u64 {
        LittleEndian::read_u64(&self.data[50..58])
    }

    pub fn set_top_segment(&mut self, val: u64) {
        LittleEndian::write_u64(&mut self.data[50..58], val);
    }

    // Slot directory.

    fn slot_offset(&self, slot: usize) -> usize {
        TREE_PAGE_HEADER_SIZE + slot * SLOT_SIZE
    }

    fn slot_fields(&self, slot: usize) -> (usize, usize, u16) {
        let off = self.slot_offset(slot);
        let rec_offset = LittleEndian::read_u16(&self.data[off..off + 2]) as usize;
        let rec_len = LittleEndian::read_u16(&self.data[off + 2..off + 4]) as usize;
        let flags = LittleEndian::read_u16(&self.data[off + 4..off + 6]);
        (rec_offset, rec_len, flags)
    }

    fn write_slot(&mut self, slot: usize, rec_offset: u16, rec_len: u16, flags: u16) {
        let off = self.slot_offset(slot);
        LittleEndian::write_u16(&mut self.data[off..off + 2], rec_offset);
        LittleEndian::write_u16(&mut self.data[off + 2..off + 4], rec_len);
        LittleEndian::write_u16(&mut self.data[off + 4..off + 6], flags);
    }

    pub fn record(&self, slot: usize) -> &[u8] {
        let (off, len, _) = self.slot_fields(slot);
        &self.data[off..off + len]
    }

    pub fn record_flags(&self, slot: usize) -> u16 {
        self.slot_fields(slot).2
    }

    pub fn is_min_record(&self, slot: usize) -> bool {
        self.record_flags(slot) & REC_MIN_FLAG != 0
    }

    pub fn set_min_record(&mut self, slot: usize, min: bool) {
        let (off, len, flags) = self.slot_fields(slot);
        let flags = if min {
            flags | REC_MIN_FLAG
        } else {
            flags & !REC_MIN_FLAG
        };
        self.write_slot(slot, off as u16, len as u16, flags);
    }

    /// The comparable key of a record. On non-leaf pages the trailing
    /// child page id is not part of the key.
    pub fn record_key(&self, slot: usize) -> &[u8] {
        let rec = self.record(slot);
        if self.is_leaf() {
            rec
        } else {
            &rec[..rec.len() - 8]
        }
    }

    /// Key bytes of a record that is about to be inserted into this page.
    pub fn key_of<'a>(&self, rec: &'a [u8]) -> &'a [u8] {
        if self.is_leaf() {
            rec
        } else {
            &rec[..rec.len() - 8]
        }
    }

    fn compare_slot(&self, slot: usize, key: &[u8]) -> Ordering {
        if self.is_min_record(slot) {
            Ordering::Less
        } else {
            self.record_key(slot).cmp(key)
        }
    }

    /// First slot whose key is >= the given key.
    pub fn lower_bound(&self, key: &[u8]) -> usize {
        let mut lo = 0;
        let mut hi = self.record_count();
        while lo < hi {
            let mid = (lo + hi) / 2;
            if self.compare_slot(mid, key) == Ordering::Less {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }

    /// Slot of the node pointer whose subtree covers the key: the last
    /// slot comparing <= key. Slot 0 (the minimum record) covers
    /// everything below the second pointer.
    pub fn child_slot_for(&self, key: &[u8]) -> usize {
        let lb = self.lower_bound(key);
        if lb < self.record_count() && self.compare_slot(lb, key) == Ordering::Equal {
            lb
        } else {
            lb.saturating_sub(1)
        }
    }

    // Space accounting.

    /// Contiguous free bytes between the slot directory and the heap.
    pub fn free_space(&self) -> usize {
        self.upper() as usize - self.lower() as usize
    }

    /// Bytes occupied by live records.
    pub fn records_data_size(&self) -> usize {
        (0..self.record_count())
            .map(|slot| self.slot_fields(slot).1)
            .sum()
    }

    /// Free space the page would have after compacting the heap.
    pub fn free_space_after_reorganize(&self) -> usize {
        PAGE_SIZE
            - TREE_PAGE_HEADER_SIZE
            - self.record_count() * SLOT_SIZE
            - self.records_data_size()
    }

    /// Bytes a set of records would occupy here, slots included.
    pub fn occupied_by(records_bytes: usize, n_records: usize) -> usize {
        records_bytes + n_records * SLOT_SIZE
    }

    pub fn is_empty(&self) -> bool {
        self.record_count() == 0
    }

    // Mutation.

    /// Insert a record at the given slot position, shifting later slots.
    pub fn insert_record_at(&mut self, slot: usize, rec: &[u8], flags: u16) -> StorageResult<()> {
        let count = self.record_count();
        if slot > count {
            return Err(StorageError::InvalidSlot {
                page_id: self.page_id,
                slot,
                record_count: count,
            });
        }

        let required = rec.len() + SLOT_SIZE;
        if self.free_space() < required {
            return Err(StorageError::PageFull {
                page_id: self.page_id,
                required,
                available: self.free_space(),
            });
        }

        // Claim heap space for the record.
        let new_upper = self.upper() as usize - rec.len();
        self.data[new_upper..new_upper + rec.len()].copy_from_slice(rec);
        self.set_upper(new_upper as u16);

        // Open a gap in the slot directory.
        let slot_start = self.slot_offset(slot);
        let lower = self.lower() as usize;
        self.data.copy_within(slot_start..lower, slot_start + SLOT_SIZE);
        self.write_slot(slot, new_upper as u16, rec.len() as u16, flags);
        self.set_lower((lower + SLOT_SIZE) as u16);
        self.set_record_count((count + 1) as u16);

        self.note_insert(slot);
        Ok(())
    }

    /// Insert a record at its key-ordered position.
    pub fn insert_sorted(&mut self, rec: &[u8], flags: u16) -> StorageResult<usize> {
        let key = self.key_of(rec).to_vec();
        let slot = self.lower_bound(&key);
        self.insert_record_at(slot, rec, flags)?;
        Ok(slot)
    }

    /// Track the last insert position and the direction run, for the
    /// sequential-insert split heuristics.
    fn note_insert(&mut self, slot: usize) {
        let direction = match self.last_insert_slot() {
            Some(last) if slot == last + 1 => InsertDirection::Right,
            Some(last) if slot == last => InsertDirection::Left,
            _ => InsertDirection::None,
        };
        let n = if direction != InsertDirection::None && direction == self.insert_direction() {
            self.n_direction().saturating_add(1)
        } else {
            1
        };
        LittleEndian::write_u16(&mut self.data[36..38], slot as u16);
        self.data[38] = direction.to_byte();
        LittleEndian::write_u16(&mut self.data[40..42], n);
    }

    /// Replace a record's bytes in place. The new record must have the
    /// same length; flags are untouched.
    pub fn overwrite_record(&mut self, slot: usize, rec: &[u8]) -> StorageResult<()> {
        let count = self.record_count();
        if slot >= count {
            return Err(StorageError::InvalidSlot {
                page_id: self.page_id,
                slot,
                record_count: count,
            });
        }
        let (off, len, _) = self.slot_fields(slot);
        debug_assert_eq!(len, rec.len());
        self.data[off..off + len].copy_from_slice(rec);
        Ok(())
    }

    /// Delete one record. The heap space is not reclaimed until the next
    /// reorganize.
    pub fn delete_record(&mut self, slot: usize) -> StorageResult<()> {
        let count = self.record_count();
        if slot >= count {
            return Err(StorageError::InvalidSlot {
                page_id: self.page_id,
                slot,
                record_count: count,
            });
        }

        let (rec_offset, rec_len, _) = self.slot_fields(slot);

        // If the record sits at the heap boundary its space can be
        // returned directly.
        if rec_offset == self.upper() as usize {
            self.set_upper((rec_offset + rec_len) as u16);
        }

        let slot_start = self.slot_offset(slot);
        let lower = self.lower() as usize;
        self.data.copy_within(slot_start + SLOT_SIZE..lower, slot_start);
        self.set_lower((lower - SLOT_SIZE) as u16);
        self.set_record_count((count - 1) as u16);
        self.reset_last_insert();
        Ok(())
    }

    /// Copy out records `[from, to)` together with their flags.
    pub fn extract_records(&self, from: usize, to: usize) -> Vec<(Vec<u8>, u16)> {
        (from..to)
            .map(|slot| (self.record(slot).to_vec(), self.record_flags(slot)))
            .collect()
    }

    /// Delete records `[from, to)`.
    pub fn delete_range(&mut self, from: usize, to: usize) -> StorageResult<()> {
        for _ in from..to {
            self.delete_record(from)?;
        }
        Ok(())
    }

    /// Compact the record heap, preserving slot order. Frees the holes
    /// left behind by deleted records.
    pub fn reorganize(&mut self) {
        let records: Vec<(Vec<u8>, u16)> = self.extract_records(0, self.record_count());
        let index_id = self.index_id();
        let level = self.level();
        let prev = self.prev_page_id();
        let next = self.next_page_id();
        let leaf_seg = self.leaf_segment();
        let top_seg = self.top_segment();
        let last_insert = LittleEndian::read_u16(&self.data[36..38]);
        let dir = self.data[38];
        let n_dir = self.n_direction();

        let mut fresh = TreePage::new(self.page_id, index_id, level);
        fresh.set_prev_page_id(prev);
        fresh.set_next_page_id(next);
        fresh.set_leaf_segment(leaf_seg);
        fresh.set_top_segment(top_seg);
        for (i, (rec, flags)) in records.iter().enumerate() {
            // Space cannot run out: the same records fit before.
            fresh
                .insert_record_at(i, rec, *flags)
                .unwrap_or_else(|_| unreachable!("reorganize grew the page"));
        }
        LittleEndian::write_u16(&mut fresh.data[36..38], last_insert);
        fresh.data[38] = dir;
        LittleEndian::write_u16(&mut fresh.data[40..42], n_dir);
        self.data = fresh.data;
    }

    /// Drop every record, keeping the header (and so the root's segment
    /// entries) intact, and set the new level.
    pub fn empty_page(&mut self, level: u32) {
        self.set_lower(TREE_PAGE_HEADER_SIZE as u16);
        self.set_upper(PAGE_SIZE as u16);
        self.set_record_count(0);
        self.set_level(level);
        self.reset_last_insert();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(page_id: u64) -> TreePage {
        TreePage::new(PageId(page_id), 7, 0)
    }

    #[test]
    fn test_new_page_header() {
        let page = leaf(1);
        assert!(page.is_tree_page());
        assert!(page.is_leaf());
        assert_eq!(page.index_id(), 7);
        assert_eq!(page.record_count(), 0);
        assert!(page.prev_page_id().is_null());
        assert!(page.next_page_id().is_null());
        assert_eq!(page.free_space(), PAGE_SIZE - TREE_PAGE_HEADER_SIZE);
    }

    #[test]
    fn test_insert_sorted_orders_records() {
        let mut page = leaf(1);
        page.insert_sorted(b"mango", 0).unwrap();
        page.insert_sorted(b"apple", 0).unwrap();
        page.insert_sorted(b"zebra", 0).unwrap();

        assert_eq!(page.record(0), b"apple");
        assert_eq!(page.record(1), b"mango");
        assert_eq!(page.record(2), b"zebra");
    }

    #[test]
    fn test_lower_bound() {
        let mut page = leaf(1);
        for key in [b"bb".as_ref(), b"dd", b"ff"] {
            page.insert_sorted(key, 0).unwrap();
        }

        assert_eq!(page.lower_bound(b"aa"), 0);
        assert_eq!(page.lower_bound(b"bb"), 0);
        assert_eq!(page.lower_bound(b"cc"), 1);
        assert_eq!(page.lower_bound(b"ff"), 2);
        assert_eq!(page.lower_bound(b"zz"), 3);
    }

    #[test]
    fn test_min_record_compares_below_everything() {
        let mut page = TreePage::new(PageId(1), 7, 1);
        let mut rec = b"zz".to_vec();
        rec.extend_from_slice(&[0u8; 8]);
        page.insert_sorted(&rec, REC_MIN_FLAG).unwrap();

        let mut rec2 = b"mm".to_vec();
        rec2.extend_from_slice(&[0u8; 8]);
        page.insert_sorted(&rec2, 0).unwrap();

        // The marked record stays first despite its larger key.
        assert!(page.is_min_record(0));
        assert_eq!(page.record_key(0), b"zz");
        assert_eq!(page.record_key(1), b"mm");
        assert_eq!(page.child_slot_for(b"aa"), 0);
        assert_eq!(page.child_slot_for(b"mm"), 1);
        assert_eq!(page.child_slot_for(b"zz"), 1);
    }

    #[test]
    fn test_delete_and_reorganize_reclaims_space() {
        let mut page = leaf(1);
        for i in 0..10u32 {
            let rec = vec![i as u8; 100];
            page.insert_sorted(&rec, 0).unwrap();
        }
        let free_before = page.free_space();

        // Delete a record from the middle: contiguous free space does
        // not grow until reorganize.
        page.delete_record(5).unwrap();
        assert_eq!(page.record_count(), 9);
        assert_eq!(page.free_space(), free_before + SLOT_SIZE);

        page.reorganize();
        assert_eq!(page.record_count(), 9);
        assert_eq!(page.free_space(), free_before + SLOT_SIZE + 100);
    }

    #[test]
    fn test_page_full() {
        let mut page = leaf(1);
        let rec = vec![0u8; 1000];
        page.insert_sorted(&rec, 0).unwrap();
        page.insert_sorted(&rec, 0).unwrap();
        page.insert_sorted(&rec, 0).unwrap();
        let res = page.insert_sorted(&vec![0u8; 1500], 0);
        assert!(matches!(res, Err(StorageError::PageFull { .. })));
    }

    #[test]
    fn test_insert_direction_tracking() {
        let mut page = leaf(1);
        page.insert_sorted(b"a", 0).unwrap();
        page.insert_sorted(b"b", 0).unwrap();
        page.insert_sorted(b"c", 0).unwrap();
        assert_eq!(page.insert_direction(), InsertDirection::Right);
        assert_eq!(page.last_insert_slot(), Some(2));
        assert!(page.n_direction() >= 2);

        let mut page = leaf(2);
        page.insert_sorted(b"z", 0).unwrap();
        page.insert_sorted(b"y", 0).unwrap();
        page.insert_sorted(b"x", 0).unwrap();
        assert_eq!(page.insert_direction(), InsertDirection::Left);
        assert_eq!(page.last_insert_slot(), Some(0));
    }

    #[test]
    fn test_empty_page_keeps_segments() {
        let mut page = leaf(0);
        page.set_leaf_segment(11);
        page.set_top_segment(22);
        page.insert_sorted(b"rec", 0).unwrap();

        page.empty_page(1);
        assert_eq!(page.record_count(), 0);
        assert_eq!(page.level(), 1);
        assert_eq!(page.leaf_segment(), 11);
        assert_eq!(page.top_segment(), 22);
    }

    #[test]
    fn test_extract_and_delete_range() {
        let mut page = leaf(1);
        for key in [b"aa".as_ref(), b"bb", b"cc", b"dd"] {
            page.insert_sorted(key, 0).unwrap();
        }

        let moved = page.extract_records(2, 4);
        assert_eq!(moved.len(), 2);
        assert_eq!(moved[0].0, b"cc");
        assert_eq!(moved[1].0, b"dd");

        page.delete_range(2, 4).unwrap();
        assert_eq!(page.record_count(), 2);
        assert_eq!(page.record(1), b"bb");
    }
}
