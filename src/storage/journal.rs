//! Mini-transaction journal.
//!
//! Every structural operation writes the full images of the pages it
//! changed as one journal record before any of them reach the buffer
//! pool. Replay of the last record on recovery makes a multi-page
//! change all-or-nothing.

use crate::storage::error::StorageResult;
use crate::storage::page::PageId;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Log sequence number. Monotonically increasing, one per record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Lsn(pub u64);

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LSN({})", self.0)
    }
}

/// One committed mini-transaction: the after-images of every page it
/// dirtied, plus the pages it released back to the allocator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalRecord {
    pub lsn: Lsn,
    pub pages: Vec<(PageId, Vec<u8>)>,
    pub freed: Vec<PageId>,
}

struct JournalInner {
    file: File,
    next_lsn: u64,
}

/// Append-only log of mini-transaction records, length-prefixed and
/// bincode-encoded, synced on every append.
pub struct Journal {
    inner: Mutex<JournalInner>,
}

impl Journal {
    pub fn create(path: impl AsRef<Path>) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(path)?;
        Ok(Self {
            inner: Mutex::new(JournalInner { file, next_lsn: 1 }),
        })
    }

    /// Open an existing journal, positioning after the last record.
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        let records = read_records(&mut file)?;
        let next_lsn = records.last().map(|r| r.lsn.0 + 1).unwrap_or(1);
        file.seek(SeekFrom::End(0))?;
        Ok(Self {
            inner: Mutex::new(JournalInner { file, next_lsn }),
        })
    }

    /// Append one record and sync it to disk.
    pub fn append(
        &self,
        pages: Vec<(PageId, Vec<u8>)>,
        freed: Vec<PageId>,
    ) -> StorageResult<Lsn> {
        let mut inner = self.inner.lock();
        let lsn = Lsn(inner.next_lsn);
        let record = JournalRecord { lsn, pages, freed };

        let encoded = bincode::serialize(&record)?;
        let len = (encoded.len() as u32).to_le_bytes();
        inner.file.write_all(&len)?;
        inner.file.write_all(&encoded)?;
        inner.file.sync_data()?;
        inner.next_lsn += 1;
        Ok(lsn)
    }

    /// Read back every record, oldest first.
    pub fn records(&self) -> StorageResult<Vec<JournalRecord>> {
        let mut inner = self.inner.lock();
        let records = read_records(&mut inner.file)?;
        inner.file.seek(SeekFrom::End(0))?;
        Ok(records)
    }
}

fn read_records(file: &mut File) -> StorageResult<Vec<JournalRecord>> {
    file.seek(SeekFrom::Start(0))?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;

    let mut records = Vec::new();
    let mut pos = 0;
    while pos + 4 <= buf.len() {
        let len = u32::from_le_bytes([buf[pos], buf[pos + 1], buf[pos + 2], buf[pos + 3]]) as usize;
        pos += 4;
        if pos + len > buf.len() {
            // Torn tail from a crash mid-append; everything before it
            // is intact.
            break;
        }
        let record: JournalRecord = bincode::deserialize(&buf[pos..pos + len])?;
        records.push(record);
        pos += len;
    }
    Ok(records)
}
