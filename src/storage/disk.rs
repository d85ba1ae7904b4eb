//! Page file I/O.

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::PageId;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

pub const PAGE_SIZE: usize = 4096;

/// Handles reading and writing fixed-size pages to the backing file.
///
/// Page numbers map directly to file offsets; the file is extended on
/// demand. Allocation here is a raw high-water mark, the segment-aware
/// policy lives in [`crate::storage::alloc::SegmentAllocator`].
pub struct PageManager {
    file: File,
}

impl PageManager {
    pub fn create(path: &Path) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        Ok(Self { file })
    }

    pub fn open(path: &Path) -> StorageResult<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;

        Ok(Self { file })
    }

    pub fn read_page(&mut self, page_id: PageId, buf: &mut [u8; PAGE_SIZE]) -> StorageResult<()> {
        let offset = Self::page_offset(page_id);
        let file_size = self.file.metadata()?.len();

        if offset >= file_size {
            return Err(StorageError::PageNotFound(page_id));
        }

        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)?;

        Ok(())
    }

    pub fn write_page(&mut self, page_id: PageId, data: &[u8; PAGE_SIZE]) -> StorageResult<()> {
        let offset = Self::page_offset(page_id);
        let file_size = self.file.metadata()?.len();

        if offset >= file_size {
            self.file.set_len(offset + PAGE_SIZE as u64)?;
        }

        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)?;
        self.file.sync_all()?;

        Ok(())
    }

    pub fn num_pages(&self) -> StorageResult<u64> {
        let file_size = self.file.metadata()?.len();
        Ok(file_size / PAGE_SIZE as u64)
    }

    /// Extend the file by one page and return its id.
    pub fn allocate_page(&mut self) -> StorageResult<PageId> {
        let current_pages = self.num_pages()?;
        let new_page_id = PageId(current_pages);

        self.file
            .set_len((current_pages + 1) * PAGE_SIZE as u64)?;

        Ok(new_page_id)
    }

    fn page_offset(page_id: PageId) -> u64 {
        page_id.0 * PAGE_SIZE as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use tempfile::tempdir;

    #[test]
    fn test_create_write_read() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("test.db");
        let mut pm = PageManager::create(&path)?;

        let mut buf = [0u8; PAGE_SIZE];
        buf[0] = 42;
        buf[PAGE_SIZE - 1] = 24;
        pm.write_page(PageId(0), &buf)?;

        let mut read_buf = [0u8; PAGE_SIZE];
        pm.read_page(PageId(0), &mut read_buf)?;
        assert_eq!(read_buf[0], 42);
        assert_eq!(read_buf[PAGE_SIZE - 1], 24);

        Ok(())
    }

    #[test]
    fn test_read_nonexistent_page_fails() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("test.db");
        let mut pm = PageManager::create(&path)?;

        let mut buf = [0u8; PAGE_SIZE];
        assert!(pm.read_page(PageId(10), &mut buf).is_err());

        Ok(())
    }

    #[test]
    fn test_allocate_extends_file() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("test.db");
        let mut pm = PageManager::create(&path)?;

        assert_eq!(pm.num_pages()?, 0);
        assert_eq!(pm.allocate_page()?, PageId(0));
        assert_eq!(pm.allocate_page()?, PageId(1));
        assert_eq!(pm.num_pages()?, 2);

        Ok(())
    }

    #[test]
    fn test_persistence_across_reopen() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("test.db");

        {
            let mut pm = PageManager::create(&path)?;
            let buf = [99u8; PAGE_SIZE];
            pm.write_page(PageId(0), &buf)?;
        }

        {
            let mut pm = PageManager::open(&path)?;
            let mut buf = [0u8; PAGE_SIZE];
            pm.read_page(PageId(0), &mut buf)?;
            assert_eq!(buf[0], 99);
        }

        Ok(())
    }
}
