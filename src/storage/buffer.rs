pub mod lru;
pub mod replacer;

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::PageId;
use crate::storage::{PageManager, PAGE_SIZE};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use replacer::{FrameId, Replacer};
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

pub struct Frame {
    data: Box<[u8; PAGE_SIZE]>,
    page_id: Option<PageId>,
    pin_count: AtomicU32,
    is_dirty: AtomicBool,
}

impl Frame {
    fn new() -> Self {
        Self {
            data: Box::new([0u8; PAGE_SIZE]),
            page_id: None,
            pin_count: AtomicU32::new(0),
            is_dirty: AtomicBool::new(false),
        }
    }

    fn reset(&mut self) {
        self.page_id = None;
        self.pin_count.store(0, Ordering::SeqCst);
        self.is_dirty.store(false, Ordering::SeqCst);
        self.data.fill(0);
    }
}

/// In-memory page cache shared by every tree operation.
///
/// Pages are pinned while a guard is alive and become evictable when the
/// last guard drops. Dirty frames are flushed before eviction.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<BufferPoolInner>,
}

struct BufferPoolInner {
    page_table: DashMap<PageId, FrameId>,
    frames: RwLock<HashMap<FrameId, Frame>>,
    replacer: Mutex<Box<dyn Replacer>>,
    page_manager: Mutex<PageManager>,
    next_frame_id: AtomicU32,
    max_frames: usize,
}

impl BufferPool {
    pub fn new(page_manager: PageManager, replacer: Box<dyn Replacer>, max_frames: usize) -> Self {
        Self {
            inner: Arc::new(BufferPoolInner {
                page_table: DashMap::new(),
                frames: RwLock::new(HashMap::with_capacity(max_frames)),
                replacer: Mutex::new(replacer),
                page_manager: Mutex::new(page_manager),
                next_frame_id: AtomicU32::new(0),
                max_frames,
            }),
        }
    }

    pub fn fetch_page(&self, page_id: PageId) -> StorageResult<PageReadGuard> {
        if let Some(frame_id) = self.inner.page_table.get(&page_id).map(|e| *e.value()) {
            let frames = self.inner.frames.read();
            if let Some(frame) = frames.get(&frame_id) {
                frame.pin_count.fetch_add(1, Ordering::SeqCst);
                self.inner.replacer.lock().pin(frame_id);

                let data = frame.data.as_ref() as *const [u8; PAGE_SIZE];
                return Ok(PageReadGuard {
                    inner: self.inner.clone(),
                    frame_id,
                    data,
                });
            }
        }

        // Not cached, load from disk.
        let frame_id = self.get_frame()?;

        {
            let mut page_manager = self.inner.page_manager.lock();
            let mut frames = self.inner.frames.write();
            let frame = frames.get_mut(&frame_id).ok_or(StorageError::BufferPoolFull)?;

            page_manager.read_page(page_id, frame.data.as_mut())?;
            frame.page_id = Some(page_id);
            frame.pin_count.store(1, Ordering::SeqCst);
            frame.is_dirty.store(false, Ordering::SeqCst);
        }

        self.inner.page_table.insert(page_id, frame_id);
        self.inner.replacer.lock().pin(frame_id);

        let frames = self.inner.frames.read();
        let frame = frames.get(&frame_id).ok_or(StorageError::BufferPoolFull)?;
        let data = frame.data.as_ref() as *const [u8; PAGE_SIZE];

        Ok(PageReadGuard {
            inner: self.inner.clone(),
            frame_id,
            data,
        })
    }

    pub fn fetch_page_write(&self, page_id: PageId) -> StorageResult<PageWriteGuard> {
        if let Some(frame_id) = self.inner.page_table.get(&page_id).map(|e| *e.value()) {
            let mut frames = self.inner.frames.write();
            if let Some(frame) = frames.get_mut(&frame_id) {
                frame.pin_count.fetch_add(1, Ordering::SeqCst);
                frame.is_dirty.store(true, Ordering::SeqCst);
                self.inner.replacer.lock().pin(frame_id);

                let data = frame.data.as_mut() as *mut [u8; PAGE_SIZE];
                drop(frames);

                return Ok(PageWriteGuard {
                    inner: self.inner.clone(),
                    frame_id,
                    data,
                });
            }
        }

        let frame_id = self.get_frame()?;

        {
            let mut page_manager = self.inner.page_manager.lock();
            let mut frames = self.inner.frames.write();
            let frame = frames.get_mut(&frame_id).ok_or(StorageError::BufferPoolFull)?;

            page_manager.read_page(page_id, frame.data.as_mut())?;
            frame.page_id = Some(page_id);
            frame.pin_count.store(1, Ordering::SeqCst);
            frame.is_dirty.store(true, Ordering::SeqCst);
        }

        self.inner.page_table.insert(page_id, frame_id);
        self.inner.replacer.lock().pin(frame_id);

        let mut frames = self.inner.frames.write();
        let frame = frames.get_mut(&frame_id).ok_or(StorageError::BufferPoolFull)?;
        let data = frame.data.as_mut() as *mut [u8; PAGE_SIZE];
        drop(frames);

        Ok(PageWriteGuard {
            inner: self.inner.clone(),
            frame_id,
            data,
        })
    }

    /// Extend the backing file by one page and pin it, zero-filled.
    pub fn new_page(&self) -> StorageResult<(PageId, PageWriteGuard)> {
        let frame_id = self.get_frame()?;

        let page_id = {
            let mut page_manager = self.inner.page_manager.lock();
            page_manager.allocate_page()?
        };

        let mut frames = self.inner.frames.write();
        let frame = frames.get_mut(&frame_id).ok_or(StorageError::BufferPoolFull)?;
        frame.reset();
        frame.page_id = Some(page_id);
        frame.pin_count.store(1, Ordering::SeqCst);
        frame.is_dirty.store(true, Ordering::SeqCst);

        self.inner.page_table.insert(page_id, frame_id);
        self.inner.replacer.lock().pin(frame_id);

        let data = frame.data.as_mut() as *mut [u8; PAGE_SIZE];
        drop(frames);

        Ok((
            page_id,
            PageWriteGuard {
                inner: self.inner.clone(),
                frame_id,
                data,
            },
        ))
    }

    /// Pin a zero-filled frame for a page the caller has (re)allocated.
    /// A frame still caching a previous life of this page id is reused
    /// so no stale duplicate survives; the file is extended when the
    /// frame is first flushed.
    pub fn create_page(&self, page_id: PageId) -> StorageResult<PageWriteGuard> {
        let frame_id = match self.inner.page_table.get(&page_id).map(|e| *e.value()) {
            Some(frame_id) => frame_id,
            None => self.get_frame()?,
        };

        let mut frames = self.inner.frames.write();
        let frame = frames.get_mut(&frame_id).ok_or(StorageError::BufferPoolFull)?;
        frame.reset();
        frame.page_id = Some(page_id);
        frame.pin_count.store(1, Ordering::SeqCst);
        frame.is_dirty.store(true, Ordering::SeqCst);

        self.inner.page_table.insert(page_id, frame_id);
        self.inner.replacer.lock().pin(frame_id);

        let data = frame.data.as_mut() as *mut [u8; PAGE_SIZE];
        drop(frames);

        Ok(PageWriteGuard {
            inner: self.inner.clone(),
            frame_id,
            data,
        })
    }

    pub fn flush_page(&self, page_id: PageId) -> StorageResult<()> {
        if let Some(frame_id) = self.inner.page_table.get(&page_id).map(|e| *e.value()) {
            let frames = self.inner.frames.read();
            if let Some(frame) = frames.get(&frame_id) {
                if frame.is_dirty.load(Ordering::SeqCst) {
                    let mut page_manager = self.inner.page_manager.lock();
                    page_manager.write_page(page_id, frame.data.as_ref())?;
                    frame.is_dirty.store(false, Ordering::SeqCst);
                }
            }
        }
        Ok(())
    }

    pub fn flush_all(&self) -> StorageResult<()> {
        let frames = self.inner.frames.read();
        let mut page_manager = self.inner.page_manager.lock();

        for frame in frames.values() {
            if let Some(page_id) = frame.page_id {
                if frame.is_dirty.load(Ordering::SeqCst) {
                    page_manager.write_page(page_id, frame.data.as_ref())?;
                    frame.is_dirty.store(false, Ordering::SeqCst);
                }
            }
        }

        Ok(())
    }

    fn get_frame(&self) -> StorageResult<FrameId> {
        {
            let frames = self.inner.frames.read();
            if frames.len() < self.inner.max_frames {
                drop(frames);
                let mut frames = self.inner.frames.write();
                // Re-check under the write lock.
                if frames.len() < self.inner.max_frames {
                    let frame_id = self.inner.next_frame_id.fetch_add(1, Ordering::SeqCst);
                    frames.insert(frame_id, Frame::new());
                    return Ok(frame_id);
                }
            }
        }

        // All frames in use, evict one.
        let evict_frame_id = {
            let mut replacer = self.inner.replacer.lock();
            replacer.evict().ok_or(StorageError::BufferPoolFull)?
        };

        let (old_page_id, is_dirty, data) = {
            let frames = self.inner.frames.read();
            if let Some(frame) = frames.get(&evict_frame_id) {
                (
                    frame.page_id,
                    frame.is_dirty.load(Ordering::SeqCst),
                    frame.data.clone(),
                )
            } else {
                return Ok(evict_frame_id);
            }
        };

        // Flush without holding the frames lock.
        if let Some(page_id) = old_page_id {
            if is_dirty {
                let mut page_manager = self.inner.page_manager.lock();
                page_manager.write_page(page_id, data.as_ref())?;
            }
            self.inner.page_table.remove(&page_id);
        }

        {
            let mut frames = self.inner.frames.write();
            if let Some(frame) = frames.get_mut(&evict_frame_id) {
                frame.reset();
            }
        }

        Ok(evict_frame_id)
    }
}

pub struct PageReadGuard {
    inner: Arc<BufferPoolInner>,
    frame_id: FrameId,
    data: *const [u8; PAGE_SIZE],
}

impl Deref for PageReadGuard {
    type Target = [u8; PAGE_SIZE];

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.data }
    }
}

impl Drop for PageReadGuard {
    fn drop(&mut self) {
        let should_unpin = {
            let frames = self.inner.frames.read();
            if let Some(frame) = frames.get(&self.frame_id) {
                frame.pin_count.fetch_sub(1, Ordering::SeqCst) == 1
            } else {
                false
            }
        };

        if should_unpin {
            self.inner.replacer.lock().unpin(self.frame_id);
        }
    }
}

pub struct PageWriteGuard {
    inner: Arc<BufferPoolInner>,
    frame_id: FrameId,
    data: *mut [u8; PAGE_SIZE],
}

impl Deref for PageWriteGuard {
    type Target = [u8; PAGE_SIZE];

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.data }
    }
}

impl DerefMut for PageWriteGuard {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.data }
    }
}

impl Drop for PageWriteGuard {
    fn drop(&mut self) {
        let should_unpin = {
            let frames = self.inner.frames.read();
            if let Some(frame) = frames.get(&self.frame_id) {
                frame.pin_count.fetch_sub(1, Ordering::SeqCst) == 1
            } else {
                false
            }
        };

        if should_unpin {
            self.inner.replacer.lock().unpin(self.frame_id);
        }
    }
}

unsafe impl Send for PageReadGuard {}
unsafe impl Sync for PageReadGuard {}
unsafe impl Send for PageWriteGuard {}
unsafe impl Sync for PageWriteGuard {}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use tempfile::tempdir;

    fn create_test_pool(max_frames: usize) -> Result<BufferPool> {
        let dir = tempdir()?;
        let path = dir.path().join("test.db");
        let page_manager = PageManager::create(&path)?;
        let replacer = Box::new(lru::LruReplacer::new(max_frames));
        Ok(BufferPool::new(page_manager, replacer, max_frames))
    }

    #[test]
    fn test_new_page_roundtrip() -> Result<()> {
        let pool = create_test_pool(10)?;

        let (page_id, mut guard) = pool.new_page()?;
        assert_eq!(page_id, PageId(0));
        guard[0] = 42;
        guard[1] = 43;
        drop(guard);

        let guard = pool.fetch_page(page_id)?;
        assert_eq!(guard[0], 42);
        assert_eq!(guard[1], 43);

        Ok(())
    }

    #[test]
    fn test_fetch_write() -> Result<()> {
        let pool = create_test_pool(10)?;

        let (page_id, mut guard) = pool.new_page()?;
        guard[0] = 10;
        drop(guard);

        let mut guard = pool.fetch_page_write(page_id)?;
        guard[0] = 20;
        drop(guard);

        let guard = pool.fetch_page(page_id)?;
        assert_eq!(guard[0], 20);

        Ok(())
    }

    #[test]
    fn test_eviction_persists_dirty_pages() -> Result<()> {
        let pool = create_test_pool(2)?;

        let (page_id1, mut guard1) = pool.new_page()?;
        guard1[0] = 1;
        drop(guard1);

        let (page_id2, mut guard2) = pool.new_page()?;
        guard2[0] = 2;
        drop(guard2);

        let (_page_id3, mut guard3) = pool.new_page()?;
        guard3[0] = 3;
        drop(guard3);

        // Page 1 was evicted; fetching it again must read it back from disk.
        let guard1 = pool.fetch_page(page_id1)?;
        assert_eq!(guard1[0], 1);

        let guard2 = pool.fetch_page(page_id2)?;
        assert_eq!(guard2[0], 2);

        Ok(())
    }

    #[test]
    fn test_pinned_page_not_evicted() -> Result<()> {
        let pool = create_test_pool(2)?;

        let (page_id1, mut guard1) = pool.new_page()?;
        guard1[0] = 1;
        drop(guard1);

        let (_page_id2, guard2) = pool.new_page()?;

        // Needs a frame; page 1 is the only unpinned candidate.
        let (_page_id3, mut guard3) = pool.new_page()?;
        guard3[0] = 3;
        drop(guard3);
        drop(guard2);

        let g1 = pool.fetch_page(page_id1)?;
        assert_eq!(g1[0], 1);

        Ok(())
    }
}
