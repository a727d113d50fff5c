// src/core/storage/buffer.rs
use crate::core::common::PageId;
use crate::core::recovery::{RecoveryError, RecoveryManager};
use crate::core::storage::page::Page;
use crate::core::storage::StorageError;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

/// The page cache as the recovery manager sees it: fetch (pinning), free,
/// and iteration over resident pages with their dirty bit.
pub trait BufferManager: Send + Sync {
    fn fetch_page(&self, page_id: PageId) -> Result<PageHandle, StorageError>;
    fn free_page(&self, page_id: PageId);
    fn iter_page_nums(&self, f: &mut dyn FnMut(PageId, bool));
}

/// One cached page. The recovery back-reference is shared with the owning
/// buffer manager so the dirty-transition hook fires without holding the
/// frame table lock.
#[derive(Debug)]
struct PageFrame {
    id: PageId,
    page: Mutex<Page>,
    pins: AtomicUsize,
    dirty: AtomicBool,
    recovery: Arc<RwLock<Weak<RecoveryManager>>>,
}

/// Pinned access to a cached page; the pin is released on drop, on every
/// exit path.
#[derive(Debug)]
pub struct PageHandle {
    frame: Arc<PageFrame>,
}

impl PageHandle {
    #[must_use]
    pub fn page_id(&self) -> PageId {
        self.frame.id
    }

    pub fn with_page<R>(&self, f: impl FnOnce(&Page) -> R) -> R {
        let page = self.frame.page.lock().unwrap();
        f(&page)
    }

    /// Mutable access. A mutation that advances the page LSN marks the frame
    /// dirty; the first such transition reports the page to the recovery
    /// manager's dirty page table.
    pub fn with_page_mut<R>(&self, f: impl FnOnce(&mut Page) -> R) -> R {
        let mut page = self.frame.page.lock().unwrap();
        let lsn_before = page.page_lsn();
        let out = f(&mut page);
        let lsn_after = page.page_lsn();
        if lsn_after != lsn_before && !self.frame.dirty.swap(true, Ordering::SeqCst) {
            if let Some(recovery) = self.frame.recovery.read().unwrap().upgrade() {
                recovery.dirty_page(self.frame.id, lsn_after);
            }
        }
        out
    }
}

impl Drop for PageHandle {
    fn drop(&mut self) {
        self.frame.pins.fetch_sub(1, Ordering::SeqCst);
    }
}

/// In-memory buffer manager. Pages materialize zero-filled on first fetch;
/// write-out goes through the recovery manager's WAL hook first and reports
/// completion through the disk I/O hook after.
#[derive(Debug)]
pub struct MemoryBufferManager {
    frames: Mutex<HashMap<PageId, Arc<PageFrame>>>,
    recovery: Arc<RwLock<Weak<RecoveryManager>>>,
}

impl MemoryBufferManager {
    #[must_use]
    pub fn new() -> Self {
        Self {
            frames: Mutex::new(HashMap::new()),
            recovery: Arc::new(RwLock::new(Weak::new())),
        }
    }

    /// Second half of the two-phase wiring: the buffer manager keeps only a
    /// weak reference back to the recovery manager.
    pub fn set_recovery_manager(&self, recovery: &Arc<RecoveryManager>) {
        *self.recovery.write().unwrap() = Arc::downgrade(recovery);
    }

    /// Writes a dirty page out, honoring write-ahead logging: the log is
    /// flushed through the page's LSN before the page leaves the cache, and
    /// the disk I/O hook runs once the write has happened.
    pub fn flush_page(&self, page_id: PageId) -> Result<(), RecoveryError> {
        let frame = match self.frames.lock().unwrap().get(&page_id) {
            Some(frame) => Arc::clone(frame),
            None => return Ok(()),
        };
        if !frame.dirty.load(Ordering::SeqCst) {
            return Ok(());
        }
        let page_lsn = frame.page.lock().unwrap().page_lsn();
        let recovery = self.recovery.read().unwrap().upgrade();
        if let Some(recovery) = &recovery {
            recovery.page_flush_hook(page_lsn)?;
        }
        frame.dirty.store(false, Ordering::SeqCst);
        if let Some(recovery) = &recovery {
            recovery.disk_io_hook(page_id);
        }
        Ok(())
    }

    /// Writes out every dirty page currently resident.
    pub fn flush_all(&self) -> Result<(), RecoveryError> {
        let resident: Vec<PageId> = self.frames.lock().unwrap().keys().copied().collect();
        for page_id in resident {
            self.flush_page(page_id)?;
        }
        Ok(())
    }
}

impl Default for MemoryBufferManager {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferManager for MemoryBufferManager {
    fn fetch_page(&self, page_id: PageId) -> Result<PageHandle, StorageError> {
        let mut frames = self.frames.lock().unwrap();
        let frame = frames.entry(page_id).or_insert_with(|| {
            Arc::new(PageFrame {
                id: page_id,
                page: Mutex::new(Page::new(page_id)),
                pins: AtomicUsize::new(0),
                dirty: AtomicBool::new(false),
                recovery: Arc::clone(&self.recovery),
            })
        });
        frame.pins.fetch_add(1, Ordering::SeqCst);
        Ok(PageHandle { frame: Arc::clone(frame) })
    }

    fn free_page(&self, page_id: PageId) {
        self.frames.lock().unwrap().remove(&page_id);
    }

    fn iter_page_nums(&self, f: &mut dyn FnMut(PageId, bool)) {
        let frames: Vec<(PageId, bool)> = self
            .frames
            .lock()
            .unwrap()
            .values()
            .map(|frame| (frame.id, frame.dirty.load(Ordering::SeqCst)))
            .collect();
        for (page_id, dirty) in frames {
            f(page_id, dirty);
        }
    }
}
