pub mod clock;
pub mod replacer;

use crate::storage::disk::{DiskManager, PAGE_SIZE};
use crate::storage::error::StorageError;
use crate::storage::page::{PageId, INVALID_PAGE_ID};
use anyhow::Result;
use log::trace;
use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{Mutex, RawRwLock, RwLock};
pub use replacer::{FrameId, Replacer};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::Arc;

pub type PageData = [u8; PAGE_SIZE];

/// Page latch guards. They own a reference to the frame's lock, so a tree
/// descent can hold latches on a whole root-to-leaf path at once.
pub type PageReadGuard = ArcRwLockReadGuard<RawRwLock, PageData>;
pub type PageWriteGuard = ArcRwLockWriteGuard<RawRwLock, PageData>;

/// A buffer pool slot holding one cached page plus metadata. The page body
/// bytes are guarded by the frame's own reader/writer latch; the metadata
/// fields are written only under the pool mutex.
#[derive(Debug)]
pub struct Frame {
    page_id: AtomicI32,
    pin_count: AtomicU32,
    is_dirty: AtomicBool,
    data: Arc<RwLock<PageData>>,
}

impl Frame {
    fn new() -> Self {
        Self {
            page_id: AtomicI32::new(INVALID_PAGE_ID.0),
            pin_count: AtomicU32::new(0),
            is_dirty: AtomicBool::new(false),
            data: Arc::new(RwLock::new([0u8; PAGE_SIZE])),
        }
    }

    pub fn page_id(&self) -> PageId {
        PageId(self.page_id.load(Ordering::SeqCst))
    }

    pub fn pin_count(&self) -> u32 {
        self.pin_count.load(Ordering::SeqCst)
    }

    pub fn is_dirty(&self) -> bool {
        self.is_dirty.load(Ordering::SeqCst)
    }

    /// Acquire this page's latch in read mode.
    pub fn rlatch(&self) -> PageReadGuard {
        self.data.read_arc()
    }

    /// Acquire this page's latch in write mode.
    pub fn wlatch(&self) -> PageWriteGuard {
        self.data.write_arc()
    }
}

struct PoolState {
    page_table: HashMap<PageId, FrameId>,
    free_list: VecDeque<FrameId>,
    disk: DiskManager,
}

/// Fixed-capacity page cache. A single mutex protects the frame table, the
/// free list, per-frame metadata writes, and the disk manager; disk I/O is
/// performed while holding it. Concurrency at the logical level comes from
/// the per-frame page latches.
pub struct BufferPoolManager {
    frames: Vec<Arc<Frame>>,
    state: Mutex<PoolState>,
    replacer: Box<dyn Replacer>,
    pool_size: usize,
}

impl BufferPoolManager {
    pub fn new(disk: DiskManager, replacer: Box<dyn Replacer>, pool_size: usize) -> Self {
        let frames = (0..pool_size).map(|_| Arc::new(Frame::new())).collect();

        // Initially, every frame is in the free list.
        let free_list = (0..pool_size).collect();

        Self {
            frames,
            state: Mutex::new(PoolState {
                page_table: HashMap::with_capacity(pool_size),
                free_list,
                disk,
            }),
            replacer,
            pool_size,
        }
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Pin the requested page into a frame, reading it from disk if it is
    /// not resident. Fails with `StorageError::PoolExhausted` when every
    /// frame is pinned.
    pub fn fetch_page(&self, page_id: PageId) -> Result<Arc<Frame>> {
        let mut state = self.state.lock();

        if let Some(&frame_id) = state.page_table.get(&page_id) {
            let frame = &self.frames[frame_id];
            frame.pin_count.fetch_add(1, Ordering::SeqCst);
            self.replacer.pin(frame_id);
            return Ok(frame.clone());
        }

        let frame_id = self.find_free_frame(&mut state)?;
        let frame = &self.frames[frame_id];

        {
            let mut data = frame.data.write();
            if let Err(e) = state.disk.read_page(page_id, &mut *data) {
                // The frame was never installed; hand it back untouched.
                state.free_list.push_front(frame_id);
                return Err(e);
            }
        }

        frame.page_id.store(page_id.0, Ordering::SeqCst);
        frame.pin_count.store(1, Ordering::SeqCst);
        frame.is_dirty.store(false, Ordering::SeqCst);
        state.page_table.insert(page_id, frame_id);

        Ok(frame.clone())
    }

    /// Drop one pin on the page, folding `is_dirty` into the frame's dirty
    /// flag. Unpinning a page that is not resident is a successful no-op.
    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> bool {
        let state = self.state.lock();

        let Some(&frame_id) = state.page_table.get(&page_id) else {
            return true;
        };

        let frame = &self.frames[frame_id];
        let pin_count = frame.pin_count.load(Ordering::SeqCst);
        assert!(pin_count > 0, "unpin of page {} with zero pin count", page_id);

        frame.pin_count.store(pin_count - 1, Ordering::SeqCst);
        if is_dirty {
            frame.is_dirty.store(true, Ordering::SeqCst);
        }

        if pin_count == 1 {
            self.replacer.unpin(frame_id);
        }

        true
    }

    /// Write the page image back to disk and clear the dirty flag,
    /// regardless of its prior state. Returns false if the page is not
    /// resident.
    pub fn flush_page(&self, page_id: PageId) -> Result<bool> {
        // Pin first so the frame cannot be evicted while waiting for its
        // latch. The latch is taken outside the pool mutex: latches order
        // before the mutex everywhere.
        let frame = {
            let state = self.state.lock();
            let Some(&frame_id) = state.page_table.get(&page_id) else {
                return Ok(false);
            };
            let frame = self.frames[frame_id].clone();
            frame.pin_count.fetch_add(1, Ordering::SeqCst);
            self.replacer.pin(frame_id);
            frame
        };

        let image = {
            let data = frame.data.read();
            *data
        };

        {
            let mut state = self.state.lock();
            if let Err(e) = state.disk.write_page(page_id, &image) {
                drop(state);
                self.unpin_page(page_id, false);
                return Err(e);
            }
        }
        frame.is_dirty.store(false, Ordering::SeqCst);
        self.unpin_page(page_id, false);

        Ok(true)
    }

    /// Allocate a fresh page on disk and pin it into a zeroed frame.
    pub fn new_page(&self) -> Result<(PageId, Arc<Frame>)> {
        let mut state = self.state.lock();

        let frame_id = self.find_free_frame(&mut state)?;
        let page_id = state.disk.allocate_page()?;

        let frame = &self.frames[frame_id];
        {
            let mut data = frame.data.write();
            data.fill(0);
        }
        frame.page_id.store(page_id.0, Ordering::SeqCst);
        frame.pin_count.store(1, Ordering::SeqCst);
        frame.is_dirty.store(false, Ordering::SeqCst);
        state.page_table.insert(page_id, frame_id);

        Ok((page_id, frame.clone()))
    }

    /// Return the page to the disk manager. A resident page can only be
    /// deleted while unpinned; its frame goes back to the free list.
    pub fn delete_page(&self, page_id: PageId) -> Result<bool> {
        let mut state = self.state.lock();

        let Some(&frame_id) = state.page_table.get(&page_id) else {
            state.disk.deallocate_page(page_id);
            return Ok(true);
        };

        let frame = &self.frames[frame_id];
        if frame.pin_count.load(Ordering::SeqCst) != 0 {
            return Ok(false);
        }

        state.disk.deallocate_page(page_id);
        state.page_table.remove(&page_id);

        // The frame is still tracked by the replacer; untrack it before
        // returning it to the free list.
        self.replacer.pin(frame_id);
        state.free_list.push_back(frame_id);

        frame.page_id.store(INVALID_PAGE_ID.0, Ordering::SeqCst);
        frame.pin_count.store(0, Ordering::SeqCst);
        frame.is_dirty.store(false, Ordering::SeqCst);

        Ok(true)
    }

    pub fn flush_all_pages(&self) -> Result<()> {
        let page_ids: Vec<PageId> = {
            let state = self.state.lock();
            state.page_table.keys().copied().collect()
        };

        // Pages evicted or deleted in the meantime just report missing.
        for page_id in page_ids {
            self.flush_page(page_id)?;
        }

        Ok(())
    }

    /// Number of frames currently eligible for eviction.
    pub fn replacer_size(&self) -> usize {
        self.replacer.size()
    }

    /// Pin count of a resident page, for invariant checks.
    pub fn page_pin_count(&self, page_id: PageId) -> Option<u32> {
        let state = self.state.lock();
        state
            .page_table
            .get(&page_id)
            .map(|&frame_id| self.frames[frame_id].pin_count())
    }

    pub fn num_disk_pages(&self) -> Result<u32> {
        self.state.lock().disk.num_pages()
    }

    /// Prefer the free list; otherwise evict a victim, writing it back
    /// first if dirty.
    fn find_free_frame(&self, state: &mut PoolState) -> Result<FrameId> {
        if let Some(frame_id) = state.free_list.pop_front() {
            return Ok(frame_id);
        }

        let Some(frame_id) = self.replacer.victim() else {
            return Err(StorageError::PoolExhausted.into());
        };

        let frame = &self.frames[frame_id];
        let old_page_id = frame.page_id();

        if frame.is_dirty() {
            trace!("evicting dirty page {}, writing back", old_page_id);
            let data = frame.data.read();
            if let Err(e) = state.disk.write_page(old_page_id, &*data) {
                self.replacer.unpin(frame_id);
                return Err(e);
            }
            frame.is_dirty.store(false, Ordering::SeqCst);
        }

        state.page_table.remove(&old_page_id);
        Ok(frame_id)
    }
}
