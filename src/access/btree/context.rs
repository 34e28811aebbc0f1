//! Per-operation scratchpad for the tree engine.
//!
//! Every public tree operation owns one `OpContext`. It records, in
//! acquisition order, the pages the descent has pinned and latched, plus
//! the pages queued for deletion by merges. Dropping the context releases
//! every latch and pin in reverse acquisition order on every exit path,
//! then drains the deletion queue.

use crate::storage::buffer::{BufferPoolManager, Frame, PageReadGuard, PageWriteGuard};
use crate::storage::error::StorageError;
use crate::storage::page::PageId;
use crate::storage::PAGE_SIZE;
use anyhow::Result;
use log::warn;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AccessMode {
    Read,
    Insert,
    Remove,
}

impl AccessMode {
    pub fn is_write(self) -> bool {
        !matches!(self, AccessMode::Read)
    }
}

enum PageGuard {
    Read(PageReadGuard),
    Write(PageWriteGuard),
}

/// A page held by the running operation: pinned, latched, addressable.
pub(crate) struct LatchedPage {
    page_id: PageId,
    frame: Arc<Frame>,
    guard: PageGuard,
}

impl LatchedPage {
    pub fn data(&self) -> &[u8; PAGE_SIZE] {
        match &self.guard {
            PageGuard::Read(guard) => &**guard,
            PageGuard::Write(guard) => &**guard,
        }
    }

    pub fn data_mut(&mut self) -> &mut [u8; PAGE_SIZE] {
        match &mut self.guard {
            PageGuard::Write(guard) => &mut **guard,
            PageGuard::Read(_) => {
                panic!("write access to page {} through a read latch", self.page_id)
            }
        }
    }

    /// Unlatch, then unpin. The latch must go first: a flusher holding the
    /// pool mutex may be waiting on it.
    fn release(self, bpm: &BufferPoolManager, is_dirty: bool) {
        let page_id = self.page_id;
        drop(self.guard);
        drop(self.frame);
        bpm.unpin_page(page_id, is_dirty);
    }
}

enum Slot {
    Path(usize),
    Extra(usize),
}

pub(crate) struct OpContext<'a> {
    bpm: &'a BufferPoolManager,
    mode: AccessMode,
    /// Descent chain, root first.
    path: Vec<LatchedPage>,
    /// Pages latched outside the chain: new siblings and merge neighbors.
    extras: Vec<LatchedPage>,
    /// Pages emptied by merges, deleted after the unwind.
    deleted: Vec<PageId>,
}

impl<'a> OpContext<'a> {
    pub fn new(bpm: &'a BufferPoolManager, mode: AccessMode) -> Self {
        Self {
            bpm,
            mode,
            path: Vec::new(),
            extras: Vec::new(),
            deleted: Vec::new(),
        }
    }

    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    fn latch(frame: &Arc<Frame>, write: bool) -> PageGuard {
        if write {
            PageGuard::Write(frame.wlatch())
        } else {
            PageGuard::Read(frame.rlatch())
        }
    }

    /// Pin and latch the next page of the descent, per the access mode.
    pub fn acquire(&mut self, page_id: PageId) -> Result<()> {
        let frame = self.bpm.fetch_page(page_id)?;
        let guard = Self::latch(&frame, self.mode.is_write());
        self.path.push(LatchedPage {
            page_id,
            frame,
            guard,
        });
        Ok(())
    }

    /// Pin and write-latch a page outside the descent chain.
    pub fn acquire_extra_write(&mut self, page_id: PageId) -> Result<()> {
        let frame = self.bpm.fetch_page(page_id)?;
        let guard = PageGuard::Write(frame.wlatch());
        self.extras.push(LatchedPage {
            page_id,
            frame,
            guard,
        });
        Ok(())
    }

    /// Allocate a fresh page, pinned and write-latched. Allocation failure
    /// during a structural change is fatal.
    pub fn allocate(&mut self) -> Result<PageId> {
        let (page_id, frame) = self.bpm.new_page().map_err(|e| {
            if matches!(
                e.downcast_ref::<StorageError>(),
                Some(StorageError::PoolExhausted)
            ) {
                StorageError::OutOfMemory.into()
            } else {
                e
            }
        })?;
        let guard = PageGuard::Write(frame.wlatch());
        self.extras.push(LatchedPage {
            page_id,
            frame,
            guard,
        });
        Ok(page_id)
    }

    /// Crabbing release: the newly latched child proved safe, so every
    /// ancestor latch and pin can go. Ancestors were never modified, so
    /// they unpin clean.
    pub fn release_all_but_top(&mut self) {
        while self.path.len() > 1 {
            let entry = self.path.remove(0);
            entry.release(self.bpm, false);
        }
    }

    /// Release everything held so far (stale-root retry path).
    pub fn release_all(&mut self) {
        while let Some(entry) = self.extras.pop() {
            entry.release(self.bpm, false);
        }
        while let Some(entry) = self.path.pop() {
            entry.release(self.bpm, false);
        }
    }

    fn locate(&self, page_id: PageId) -> Option<Slot> {
        if let Some(i) = self.path.iter().position(|p| p.page_id == page_id) {
            return Some(Slot::Path(i));
        }
        self.extras
            .iter()
            .position(|p| p.page_id == page_id)
            .map(Slot::Extra)
    }

    pub fn holds(&self, page_id: PageId) -> bool {
        self.locate(page_id).is_some()
    }

    /// The held page, by id. Panics if the operation does not hold it;
    /// callers only ask for pages their own descent latched.
    pub fn page(&self, page_id: PageId) -> &LatchedPage {
        match self.locate(page_id) {
            Some(Slot::Path(i)) => &self.path[i],
            Some(Slot::Extra(i)) => &self.extras[i],
            None => panic!("page {} is not held by this operation", page_id),
        }
    }

    pub fn page_mut(&mut self, page_id: PageId) -> &mut LatchedPage {
        match self.locate(page_id) {
            Some(Slot::Path(i)) => &mut self.path[i],
            Some(Slot::Extra(i)) => &mut self.extras[i],
            None => panic!("page {} is not held by this operation", page_id),
        }
    }

    /// Two distinct held pages, mutably. Needed whenever entries move
    /// between sibling nodes.
    pub fn pair_mut(
        &mut self,
        a: PageId,
        b: PageId,
    ) -> (&mut LatchedPage, &mut LatchedPage) {
        debug_assert_ne!(a, b);
        let slot_a = self.locate(a);
        let slot_b = self.locate(b);
        match (slot_a, slot_b) {
            (Some(Slot::Path(i)), Some(Slot::Path(j))) => {
                if i < j {
                    let (lo, hi) = self.path.split_at_mut(j);
                    (&mut lo[i], &mut hi[0])
                } else {
                    let (lo, hi) = self.path.split_at_mut(i);
                    (&mut hi[0], &mut lo[j])
                }
            }
            (Some(Slot::Extra(i)), Some(Slot::Extra(j))) => {
                if i < j {
                    let (lo, hi) = self.extras.split_at_mut(j);
                    (&mut lo[i], &mut hi[0])
                } else {
                    let (lo, hi) = self.extras.split_at_mut(i);
                    (&mut hi[0], &mut lo[j])
                }
            }
            (Some(Slot::Path(i)), Some(Slot::Extra(j))) => (&mut self.path[i], &mut self.extras[j]),
            (Some(Slot::Extra(i)), Some(Slot::Path(j))) => (&mut self.extras[i], &mut self.path[j]),
            _ => panic!("pages {} and {} are not both held by this operation", a, b),
        }
    }

    /// Queue a merged-away page for deletion after the unwind.
    pub fn mark_deleted(&mut self, page_id: PageId) {
        self.deleted.push(page_id);
    }
}

impl Drop for OpContext<'_> {
    fn drop(&mut self) {
        let is_dirty = self.mode.is_write();

        // Reverse acquisition order: leaf-side latches first.
        while let Some(entry) = self.extras.pop() {
            entry.release(self.bpm, is_dirty);
        }
        while let Some(entry) = self.path.pop() {
            entry.release(self.bpm, is_dirty);
        }

        // A concurrent reader may still pin a queued page; its pin is
        // transient, so spin until the delete goes through.
        for page_id in self.deleted.drain(..) {
            loop {
                match self.bpm.delete_page(page_id) {
                    Ok(true) => break,
                    Ok(false) => std::thread::yield_now(),
                    Err(err) => {
                        warn!("giving up deleting page {}: {}", page_id, err);
                        break;
                    }
                }
            }
        }
    }
}
