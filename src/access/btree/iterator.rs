//! Ordered iterator over the leaf chain.
//!
//! The iterator holds a pin on its current leaf (no latch between calls)
//! and walks the `next_page_id` chain, unpinning each leaf as it leaves
//! it. The exhausted state is no leaf and offset zero.

use crate::access::btree::key::IndexKey;
use crate::access::rid::Rid;
use crate::storage::buffer::{BufferPoolManager, Frame};
use crate::storage::page::btree_page::BTreePage;
use crate::storage::page::{LeafNode, PageId, INVALID_PAGE_ID};
use anyhow::Result;
use std::sync::Arc;

pub struct TreeIterator<'a> {
    bpm: &'a BufferPoolManager,
    frame: Option<Arc<Frame>>,
    page_id: PageId,
    offset: usize,
}

impl<'a> TreeIterator<'a> {
    pub(crate) fn new(
        bpm: &'a BufferPoolManager,
        frame: Arc<Frame>,
        page_id: PageId,
        offset: usize,
    ) -> Self {
        Self {
            bpm,
            frame: Some(frame),
            page_id,
            offset,
        }
    }

    /// The canonical end iterator.
    pub(crate) fn end(bpm: &'a BufferPoolManager) -> Self {
        Self {
            bpm,
            frame: None,
            page_id: INVALID_PAGE_ID,
            offset: 0,
        }
    }

    pub fn is_end(&self) -> bool {
        self.frame.is_none()
    }

    /// The next entry in key order, or None once the chain is exhausted.
    pub fn next(&mut self) -> Result<Option<(IndexKey, Rid)>> {
        loop {
            let Some(frame) = &self.frame else {
                return Ok(None);
            };

            let (item, next_page_id) = {
                let guard = frame.rlatch();
                let leaf = LeafNode::from_data(&*guard);
                if self.offset < leaf.size() as usize {
                    (
                        Some((leaf.key_at(self.offset), leaf.rid_at(self.offset))),
                        INVALID_PAGE_ID,
                    )
                } else {
                    (None, leaf.next_page_id())
                }
            };

            if let Some(item) = item {
                self.offset += 1;
                return Ok(Some(item));
            }

            // This leaf is exhausted; move the pin to the next one.
            self.frame = None;
            self.bpm.unpin_page(self.page_id, false);
            self.offset = 0;

            if !next_page_id.is_valid() {
                self.page_id = INVALID_PAGE_ID;
                return Ok(None);
            }

            self.frame = Some(self.bpm.fetch_page(next_page_id)?);
            self.page_id = next_page_id;
        }
    }
}

impl Drop for TreeIterator<'_> {
    fn drop(&mut self) {
        if self.frame.take().is_some() {
            self.bpm.unpin_page(self.page_id, false);
        }
    }
}
