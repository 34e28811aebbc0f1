//! Concurrent B+Tree index over the buffer pool.
//!
//! Internal pages direct the search and leaf pages hold the data. Keys are
//! unique tree-wide; the structure grows and shrinks dynamically and leaf
//! pages chain into an ordered list for range scans. Thread safety comes
//! from latch crabbing: a descent latches the child before giving up the
//! parent, and a writer keeps the whole ancestor chain latched until the
//! child proves it cannot split or underflow.

mod context;
pub mod iterator;
pub mod key;

use self::context::{AccessMode, OpContext};
use self::iterator::TreeIterator;
use self::key::{IndexKey, KeyComparator};
use crate::access::rid::Rid;
use crate::storage::buffer::BufferPoolManager;
use crate::storage::page::btree_page::{BTreePage, BTreePageMut, NodeView};
use crate::storage::page::header_page::{HeaderPage, HEADER_PAGE_ID};
use crate::storage::page::{InternalNode, LeafNode, PageId, INVALID_PAGE_ID};
use anyhow::{bail, ensure, Context, Result};
use log::debug;
use parking_lot::Mutex;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

pub use crate::storage::page::btree_internal_page::DEFAULT_INTERNAL_MAX_SIZE;
pub use crate::storage::page::btree_leaf_page::DEFAULT_LEAF_MAX_SIZE;

/// Thread-safe B+Tree with unique keys.
pub struct BPlusTree {
    index_name: String,
    bpm: Arc<BufferPoolManager>,
    comparator: KeyComparator,
    leaf_max_size: u32,
    internal_max_size: u32,
    root_page_id: AtomicI32,
    /// Serializes installing the first root; the descent revalidation loop
    /// covers every later root change.
    root_latch: Mutex<()>,
}

impl BPlusTree {
    pub fn new(
        index_name: &str,
        bpm: Arc<BufferPoolManager>,
        comparator: KeyComparator,
        leaf_max_size: u32,
        internal_max_size: u32,
    ) -> Result<Self> {
        ensure!(leaf_max_size >= 3, "leaf max size must be at least 3");
        ensure!(internal_max_size >= 3, "internal max size must be at least 3");
        ensure!(
            leaf_max_size as usize <= crate::storage::page::btree_leaf_page::LEAF_PAGE_CAPACITY,
            "leaf max size exceeds page capacity"
        );
        ensure!(
            (internal_max_size as usize)
                < crate::storage::page::btree_internal_page::INTERNAL_PAGE_CAPACITY,
            "internal max size must leave one spare entry slot"
        );

        // Page 0 is the root-record page; create it on a fresh file.
        if bpm.num_disk_pages()? == 0 {
            let (page_id, _frame) = bpm.new_page()?;
            ensure!(
                page_id == HEADER_PAGE_ID,
                "root-record page must be page 0, got {}",
                page_id
            );
            bpm.unpin_page(page_id, true);
        }

        let recovered_root = {
            let frame = bpm.fetch_page(HEADER_PAGE_ID)?;
            let root = {
                let guard = frame.rlatch();
                let header = HeaderPage::from_data(&*guard);
                header.get_root_id(index_name)
            };
            bpm.unpin_page(HEADER_PAGE_ID, false);
            root
        };

        Ok(Self {
            index_name: index_name.to_string(),
            bpm,
            comparator,
            leaf_max_size,
            internal_max_size,
            root_page_id: AtomicI32::new(recovered_root.unwrap_or(INVALID_PAGE_ID).0),
            root_latch: Mutex::new(()),
        })
    }

    /// Open with the capacities derived from the page size.
    pub fn with_default_sizes(index_name: &str, bpm: Arc<BufferPoolManager>) -> Result<Self> {
        Self::new(
            index_name,
            bpm,
            KeyComparator,
            DEFAULT_LEAF_MAX_SIZE,
            DEFAULT_INTERNAL_MAX_SIZE,
        )
    }

    pub fn root_page_id(&self) -> PageId {
        PageId(self.root_page_id.load(Ordering::SeqCst))
    }

    fn set_root_page_id(&self, page_id: PageId) {
        self.root_page_id.store(page_id.0, Ordering::SeqCst);
    }

    pub fn is_empty(&self) -> bool {
        !self.root_page_id().is_valid()
    }

    /// Persist the current root id in the root-record page. `insert_record`
    /// distinguishes first creation, but a tree emptied and regrown under
    /// the same name falls back to an update.
    fn update_root_page_id(&self, insert_record: bool) -> Result<()> {
        let frame = self.bpm.fetch_page(HEADER_PAGE_ID)?;
        let done = {
            let mut guard = frame.wlatch();
            let mut header = HeaderPage::from_data(&mut *guard);
            let root = self.root_page_id();
            if insert_record {
                header.insert_record(&self.index_name, root)
                    || header.update_record(&self.index_name, root)
            } else {
                header.update_record(&self.index_name, root)
                    || header.insert_record(&self.index_name, root)
            }
        };
        self.bpm.unpin_page(HEADER_PAGE_ID, true);
        ensure!(
            done,
            "could not persist root record for index {}",
            self.index_name
        );
        Ok(())
    }

    /// Descend to the leaf responsible for `target` (or the leftmost leaf
    /// when `target` is None), latching per the context's access mode and
    /// crabbing ancestor latches away as soon as a child proves safe.
    /// Returns the leaf page id, or None on an empty tree.
    fn find_leaf(&self, ctx: &mut OpContext, target: Option<&IndexKey>) -> Result<Option<PageId>> {
        // Latch the presumed root, then revalidate: a concurrent split or
        // collapse may have moved it before the latch landed.
        let mut current = loop {
            let root_id = self.root_page_id();
            if !root_id.is_valid() {
                return Ok(None);
            }
            ctx.acquire(root_id)?;
            if self.root_page_id() == root_id {
                break root_id;
            }
            ctx.release_all();
        };

        loop {
            let child = {
                let entry = ctx.page(current);
                let view = NodeView::from_data(entry.data());
                if view.is_leaf() {
                    return Ok(Some(current));
                }
                let node = InternalNode::from_data(entry.data());
                match target {
                    Some(key) => node.lookup(key, &self.comparator),
                    None => node.value_at(0),
                }
            };

            ctx.acquire(child)?;

            let release_ancestors = match ctx.mode() {
                AccessMode::Read => true,
                mode => {
                    // Safe iff the child cannot split (insert) or
                    // underflow (remove) after this operation.
                    let view = NodeView::from_data(ctx.page(child).data());
                    match mode {
                        AccessMode::Insert => view.size() + 1 < view.max_size(),
                        AccessMode::Remove => view.size() > view.min_size(),
                        AccessMode::Read => unreachable!(),
                    }
                }
            };
            if release_ancestors {
                ctx.release_all_but_top();
            }

            current = child;
        }
    }

    /// Point lookup. Returns the record identifier stored under `key`.
    pub fn get_value(&self, key: &IndexKey) -> Result<Option<Rid>> {
        let mut ctx = OpContext::new(&self.bpm, AccessMode::Read);
        let Some(leaf_id) = self.find_leaf(&mut ctx, Some(key))? else {
            return Ok(None);
        };
        let leaf = LeafNode::from_data(ctx.page(leaf_id).data());
        Ok(leaf.lookup(key, &self.comparator))
    }

    /// Insert a key/rid pair. Returns false (and changes nothing) if the
    /// key already exists.
    pub fn insert(&self, key: &IndexKey, rid: &Rid) -> Result<bool> {
        loop {
            {
                let mut ctx = OpContext::new(&self.bpm, AccessMode::Insert);
                if let Some(leaf_id) = self.find_leaf(&mut ctx, Some(key))? {
                    return self.insert_into_leaf(&mut ctx, leaf_id, key, rid);
                }
            }

            // Empty tree: race to install the first root.
            let _root_guard = self.root_latch.lock();
            if !self.is_empty() {
                continue;
            }
            self.start_new_tree(key, rid)?;
            return Ok(true);
        }
    }

    fn start_new_tree(&self, key: &IndexKey, rid: &Rid) -> Result<()> {
        let mut ctx = OpContext::new(&self.bpm, AccessMode::Insert);
        let page_id = ctx.allocate()?;
        {
            let entry = ctx.page_mut(page_id);
            let mut leaf = LeafNode::from_data(entry.data_mut());
            leaf.init(page_id, INVALID_PAGE_ID, self.leaf_max_size);
            leaf.insert(key, rid, &self.comparator);
        }
        self.set_root_page_id(page_id);
        self.update_root_page_id(true)?;
        debug!("started new tree {} with root {}", self.index_name, page_id);
        Ok(())
    }

    fn insert_into_leaf(
        &self,
        ctx: &mut OpContext,
        leaf_id: PageId,
        key: &IndexKey,
        rid: &Rid,
    ) -> Result<bool> {
        let (inserted, at_max) = {
            let entry = ctx.page_mut(leaf_id);
            let mut leaf = LeafNode::from_data(entry.data_mut());
            let before = leaf.size();
            let after = leaf.insert(key, rid, &self.comparator);
            (after != before, after >= leaf.max_size())
        };

        if !inserted {
            return Ok(false);
        }

        if at_max {
            let (sep_key, new_id) = self.split_leaf(ctx, leaf_id)?;
            self.insert_into_parent(ctx, leaf_id, sep_key, new_id)?;
        }

        Ok(true)
    }

    /// Split a full leaf: allocate the right sibling, move the upper half
    /// over, and return the separator that rises into the parent.
    fn split_leaf(&self, ctx: &mut OpContext, leaf_id: PageId) -> Result<(IndexKey, PageId)> {
        let new_id = ctx.allocate()?;

        let (old_entry, new_entry) = ctx.pair_mut(leaf_id, new_id);
        let mut old = LeafNode::from_data(old_entry.data_mut());
        let mut new = LeafNode::from_data(new_entry.data_mut());

        new.init(new_id, old.parent_page_id(), old.max_size());
        old.move_half_to(&mut new);

        let sep_key = new.key_at(0);
        debug!("split leaf {} into {}", leaf_id, new_id);
        Ok((sep_key, new_id))
    }

    /// Split a full internal node. The separator that rises is the first
    /// key moved into the sibling; the moved children are re-parented.
    fn split_internal(&self, ctx: &mut OpContext, node_id: PageId) -> Result<(IndexKey, PageId)> {
        let new_id = ctx.allocate()?;

        let (sep_key, adopted) = {
            let (old_entry, new_entry) = ctx.pair_mut(node_id, new_id);
            let mut old = InternalNode::from_data(old_entry.data_mut());
            let mut new = InternalNode::from_data(new_entry.data_mut());

            new.init(new_id, old.parent_page_id(), old.max_size());
            old.move_half_to(&mut new);

            let adopted: Vec<PageId> = (0..new.size() as usize).map(|i| new.value_at(i)).collect();
            (new.key_at(0), adopted)
        };

        for child in adopted {
            self.reparent(ctx, child, new_id)?;
        }

        debug!("split internal node {} into {}", node_id, new_id);
        Ok((sep_key, new_id))
    }

    /// Hook `new_id` into the tree right of `old_id` under `sep_key`,
    /// growing a new root when the old node was the root and splitting the
    /// parent recursively when it fills up.
    fn insert_into_parent(
        &self,
        ctx: &mut OpContext,
        old_id: PageId,
        sep_key: IndexKey,
        new_id: PageId,
    ) -> Result<()> {
        let (is_root, parent_id) = {
            let view = NodeView::from_data(ctx.page(old_id).data());
            (view.is_root_page(), view.parent_page_id())
        };

        if is_root {
            let root_id = ctx.allocate()?;
            {
                let entry = ctx.page_mut(root_id);
                let mut root = InternalNode::from_data(entry.data_mut());
                root.init(root_id, INVALID_PAGE_ID, self.internal_max_size);
                root.populate_new_root(old_id, &sep_key, new_id);
            }
            self.reparent(ctx, old_id, root_id)?;
            self.reparent(ctx, new_id, root_id)?;
            self.set_root_page_id(root_id);
            self.update_root_page_id(false)?;
            debug!("grew new root {}", root_id);
            return Ok(());
        }

        // The parent is still write-latched on the descent path; the
        // crabbing protocol kept it there because this child was unsafe.
        // A coalesce may leave an internal node resting at max_size, so the
        // insert can push it one past it; the body always has the one
        // spare entry slot this needs.
        let at_max = {
            let entry = ctx.page_mut(parent_id);
            let mut parent = InternalNode::from_data(entry.data_mut());
            let new_size = parent.insert_node_after(old_id, &sep_key, new_id);
            new_size >= parent.max_size()
        };

        if at_max {
            let (parent_sep, parent_new) = self.split_internal(ctx, parent_id)?;
            self.insert_into_parent(ctx, parent_id, parent_sep, parent_new)?;
        }

        Ok(())
    }

    /// Delete `key` if present. Rebalances or collapses the tree when the
    /// leaf underflows.
    pub fn remove(&self, key: &IndexKey) -> Result<()> {
        let mut ctx = OpContext::new(&self.bpm, AccessMode::Remove);
        let Some(leaf_id) = self.find_leaf(&mut ctx, Some(key))? else {
            return Ok(());
        };

        let (removed, below_min) = {
            let entry = ctx.page_mut(leaf_id);
            let mut leaf = LeafNode::from_data(entry.data_mut());
            let before = leaf.size();
            let after = leaf.remove_and_delete_record(key, &self.comparator);
            (after != before, after < leaf.min_size())
        };

        if !removed {
            return Ok(());
        }

        if below_min {
            self.coalesce_or_redistribute(&mut ctx, leaf_id)?;
        }

        Ok(())
    }

    /// A node fell below its minimum occupancy: merge it with a sibling if
    /// the two fit in one node, otherwise shift one entry across.
    fn coalesce_or_redistribute(&self, ctx: &mut OpContext, node_id: PageId) -> Result<()> {
        let (is_root, parent_id) = {
            let view = NodeView::from_data(ctx.page(node_id).data());
            (view.is_root_page(), view.parent_page_id())
        };

        if is_root {
            return self.adjust_root(ctx, node_id);
        }

        // Left neighbor preferred; the leftmost child uses its right one.
        let (index, neighbor_id) = {
            let parent = InternalNode::from_data(ctx.page(parent_id).data());
            let index = parent
                .value_index(node_id)
                .expect("underflowed node must appear in its parent");
            let neighbor_index = if index == 0 { 1 } else { index - 1 };
            (index, parent.value_at(neighbor_index))
        };

        ctx.acquire_extra_write(neighbor_id)?;

        let (node_size, neighbor_size, is_leaf, max_size) = {
            let node_view = NodeView::from_data(ctx.page(node_id).data());
            let neighbor_view = NodeView::from_data(ctx.page(neighbor_id).data());
            (
                node_view.size(),
                neighbor_view.size(),
                node_view.is_leaf(),
                node_view.max_size(),
            )
        };

        let fits_in_one = if is_leaf {
            node_size + neighbor_size < max_size
        } else {
            node_size + neighbor_size <= max_size
        };

        if fits_in_one {
            self.coalesce(ctx, neighbor_id, node_id, parent_id, index)
        } else {
            self.redistribute(ctx, neighbor_id, node_id, parent_id, index)
        }
    }

    /// Fold the right node of the pair into the left one, pull the
    /// separator out of the parent, and queue the emptied page for
    /// deletion. The parent may underflow in turn.
    fn coalesce(
        &self,
        ctx: &mut OpContext,
        neighbor_id: PageId,
        node_id: PageId,
        parent_id: PageId,
        index: usize,
    ) -> Result<()> {
        let (src_id, dst_id, sep_index) = if index == 0 {
            (neighbor_id, node_id, 1)
        } else {
            (node_id, neighbor_id, index)
        };

        let middle_key = {
            let parent = InternalNode::from_data(ctx.page(parent_id).data());
            parent.key_at(sep_index)
        };

        let is_leaf = NodeView::from_data(ctx.page(src_id).data()).is_leaf();

        if is_leaf {
            let (src_entry, dst_entry) = ctx.pair_mut(src_id, dst_id);
            let mut src = LeafNode::from_data(src_entry.data_mut());
            let mut dst = LeafNode::from_data(dst_entry.data_mut());
            src.move_all_to(&mut dst);
        } else {
            let adopted = {
                let (src_entry, dst_entry) = ctx.pair_mut(src_id, dst_id);
                let mut src = InternalNode::from_data(src_entry.data_mut());
                let mut dst = InternalNode::from_data(dst_entry.data_mut());
                let before = dst.size() as usize;
                src.move_all_to(&mut dst, &middle_key);
                (before..dst.size() as usize)
                    .map(|i| dst.value_at(i))
                    .collect::<Vec<_>>()
            };
            for child in adopted {
                self.reparent(ctx, child, dst_id)?;
            }
        }

        debug!("coalesced node {} into {}", src_id, dst_id);
        ctx.mark_deleted(src_id);

        let parent_underflowed = {
            let entry = ctx.page_mut(parent_id);
            let mut parent = InternalNode::from_data(entry.data_mut());
            parent.remove(sep_index);
            parent.size() < parent.min_size()
        };

        if parent_underflowed {
            self.coalesce_or_redistribute(ctx, parent_id)?;
        }

        Ok(())
    }

    /// Shift one entry across the separator and rewrite it in the parent.
    /// The parent's size is unchanged, so the rebalance stops here.
    fn redistribute(
        &self,
        ctx: &mut OpContext,
        neighbor_id: PageId,
        node_id: PageId,
        parent_id: PageId,
        index: usize,
    ) -> Result<()> {
        let is_leaf = NodeView::from_data(ctx.page(node_id).data()).is_leaf();

        if is_leaf {
            if index == 0 {
                // Borrow the right sibling's first entry.
                {
                    let (neighbor_entry, node_entry) = ctx.pair_mut(neighbor_id, node_id);
                    let mut neighbor = LeafNode::from_data(neighbor_entry.data_mut());
                    let mut node = LeafNode::from_data(node_entry.data_mut());
                    neighbor.move_first_to_end_of(&mut node);
                }
                let new_sep = LeafNode::from_data(ctx.page(neighbor_id).data()).key_at(0);
                let mut parent = InternalNode::from_data(ctx.page_mut(parent_id).data_mut());
                parent.set_key_at(1, &new_sep);
            } else {
                // Borrow the left sibling's last entry.
                {
                    let (neighbor_entry, node_entry) = ctx.pair_mut(neighbor_id, node_id);
                    let mut neighbor = LeafNode::from_data(neighbor_entry.data_mut());
                    let mut node = LeafNode::from_data(node_entry.data_mut());
                    neighbor.move_last_to_front_of(&mut node);
                }
                let new_sep = LeafNode::from_data(ctx.page(node_id).data()).key_at(0);
                let mut parent = InternalNode::from_data(ctx.page_mut(parent_id).data_mut());
                parent.set_key_at(index, &new_sep);
            }
        } else if index == 0 {
            let middle_key = {
                let parent = InternalNode::from_data(ctx.page(parent_id).data());
                parent.key_at(1)
            };
            let moved_child = {
                let (neighbor_entry, node_entry) = ctx.pair_mut(neighbor_id, node_id);
                let mut neighbor = InternalNode::from_data(neighbor_entry.data_mut());
                let mut node = InternalNode::from_data(node_entry.data_mut());
                neighbor.move_first_to_end_of(&mut node, &middle_key);
                node.value_at(node.size() as usize - 1)
            };
            self.reparent(ctx, moved_child, node_id)?;
            let new_sep = InternalNode::from_data(ctx.page(neighbor_id).data()).key_at(0);
            let mut parent = InternalNode::from_data(ctx.page_mut(parent_id).data_mut());
            parent.set_key_at(1, &new_sep);
        } else {
            let middle_key = {
                let parent = InternalNode::from_data(ctx.page(parent_id).data());
                parent.key_at(index)
            };
            let moved_child = {
                let (neighbor_entry, node_entry) = ctx.pair_mut(neighbor_id, node_id);
                let mut neighbor = InternalNode::from_data(neighbor_entry.data_mut());
                let mut node = InternalNode::from_data(node_entry.data_mut());
                neighbor.move_last_to_front_of(&mut node, &middle_key);
                node.value_at(0)
            };
            self.reparent(ctx, moved_child, node_id)?;
            // The moved key parked in the dummy slot.
            let new_sep = InternalNode::from_data(ctx.page(node_id).data()).key_at(0);
            let mut parent = InternalNode::from_data(ctx.page_mut(parent_id).data_mut());
            parent.set_key_at(index, &new_sep);
        }

        debug!("redistributed between {} and {}", neighbor_id, node_id);
        Ok(())
    }

    /// The root underflowed: an internal root with a single child hands
    /// the tree to that child; an empty leaf root leaves the tree empty.
    fn adjust_root(&self, ctx: &mut OpContext, root_id: PageId) -> Result<()> {
        let (is_leaf, size) = {
            let view = NodeView::from_data(ctx.page(root_id).data());
            (view.is_leaf(), view.size())
        };

        if !is_leaf && size == 1 {
            let child_id = {
                let entry = ctx.page_mut(root_id);
                let mut root = InternalNode::from_data(entry.data_mut());
                root.remove_and_return_only_child()
            };
            self.reparent(ctx, child_id, INVALID_PAGE_ID)?;
            self.set_root_page_id(child_id);
            self.update_root_page_id(false)?;
            ctx.mark_deleted(root_id);
            debug!("root {} collapsed into {}", root_id, child_id);
        } else if is_leaf && size == 0 {
            self.set_root_page_id(INVALID_PAGE_ID);
            self.update_root_page_id(false)?;
            ctx.mark_deleted(root_id);
            debug!("tree {} is now empty", self.index_name);
        }

        Ok(())
    }

    /// Rewrite a child's parent pointer through the buffer pool. A child
    /// already write-latched by this operation is written through the held
    /// guard; latching it again would self-deadlock.
    fn reparent(&self, ctx: &mut OpContext, child_id: PageId, new_parent: PageId) -> Result<()> {
        if ctx.holds(child_id) {
            let entry = ctx.page_mut(child_id);
            let mut view = NodeView::from_data(entry.data_mut());
            view.set_parent_page_id(new_parent);
            return Ok(());
        }

        let frame = self.bpm.fetch_page(child_id)?;
        {
            let mut guard = frame.wlatch();
            let mut view = NodeView::from_data(&mut *guard);
            view.set_parent_page_id(new_parent);
        }
        self.bpm.unpin_page(child_id, true);
        Ok(())
    }

    /// Iterator positioned at the smallest key.
    pub fn iter(&self) -> Result<TreeIterator<'_>> {
        let mut ctx = OpContext::new(&self.bpm, AccessMode::Read);
        let Some(leaf_id) = self.find_leaf(&mut ctx, None)? else {
            return Ok(TreeIterator::end(&self.bpm));
        };
        // The iterator takes its own pin before the descent unwinds.
        let frame = self.bpm.fetch_page(leaf_id)?;
        Ok(TreeIterator::new(&self.bpm, frame, leaf_id, 0))
    }

    /// Iterator positioned at the first key >= `key`.
    pub fn iter_from(&self, key: &IndexKey) -> Result<TreeIterator<'_>> {
        let mut ctx = OpContext::new(&self.bpm, AccessMode::Read);
        let Some(leaf_id) = self.find_leaf(&mut ctx, Some(key))? else {
            return Ok(TreeIterator::end(&self.bpm));
        };
        let offset = LeafNode::from_data(ctx.page(leaf_id).data()).key_index(key, &self.comparator);
        let frame = self.bpm.fetch_page(leaf_id)?;
        Ok(TreeIterator::new(&self.bpm, frame, leaf_id, offset))
    }

    /// Insert one integer key per line; the rid derives from the key.
    pub fn insert_from_file(&self, path: &Path) -> Result<()> {
        let file =
            File::open(path).with_context(|| format!("Failed to open key file: {:?}", path))?;
        for line in BufReader::new(file).lines() {
            let line = line?;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let value: i64 = trimmed
                .parse()
                .with_context(|| format!("Invalid key: {}", trimmed))?;
            let key = IndexKey::from_i64(value);
            let rid = Rid::new(PageId((value >> 32) as i32), value as u32);
            self.insert(&key, &rid)?;
        }
        Ok(())
    }

    /// Remove one integer key per line.
    pub fn remove_from_file(&self, path: &Path) -> Result<()> {
        let file =
            File::open(path).with_context(|| format!("Failed to open key file: {:?}", path))?;
        for line in BufReader::new(file).lines() {
            let line = line?;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let value: i64 = trimmed
                .parse()
                .with_context(|| format!("Invalid key: {}", trimmed))?;
            self.remove(&IndexKey::from_i64(value))?;
        }
        Ok(())
    }

    /// Walk the whole tree and check its structural invariants: node
    /// occupancy bounds, in-node ordering, separator bounds, parent
    /// pointers, and the ascending acyclic leaf chain. Meant for tests and
    /// debugging on a quiesced tree.
    pub fn verify_integrity(&self) -> Result<()> {
        let root_id = self.root_page_id();
        if !root_id.is_valid() {
            return Ok(());
        }

        let mut leaves = Vec::new();
        let mut keys = Vec::new();
        self.verify_node(root_id, INVALID_PAGE_ID, None, None, &mut leaves, &mut keys)?;

        for pair in keys.windows(2) {
            ensure!(pair[0] < pair[1], "keys are not strictly ascending");
        }

        // The chain must visit exactly the leaves found by the descent,
        // left to right.
        let Some(&first_leaf) = leaves.first() else {
            bail!("non-empty tree has no leaves");
        };
        let mut chain = Vec::new();
        let mut current = first_leaf;
        loop {
            ensure!(chain.len() <= leaves.len(), "leaf chain has a cycle");
            chain.push(current);
            let data = self.copy_node(current)?;
            let next = LeafNode::from_data(&data).next_page_id();
            if !next.is_valid() {
                break;
            }
            current = next;
        }
        ensure!(
            chain == leaves,
            "leaf chain disagrees with the tree structure"
        );

        Ok(())
    }

    fn copy_node(&self, page_id: PageId) -> Result<[u8; crate::storage::PAGE_SIZE]> {
        let frame = self.bpm.fetch_page(page_id)?;
        let data = {
            let guard = frame.rlatch();
            *guard
        };
        self.bpm.unpin_page(page_id, false);
        Ok(data)
    }

    fn verify_node(
        &self,
        page_id: PageId,
        expected_parent: PageId,
        lower: Option<IndexKey>,
        upper: Option<IndexKey>,
        leaves: &mut Vec<PageId>,
        keys: &mut Vec<i64>,
    ) -> Result<()> {
        use std::cmp::Ordering as KeyOrdering;

        let data = self.copy_node(page_id)?;
        let view = NodeView::from_data(&data);
        let is_root = !expected_parent.is_valid();

        ensure!(
            view.page_id() == page_id,
            "page {} header claims id {}",
            page_id,
            view.page_id()
        );
        ensure!(
            view.parent_page_id() == expected_parent,
            "page {} has parent {}, expected {}",
            page_id,
            view.parent_page_id(),
            expected_parent
        );

        if view.is_leaf() {
            let leaf = LeafNode::from_data(&data);
            let size = leaf.size() as usize;

            if is_root {
                ensure!(size >= 1, "root leaf {} is empty", page_id);
            } else {
                ensure!(
                    size >= leaf.min_size() as usize && size <= leaf.max_size() as usize - 1,
                    "leaf {} occupancy {} out of bounds",
                    page_id,
                    size
                );
            }

            for i in 0..size {
                let k = leaf.key_at(i);
                if i > 0 {
                    ensure!(
                        self.comparator.compare(&leaf.key_at(i - 1), &k) == KeyOrdering::Less,
                        "leaf {} keys out of order",
                        page_id
                    );
                }
                if let Some(lo) = &lower {
                    ensure!(
                        self.comparator.compare(&k, lo) != KeyOrdering::Less,
                        "leaf {} violates its lower bound",
                        page_id
                    );
                }
                if let Some(up) = &upper {
                    ensure!(
                        self.comparator.compare(&k, up) == KeyOrdering::Less,
                        "leaf {} violates its upper bound",
                        page_id
                    );
                }
                keys.push(k.to_i64());
            }

            leaves.push(page_id);
        } else {
            let node = InternalNode::from_data(&data);
            let size = node.size() as usize;

            if is_root {
                ensure!(size >= 2, "internal root {} has {} children", page_id, size);
            } else {
                ensure!(
                    size >= node.min_size() as usize && size <= node.max_size() as usize,
                    "internal node {} occupancy {} out of bounds",
                    page_id,
                    size
                );
            }

            for i in 2..size {
                ensure!(
                    self.comparator.compare(&node.key_at(i - 1), &node.key_at(i)) == KeyOrdering::Less,
                    "internal node {} separators out of order",
                    page_id
                );
            }

            for i in 0..size {
                let child_lower = if i == 0 { lower } else { Some(node.key_at(i)) };
                let child_upper = if i + 1 < size {
                    Some(node.key_at(i + 1))
                } else {
                    upper
                };
                self.verify_node(node.value_at(i), page_id, child_lower, child_upper, leaves, keys)?;
            }
        }

        Ok(())
    }
}
