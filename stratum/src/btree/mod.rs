//! B+tree secondary indexes over multi-column keys. Nodes reference each
//! other by page number; ownership of the pages stays with the buffer
//! pool. Leaves form a doubly linked chain in key order for range scans.
//!
//! Concurrency: mutating operations hold the index's structural latch
//! exclusively for their whole run (splits and merges propagate under
//! it); readers share it. Every page access additionally goes through
//! the page latch, so a reader never observes a half-split node.

pub mod key;
pub mod node;
pub mod scan;

pub use key::{ColType, KeySchema, Value};
pub use scan::IndexScan;

use std::sync::{Arc, Mutex, RwLock};

use bytes::{Buf, BufMut};
use log::trace;

use crate::buffer_pool::{BufferPool, PageGuard};
use crate::disk::{DiskManager, FileId};
use crate::error::{EngineError, Result};
use crate::page::{PageId, Rid};
use crate::{PageNo, NO_PAGE, PAGE_SIZE};

use node::{NodeHeader, NodeLayout, NODE_HEADER_SIZE, RID_SIZE};

/// An index slot position: `(node page, key slot)`. Transient — any
/// concurrent mutation of the index invalidates it.
pub type Iid = Rid;

/// Page 0 of an index file.
pub const INDEX_HEADER_PAGE: PageNo = 0;

/// Mutable part of the on-disk index header.
#[derive(Debug, Clone, Copy)]
struct IndexHeaderState {
    num_pages: u32,
    root_page: PageNo,
    first_leaf: PageNo,
    last_leaf: PageNo,
}

/// Handle on one open index file.
pub struct Index {
    name: String,
    fd: FileId,
    disk: Arc<DiskManager>,
    pool: Arc<BufferPool>,
    layout: NodeLayout,
    header: Mutex<IndexHeaderState>,
    tree_latch: RwLock<()>,
}

/// Largest even order such that an overflowed node still fits in a page.
fn default_order(key_len: usize) -> usize {
    let mut order = (PAGE_SIZE - NODE_HEADER_SIZE - key_len - 2 * RID_SIZE)
        / (key_len + RID_SIZE);
    order &= !1;
    order
}

fn node_bytes_for(order: usize, key_len: usize) -> usize {
    NODE_HEADER_SIZE + (order + 1) * key_len + (order + 2) * RID_SIZE
}

impl Index {
    /// Creates an index file with its header page and an empty root leaf.
    pub fn create(
        disk: &Arc<DiskManager>,
        file_name: &str,
        schema: &KeySchema,
        order: Option<usize>,
    ) -> Result<()> {
        let key_len = schema.total_len();
        let order = order.unwrap_or_else(|| default_order(key_len));
        if order < 2 || node_bytes_for(order, key_len) > PAGE_SIZE {
            return Err(EngineError::Internal(format!(
                "order {order} with {key_len}-byte keys does not fit a page"
            )));
        }

        disk.create_file(file_name)?;
        let fd = disk.open_file(file_name)?;

        let header = IndexHeaderState {
            num_pages: 2,
            root_page: 1,
            first_leaf: 1,
            last_leaf: 1,
        };
        write_header(disk, fd, &header, schema, order)?;

        let mut root = vec![0u8; PAGE_SIZE];
        let node_header = NodeHeader {
            num_keys: 0,
            parent: NO_PAGE,
            next_leaf: NO_PAGE,
            prev_leaf: NO_PAGE,
            is_leaf: 1,
        };
        unsafe {
            std::ptr::write_unaligned(root.as_mut_ptr() as *mut NodeHeader, node_header);
        }
        disk.write_page(fd, 1, &root)?;
        Ok(())
    }

    /// Opens an existing index file, decoding schema and order from its
    /// header page.
    pub fn open(
        disk: Arc<DiskManager>,
        pool: Arc<BufferPool>,
        name: &str,
        file_name: &str,
    ) -> Result<Self> {
        let fd = disk.open_file(file_name)?;
        let mut buf = vec![0u8; PAGE_SIZE];
        disk.read_page(fd, INDEX_HEADER_PAGE, &mut buf)?;
        let (header, schema, order) = decode_header(&buf)?;
        disk.set_next_page_no(fd, header.num_pages as PageNo)?;
        Ok(Self {
            name: name.to_string(),
            fd,
            disk,
            pool,
            layout: NodeLayout { schema, order },
            header: Mutex::new(header),
            tree_latch: RwLock::new(()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fd(&self) -> FileId {
        self.fd
    }

    pub fn schema(&self) -> &KeySchema {
        &self.layout.schema
    }

    pub fn order(&self) -> usize {
        self.layout.order
    }

    pub(crate) fn layout(&self) -> &NodeLayout {
        &self.layout
    }

    pub(crate) fn tree_latch(&self) -> &RwLock<()> {
        &self.tree_latch
    }

    fn root_page(&self) -> PageNo {
        self.header.lock().unwrap().root_page
    }

    pub(crate) fn fetch(&self, page_no: PageNo) -> Result<PageGuard<'_>> {
        self.pool.fetch_page(PageId::new(self.fd, page_no))
    }

    fn create_node(&self, is_leaf: bool) -> Result<PageGuard<'_>> {
        let guard = self.pool.new_page(self.fd, None)?;
        {
            let mut page = guard.write();
            self.layout.init_node(&mut page, is_leaf);
        }
        self.header.lock().unwrap().num_pages += 1;
        Ok(guard)
    }

    fn delete_node_page(&self, page_no: PageNo) -> Result<()> {
        if !self.pool.delete_page(PageId::new(self.fd, page_no))? {
            return Err(EngineError::Internal(format!(
                "index node {page_no} still pinned at delete"
            )));
        }
        self.header.lock().unwrap().num_pages -= 1;
        Ok(())
    }

    fn save_header(&self) -> Result<()> {
        let header = *self.header.lock().unwrap();
        write_header(&self.disk, self.fd, &header, &self.layout.schema, self.layout.order)
    }

    /// Writes the header and every dirty node page back to disk.
    pub fn flush(&self) -> Result<()> {
        self.save_header()?;
        self.pool.flush_all_pages(self.fd)
    }

    fn check_key(&self, key: &[u8]) -> Result<()> {
        if key.len() != self.layout.key_len() {
            return Err(EngineError::Internal(format!(
                "key of {} bytes against index {} with {}-byte keys",
                key.len(),
                self.name,
                self.layout.key_len()
            )));
        }
        Ok(())
    }

    /// Descends from the root to the leaf covering `key`, coupling page
    /// latches one level at a time. `None` on an empty tree.
    fn find_leaf(&self, key: &[u8]) -> Result<Option<PageNo>> {
        let mut current = self.root_page();
        if current == NO_PAGE {
            return Ok(None);
        }
        loop {
            let guard = self.fetch(current)?;
            let page = guard.read();
            if self.layout.is_leaf(&page) {
                return Ok(Some(current));
            }
            current = self.layout.internal_lookup(&page, key);
        }
    }

    /// Point lookup. At most one match, since duplicate insertion is a
    /// no-op.
    pub fn get_value(&self, key: &[u8]) -> Result<Vec<Rid>> {
        self.check_key(key)?;
        let _latch = self.tree_latch.read().unwrap();
        let Some(leaf_no) = self.find_leaf(key)? else {
            return Ok(Vec::new());
        };
        let guard = self.fetch(leaf_no)?;
        let page = guard.read();
        Ok(self
            .layout
            .leaf_lookup(&page, key)
            .map(|(_, rid)| rid)
            .into_iter()
            .collect())
    }

    /// Inserts `key -> rid`, splitting up the tree as needed. Returns
    /// the leaf page the pair landed in; inserting an existing key is a
    /// no-op.
    pub fn insert_entry(&self, key: &[u8], rid: Rid) -> Result<PageNo> {
        self.check_key(key)?;
        let _latch = self.tree_latch.write().unwrap();

        if self.root_page() == NO_PAGE {
            // Every key was deleted at some point; regrow from a root leaf.
            let guard = self.create_node(true)?;
            let leaf_no = guard.page_id().page_no;
            {
                let mut page = guard.write();
                self.layout.leaf_insert(&mut page, key, rid);
            }
            let mut header = self.header.lock().unwrap();
            header.root_page = leaf_no;
            header.first_leaf = leaf_no;
            header.last_leaf = leaf_no;
            drop(header);
            drop(guard);
            self.save_header()?;
            return Ok(leaf_no);
        }

        let leaf_no = match self.find_leaf(key)? {
            Some(no) => no,
            None => unreachable!("non-empty tree always has a leaf"),
        };
        let size = {
            let guard = self.fetch(leaf_no)?;
            let mut page = guard.write();
            self.layout.leaf_insert(&mut page, key, rid)
        };
        if size <= self.layout.order {
            return Ok(leaf_no);
        }

        let sibling_no = self.split(leaf_no)?;
        let promoted = {
            let guard = self.fetch(sibling_no)?;
            let page = guard.read();
            self.layout.key(&page, 0).to_vec()
        };
        self.insert_into_parent(leaf_no, &promoted, sibling_no)?;
        self.save_header()?;
        Ok(leaf_no)
    }

    /// Removes `key`. Returns false if the key is not present.
    pub fn delete_entry(&self, key: &[u8]) -> Result<bool> {
        self.check_key(key)?;
        let _latch = self.tree_latch.write().unwrap();

        let Some(leaf_no) = self.find_leaf(key)? else {
            return Ok(false);
        };
        {
            let guard = self.fetch(leaf_no)?;
            let mut page = guard.write();
            let Some((pos, _)) = self.layout.leaf_lookup(&page, key) else {
                return Ok(false);
            };
            self.layout.erase_pair(&mut page, pos);
        }
        self.coalesce_or_redistribute(leaf_no)?;
        self.save_header()?;
        Ok(true)
    }

    /// Splits an overflowed node, moving its upper half into a fresh
    /// right sibling. Returns the sibling's page number; the caller
    /// promotes the separator.
    fn split(&self, node_no: PageNo) -> Result<PageNo> {
        let node_guard = self.fetch(node_no)?;
        let is_leaf = self.layout.is_leaf(&node_guard.read());
        let sibling_guard = self.create_node(is_leaf)?;
        let sibling_no = sibling_guard.page_id().page_no;

        let mut moved_children = Vec::new();
        let old_next_leaf;
        {
            let mut node = node_guard.write();
            let mut sibling = sibling_guard.write();
            let node_header = self.layout.header(&node);
            let size = node_header.num_keys as usize;
            let mid = size / 2;

            if is_leaf {
                for i in mid..size {
                    let k = self.layout.key(&node, i).to_vec();
                    self.layout.set_key(&mut sibling, i - mid, &k);
                    self.layout.set_rid(&mut sibling, i - mid, self.layout.rid(&node, i));
                }
                self.layout.set_header(
                    &mut sibling,
                    &NodeHeader {
                        num_keys: (size - mid) as u32,
                        parent: node_header.parent,
                        next_leaf: node_header.next_leaf,
                        prev_leaf: node_no,
                        is_leaf: 1,
                    },
                );
                old_next_leaf = node_header.next_leaf;
                let mut node_header = node_header;
                node_header.next_leaf = sibling_no;
                self.layout.set_header(&mut node, &node_header);
                self.layout.truncate(&mut node, mid, false);
            } else {
                // The sibling takes keys [mid, size) and the children
                // that follow them; its first key is promoted and erased
                // by insert_into_parent.
                for i in mid..size {
                    let k = self.layout.key(&node, i).to_vec();
                    self.layout.set_key(&mut sibling, i - mid, &k);
                    let child = self.layout.rid(&node, i + 1);
                    self.layout.set_rid(&mut sibling, i - mid, child);
                    moved_children.push(child.page_no);
                }
                self.layout.set_header(
                    &mut sibling,
                    &NodeHeader {
                        num_keys: (size - mid) as u32,
                        parent: node_header.parent,
                        next_leaf: NO_PAGE,
                        prev_leaf: NO_PAGE,
                        is_leaf: 0,
                    },
                );
                old_next_leaf = NO_PAGE;
                self.layout.truncate(&mut node, mid, true);
            }
        }

        if is_leaf {
            // Keep the chain doubly linked around the new sibling.
            if old_next_leaf != NO_PAGE {
                let next_guard = self.fetch(old_next_leaf)?;
                let mut next = next_guard.write();
                let mut h = self.layout.header(&next);
                h.prev_leaf = sibling_no;
                self.layout.set_header(&mut next, &h);
            }
            let mut header = self.header.lock().unwrap();
            if header.last_leaf == node_no {
                header.last_leaf = sibling_no;
            }
        } else {
            for child_no in moved_children {
                self.set_parent(child_no, sibling_no)?;
            }
        }
        trace!("split node {node_no} of index {}, new sibling {sibling_no}", self.name);
        Ok(sibling_no)
    }

    fn set_parent(&self, page_no: PageNo, parent: PageNo) -> Result<()> {
        let guard = self.fetch(page_no)?;
        let mut page = guard.write();
        let mut header = self.layout.header(&page);
        header.parent = parent;
        self.layout.set_header(&mut page, &header);
        Ok(())
    }

    /// Index of `child_no` among the parent's child rids.
    fn find_child(&self, parent: &PageGuard<'_>, child_no: PageNo) -> Result<usize> {
        let page = parent.read();
        let num_keys = self.layout.num_keys(&page);
        for i in 0..=num_keys {
            if self.layout.child_at(&page, i) == child_no {
                return Ok(i);
            }
        }
        Err(EngineError::Internal(format!(
            "node {child_no} missing from its parent in index {}",
            self.name
        )))
    }

    /// Threads a freshly split-off sibling into the parent, recursing if
    /// the parent overflows in turn.
    fn insert_into_parent(
        &self,
        node_no: PageNo,
        promoted: &[u8],
        sibling_no: PageNo,
    ) -> Result<()> {
        let (parent_no, node_is_leaf) = {
            let guard = self.fetch(node_no)?;
            let page = guard.read();
            let h = self.layout.header(&page);
            (h.parent, h.is_leaf != 0)
        };

        if parent_no == NO_PAGE {
            // The root split: grow the tree by one level.
            let root_guard = self.create_node(false)?;
            let root_no = root_guard.page_id().page_no;
            {
                let mut root = root_guard.write();
                self.layout.set_key(&mut root, 0, promoted);
                self.layout.set_rid(&mut root, 0, Rid::new(node_no, 0));
                self.layout.set_rid(&mut root, 1, Rid::new(sibling_no, 0));
                let mut h = self.layout.header(&root);
                h.num_keys = 1;
                self.layout.set_header(&mut root, &h);
            }
            self.set_parent(node_no, root_no)?;
            self.set_parent(sibling_no, root_no)?;
            if !node_is_leaf {
                self.erase_promoted_key(sibling_no)?;
            }
            self.header.lock().unwrap().root_page = root_no;
            return Ok(());
        }

        let parent_guard = self.fetch(parent_no)?;
        let child_idx = self.find_child(&parent_guard, node_no)?;
        {
            let mut parent = parent_guard.write();
            self.layout
                .insert_pairs(&mut parent, child_idx, child_idx + 1, promoted, &[Rid::new(
                    sibling_no, 0,
                )]);
        }
        self.set_parent(sibling_no, parent_no)?;
        if !node_is_leaf {
            self.erase_promoted_key(sibling_no)?;
        }

        let parent_size = self.layout.num_keys(&parent_guard.read());
        drop(parent_guard);
        if parent_size > self.layout.order {
            let new_sibling = self.split(parent_no)?;
            let promoted = {
                let guard = self.fetch(new_sibling)?;
                let page = guard.read();
                self.layout.key(&page, 0).to_vec()
            };
            self.insert_into_parent(parent_no, &promoted, new_sibling)?;
        }
        Ok(())
    }

    /// After an internal promotion the sibling's first key has been
    /// elevated; drop it, keeping the child rid it led.
    fn erase_promoted_key(&self, sibling_no: PageNo) -> Result<()> {
        let guard = self.fetch(sibling_no)?;
        let mut page = guard.write();
        self.layout.erase_first_key(&mut page);
        Ok(())
    }

    /// Rebalances `node_no` after a deletion left it underfull,
    /// recursing up when a merge shrinks the parent.
    fn coalesce_or_redistribute(&self, node_no: PageNo) -> Result<()> {
        let (parent_no, size) = {
            let guard = self.fetch(node_no)?;
            let page = guard.read();
            let h = self.layout.header(&page);
            (h.parent, h.num_keys as usize)
        };
        if parent_no == NO_PAGE {
            return self.adjust_root(node_no);
        }
        if size >= self.layout.min_keys() {
            return Ok(());
        }

        let parent_guard = self.fetch(parent_no)?;
        let child_idx = self.find_child(&parent_guard, node_no)?;
        // Prefer the previous sibling; the leftmost child borrows from
        // the next one.
        let sibling_is_prev = child_idx > 0;
        let sibling_idx = if sibling_is_prev { child_idx - 1 } else { child_idx + 1 };
        let sibling_no = self.layout.child_at(&parent_guard.read(), sibling_idx);
        let (sibling_size, is_leaf) = {
            let guard = self.fetch(sibling_no)?;
            let page = guard.read();
            (self.layout.num_keys(&page), self.layout.is_leaf(&page))
        };

        let can_merge = if is_leaf {
            size + sibling_size <= self.layout.order
        } else {
            size + sibling_size + 1 <= self.layout.order
        };
        if size + sibling_size >= 2 * self.layout.min_keys() || !can_merge {
            self.redistribute(sibling_no, node_no, &parent_guard, child_idx, sibling_is_prev)
        } else {
            self.coalesce(sibling_no, node_no, &parent_guard, child_idx, sibling_is_prev)?;
            drop(parent_guard);
            self.coalesce_or_redistribute(parent_no)
        }
    }

    /// Shrinks the root: an internal root with a single child promotes
    /// that child; an empty root leaf empties the tree.
    fn adjust_root(&self, root_no: PageNo) -> Result<()> {
        let (is_leaf, size, only_child) = {
            let guard = self.fetch(root_no)?;
            let page = guard.read();
            let h = self.layout.header(&page);
            (h.is_leaf != 0, h.num_keys as usize, self.layout.child_at(&page, 0))
        };

        if !is_leaf && size == 0 {
            self.set_parent(only_child, NO_PAGE)?;
            self.header.lock().unwrap().root_page = only_child;
            self.delete_node_page(root_no)?;
        } else if is_leaf && size == 0 {
            let mut header = self.header.lock().unwrap();
            header.root_page = NO_PAGE;
            header.first_leaf = NO_PAGE;
            header.last_leaf = NO_PAGE;
            drop(header);
            self.delete_node_page(root_no)?;
        }
        Ok(())
    }

    /// Moves one pair across the sibling boundary, rotating the
    /// separator through the parent.
    fn redistribute(
        &self,
        sibling_no: PageNo,
        node_no: PageNo,
        parent: &PageGuard<'_>,
        child_idx: usize,
        sibling_is_prev: bool,
    ) -> Result<()> {
        let sibling_guard = self.fetch(sibling_no)?;
        let node_guard = self.fetch(node_no)?;
        let mut moved_child = NO_PAGE;
        {
            let mut sibling = sibling_guard.write();
            let mut node = node_guard.write();
            let is_leaf = self.layout.is_leaf(&node);
            let sibling_size = self.layout.num_keys(&sibling);
            let node_size = self.layout.num_keys(&node);

            if is_leaf {
                if sibling_is_prev {
                    let k = self.layout.key(&sibling, sibling_size - 1).to_vec();
                    let r = self.layout.rid(&sibling, sibling_size - 1);
                    self.layout.erase_pair(&mut sibling, sibling_size - 1);
                    self.layout.insert_pairs(&mut node, 0, 0, &k, &[r]);
                    let mut parent_page = parent.write();
                    self.layout.set_key(&mut parent_page, child_idx - 1, &k);
                } else {
                    let k = self.layout.key(&sibling, 0).to_vec();
                    let r = self.layout.rid(&sibling, 0);
                    self.layout.erase_pair(&mut sibling, 0);
                    self.layout.insert_pairs(&mut node, node_size, node_size, &k, &[r]);
                    let new_separator = self.layout.key(&sibling, 0).to_vec();
                    let mut parent_page = parent.write();
                    self.layout.set_key(&mut parent_page, child_idx, &new_separator);
                }
            } else if sibling_is_prev {
                let moved_key = self.layout.key(&sibling, sibling_size - 1).to_vec();
                let moved_rid = self.layout.rid(&sibling, sibling_size);
                let old_separator = self.layout.key(&parent.read(), child_idx - 1).to_vec();
                self.layout.insert_pairs(&mut node, 0, 0, &old_separator, &[moved_rid]);
                self.layout.erase_at(&mut sibling, sibling_size - 1, sibling_size);
                let mut parent_page = parent.write();
                self.layout.set_key(&mut parent_page, child_idx - 1, &moved_key);
                moved_child = moved_rid.page_no;
            } else {
                let moved_rid = self.layout.rid(&sibling, 0);
                let new_separator = self.layout.key(&sibling, 0).to_vec();
                let old_separator = self.layout.key(&parent.read(), child_idx).to_vec();
                self.layout
                    .insert_pairs(&mut node, node_size, node_size + 1, &old_separator, &[moved_rid]);
                self.layout.erase_at(&mut sibling, 0, 0);
                let mut parent_page = parent.write();
                self.layout.set_key(&mut parent_page, child_idx, &new_separator);
                moved_child = moved_rid.page_no;
            }
        }
        if moved_child != NO_PAGE {
            self.set_parent(moved_child, node_no)?;
        }
        Ok(())
    }

    /// Merges the right node of the pair into the left one, pulling the
    /// separator down for internal nodes, and removes the right child
    /// from the parent.
    fn coalesce(
        &self,
        sibling_no: PageNo,
        node_no: PageNo,
        parent: &PageGuard<'_>,
        child_idx: usize,
        sibling_is_prev: bool,
    ) -> Result<()> {
        let (left_no, right_no, separator_idx) = if sibling_is_prev {
            (sibling_no, node_no, child_idx - 1)
        } else {
            (node_no, sibling_no, child_idx)
        };
        let separator = {
            let page = parent.read();
            self.layout.key(&page, separator_idx).to_vec()
        };

        let left_guard = self.fetch(left_no)?;
        let right_guard = self.fetch(right_no)?;
        let mut moved_children = Vec::new();
        let mut old_next_leaf = NO_PAGE;
        let is_leaf;
        {
            let mut left = left_guard.write();
            let right = right_guard.read();
            let left_size = self.layout.num_keys(&left);
            let right_size = self.layout.num_keys(&right);
            is_leaf = self.layout.is_leaf(&right);

            if is_leaf {
                for i in 0..right_size {
                    let k = self.layout.key(&right, i).to_vec();
                    self.layout.set_key(&mut left, left_size + i, &k);
                    self.layout.set_rid(&mut left, left_size + i, self.layout.rid(&right, i));
                }
                let right_header = self.layout.header(&right);
                old_next_leaf = right_header.next_leaf;
                let mut left_header = self.layout.header(&left);
                left_header.num_keys = (left_size + right_size) as u32;
                left_header.next_leaf = right_header.next_leaf;
                self.layout.set_header(&mut left, &left_header);
            } else {
                self.layout.set_key(&mut left, left_size, &separator);
                for i in 0..right_size {
                    let k = self.layout.key(&right, i).to_vec();
                    self.layout.set_key(&mut left, left_size + 1 + i, &k);
                }
                for i in 0..=right_size {
                    let child = self.layout.rid(&right, i);
                    self.layout.set_rid(&mut left, left_size + 1 + i, child);
                    moved_children.push(child.page_no);
                }
                let mut left_header = self.layout.header(&left);
                left_header.num_keys = (left_size + 1 + right_size) as u32;
                self.layout.set_header(&mut left, &left_header);
            }
        }

        if is_leaf {
            if old_next_leaf != NO_PAGE {
                let next_guard = self.fetch(old_next_leaf)?;
                let mut next = next_guard.write();
                let mut h = self.layout.header(&next);
                h.prev_leaf = left_no;
                self.layout.set_header(&mut next, &h);
            }
            let mut header = self.header.lock().unwrap();
            if header.last_leaf == right_no {
                header.last_leaf = left_no;
            }
        } else {
            for child_no in moved_children {
                self.set_parent(child_no, left_no)?;
            }
        }

        {
            let mut parent_page = parent.write();
            self.layout.erase_at(&mut parent_page, separator_idx, separator_idx + 1);
        }
        drop(right_guard);
        self.delete_node_page(right_no)?;
        trace!("coalesced node {right_no} into {left_no} in index {}", self.name);
        Ok(())
    }

    /// `Iid` of the first entry `>= key`.
    pub fn lower_bound(&self, key: &[u8]) -> Result<Iid> {
        self.check_key(key)?;
        let _latch = self.tree_latch.read().unwrap();
        let Some(leaf_no) = self.find_leaf(key)? else {
            return Ok(Iid::new(NO_PAGE, 0));
        };
        let guard = self.fetch(leaf_no)?;
        let page = guard.read();
        Ok(Iid::new(leaf_no, self.layout.lower_bound(&page, key) as i32))
    }

    /// `Iid` one past the last entry `<= key`.
    pub fn upper_bound(&self, key: &[u8]) -> Result<Iid> {
        self.check_key(key)?;
        let _latch = self.tree_latch.read().unwrap();
        let Some(leaf_no) = self.find_leaf(key)? else {
            return Ok(Iid::new(NO_PAGE, 0));
        };
        let guard = self.fetch(leaf_no)?;
        let page = guard.read();
        Ok(Iid::new(leaf_no, self.layout.upper_bound(&page, key) as i32))
    }

    /// `Iid` of the first entry of the first leaf.
    pub fn leaf_begin(&self) -> Iid {
        let header = self.header.lock().unwrap();
        if header.first_leaf == NO_PAGE {
            return Iid::new(NO_PAGE, 0);
        }
        Iid::new(header.first_leaf, 0)
    }

    /// `Iid` one past the last entry of the last leaf.
    pub fn leaf_end(&self) -> Result<Iid> {
        let last_leaf = self.header.lock().unwrap().last_leaf;
        if last_leaf == NO_PAGE {
            return Ok(Iid::new(NO_PAGE, 0));
        }
        let guard = self.fetch(last_leaf)?;
        let size = self.layout.num_keys(&guard.read());
        Ok(Iid::new(last_leaf, size as i32))
    }

    /// Resolves an `Iid` to the record id stored at that slot.
    pub fn get_rid(&self, iid: Iid) -> Result<Rid> {
        if iid.page_no == NO_PAGE {
            return Err(EngineError::IndexEntryNotFound);
        }
        let guard = self.fetch(iid.page_no)?;
        let page = guard.read();
        if iid.slot_no < 0 || iid.slot_no as usize >= self.layout.num_keys(&page) {
            return Err(EngineError::IndexEntryNotFound);
        }
        Ok(self.layout.rid(&page, iid.slot_no as usize))
    }

    /// Range scan over `[lower, upper)` in key space; an unbounded side
    /// covers from the first or to the last leaf.
    pub fn range_scan(&self, lower: Option<&[u8]>, upper: Option<&[u8]>) -> Result<IndexScan<'_>> {
        let begin = match lower {
            Some(key) => self.lower_bound(key)?,
            None => self.leaf_begin(),
        };
        let end = match upper {
            Some(key) => self.upper_bound(key)?,
            None => self.leaf_end()?,
        };
        IndexScan::new(self, begin, end)
    }
}

fn write_header(
    disk: &Arc<DiskManager>,
    fd: FileId,
    header: &IndexHeaderState,
    schema: &KeySchema,
    order: usize,
) -> Result<()> {
    let mut buf = Vec::with_capacity(PAGE_SIZE);
    buf.put_u32_le(header.num_pages);
    buf.put_i32_le(header.root_page);
    buf.put_i32_le(header.first_leaf);
    buf.put_i32_le(header.last_leaf);
    buf.put_u32_le(schema.cols().len() as u32);
    buf.put_u32_le(schema.total_len() as u32);
    buf.put_u32_le(order as u32);
    for &(ty, _) in schema.cols() {
        buf.put_u8(ty.tag());
    }
    for &(_, len) in schema.cols() {
        buf.put_u32_le(len);
    }
    buf.resize(PAGE_SIZE, 0);
    disk.write_page(fd, INDEX_HEADER_PAGE, &buf)
}

fn decode_header(buf: &[u8]) -> Result<(IndexHeaderState, KeySchema, usize)> {
    let mut cursor = buf;
    let num_pages = cursor.get_u32_le();
    let root_page = cursor.get_i32_le();
    let first_leaf = cursor.get_i32_le();
    let last_leaf = cursor.get_i32_le();
    let col_num = cursor.get_u32_le() as usize;
    let col_tot_len = cursor.get_u32_le() as usize;
    let order = cursor.get_u32_le() as usize;
    let mut types = Vec::with_capacity(col_num);
    for _ in 0..col_num {
        types.push(ColType::from_tag(cursor.get_u8())?);
    }
    let mut cols = Vec::with_capacity(col_num);
    for ty in types {
        cols.push((ty, cursor.get_u32_le()));
    }
    let schema = KeySchema::new(cols)?;
    if schema.total_len() != col_tot_len {
        return Err(EngineError::Internal(
            "index header column lengths disagree with total".into(),
        ));
    }
    Ok((
        IndexHeaderState {
            num_pages,
            root_page,
            first_leaf,
            last_leaf,
        },
        schema,
        order,
    ))
}
