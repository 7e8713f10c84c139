use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;

use crate::common::types::{Entry, PageNum};
use crate::index::btree::node::{self, Layout, NODE_LEAF};
use crate::index::{Index, IndexError, IndexKind, IndexMeta};
use crate::storage::pager::{PageHandle, PageWriteGuard, Pager};

/// A latched, pinned node on the descent path. Field order matters:
/// the latch must release before the pin.
struct Latched {
    guard: PageWriteGuard,
    handle: PageHandle,
}

/// A key promoted out of a split, headed for the parent.
struct SplitResult {
    key: i64,
    left_pn: PageNum,
    right_pn: PageNum,
}

/// Disk-backed B+-tree over `(i64, i64)` entries. Leaves form a
/// singly linked list in key order; the root page number lives in the
/// sidecar meta file.
pub struct BTreeIndex {
    name: String,
    pager: Arc<Pager>,
    meta_path: PathBuf,
    layout: Layout,
    root: Mutex<PageNum>,
}

impl BTreeIndex {
    /// Create a fresh tree whose root is a single empty leaf.
    pub fn create(name: &str, pager: Arc<Pager>, meta_path: &Path) -> Result<Self, IndexError> {
        Self::create_with_layout(name, pager, meta_path, Layout::default())
    }

    /// Create with explicit node capacities. Tests use tiny
    /// capacities to exercise splits without thousands of keys.
    pub fn create_with_layout(
        name: &str,
        pager: Arc<Pager>,
        meta_path: &Path,
        layout: Layout,
    ) -> Result<Self, IndexError> {
        let root_page = pager.new_page()?;
        node::init_leaf(&mut root_page.write().0);
        root_page.mark_dirty();
        let index = Self {
            name: name.to_string(),
            pager,
            meta_path: meta_path.to_path_buf(),
            layout,
            root: Mutex::new(root_page.pagenum()),
        };
        drop(root_page);
        index.write_meta()?;
        Ok(index)
    }

    /// Reopen a tree from its persisted root page number.
    pub fn open(name: &str, pager: Arc<Pager>, meta_path: &Path, root_pn: PageNum) -> Self {
        Self {
            name: name.to_string(),
            pager,
            meta_path: meta_path.to_path_buf(),
            layout: Layout::default(),
            root: Mutex::new(root_pn),
        }
    }

    pub fn root_pn(&self) -> PageNum {
        *self.root.lock()
    }

    pub fn layout(&self) -> Layout {
        self.layout
    }

    fn write_meta_for(&self, root_pn: PageNum) -> Result<(), IndexError> {
        IndexMeta::BTree { root_pn }.write_to(&self.meta_path)
    }

    fn write_meta(&self) -> Result<(), IndexError> {
        let root_pn = *self.root.lock();
        self.write_meta_for(root_pn)
    }

    /// A node is safe for an insert when one more key cannot overflow
    /// it: anything below it can split without the split escaping
    /// past this node.
    fn is_safe(&self, buf: &[u8]) -> bool {
        let cap = if node::node_type(buf) == NODE_LEAF {
            self.layout.leaf_cap
        } else {
            self.layout.internal_cap
        };
        node::num_keys(buf) < cap
    }

    /// Write-latched descent with latch coupling: the chain of
    /// ancestor latches (and the root-pointer lock at its top) is
    /// released as soon as the just-latched child is safe.
    pub fn insert_entry(&self, key: i64, value: i64, update: bool) -> Result<(), IndexError> {
        let mut root_lock = Some(self.root.lock());
        let root_pn = **root_lock.as_ref().unwrap();
        let handle = self.pager.get_page(root_pn)?;
        let guard = handle.write_arc();
        let mut stack = vec![Latched { guard, handle }];
        if self.is_safe(&stack[0].guard.0) {
            root_lock = None;
        }

        loop {
            let child_pn = {
                let top = stack.last().unwrap();
                if node::node_type(&top.guard.0) == NODE_LEAF {
                    break;
                }
                let idx = node::internal_search(&top.guard.0, key);
                node::child_at(&top.guard.0, &self.layout, idx)
            };
            let handle = self.pager.get_page(child_pn)?;
            let guard = handle.write_arc();
            let safe = self.is_safe(&guard.0);
            stack.push(Latched { guard, handle });
            if safe {
                let top = stack.pop().unwrap();
                stack.clear();
                stack.push(top);
                root_lock = None;
            }
        }

        // Leaf-level insert or overwrite.
        let overflow = {
            let leaf = stack.last_mut().unwrap();
            let buf = &mut leaf.guard.0;
            let n = node::num_keys(buf);
            let idx = node::leaf_search(buf, key);
            let exists = idx < n && node::leaf_key_at(buf, idx) == key;
            if update {
                if !exists {
                    return Err(IndexError::NotFound);
                }
                node::leaf_set_value(buf, idx, value);
                leaf.handle.mark_dirty();
                return Ok(());
            }
            if exists {
                return Err(IndexError::Duplicate);
            }
            for i in (idx..n).rev() {
                let (k, v) = (node::leaf_key_at(buf, i), node::leaf_value_at(buf, i));
                node::leaf_set_cell(buf, i + 1, k, v);
            }
            node::leaf_set_cell(buf, idx, key, value);
            node::set_num_keys(buf, n + 1);
            leaf.handle.mark_dirty();
            n + 1 > self.layout.leaf_cap
        };
        if !overflow {
            return Ok(());
        }

        // The leaf overflowed; split it and cascade the promoted key
        // up the retained latch chain.
        let mut leaf = stack.pop().unwrap();
        let mut split = self.split_leaf(&mut leaf)?;
        drop(leaf);
        while let Some(mut parent) = stack.pop() {
            let overflow = self.insert_split(&mut parent, &split);
            parent.handle.mark_dirty();
            if !overflow {
                return Ok(());
            }
            split = self.split_internal(&mut parent)?;
        }

        // The split escaped the old root: grow the tree by one level.
        let mut root_lock = root_lock.expect("root pointer lock retained for an unsafe root");
        let new_root = self.pager.new_page()?;
        {
            let mut buf = new_root.write();
            node::init_internal(&mut buf.0);
            node::set_num_keys(&mut buf.0, 1);
            node::internal_set_key_at(&mut buf.0, 0, split.key);
            node::set_child_at(&mut buf.0, &self.layout, 0, split.left_pn);
            node::set_child_at(&mut buf.0, &self.layout, 1, split.right_pn);
        }
        new_root.mark_dirty();
        *root_lock = new_root.pagenum();
        debug!("btree new root: table={} pn={}", self.name, new_root.pagenum());
        drop(root_lock);
        self.write_meta()?;
        Ok(())
    }

    /// Move the upper half of a leaf into a fresh right sibling and
    /// splice it into the leaf chain.
    fn split_leaf(&self, leaf: &mut Latched) -> Result<SplitResult, IndexError> {
        let right = self.pager.new_page()?;
        let mut right_buf = right.write();
        node::init_leaf(&mut right_buf.0);

        let buf = &mut leaf.guard.0;
        let n = node::num_keys(buf);
        let mid = n / 2;
        for i in mid..n {
            node::leaf_set_cell(
                &mut right_buf.0,
                i - mid,
                node::leaf_key_at(buf, i),
                node::leaf_value_at(buf, i),
            );
        }
        node::set_num_keys(&mut right_buf.0, n - mid);
        node::set_parent_pn(&mut right_buf.0, node::parent_pn(buf));
        node::set_right_sibling(&mut right_buf.0, node::right_sibling(buf));
        node::set_right_sibling(buf, right.pagenum());
        node::set_num_keys(buf, mid);

        let split = SplitResult {
            key: node::leaf_key_at(&right_buf.0, 0),
            left_pn: leaf.handle.pagenum(),
            right_pn: right.pagenum(),
        };
        drop(right_buf);
        right.mark_dirty();
        leaf.handle.mark_dirty();
        Ok(split)
    }

    /// Install a promoted separator and right child into an internal
    /// node. Returns true when the node now overflows.
    fn insert_split(&self, parent: &mut Latched, split: &SplitResult) -> bool {
        let buf = &mut parent.guard.0;
        let n = node::num_keys(buf);
        let pos = node::internal_search(buf, split.key);
        for i in (pos..n).rev() {
            let k = node::internal_key_at(buf, i);
            node::internal_set_key_at(buf, i + 1, k);
        }
        for i in ((pos + 1)..=n).rev() {
            let child = node::child_at(buf, &self.layout, i);
            node::set_child_at(buf, &self.layout, i + 1, child);
        }
        node::internal_set_key_at(buf, pos, split.key);
        node::set_child_at(buf, &self.layout, pos + 1, split.right_pn);
        node::set_num_keys(buf, n + 1);
        n + 1 > self.layout.internal_cap
    }

    /// Split an overflowing internal node: the median key is promoted
    /// (not kept); keys and children after it move right, so the
    /// right node's first child is the old `children[half + 1]`.
    fn split_internal(&self, left: &mut Latched) -> Result<SplitResult, IndexError> {
        let right = self.pager.new_page()?;
        let mut right_buf = right.write();
        node::init_internal(&mut right_buf.0);

        let buf = &mut left.guard.0;
        let n = node::num_keys(buf);
        let half = n / 2;
        let promoted = node::internal_key_at(buf, half);
        for i in (half + 1)..n {
            node::internal_set_key_at(&mut right_buf.0, i - half - 1, node::internal_key_at(buf, i));
        }
        for i in (half + 1)..=n {
            let child = node::child_at(buf, &self.layout, i);
            node::set_child_at(&mut right_buf.0, &self.layout, i - half - 1, child);
        }
        node::set_num_keys(&mut right_buf.0, n - half - 1);
        node::set_parent_pn(&mut right_buf.0, node::parent_pn(buf));
        node::set_num_keys(buf, half);

        let split = SplitResult {
            key: promoted,
            left_pn: left.handle.pagenum(),
            right_pn: right.pagenum(),
        };
        drop(right_buf);
        right.mark_dirty();
        left.handle.mark_dirty();
        Ok(split)
    }

    /// Read-latched descent; the parent latch is released as soon as
    /// the child's is held.
    fn get(&self, key: i64) -> Result<Entry, IndexError> {
        let root_lock = self.root.lock();
        let mut handle = self.pager.get_page(*root_lock)?;
        let mut guard = handle.read_arc();
        drop(root_lock);
        loop {
            if node::node_type(&guard.0) == NODE_LEAF {
                let idx = node::leaf_search(&guard.0, key);
                if idx < node::num_keys(&guard.0) && node::leaf_key_at(&guard.0, idx) == key {
                    return Ok(Entry::new(key, node::leaf_value_at(&guard.0, idx)));
                }
                return Err(IndexError::NotFound);
            }
            let idx = node::internal_search(&guard.0, key);
            let child_pn = node::child_at(&guard.0, &self.layout, idx);
            let child = self.pager.get_page(child_pn)?;
            let child_guard = child.read_arc();
            guard = child_guard;
            handle = child;
        }
    }
}

impl Index for BTreeIndex {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> IndexKind {
        IndexKind::BTree
    }

    fn insert(&self, key: i64, value: i64) -> Result<(), IndexError> {
        self.insert_entry(key, value, false)
    }

    fn update(&self, key: i64, value: i64) -> Result<(), IndexError> {
        self.insert_entry(key, value, true)
    }

    /// Write-latched descent; shift-removes from the leaf. No
    /// rebalancing or coalescing.
    fn delete(&self, key: i64) -> Result<(), IndexError> {
        let root_lock = self.root.lock();
        let mut handle = self.pager.get_page(*root_lock)?;
        let mut guard = handle.write_arc();
        drop(root_lock);
        loop {
            if node::node_type(&guard.0) == NODE_LEAF {
                let n = node::num_keys(&guard.0);
                let idx = node::leaf_search(&guard.0, key);
                if idx >= n || node::leaf_key_at(&guard.0, idx) != key {
                    return Err(IndexError::NotFound);
                }
                for i in idx..n - 1 {
                    let (k, v) = (
                        node::leaf_key_at(&guard.0, i + 1),
                        node::leaf_value_at(&guard.0, i + 1),
                    );
                    node::leaf_set_cell(&mut guard.0, i, k, v);
                }
                node::set_num_keys(&mut guard.0, n - 1);
                handle.mark_dirty();
                return Ok(());
            }
            let idx = node::internal_search(&guard.0, key);
            let child_pn = node::child_at(&guard.0, &self.layout, idx);
            let child = self.pager.get_page(child_pn)?;
            let child_guard = child.write_arc();
            guard = child_guard;
            handle = child;
        }
    }

    fn find(&self, key: i64) -> Result<Entry, IndexError> {
        self.get(key)
    }

    fn select(&self) -> Result<Vec<Entry>, IndexError> {
        let mut cursor = self.table_start()?;
        let mut entries = Vec::new();
        while !cursor.is_end() {
            entries.push(cursor.entry()?);
            cursor.step_forward()?;
        }
        Ok(entries)
    }

    fn pager(&self) -> &Arc<Pager> {
        &self.pager
    }

    fn as_btree(&self) -> Option<&BTreeIndex> {
        Some(self)
    }

    /// Quiesce the tree and flush it. Lock order is root pointer ->
    /// eviction gate -> pager core; in-flight descents that already
    /// released the root pointer keep their page latches and those
    /// pages are skipped by the flush.
    fn flush(&self) -> Result<(), IndexError> {
        let root = self.root.lock();
        let _evictions = self.pager.block_evictions();
        self.write_meta_for(*root)?;
        self.pager.flush_all_pages()?;
        Ok(())
    }

    fn close(&self) -> Result<(), IndexError> {
        self.flush()?;
        self.pager.close()?;
        Ok(())
    }
}
