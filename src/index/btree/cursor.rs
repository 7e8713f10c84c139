use crate::common::types::{Entry, NOPAGE};
use crate::index::btree::index::BTreeIndex;
use crate::index::btree::node::{self, NODE_LEAF};
use crate::index::{Index, IndexError};
use crate::storage::pager::PageHandle;

/// A position in a B+-tree: a pinned leaf page and a cell number.
/// Stepping off the end of a leaf follows the right-sibling chain;
/// `is_end` is true once the cursor has passed the last cell of the
/// last leaf.
pub struct BTreeCursor<'a> {
    index: &'a BTreeIndex,
    handle: PageHandle,
    cellnum: i64,
    is_end: bool,
}

impl BTreeIndex {
    /// Cursor at the first entry of the table.
    pub fn table_start(&self) -> Result<BTreeCursor<'_>, IndexError> {
        let mut handle = self.pager().get_page(self.root_pn())?;
        loop {
            let next = {
                let buf = handle.read();
                if node::node_type(&buf.0) == NODE_LEAF {
                    break;
                }
                node::child_at(&buf.0, &self.layout(), 0)
            };
            handle = self.pager().get_page(next)?;
        }
        let mut cursor = BTreeCursor { index: self, handle, cellnum: 0, is_end: false };
        cursor.settle()?;
        Ok(cursor)
    }

    /// Cursor at `key`, or at the insertion position for `key` when
    /// it is absent.
    pub fn table_find(&self, key: i64) -> Result<BTreeCursor<'_>, IndexError> {
        let mut handle = self.pager().get_page(self.root_pn())?;
        let cellnum = loop {
            let next = {
                let buf = handle.read();
                if node::node_type(&buf.0) == NODE_LEAF {
                    break node::leaf_search(&buf.0, key);
                }
                let idx = node::internal_search(&buf.0, key);
                node::child_at(&buf.0, &self.layout(), idx)
            };
            handle = self.pager().get_page(next)?;
        };
        let mut cursor = BTreeCursor { index: self, handle, cellnum, is_end: false };
        cursor.settle()?;
        Ok(cursor)
    }

    /// Entries with keys in `[start, end)`, ascending. An inverted
    /// range is empty.
    pub fn range(&self, start: i64, end: i64) -> Result<Vec<Entry>, IndexError> {
        let mut entries = Vec::new();
        if start > end {
            return Ok(entries);
        }
        let mut cursor = self.table_find(start)?;
        while !cursor.is_end() {
            let entry = cursor.entry()?;
            if entry.key >= end {
                break;
            }
            entries.push(entry);
            cursor.step_forward()?;
        }
        Ok(entries)
    }
}

impl<'a> BTreeCursor<'a> {
    pub fn is_end(&self) -> bool {
        self.is_end
    }

    /// The entry under the cursor.
    pub fn entry(&self) -> Result<Entry, IndexError> {
        if self.is_end {
            return Err(IndexError::NotFound);
        }
        let buf = self.handle.read();
        Ok(Entry::new(
            node::leaf_key_at(&buf.0, self.cellnum),
            node::leaf_value_at(&buf.0, self.cellnum),
        ))
    }

    /// Advance one cell, hopping to the next leaf when this one is
    /// exhausted.
    pub fn step_forward(&mut self) -> Result<(), IndexError> {
        if self.is_end {
            return Ok(());
        }
        self.cellnum += 1;
        self.settle()
    }

    /// Walk the sibling chain until the cell number points at a real
    /// cell, or the chain runs out.
    fn settle(&mut self) -> Result<(), IndexError> {
        loop {
            let (n, next) = {
                let buf = self.handle.read();
                (node::num_keys(&buf.0), node::right_sibling(&buf.0))
            };
            if self.cellnum < n {
                return Ok(());
            }
            if next == NOPAGE {
                self.is_end = true;
                return Ok(());
            }
            self.handle = self.index.pager().get_page(next)?;
            self.cellnum = 0;
        }
    }
}
