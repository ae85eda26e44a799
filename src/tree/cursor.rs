//! # Cursors and Iteration
//!
//! A cursor is the explicit root-to-leaf descent stack: one
//! `(page, position)` pair per level. Mutations use it to propagate
//! copy-on-write up to the root; iteration uses it to walk leaves without
//! sibling links (a copy-on-write tree cannot afford them — linking leaves
//! would dirty every neighbor of a modified page).
//!
//! `TreeIter` advances within a leaf until its entries are exhausted, then
//! re-ascends the stack to the nearest ancestor with a further child and
//! descends that child's leftmost spine. Leaves emptied by deletes are
//! skipped transparently. The iterator holds the transaction's page
//! resolution, so it observes the transaction's own writes and is fixed to
//! its snapshot otherwise.

use eyre::Result;
use smallvec::SmallVec;

use crate::txn::Transaction;

use super::node::{PageView, SearchResult};
use super::ops::read_overflow;
use super::TreeState;

#[derive(Debug, Clone, Copy)]
pub(crate) struct CursorEntry {
    pub page: u64,
    pub pos: usize,
}

/// Root-to-leaf descent stack; the leaf is on top.
pub(crate) struct Cursor {
    pub stack: SmallVec<[CursorEntry; 8]>,
}

impl Cursor {
    pub fn new() -> Self {
        Self {
            stack: SmallVec::new(),
        }
    }

    pub fn push(&mut self, entry: CursorEntry) {
        self.stack.push(entry);
    }

    pub fn len(&self) -> usize {
        self.stack.len()
    }

    pub fn top(&self) -> &CursorEntry {
        self.stack.last().expect("cursor is empty")
    }
}

/// One key-value pair yielded by iteration. Multi-value entries surface
/// with an empty value; their values are enumerated with the multi
/// iterator.
pub type TreeEntry = (Vec<u8>, Vec<u8>);

/// Ordered iterator over a tree's entries.
pub struct TreeIter<'t, 'env> {
    txn: &'t Transaction<'env>,
    stack: SmallVec<[CursorEntry; 8]>,
    finished: bool,
}

impl<'t, 'env> TreeIter<'t, 'env> {
    /// Positions at the first key `>= from` (or the tree minimum).
    pub(crate) fn seek(
        txn: &'t Transaction<'env>,
        state: &TreeState,
        from: Option<&[u8]>,
    ) -> Result<Self> {
        let mut iter = Self {
            txn,
            stack: SmallVec::new(),
            finished: state.root_page == 0,
        };
        if iter.finished {
            return Ok(iter);
        }

        let mut page_no = state.root_page;
        loop {
            let buf = iter.txn.read_page(page_no)?;
            let view = PageView::new(&buf)?;

            if view.is_leaf() {
                let pos = match from {
                    None => 0,
                    Some(key) => match view.search(key)? {
                        SearchResult::Found(i) | SearchResult::NotFound(i) => i,
                    },
                };
                iter.stack.push(CursorEntry { page: page_no, pos });
                return Ok(iter);
            }

            let idx = match from {
                None => 0,
                Some(key) => view.branch_child_index(key)?,
            };
            let child = view.child_page(idx)?;
            iter.stack.push(CursorEntry { page: page_no, pos: idx });
            page_no = child;
        }
    }

    /// Moves the stack to the next leaf with entries. Returns false when
    /// the tree is exhausted.
    fn advance_leaf(&mut self) -> Result<bool> {
        loop {
            // Drop the exhausted leaf, then climb to an ancestor with a
            // further child.
            self.stack.pop();

            let next_child = loop {
                let Some(parent) = self.stack.last_mut() else {
                    return Ok(false);
                };
                let buf = self.txn.read_page(parent.page)?;
                let view = PageView::new(&buf)?;
                if parent.pos + 1 < view.entry_count() {
                    parent.pos += 1;
                    break view.child_page(parent.pos)?;
                }
                self.stack.pop();
            };

            // Leftmost spine of the next subtree.
            let mut page_no = next_child;
            loop {
                let buf = self.txn.read_page(page_no)?;
                let view = PageView::new(&buf)?;
                if view.is_leaf() {
                    self.stack.push(CursorEntry { page: page_no, pos: 0 });
                    if view.entry_count() > 0 {
                        return Ok(true);
                    }
                    break; // Empty leaf: climb again.
                }
                self.stack.push(CursorEntry { page: page_no, pos: 0 });
                page_no = view.child_page(0)?;
            }
        }
    }

    fn next_entry(&mut self) -> Result<Option<TreeEntry>> {
        if self.finished {
            return Ok(None);
        }

        loop {
            let Some(top) = self.stack.last() else {
                self.finished = true;
                return Ok(None);
            };
            let page = top.page;
            let pos = top.pos;

            let entry = {
                let buf = self.txn.read_page(page)?;
                let view = PageView::new(&buf)?;
                if pos >= view.entry_count() {
                    None
                } else {
                    let node = view.node(pos)?;
                    let key = node.key.to_vec();
                    let value = if node.header.is_overflow() {
                        read_overflow(self.txn, node.header.page(), node.header.data_size())?
                    } else if node.header.is_multi_value() {
                        Vec::new()
                    } else {
                        node.value.to_vec()
                    };
                    Some((key, value))
                }
            };

            match entry {
                Some(pair) => {
                    self.stack.last_mut().expect("leaf on stack").pos += 1;
                    return Ok(Some(pair));
                }
                None => {
                    if !self.advance_leaf()? {
                        self.finished = true;
                        return Ok(None);
                    }
                }
            }
        }
    }
}

impl Iterator for TreeIter<'_, '_> {
    type Item = Result<TreeEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_entry() {
            Ok(Some(pair)) => Some(Ok(pair)),
            Ok(None) => None,
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}

