//! # Copy-on-Write B+ Tree
//!
//! The ordered map at the heart of Vellum: variable-length byte-string keys
//! and values under the byte comparator, one tree per name plus the unnamed
//! root tree that catalogs the others.
//!
//! ## Structure
//!
//! Each node occupies one 4096-byte page. Branch pages hold `PageRef`
//! entries whose first key is always the empty "before all keys" sentinel;
//! leaf pages hold `Data` entries (inline or overflow) and
//! `MultiValuePageRef` entries pointing at embedded sub-trees. All state a
//! reader needs — root page, depth, counters — travels in a 40-byte
//! `TreeHeader` stored in the root tree (or the file header, for the root
//! tree itself).
//!
//! ## Copy-on-Write
//!
//! Trees are never mutated in place. A write transaction copies each page
//! on the descent path to a fresh page number, rewires the parent pointers,
//! and updates its private copy of the tree state. Readers keep resolving
//! the old pages through their snapshot until they finish; the old page
//! numbers return to the free-space map only after every such reader is
//! gone.
//!
//! ## Multi-Value Keys
//!
//! A key can hold a set of values: the values become the keys of an
//! embedded sub-tree hanging off the parent leaf entry. The transaction
//! tracks touched sub-trees in a `(tree, key)` side table and flushes them
//! at commit, first the sub-tree pages, then the parent entry rewritten
//! with the sub-tree's new root.
//!
//! ## Module Organization
//!
//! - `node`: page layout and node codec
//! - `ops`: descent, copy-on-write, insert/delete, page split
//! - `cursor`: descent stacks and ordered iteration
//! - `multi`: multi-value sub-tree operations

pub(crate) mod cursor;
pub(crate) mod multi;
pub mod node;
pub(crate) mod ops;

pub use cursor::{TreeEntry, TreeIter};
pub use multi::MultiIter;
pub use ops::Upsert;

use eyre::{eyre, Result};

use crate::storage::TreeHeader;
use crate::txn::Transaction;

/// Transaction-local state of one tree. The committed form is
/// `TreeHeader`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TreeState {
    pub root_page: u64,
    pub depth: u32,
    pub page_count: u64,
    pub entry_count: u64,
    pub overflow_pages: u64,
}

impl TreeState {
    pub fn empty() -> Self {
        Self {
            root_page: 0,
            depth: 0,
            page_count: 0,
            entry_count: 0,
            overflow_pages: 0,
        }
    }

    pub fn from_header(header: &TreeHeader) -> Self {
        Self {
            root_page: header.root_page(),
            depth: header.depth(),
            page_count: header.page_count(),
            entry_count: header.entry_count(),
            overflow_pages: header.overflow_pages(),
        }
    }

    pub fn to_header(&self) -> TreeHeader {
        TreeHeader::new(
            self.root_page,
            self.depth,
            self.page_count,
            self.entry_count,
            self.overflow_pages,
        )
    }
}

/// Size and shape counters for a tree, as of the observing transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeStats {
    pub root_page: u64,
    pub depth: u32,
    pub page_count: u64,
    pub entry_count: u64,
    pub overflow_pages: u64,
}

/// Handle to a named tree (empty name = the root tree). Cheap to clone;
/// all operations go through a transaction.
#[derive(Debug, Clone)]
pub struct Tree {
    name: String,
}

impl Tree {
    pub(crate) fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn require_state(&self, txn: &Transaction<'_>) -> Result<TreeState> {
        txn.tree_state(&self.name)?
            .ok_or_else(|| eyre!("tree '{}' does not exist", self.name))
    }

    /// Point lookup under the transaction's snapshot.
    pub fn get(&self, txn: &Transaction<'_>, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let state = self.require_state(txn)?;
        ops::get(txn, &state, key)
    }

    /// Upsert. Returns whether the key was inserted or an existing slot was
    /// replaced (bumping its version counter).
    pub fn add(&self, txn: &mut Transaction<'_>, key: &[u8], value: &[u8]) -> Result<Upsert> {
        let mut state = self.require_state(txn)?;
        let result = ops::add(txn, &mut state, key, value)?;
        txn.store_tree_state(&self.name, state);
        Ok(result)
    }

    /// Removes `key` and everything hanging off it. Returns whether it
    /// existed.
    pub fn delete(&self, txn: &mut Transaction<'_>, key: &[u8]) -> Result<bool> {
        // A pending multi-value sub-tree for this key dies with it.
        if let Some(sub) = txn
            .multi
            .remove(&(self.name.clone(), key.to_vec()))
        {
            ops::free_tree_pages(txn, &sub)?;
        }

        let mut state = self.require_state(txn)?;
        let existed = ops::delete(txn, &mut state, key)?;
        txn.store_tree_state(&self.name, state);
        Ok(existed)
    }

    /// Ordered iteration from the first key `>= from` (or the minimum).
    pub fn iter<'t, 'env>(
        &self,
        txn: &'t Transaction<'env>,
        from: Option<&[u8]>,
    ) -> Result<TreeIter<'t, 'env>> {
        let state = self.require_state(txn)?;
        TreeIter::seek(txn, &state, from)
    }

    /// Adds `value` to the set stored under `key`.
    pub fn multi_add(&self, txn: &mut Transaction<'_>, key: &[u8], value: &[u8]) -> Result<()> {
        let state = self.require_state(txn)?;
        multi::multi_add(txn, &self.name, &state, key, value)?;
        // The parent tree is rewritten at commit; make sure it is tracked.
        txn.store_tree_state(&self.name, state);
        Ok(())
    }

    /// Removes `value` from the set stored under `key`.
    pub fn multi_delete(
        &self,
        txn: &mut Transaction<'_>,
        key: &[u8],
        value: &[u8],
    ) -> Result<bool> {
        let state = self.require_state(txn)?;
        multi::multi_delete(txn, &self.name, &state, key, value)
    }

    /// Iterates the values stored under `key`, in byte order.
    pub fn multi_iter<'t, 'env>(
        &self,
        txn: &'t Transaction<'env>,
        key: &[u8],
    ) -> Result<MultiIter<'t, 'env>> {
        let state = self.require_state(txn)?;
        multi::multi_iter(txn, &self.name, &state, key)
    }

    /// Counters as seen by this transaction.
    pub fn stats(&self, txn: &Transaction<'_>) -> Result<TreeStats> {
        let state = self.require_state(txn)?;
        Ok(TreeStats {
            root_page: state.root_page,
            depth: state.depth,
            page_count: state.page_count,
            entry_count: state.entry_count,
            overflow_pages: state.overflow_pages,
        })
    }
}
