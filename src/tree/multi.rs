//! # Multi-Value Sub-Trees
//!
//! A key whose value is a set stores the set members as the keys of an
//! embedded sub-tree. The parent leaf entry carries the sub-tree's header
//! as its payload and the `MultiValuePageRef` flag.
//!
//! During a write transaction, touched sub-trees live in the transaction's
//! `(tree name, key)` side table; the parent entry is only rewritten at
//! commit, after the sub-tree pages are final. Readers resolve the side
//! table first (read-your-writes), then the parent entry.
//!
//! Adding a value under a key that currently holds a plain inline value
//! converts it: the old value becomes the first member of the set.

use eyre::{bail, ensure, Result};

use crate::txn::Transaction;

use super::cursor::TreeIter;
use super::node::{node_size, MAX_NODE_SIZE, NODE_DATA};
use super::ops::{self, FoundNode, ValueRef};
use super::TreeState;

/// The sub-tree for `key` as this transaction sees it, if any.
fn resolve_sub_tree(
    txn: &Transaction<'_>,
    tree_name: &str,
    parent: &TreeState,
    key: &[u8],
) -> Result<Option<TreeState>> {
    if let Some(state) = txn.multi.get(&(tree_name.to_string(), key.to_vec())) {
        return Ok(Some(state.clone()));
    }

    match ops::get_found(txn, parent, key)? {
        Some(FoundNode {
            value: ValueRef::MultiTree(state),
            ..
        }) => Ok(Some(state)),
        _ => Ok(None),
    }
}

pub(crate) fn multi_add(
    txn: &mut Transaction<'_>,
    tree_name: &str,
    parent: &TreeState,
    key: &[u8],
    value: &[u8],
) -> Result<()> {
    txn.ensure_writable()?;
    ensure!(!value.is_empty(), "multi-values must not be empty");
    ensure!(
        node_size(value.len(), 0) <= MAX_NODE_SIZE,
        "multi-value of {} bytes exceeds the maximum node size",
        value.len()
    );

    let map_key = (tree_name.to_string(), key.to_vec());
    let mut sub = match txn.multi.get(&map_key) {
        Some(state) => state.clone(),
        None => match ops::get_found(txn, parent, key)? {
            Some(FoundNode {
                value: ValueRef::MultiTree(state),
                ..
            }) => state,
            Some(FoundNode {
                value: ValueRef::Inline(existing),
                ..
            }) => {
                // Convert a plain value into a set keeping the old value as
                // its first member.
                let mut state = TreeState::empty();
                if !existing.is_empty() {
                    ops::add_node(txn, &mut state, &existing, &[], NODE_DATA, 0)?;
                }
                state
            }
            Some(FoundNode {
                value: ValueRef::Overflow { .. },
                ..
            }) => {
                bail!("cannot convert an overflow value into a multi-value set")
            }
            None => TreeState::empty(),
        },
    };

    ops::add_node(txn, &mut sub, value, &[], NODE_DATA, 0)?;
    txn.multi.insert(map_key, sub);
    Ok(())
}

pub(crate) fn multi_delete(
    txn: &mut Transaction<'_>,
    tree_name: &str,
    parent: &TreeState,
    key: &[u8],
    value: &[u8],
) -> Result<bool> {
    txn.ensure_writable()?;

    let Some(mut sub) = resolve_sub_tree(txn, tree_name, parent, key)? else {
        return Ok(false);
    };

    let existed = ops::delete(txn, &mut sub, value)?;
    txn.multi
        .insert((tree_name.to_string(), key.to_vec()), sub);
    Ok(existed)
}

/// Iterator over the values stored under one key.
pub struct MultiIter<'t, 'env> {
    inner: MultiIterInner<'t, 'env>,
}

enum MultiIterInner<'t, 'env> {
    Empty,
    Single(Option<Vec<u8>>),
    Tree(TreeIter<'t, 'env>),
}

pub(crate) fn multi_iter<'t, 'env>(
    txn: &'t Transaction<'env>,
    tree_name: &str,
    parent: &TreeState,
    key: &[u8],
) -> Result<MultiIter<'t, 'env>> {
    if let Some(state) = txn.multi.get(&(tree_name.to_string(), key.to_vec())) {
        return Ok(MultiIter {
            inner: MultiIterInner::Tree(TreeIter::seek(txn, state, None)?),
        });
    }

    let inner = match ops::get_found(txn, parent, key)? {
        None => MultiIterInner::Empty,
        Some(FoundNode {
            value: ValueRef::MultiTree(state),
            ..
        }) => MultiIterInner::Tree(TreeIter::seek(txn, &state, None)?),
        Some(FoundNode {
            value: ValueRef::Inline(value),
            ..
        }) => MultiIterInner::Single(Some(value)),
        Some(FoundNode {
            value: ValueRef::Overflow { start, len },
            ..
        }) => MultiIterInner::Single(Some(ops::read_overflow(txn, start, len)?)),
    };

    Ok(MultiIter { inner })
}

impl Iterator for MultiIter<'_, '_> {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        match &mut self.inner {
            MultiIterInner::Empty => None,
            MultiIterInner::Single(value) => value.take().map(Ok),
            MultiIterInner::Tree(iter) => iter.next().map(|r| r.map(|(key, _)| key)),
        }
    }
}
