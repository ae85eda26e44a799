//! # Tree Algorithms
//!
//! The copy-on-write B+ tree operations, expressed as free functions over a
//! transaction and a transaction-local `TreeState`. The `Tree` handle and
//! the multi-value layer wrap these; the commit path calls them directly to
//! publish tree headers into the root tree.
//!
//! ## Descent and Copy-on-Write
//!
//! Every mutation descends root-to-leaf recording a cursor of
//! `(page, position)` pairs, then copies the whole path: each page on the
//! cursor is handed to `Transaction::modify_page`, and when a copy happens
//! the parent's child pointer is rewritten to the new number (the root case
//! updates the tree state instead). After that the mutation itself touches
//! only pages the transaction owns.
//!
//! ## Split
//!
//! A page that cannot fit a new entry splits. Appends at the tail take the
//! sequential-insert path: the original page keeps its entries and the new
//! entry starts a fresh right sibling (for branch pages the last entry
//! moves over first, re-keyed to the sentinel, preserving the
//! implicit-null-left invariant). Everything else materializes the entries,
//! picks a size-balanced split index, rebuilds both sides, and pushes the
//! separator into the parent — recursively splitting parents that are full,
//! growing a new root when the split reaches the top.

use eyre::{bail, ensure, Result};

use crate::storage::{TreeHeader, PAGE_HEADER_SIZE, PAGE_SIZE, PAGE_USABLE_SIZE};
use crate::txn::Transaction;

use super::cursor::{Cursor, CursorEntry};
use super::node::{
    self, node_size, overflow_page_count, PageMut, PageView, SearchResult, MAX_NODE_SIZE,
    NODE_DATA, NODE_MULTI_VALUE_PAGE_REF, NODE_OVERFLOW, NODE_PAGE_REF, PAGE_BRANCH, PAGE_LEAF,
    PAGE_OVERFLOW, SLOT_SIZE,
};
use super::TreeState;

/// Outcome of an upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Inserted,
    Replaced,
}

/// Where a found node's value lives.
pub(crate) enum ValueRef {
    Inline(Vec<u8>),
    Overflow { start: u64, len: u64 },
    MultiTree(TreeState),
}

pub(crate) struct FoundNode {
    pub version: u32,
    pub value: ValueRef,
}

/// An entry lifted out of a page, owned, for splits and rebuilds.
struct OwnedNode {
    flags: u8,
    key: Vec<u8>,
    page: u64,
    data: Vec<u8>,
    data_size: u64,
    version: u32,
}

impl OwnedNode {
    fn size(&self) -> usize {
        node_size(self.key.len(), self.data.len())
    }
}

/// Walks root to leaf for `key`, recording the descent.
fn descend(txn: &Transaction<'_>, state: &TreeState, key: &[u8]) -> Result<(Cursor, SearchResult)> {
    debug_assert!(state.root_page != 0);

    let mut cursor = Cursor::new();
    let mut page_no = state.root_page;

    loop {
        let buf = txn.read_page(page_no)?;
        let view = PageView::new(&buf)?;

        if view.is_leaf() {
            let result = view.search(key)?;
            let pos = match result {
                SearchResult::Found(i) | SearchResult::NotFound(i) => i,
            };
            cursor.push(CursorEntry { page: page_no, pos });
            return Ok((cursor, result));
        } else if view.is_branch() {
            let idx = view.branch_child_index(key)?;
            let child = view.child_page(idx)?;
            cursor.push(CursorEntry { page: page_no, pos: idx });
            page_no = child;
        } else {
            bail!("unexpected page type during descent at page {}", page_no);
        }
    }
}

/// Copies the cursor's path for writing, rewiring parent pointers and the
/// tree root as pages move.
fn cow_path(txn: &mut Transaction<'_>, state: &mut TreeState, cursor: &mut Cursor) -> Result<()> {
    let mut parent: Option<(u64, usize)> = None;

    for level in 0..cursor.len() {
        let page_no = cursor.stack[level].page;
        let new_no = txn.modify_page(page_no)?;
        if new_no != page_no {
            cursor.stack[level].page = new_no;
            match parent {
                None => state.root_page = new_no,
                Some((parent_page, pos)) => {
                    let buf = txn.dirty_page_mut(parent_page)?;
                    PageMut::new(buf)?.set_child_page(pos, new_no)?;
                }
            }
        }
        parent = Some((cursor.stack[level].page, cursor.stack[level].pos));
    }

    Ok(())
}

pub(crate) fn get_found(
    txn: &Transaction<'_>,
    state: &TreeState,
    key: &[u8],
) -> Result<Option<FoundNode>> {
    if state.root_page == 0 {
        return Ok(None);
    }

    let (cursor, result) = descend(txn, state, key)?;
    let SearchResult::Found(pos) = result else {
        return Ok(None);
    };

    let leaf = cursor.top().page;
    let buf = txn.read_page(leaf)?;
    let view = PageView::new(&buf)?;
    let node = view.node(pos)?;

    let value = if node.header.is_multi_value() {
        let header = TreeHeader::from_bytes(node.value)?;
        ValueRef::MultiTree(TreeState::from_header(header))
    } else if node.header.is_overflow() {
        ValueRef::Overflow {
            start: node.header.page(),
            len: node.header.data_size(),
        }
    } else {
        ValueRef::Inline(node.value.to_vec())
    };

    Ok(Some(FoundNode {
        version: node.header.version(),
        value,
    }))
}

/// Point lookup. Multi-value keys are not readable through `get`; their
/// values are enumerated with the multi iterator.
pub(crate) fn get(txn: &Transaction<'_>, state: &TreeState, key: &[u8]) -> Result<Option<Vec<u8>>> {
    match get_found(txn, state, key)? {
        None => Ok(None),
        Some(found) => match found.value {
            ValueRef::Inline(bytes) => Ok(Some(bytes)),
            ValueRef::Overflow { start, len } => Ok(Some(read_overflow(txn, start, len)?)),
            ValueRef::MultiTree(_) => {
                bail!("key holds a multi-value tree; use the multi iterator")
            }
        },
    }
}

/// Reassembles an overflow run.
pub(crate) fn read_overflow(txn: &Transaction<'_>, start: u64, len: u64) -> Result<Vec<u8>> {
    let pages = overflow_page_count(len as usize);
    let mut value = Vec::with_capacity(len as usize);

    for j in 0..pages {
        let buf = txn.read_page(start + j)?;
        let view = PageView::new(&buf)?;
        ensure!(
            view.is_overflow(),
            "page {} in overflow run is not an overflow page",
            start + j
        );
        let remaining = len as usize - value.len();
        let take = remaining.min(PAGE_USABLE_SIZE);
        value.extend_from_slice(&buf[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + take]);
    }

    Ok(value)
}

/// Writes `value` into a freshly allocated contiguous overflow run and
/// returns the first page number.
fn write_overflow(txn: &mut Transaction<'_>, value: &[u8]) -> Result<(u64, u64)> {
    let pages = overflow_page_count(value.len());
    let start = txn.allocate(pages)?;

    for j in 0..pages {
        let page_no = start + j;
        let offset = j as usize * PAGE_USABLE_SIZE;
        let end = (offset + PAGE_USABLE_SIZE).min(value.len());
        {
            let buf = txn.new_dirty_page(page_no);
            {
                let mut page = PageMut::init(buf, PAGE_OVERFLOW, page_no as u32)?;
                if j == 0 {
                    page.set_overflow_size(value.len() as u32);
                }
            }
            buf[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + (end - offset)]
                .copy_from_slice(&value[offset..end]);
        }
        txn.record_overflow_page(page_no);
    }

    Ok((start, pages))
}

fn free_overflow_run(txn: &mut Transaction<'_>, state: &mut TreeState, start: u64, len: u64) {
    let pages = overflow_page_count(len as usize);
    for j in 0..pages {
        txn.free_page(start + j);
    }
    state.overflow_pages = state.overflow_pages.saturating_sub(pages);
}

/// Upsert of a data entry; large values are moved to an overflow run.
pub(crate) fn add(
    txn: &mut Transaction<'_>,
    state: &mut TreeState,
    key: &[u8],
    value: &[u8],
) -> Result<Upsert> {
    ensure!(!key.is_empty(), "keys must not be empty");
    ensure!(
        node_size(key.len(), 0) <= MAX_NODE_SIZE,
        "key of {} bytes exceeds the maximum node size",
        key.len()
    );

    if node_size(key.len(), value.len()) <= MAX_NODE_SIZE {
        add_node(txn, state, key, value, NODE_DATA, 0)
    } else {
        let (start, pages) = write_overflow(txn, value)?;
        state.overflow_pages += pages;
        add_raw(
            txn,
            state,
            key,
            OwnedNode {
                flags: NODE_DATA | NODE_OVERFLOW,
                key: key.to_vec(),
                page: start,
                data: Vec::new(),
                data_size: value.len() as u64,
                version: 0,
            },
        )
    }
}

/// Upsert of an arbitrary node: inline payload plus flags and page pointer.
/// Used for plain data, multi-value references, and tree headers in the
/// root tree.
pub(crate) fn add_node(
    txn: &mut Transaction<'_>,
    state: &mut TreeState,
    key: &[u8],
    payload: &[u8],
    flags: u8,
    page: u64,
) -> Result<Upsert> {
    ensure!(!key.is_empty(), "keys must not be empty");
    ensure!(
        node_size(key.len(), payload.len()) <= MAX_NODE_SIZE,
        "entry of {} bytes exceeds the maximum node size",
        node_size(key.len(), payload.len())
    );

    add_raw(
        txn,
        state,
        key,
        OwnedNode {
            flags,
            key: key.to_vec(),
            page,
            data: payload.to_vec(),
            data_size: payload.len() as u64,
            version: 0,
        },
    )
}

fn add_raw(
    txn: &mut Transaction<'_>,
    state: &mut TreeState,
    key: &[u8],
    mut node: OwnedNode,
) -> Result<Upsert> {
    txn.ensure_writable()?;

    if state.root_page == 0 {
        let root = txn.allocate(1)?;
        let buf = txn.new_dirty_page(root);
        PageMut::init(buf, PAGE_LEAF, root as u32)?;
        state.root_page = root;
        state.depth = 1;
        state.page_count += 1;
    }

    let (mut cursor, _) = descend(txn, state, key)?;
    cow_path(txn, state, &mut cursor)?;

    let leaf = cursor.top().page;
    let (found, pos) = {
        let buf = txn.read_page(leaf)?;
        match PageView::new(&buf)?.search(key)? {
            SearchResult::Found(i) => (true, i),
            SearchResult::NotFound(i) => (false, i),
        }
    };

    if found {
        let (old_version, old_overflow, old_multi) = {
            let buf = txn.read_page(leaf)?;
            let view = PageView::new(&buf)?;
            let old = view.node(pos)?;
            (
                old.header.version(),
                if old.header.is_overflow() {
                    Some((old.header.page(), old.header.data_size()))
                } else {
                    None
                },
                if old.header.is_multi_value() {
                    Some(TreeState::from_header(TreeHeader::from_bytes(old.value)?))
                } else {
                    None
                },
            )
        };

        node.version = old_version.wrapping_add(1);
        if let Some((start, len)) = old_overflow {
            free_overflow_run(txn, state, start, len);
        }
        if let Some(sub) = old_multi {
            // A plain value overwriting a multi-value key strands the
            // sub-tree; release it. A multi reference replacing one is the
            // same tree after copy-on-write, whose old pages the CoW pass
            // already freed.
            if node.flags & NODE_MULTI_VALUE_PAGE_REF == 0 {
                free_tree_pages(txn, &sub)?;
            }
        }
        PageMut::new(txn.dirty_page_mut(leaf)?)?.remove_node(pos)?;
    }

    let fits = {
        let buf = txn.read_page(leaf)?;
        PageView::new(&buf)?.has_space_for(node.size())
    };

    if fits {
        let version = node.version;
        let buf = txn.dirty_page_mut(leaf)?;
        PageMut::new(buf)?.insert_node_with_size(
            pos,
            node.flags,
            &node.key,
            node.page,
            &node.data,
            node.data_size,
            version,
        )?;
    } else {
        let level = cursor.len() - 1;
        split_level(txn, state, &mut cursor, level, pos, node)?;
    }

    if found {
        Ok(Upsert::Replaced)
    } else {
        state.entry_count += 1;
        Ok(Upsert::Inserted)
    }
}

/// Deletes `key`. Overflow runs and multi-value sub-trees hanging off the
/// entry are released with it. Pages are not rebalanced; an emptied leaf
/// stays in place until its tree is deleted.
pub(crate) fn delete(
    txn: &mut Transaction<'_>,
    state: &mut TreeState,
    key: &[u8],
) -> Result<bool> {
    txn.ensure_writable()?;

    if state.root_page == 0 {
        return Ok(false);
    }

    let (mut cursor, result) = descend(txn, state, key)?;
    if !matches!(result, SearchResult::Found(_)) {
        return Ok(false);
    }

    cow_path(txn, state, &mut cursor)?;

    let leaf = cursor.top().page;
    let pos = {
        let buf = txn.read_page(leaf)?;
        match PageView::new(&buf)?.search(key)? {
            SearchResult::Found(i) => i,
            SearchResult::NotFound(_) => bail!("key vanished between descent and delete"),
        }
    };

    let (overflow, multi) = {
        let buf = txn.read_page(leaf)?;
        let view = PageView::new(&buf)?;
        let old = view.node(pos)?;
        (
            if old.header.is_overflow() {
                Some((old.header.page(), old.header.data_size()))
            } else {
                None
            },
            if old.header.is_multi_value() {
                Some(TreeState::from_header(TreeHeader::from_bytes(old.value)?))
            } else {
                None
            },
        )
    };

    if let Some((start, len)) = overflow {
        free_overflow_run(txn, state, start, len);
    }
    if let Some(sub) = multi {
        free_tree_pages(txn, &sub)?;
    }

    PageMut::new(txn.dirty_page_mut(leaf)?)?.remove_node(pos)?;
    state.entry_count = state.entry_count.saturating_sub(1);

    Ok(true)
}

/// Releases every page of a tree: leaves, branches, overflow runs, and
/// embedded multi-value sub-trees.
pub(crate) fn free_tree_pages(txn: &mut Transaction<'_>, state: &TreeState) -> Result<()> {
    if state.root_page == 0 {
        return Ok(());
    }
    free_subtree(txn, state.root_page)
}

fn free_subtree(txn: &mut Transaction<'_>, page_no: u64) -> Result<()> {
    let buf = txn.read_page(page_no)?.into_owned();
    let view = PageView::new(&buf)?;

    if view.is_branch() {
        for i in 0..view.entry_count() {
            let child = view.child_page(i)?;
            free_subtree(txn, child)?;
        }
    } else if view.is_leaf() {
        for i in 0..view.entry_count() {
            let node = view.node(i)?;
            if node.header.is_overflow() {
                let pages = overflow_page_count(node.header.data_size() as usize);
                for j in 0..pages {
                    txn.free_page(node.header.page() + j);
                }
            } else if node.header.is_multi_value() {
                let sub = TreeState::from_header(TreeHeader::from_bytes(node.value)?);
                free_tree_pages(txn, &sub)?;
            }
        }
    }

    txn.free_page(page_no);
    Ok(())
}

/// Splits the page at `cursor[level]` while inserting `node` at
/// `insert_pos`. Recursively splits ancestors when the separator does not
/// fit, growing a new root when the split reaches the top.
fn split_level(
    txn: &mut Transaction<'_>,
    state: &mut TreeState,
    cursor: &mut Cursor,
    level: usize,
    insert_pos: usize,
    node: OwnedNode,
) -> Result<()> {
    let mut level = level;

    // Splitting the root grows the tree: a new branch root points at the
    // old root under the sentinel key.
    if level == 0 {
        let new_root = txn.allocate(1)?;
        let old_root = cursor.stack[0].page;
        {
            let buf = txn.new_dirty_page(new_root);
            let mut page = PageMut::init(buf, PAGE_BRANCH, new_root as u32)?;
            page.insert_node(0, NODE_PAGE_REF, b"", old_root, &[], 0)?;
        }
        state.root_page = new_root;
        state.depth += 1;
        state.page_count += 1;
        cursor.stack.insert(0, CursorEntry { page: new_root, pos: 0 });
        level = 1;
    }

    let page_no = cursor.stack[level].page;
    let snapshot = txn.read_page(page_no)?.into_owned();
    let view = PageView::new(&snapshot)?;
    let count = view.entry_count();
    let is_branch = view.is_branch();
    let page_flags = view.header().flags();

    let right_page = txn.allocate(1)?;
    state.page_count += 1;

    // Sequential tail insert: leave the page as is and start the new entry
    // on a fresh right sibling. Branch pages move their last entry over
    // first, re-keyed to the sentinel, so the new sibling keeps the
    // implicit-null-left invariant.
    if insert_pos == count {
        let separator;
        {
            let buf = txn.new_dirty_page(right_page);
            let mut right = PageMut::init(buf, page_flags, right_page as u32)?;

            if is_branch {
                let last = view.node(count - 1)?;
                separator = last.key.to_vec();
                right.insert_node_with_size(
                    0,
                    last.header.flags(),
                    b"",
                    last.header.page(),
                    last.value,
                    last.header.data_size(),
                    last.header.version(),
                )?;
                let version = node.version;
                right.insert_node_with_size(
                    1,
                    node.flags,
                    &node.key,
                    node.page,
                    &node.data,
                    node.data_size,
                    version,
                )?;
            } else {
                separator = node.key.clone();
                right.insert_node_with_size(
                    0,
                    node.flags,
                    &node.key,
                    node.page,
                    &node.data,
                    node.data_size,
                    node.version,
                )?;
            }
        }
        if is_branch {
            PageMut::new(txn.dirty_page_mut(page_no)?)?.remove_node(count - 1)?;
        }
        return insert_page_ref(txn, state, cursor, level, separator, right_page);
    }

    // General split: materialize, pick a size-balanced index, rebuild both
    // sides.
    let mut entries: Vec<OwnedNode> = Vec::with_capacity(count + 1);
    for i in 0..count {
        let n = view.node(i)?;
        entries.push(OwnedNode {
            flags: n.header.flags(),
            key: n.key.to_vec(),
            page: n.header.page(),
            data: n.value.to_vec(),
            data_size: n.header.data_size(),
            version: n.header.version(),
        });
    }
    entries.insert(insert_pos, node);

    let mut mid = entries.len() / 2;
    let side_size = |slice: &[OwnedNode]| -> usize {
        slice.iter().map(|e| e.size() + SLOT_SIZE).sum()
    };
    while mid > 1 && side_size(&entries[..mid]) > PAGE_USABLE_SIZE {
        mid -= 1;
    }
    while mid + 1 < entries.len() && side_size(&entries[mid..]) > PAGE_USABLE_SIZE {
        mid += 1;
    }
    ensure!(
        mid > 0 && mid < entries.len(),
        "page split cannot balance entries"
    );
    ensure!(
        side_size(&entries[..mid]) <= PAGE_USABLE_SIZE
            && side_size(&entries[mid..]) <= PAGE_USABLE_SIZE,
        "page split cannot fit either half"
    );

    let separator = entries[mid].key.clone();

    rebuild_page(txn, page_no, page_flags, &entries[..mid], false)?;
    txn.new_dirty_page(right_page);
    rebuild_page(txn, right_page, page_flags, &entries[mid..], is_branch)?;

    insert_page_ref(txn, state, cursor, level, separator, right_page)
}

fn rebuild_page(
    txn: &mut Transaction<'_>,
    page_no: u64,
    flags: u8,
    entries: &[OwnedNode],
    sentinel_first: bool,
) -> Result<()> {
    let buf = txn.dirty_page_mut(page_no)?;
    let mut page = PageMut::init(buf, flags, page_no as u32)?;

    for (i, entry) in entries.iter().enumerate() {
        let key: &[u8] = if sentinel_first && i == 0 { b"" } else { &entry.key };
        page.insert_node_with_size(
            i,
            entry.flags,
            key,
            entry.page,
            &entry.data,
            entry.data_size,
            entry.version,
        )?;
    }

    Ok(())
}

/// Adds `(separator, right_page)` to the parent of `cursor[child_level]`,
/// splitting the parent with the same algorithm when it is full.
fn insert_page_ref(
    txn: &mut Transaction<'_>,
    state: &mut TreeState,
    cursor: &mut Cursor,
    child_level: usize,
    separator: Vec<u8>,
    right_page: u64,
) -> Result<()> {
    debug_assert!(child_level > 0);
    let parent_level = child_level - 1;
    let parent_page = cursor.stack[parent_level].page;

    let (pos, fits) = {
        let buf = txn.read_page(parent_page)?;
        let view = PageView::new(&buf)?;
        let pos = match view.search(&separator)? {
            SearchResult::Found(i) => i,
            SearchResult::NotFound(i) => i,
        };
        (pos, view.has_space_for(node_size(separator.len(), 0)))
    };

    if fits {
        let buf = txn.dirty_page_mut(parent_page)?;
        PageMut::new(buf)?.insert_node(pos, NODE_PAGE_REF, &separator, right_page, &[], 0)?;
        return Ok(());
    }

    split_level(
        txn,
        state,
        cursor,
        parent_level,
        pos,
        OwnedNode {
            flags: NODE_PAGE_REF,
            key: separator,
            page: right_page,
            data: Vec::new(),
            data_size: 0,
            version: 0,
        },
    )
}

/// Structural validation of a whole tree; the commit path runs it over
/// every modified tree in debug builds.
pub(crate) fn validate_tree(txn: &Transaction<'_>, state: &TreeState) -> Result<()> {
    if state.root_page == 0 {
        return Ok(());
    }
    validate_subtree(txn, state.root_page, state.depth, 1)
}

fn validate_subtree(
    txn: &Transaction<'_>,
    page_no: u64,
    depth: u32,
    level: u32,
) -> Result<()> {
    let buf = txn.read_page(page_no)?;
    ensure!(buf.len() == PAGE_SIZE, "short page {}", page_no);
    node::validate_page(&buf)?;
    let view = PageView::new(&buf)?;

    if view.is_branch() {
        ensure!(level < depth, "branch page {} at leaf depth", page_no);
        for i in 0..view.entry_count() {
            let child = view.child_page(i)?;
            ensure!(child != page_no, "page {} references itself", page_no);
            validate_subtree(txn, child, depth, level + 1)?;
        }
    } else {
        ensure!(level == depth, "leaf page {} above leaf depth", page_no);
    }

    Ok(())
}
