//! # Transactions
//!
//! Vellum follows a single-writer / multi-reader model with snapshot
//! isolation. A transaction owns everything it changes: dirty pages live by
//! value in a page-number-indexed map, freed page numbers accumulate in a
//! list, and every touched tree's state is a transaction-local copy. Nothing
//! escapes until commit.
//!
//! ## Read Resolution
//!
//! `read_page` consults, in order:
//!
//! 1. the transaction's own dirty pages (read-your-writes)
//! 2. the journal snapshot captured at begin, newest file first
//! 3. the data file
//!
//! Read transactions skip step 1 (they have no dirty pages). Because the
//! snapshot list and each file's translation table are immutable once
//! captured, a reader's view is fixed at begin: later commits are invisible.
//!
//! ## Copy-on-Write
//!
//! `modify_page` returns a page ready for mutation. A page already owned by
//! the transaction is returned as-is; otherwise a fresh page number is
//! allocated (free list first, then end of file), the old image is copied
//! in — compacted, which reclaims space leaked by earlier deletes — and the
//! old number joins the freed list. The tree layer rewrites the parent's
//! child pointer and repeats up the cursor to the root.
//!
//! ## Commit
//!
//! Commit is the journal's: multi-value sub-trees are flushed into their
//! parent leaves, modified tree headers are written into the root tree,
//! reclaimable freed pages are returned to the free-space map, the map's
//! dirty chunks join the dirty page set, and the whole set goes to the
//! journal in ascending page order under one checksummed transaction
//! header. Only after the journal fsync does the commit publish: new read
//! snapshot, new committed state, new transaction counter. The data file is
//! untouched; the applier catches up later.
//!
//! ## Rollback
//!
//! Dropping a transaction without commit releases the writer lock, reverts
//! the free-space back buffer, and discards the dirty pages. Nothing was
//! published, so the next writer reuses the same end-of-file counter.

use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use eyre::{bail, ensure, Result, WrapErr};
use hashbrown::{HashMap, HashSet};
use parking_lot::MutexGuard;
use zerocopy::IntoBytes;

use crate::env::EnvInner;
use crate::journal::applier;
use crate::journal::{AppendTransaction, JournalSnapshot};
use crate::storage::{TreeHeader, PAGE_SIZE};
use crate::tree::node::{PageMut, PageView, NODE_DATA, NODE_MULTI_VALUE_PAGE_REF, PAGE_FREE_SPACE};
use crate::tree::{ops, TreeState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionKind {
    Read,
    ReadWrite,
}

pub struct Transaction<'env> {
    pub(crate) env: &'env EnvInner,
    id: u64,
    anchor: u64,
    kind: TransactionKind,
    write_guard: Option<MutexGuard<'env, ()>>,
    pub(crate) next_page: u64,
    pub(crate) dirty: HashMap<u64, Vec<u8>>,
    pub(crate) overflow_dirty: HashSet<u64>,
    pub(crate) freed: Vec<u64>,
    pub(crate) root_tree: TreeState,
    pub(crate) trees: BTreeMap<String, TreeState>,
    pub(crate) modified_trees: BTreeSet<String>,
    pub(crate) multi: BTreeMap<(String, Vec<u8>), TreeState>,
    snapshot: Arc<JournalSnapshot>,
    committed: bool,
}

impl<'env> Transaction<'env> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn begin(
        env: &'env EnvInner,
        kind: TransactionKind,
        id: u64,
        anchor: u64,
        write_guard: Option<MutexGuard<'env, ()>>,
        root_tree: TreeState,
        next_page: u64,
        snapshot: Arc<JournalSnapshot>,
    ) -> Self {
        Self {
            env,
            id,
            anchor,
            kind,
            write_guard,
            next_page,
            dirty: HashMap::new(),
            overflow_dirty: HashSet::new(),
            freed: Vec::new(),
            root_tree,
            trees: BTreeMap::new(),
            modified_trees: BTreeSet::new(),
            multi: BTreeMap::new(),
            snapshot,
            committed: false,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> TransactionKind {
        self.kind
    }

    pub fn is_writable(&self) -> bool {
        self.kind == TransactionKind::ReadWrite
    }

    pub(crate) fn ensure_writable(&self) -> Result<()> {
        ensure!(
            self.is_writable(),
            "operation requires a read-write transaction"
        );
        Ok(())
    }

    /// Resolves a page: dirty copy first, then the journal snapshot
    /// (newest file wins), then the data file.
    pub(crate) fn read_page(&self, page_no: u64) -> Result<Cow<'_, [u8]>> {
        if let Some(buf) = self.dirty.get(&page_no) {
            return Ok(Cow::Borrowed(buf.as_slice()));
        }

        if let Some((file, index)) = self.snapshot.lookup(page_no) {
            return Ok(Cow::Borrowed(file.read_page(index)?));
        }

        let pager = self.env.pager.read();
        pager
            .page_copy(page_no)
            .map(Cow::Owned)
            .wrap_err_with(|| format!("failed to read page {}", page_no))
    }

    pub(crate) fn dirty_page_mut(&mut self, page_no: u64) -> Result<&mut Vec<u8>> {
        match self.dirty.get_mut(&page_no) {
            Some(buf) => Ok(buf),
            None => bail!("page {} is not owned by this transaction", page_no),
        }
    }

    /// Allocates `count` contiguous pages: free list first, end of file on
    /// miss. The data file itself is not extended here; the journal applier
    /// grows it when the pages are applied.
    pub(crate) fn allocate(&mut self, count: u64) -> Result<u64> {
        self.ensure_writable()?;

        if let Some(page) = self.env.freespace.lock().try_allocate(count) {
            return Ok(page);
        }

        ensure!(
            self.next_page + count <= self.env.max_pages,
            "database full: cannot allocate {} pages beyond the tracked capacity of {}",
            count,
            self.env.max_pages
        );

        let page = self.next_page;
        self.next_page += count;
        Ok(page)
    }

    /// Registers a zeroed page buffer owned by this transaction.
    pub(crate) fn new_dirty_page(&mut self, page_no: u64) -> &mut Vec<u8> {
        self.dirty.entry(page_no).or_insert_with(|| vec![0u8; PAGE_SIZE])
    }

    /// Copy-on-write: returns `page_no` if the page is already owned,
    /// otherwise allocates a replacement, copies (and compacts) the old
    /// image into it, and adds the old number to the freed list. The caller
    /// rewires parent references.
    pub(crate) fn modify_page(&mut self, page_no: u64) -> Result<u64> {
        self.ensure_writable()?;

        if self.dirty.contains_key(&page_no) {
            return Ok(page_no);
        }

        let old = self.read_page(page_no)?.into_owned();
        let new_no = self.allocate(1)?;

        let mut buf = vec![0u8; PAGE_SIZE];
        let view = PageView::new(&old)?;
        if view.is_leaf() || view.is_branch() {
            crate::tree::node::copy_compact(view, &mut buf)?;
        } else {
            buf.copy_from_slice(&old);
        }
        PageMut::new(&mut buf)?.set_page_no(new_no as u32);

        self.dirty.insert(new_no, buf);
        self.freed.push(page_no);
        Ok(new_no)
    }

    /// Releases a page owned by or visible to this transaction.
    pub(crate) fn free_page(&mut self, page_no: u64) {
        self.dirty.remove(&page_no);
        self.overflow_dirty.remove(&page_no);
        self.freed.push(page_no);
    }

    pub(crate) fn record_overflow_page(&mut self, page_no: u64) {
        self.overflow_dirty.insert(page_no);
    }

    /// The transaction-local state of a tree, loading it from the root tree
    /// on first access. Returns `None` for unknown tree names.
    pub(crate) fn tree_state(&self, name: &str) -> Result<Option<TreeState>> {
        if name.is_empty() {
            return Ok(Some(self.root_tree.clone()));
        }
        if let Some(state) = self.trees.get(name) {
            return Ok(Some(state.clone()));
        }

        match ops::get(self, &self.root_tree, name.as_bytes())? {
            Some(bytes) => {
                let header = TreeHeader::from_bytes(&bytes)?;
                Ok(Some(TreeState::from_header(header)))
            }
            None => Ok(None),
        }
    }

    pub(crate) fn store_tree_state(&mut self, name: &str, state: TreeState) {
        if name.is_empty() {
            self.root_tree = state;
        } else {
            self.trees.insert(name.to_string(), state);
            self.modified_trees.insert(name.to_string());
        }
    }

    pub(crate) fn forget_tree(&mut self, name: &str) {
        self.trees.remove(name);
        self.modified_trees.remove(name);
        let prefix = name.to_string();
        self.multi.retain(|(tree, _), _| tree != &prefix);
    }

    /// Commits a read-write transaction through the journal. Committing a
    /// read transaction just ends it.
    pub fn commit(mut self) -> Result<()> {
        if !self.is_writable() {
            self.finish();
            return Ok(());
        }

        // Multi-value sub-trees first: each parent leaf entry is rewritten
        // with the sub-tree's final root state.
        let multi: Vec<_> = std::mem::take(&mut self.multi).into_iter().collect();
        for ((tree_name, key), sub) in multi {
            let mut parent = match self.tree_state(&tree_name)? {
                Some(state) => state,
                None => bail!("tree '{}' vanished during commit", tree_name),
            };
            ops::add_node(
                &mut self,
                &mut parent,
                &key,
                sub.to_header().as_bytes(),
                NODE_MULTI_VALUE_PAGE_REF,
                sub.root_page,
            )?;
            self.store_tree_state(&tree_name, parent);
        }

        // Publish every modified named tree's header into the root tree.
        let names: Vec<String> = self.modified_trees.iter().cloned().collect();
        for name in names {
            let Some(state) = self.trees.get(&name).cloned() else {
                continue;
            };
            if cfg!(debug_assertions) {
                ops::validate_tree(&self, &state)
                    .wrap_err_with(|| format!("tree '{}' failed structural validation", name))?;
            }
            let header = state.to_header();
            let mut root = self.root_tree.clone();
            ops::add_node(&mut self, &mut root, name.as_bytes(), header.as_bytes(), NODE_DATA, 0)?;
            self.root_tree = root;
        }

        // Return previously freed pages that no active transaction can
        // still observe, then capture the free-space dirty set.
        let oldest = self.env.active.lock().oldest_anchor();
        let reclaimed = self.env.pending_frees.lock().drain_reclaimable(oldest);

        let (fs_pages, fs_state) = {
            let mut freespace = self.env.freespace.lock();
            for &page in &reclaimed {
                freespace.free_page(page)?;
            }
            (freespace.dirty_file_pages(), freespace.pending_state())
        };

        let mut fs_images: Vec<(u64, Vec<u8>)> = Vec::with_capacity(fs_pages.len());
        for (page_no, payload) in fs_pages {
            let mut image = vec![0u8; PAGE_SIZE];
            let mut page = PageMut::init(&mut image, PAGE_FREE_SPACE, page_no as u32)?;
            page.set_overflow_size(payload.len() as u32);
            image[crate::storage::PAGE_HEADER_SIZE..crate::storage::PAGE_HEADER_SIZE + payload.len()]
                .copy_from_slice(&payload);
            fs_images.push((page_no, image));
        }

        let mut pages: Vec<(u64, &[u8])> = self
            .dirty
            .iter()
            .map(|(p, buf)| (*p, buf.as_slice()))
            .chain(fs_images.iter().map(|(p, buf)| (*p, buf.as_slice())))
            .collect();
        pages.sort_by_key(|(p, _)| *p);

        let append = AppendTransaction {
            txid: self.id,
            next_page: self.next_page,
            last_page: self.next_page.saturating_sub(1),
            root: self.root_tree.to_header(),
            free_space: fs_state,
            pages,
            overflow_page_count: self.overflow_dirty.len() as u32,
        };

        let snapshot = match self.env.journal.lock().append_transaction(&append) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                // The reclaimed pages were taken out of the pending table;
                // park them again so a later commit can return them.
                self.env.pending_frees.lock().record(0, reclaimed);
                return Err(e);
            }
        };

        // Durable. Publish: snapshot before counters so a racing reader can
        // always resolve the state it observes.
        *self.env.snapshot.write() = snapshot;
        self.env.freespace.lock().publish();
        self.env
            .pending_frees
            .lock()
            .record(self.id, std::mem::take(&mut self.freed));

        {
            let mut committed = self.env.committed.lock();
            committed.txid = self.id;
            committed.root = self.root_tree.clone();
            committed.free_space = fs_state;
            committed.next_page = self.next_page;
        }
        self.env.last_txid.store(self.id, Ordering::SeqCst);

        self.finish();

        if self
            .env
            .journal
            .lock()
            .wants_apply(self.env.options.flush_interval)
        {
            applier::apply_journal(self.env)
                .wrap_err("journal application after commit failed")?;
        }

        Ok(())
    }

    /// Explicit abort; identical to dropping the transaction.
    pub fn rollback(self) {}

    fn finish(&mut self) {
        self.env.active.lock().unregister(self.anchor);
        self.committed = true;
        self.write_guard.take();
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.committed {
            if self.is_writable() {
                self.env.freespace.lock().revert();
            }
            self.env.active.lock().unregister(self.anchor);
        }
    }
}
