//! # Storage Environment
//!
//! `Environment` is the top-level façade: it owns the data file, the
//! write-ahead journal, the free-space maps, the single-writer lock, the
//! transaction counter, and the table of active transactions. Everything
//! else flows through transactions it hands out.
//!
//! ## Lifecycle
//!
//! A fresh environment writes both header copies, reserves the free-space
//! buffer regions, and commits an empty boot transaction through the
//! journal. Opening an existing environment reads both header pages, picks
//! the valid copy with the greater transaction id, runs journal recovery,
//! and lets the newest recovered commit supersede the header's state.
//!
//! ## Concurrency
//!
//! One writer at a time: `new_transaction(ReadWrite)` blocks on the writer
//! mutex and the guard travels inside the transaction until commit or
//! rollback. Readers never take it; any number run concurrently with each
//! other and with the writer, each pinned to the committed state and
//! journal snapshot captured at begin.
//!
//! ## Trees
//!
//! The unnamed root tree catalogs named trees: each entry maps a tree name
//! to its 40-byte header. `create_tree`, `get_tree`, and `delete_tree`
//! operate on the calling transaction's view and publish with its commit.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use eyre::{ensure, Result, WrapErr};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use zerocopy::IntoBytes;

use crate::journal::{applier, recovery, Journal, JournalSnapshot};
use crate::storage::{
    FileHeader, FreeSpace, FreeSpaceState, JournalInfo, Pager, PendingFrees, TreeHeader,
    FILE_HEADER_SIZE, FIRST_FREE_SPACE_PAGE, PAGE_HEADER_SIZE, PAGE_SIZE,
};
use crate::tree::{ops, Tree, TreeState};
use crate::txn::{Transaction, TransactionKind};

pub const DATA_FILE_NAME: &str = "data.vellum";

/// Tunables fixed at environment creation or open.
#[derive(Debug, Clone)]
pub struct Options {
    /// Size of each preallocated journal file, in pages.
    pub journal_file_pages: u64,
    /// Pages reserved for one free-space buffer; bounds the trackable file
    /// size.
    pub free_space_buffer_pages: u32,
    /// Commits between automatic journal application passes.
    pub flush_interval: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            // 64 MiB journal files.
            journal_file_pages: 16384,
            free_space_buffer_pages: 1,
            flush_interval: 16,
        }
    }
}

/// The committed state readers anchor on: advanced atomically at each
/// commit's publication point.
pub(crate) struct CommittedState {
    pub txid: u64,
    pub root: TreeState,
    pub free_space: FreeSpaceState,
    pub next_page: u64,
}

/// Reference counts of active transactions keyed by their snapshot anchor.
/// The minimum key is the barrier the applier and page reclamation honor.
#[derive(Default)]
pub(crate) struct ActiveTransactions {
    anchors: BTreeMap<u64, u64>,
}

impl ActiveTransactions {
    pub fn register(&mut self, anchor: u64) {
        *self.anchors.entry(anchor).or_insert(0) += 1;
    }

    pub fn unregister(&mut self, anchor: u64) {
        if let Some(count) = self.anchors.get_mut(&anchor) {
            *count -= 1;
            if *count == 0 {
                self.anchors.remove(&anchor);
            }
        }
    }

    pub fn oldest_anchor(&self) -> Option<u64> {
        self.anchors.keys().next().copied()
    }

    pub fn count(&self) -> u64 {
        self.anchors.values().sum()
    }
}

pub(crate) struct EnvInner {
    pub(crate) options: Options,
    pub(crate) pager: RwLock<Pager>,
    pub(crate) journal: Mutex<Journal>,
    pub(crate) snapshot: RwLock<Arc<JournalSnapshot>>,
    pub(crate) freespace: Mutex<FreeSpace>,
    pub(crate) pending_frees: Mutex<PendingFrees>,
    pub(crate) write_lock: Mutex<()>,
    pub(crate) apply_lock: Mutex<()>,
    pub(crate) active: Mutex<ActiveTransactions>,
    pub(crate) committed: Mutex<CommittedState>,
    pub(crate) last_txid: AtomicU64,
    pub(crate) max_pages: u64,
}

/// Point-in-time counters for monitoring and accounting checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvironmentStats {
    pub data_file_pages: u64,
    pub next_page_number: u64,
    pub free_pages: u64,
    pub pending_free_pages: u64,
    pub active_transactions: u64,
    pub journal_files: usize,
    pub last_committed_txid: u64,
}

pub struct Environment {
    inner: EnvInner,
}

impl Environment {
    /// Creates a fresh environment in `dir` and commits its boot
    /// transaction.
    pub fn create<P: AsRef<Path>>(dir: P) -> Result<Self> {
        Self::create_with(dir, Options::default())
    }

    pub fn create_with<P: AsRef<Path>>(dir: P, options: Options) -> Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)
            .wrap_err_with(|| format!("failed to create environment directory {:?}", dir))?;

        let data_path = dir.join(DATA_FILE_NAME);
        ensure!(
            !data_path.exists(),
            "environment already exists at {:?}",
            data_path
        );
        ensure!(
            options.free_space_buffer_pages > 0,
            "free-space buffers need at least one page"
        );
        ensure!(
            options.journal_file_pages >= 4,
            "journal files need at least four pages"
        );

        let buffer_pages = options.free_space_buffer_pages;
        let first_data_page = FIRST_FREE_SPACE_PAGE as u64 + 2 * buffer_pages as u64;

        let mut pager = Pager::create(&data_path, first_data_page)?;
        let freespace = FreeSpace::create(FIRST_FREE_SPACE_PAGE, buffer_pages)?;
        let tracked = freespace.tracked_pages();

        let free_space_state =
            FreeSpaceState::new(FIRST_FREE_SPACE_PAGE, buffer_pages, 0, tracked, 0);
        let header = FileHeader::new(
            0,
            first_data_page - 1,
            JournalInfo::none(),
            free_space_state,
            TreeHeader::empty(),
        );
        for slot in 0..2u64 {
            let image = {
                let temp = pager.temp_page();
                temp[..FILE_HEADER_SIZE].copy_from_slice(header.as_bytes());
                temp.to_vec()
            };
            pager.write_page_at(slot, &image)?;
        }
        pager.sync()?;

        let journal = Journal::new(dir.to_path_buf(), options.journal_file_pages);
        let env = Self {
            inner: EnvInner {
                max_pages: tracked,
                options,
                pager: RwLock::new(pager),
                journal: Mutex::new(journal),
                snapshot: RwLock::new(JournalSnapshot::empty()),
                freespace: Mutex::new(freespace),
                pending_frees: Mutex::new(PendingFrees::new()),
                write_lock: Mutex::new(()),
                apply_lock: Mutex::new(()),
                active: Mutex::new(ActiveTransactions::default()),
                committed: Mutex::new(CommittedState {
                    txid: 0,
                    root: TreeState::empty(),
                    free_space: free_space_state,
                    next_page: first_data_page,
                }),
                last_txid: AtomicU64::new(0),
            },
        };

        // Boot commit: establishes the first journal file and txid 1.
        env.new_transaction(TransactionKind::ReadWrite)?.commit()?;

        Ok(env)
    }

    /// Opens an existing environment, recovering the journal.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        Self::open_with(dir, Options::default())
    }

    pub fn open_with<P: AsRef<Path>>(dir: P, options: Options) -> Result<Self> {
        let dir = dir.as_ref();
        let data_path = dir.join(DATA_FILE_NAME);

        let pager = Pager::open(&data_path)?;
        ensure!(
            pager.page_count() >= 2,
            "data file at {:?} is too small to hold its headers",
            data_path
        );

        let header = FileHeader::choose_current(pager.page(0)?, pager.page(1)?)
            .wrap_err_with(|| format!("failed to open environment at {:?}", dir))?;

        let recovered = recovery::recover(dir, options.journal_file_pages, &header)?;
        let journal = recovered.journal;
        let snapshot = journal.build_snapshot();

        let (txid, next_page, root_header, free_space_state) = match &recovered.state {
            Some(state) => (state.txid, state.next_page, state.root, state.free_space),
            None => (
                header.transaction_id(),
                header.last_page_number() + 1,
                *header.root(),
                *header.free_space(),
            ),
        };

        // The free-space buffers are read through the recovered journal
        // view so unapplied commits are honored.
        let read_region = |first: u64, count: u64| -> Result<Vec<u8>> {
            let mut payload = Vec::with_capacity(count as usize * (PAGE_SIZE - PAGE_HEADER_SIZE));
            for page_no in first..first + count {
                let image = match snapshot.lookup(page_no) {
                    Some((file, index)) => file.read_page(index)?.to_vec(),
                    None => pager.page_copy(page_no)?,
                };
                payload.extend_from_slice(&image[PAGE_HEADER_SIZE..]);
            }
            Ok(payload)
        };

        let buffer_pages = free_space_state.buffer_pages() as u64;
        let first = free_space_state.first_page() as u64;
        let payload_len =
            buffer_pages as usize * crate::storage::FREE_SPACE_PAGE_PAYLOAD;
        let mut buffer_a = read_region(first, buffer_pages)?;
        let mut buffer_b = read_region(first + buffer_pages, buffer_pages)?;
        buffer_a.truncate(payload_len);
        buffer_b.truncate(payload_len);

        let freespace = FreeSpace::load(&free_space_state, buffer_a, buffer_b)?;
        let tracked = freespace.tracked_pages();

        let env = Self {
            inner: EnvInner {
                max_pages: tracked,
                options,
                pager: RwLock::new(pager),
                journal: Mutex::new(journal),
                snapshot: RwLock::new(snapshot),
                freespace: Mutex::new(freespace),
                pending_frees: Mutex::new(PendingFrees::new()),
                write_lock: Mutex::new(()),
                apply_lock: Mutex::new(()),
                active: Mutex::new(ActiveTransactions::default()),
                committed: Mutex::new(CommittedState {
                    txid,
                    root: TreeState::from_header(&root_header),
                    free_space: free_space_state,
                    next_page,
                }),
                last_txid: AtomicU64::new(txid),
            },
        };

        Ok(env)
    }

    /// Begins a transaction. `ReadWrite` blocks until the single writer
    /// slot is free; `Read` never blocks on the writer.
    pub fn new_transaction(&self, kind: TransactionKind) -> Result<Transaction<'_>> {
        match kind {
            TransactionKind::Read => {
                let (anchor, root, next_page) = {
                    let mut active = self.inner.active.lock();
                    let committed = self.inner.committed.lock();
                    active.register(committed.txid);
                    (committed.txid, committed.root.clone(), committed.next_page)
                };
                let snapshot = self.inner.snapshot.read().clone();
                Ok(Transaction::begin(
                    &self.inner,
                    kind,
                    anchor,
                    anchor,
                    None,
                    root,
                    next_page,
                    snapshot,
                ))
            }
            TransactionKind::ReadWrite => {
                let guard = self.inner.write_lock.lock();
                let (anchor, root, next_page) = {
                    let mut active = self.inner.active.lock();
                    let committed = self.inner.committed.lock();
                    active.register(committed.txid);
                    (committed.txid, committed.root.clone(), committed.next_page)
                };
                let snapshot = self.inner.snapshot.read().clone();
                Ok(Transaction::begin(
                    &self.inner,
                    kind,
                    anchor + 1,
                    anchor,
                    Some(guard),
                    root,
                    next_page,
                    snapshot,
                ))
            }
        }
    }

    /// The unnamed root tree. Usable directly as a key-value map, and the
    /// catalog the named trees live in.
    pub fn root_tree(&self) -> Tree {
        Tree::new("")
    }

    /// Creates a named tree, or returns the existing one.
    pub fn create_tree(&self, txn: &mut Transaction<'_>, name: &str) -> Result<Tree> {
        txn.ensure_writable()?;
        ensure!(!name.is_empty(), "tree names must not be empty");

        if txn.tree_state(name)?.is_none() {
            txn.store_tree_state(name, TreeState::empty());
        }
        Ok(Tree::new(name))
    }

    /// Looks up a named tree in the transaction's view.
    pub fn get_tree(&self, txn: &Transaction<'_>, name: &str) -> Result<Option<Tree>> {
        ensure!(!name.is_empty(), "tree names must not be empty");
        Ok(txn.tree_state(name)?.map(|_| Tree::new(name)))
    }

    /// Deletes a named tree and frees all of its pages. Returns whether it
    /// existed.
    pub fn delete_tree(&self, txn: &mut Transaction<'_>, name: &str) -> Result<bool> {
        txn.ensure_writable()?;
        ensure!(!name.is_empty(), "tree names must not be empty");

        let Some(state) = txn.tree_state(name)? else {
            return Ok(false);
        };

        ops::free_tree_pages(txn, &state)?;

        let mut root = txn.root_tree.clone();
        ops::delete(txn, &mut root, name.as_bytes())?;
        txn.root_tree = root;
        txn.forget_tree(name);

        Ok(true)
    }

    /// Names of all trees catalogued in the root tree, in order.
    pub fn tree_names(&self, txn: &Transaction<'_>) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in self.root_tree().iter(txn, None)? {
            let (key, _) = entry?;
            names.push(String::from_utf8_lossy(&key).into_owned());
        }
        Ok(names)
    }

    /// A read-only view pinned to the current committed state.
    pub fn create_snapshot(&self) -> Result<Snapshot<'_>> {
        Ok(Snapshot {
            txn: self.new_transaction(TransactionKind::Read)?,
        })
    }

    /// Applies pending committed transactions to the data file. Returns
    /// whether anything was applied.
    pub fn flush_journal(&self) -> Result<bool> {
        applier::apply_journal(&self.inner)
    }

    /// Streams a consistent copy of the data file: both header pages, then
    /// every page up to the allocation frontier, resolved through a read
    /// snapshot. Returns the bytes written. Neither internal transaction
    /// commits.
    pub fn backup<W: Write>(&self, out: &mut W) -> Result<u64> {
        // The write transaction fences commits. With commits fenced, one
        // application pass brings the header pages up to the state the
        // read transaction will observe; the apply lock then keeps them
        // still while they are copied verbatim.
        let _fence = self.new_transaction(TransactionKind::ReadWrite)?;
        applier::apply_journal(&self.inner)?;
        let _apply_fence = self.inner.apply_lock.lock();
        let read_txn = self.new_transaction(TransactionKind::Read)?;

        let mut written = 0u64;
        for page_no in 0..2u64 {
            let page = self.inner.pager.read().page_copy(page_no)?;
            out.write_all(&page).wrap_err("failed to write backup")?;
            written += PAGE_SIZE as u64;
        }

        let next_page = read_txn.next_page;
        for page_no in 2..next_page {
            let page = read_txn
                .read_page(page_no)
                .wrap_err_with(|| format!("failed to back up page {}", page_no))?;
            out.write_all(&page).wrap_err("failed to write backup")?;
            written += PAGE_SIZE as u64;
        }

        Ok(written)
    }

    pub fn stats(&self) -> EnvironmentStats {
        EnvironmentStats {
            data_file_pages: self.inner.pager.read().page_count(),
            next_page_number: self.inner.committed.lock().next_page,
            free_pages: self.inner.freespace.lock().free_page_count(),
            pending_free_pages: self.inner.pending_frees.lock().pending_count() as u64,
            active_transactions: self.inner.active.lock().count(),
            journal_files: self.inner.journal.lock().file_count(),
            last_committed_txid: self.inner.last_txid.load(Ordering::SeqCst),
        }
    }

    /// The environment directory's data file path, for diagnostics.
    pub fn data_path(dir: &Path) -> PathBuf {
        dir.join(DATA_FILE_NAME)
    }
}

/// A read-only view of the environment at a fixed point in time.
pub struct Snapshot<'env> {
    txn: Transaction<'env>,
}

impl<'env> Snapshot<'env> {
    pub fn transaction(&self) -> &Transaction<'env> {
        &self.txn
    }

    pub fn tree(&self, name: &str) -> Result<Option<Tree>> {
        ensure!(!name.is_empty(), "tree names must not be empty");
        Ok(self.txn.tree_state(name)?.map(|_| Tree::new(name)))
    }

    pub fn root_tree(&self) -> Tree {
        Tree::new("")
    }
}
