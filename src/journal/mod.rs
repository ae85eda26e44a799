//! # Write-Ahead Journal
//!
//! Durability for Vellum commits. The journal is an ordered sequence of
//! append-only files, each preallocated to a fixed size and filled with
//! whole page images. A transaction's journal footprint is one
//! `TransactionHeader` page followed by its dirty pages in ascending
//! logical-page order:
//!
//! ```text
//! 0000000000000000001.journal
//! +----------+--------+--------+----------+--------+----
//! | TxHeader | page A | page B | TxHeader | page C | ...
//! +----------+--------+--------+----------+--------+----
//! ```
//!
//! ## Commit Protocol
//!
//! 1. Reserve the header page at the current write position
//! 2. Append the dirty page images, streaming them through a CRC32 digest
//! 3. Write the header (marker `Start|Commit`, counts, CRC) and fsync
//! 4. Merge the transaction's page-translation entries into the file's
//!    table and publish a new read snapshot (copy-on-replace)
//!
//! A transaction that does not fit the current file continues in exactly one
//! more: the first chunk's header carries `Start|Split`, the second
//! `Split|Commit`, each chunk checksummed over its own pages. Anything
//! larger is rejected before any page is written.
//!
//! ## Page Translation
//!
//! Each file maintains an append-only table mapping logical data-page
//! numbers to page indexes within the file. Remapping a logical page always
//! points to a later offset, so "newest journal file, then latest entry"
//! resolves every read. Read transactions capture an immutable snapshot of
//! `(file, table)` pairs at begin and scan newest-to-oldest.
//!
//! ## Reference Counting
//!
//! Journal files are shared through `Arc`: the journal's own list holds the
//! creator reference, every read snapshot holds one per file, and the writer
//! holds one for the file it may still append to. A retired file is marked
//! delete-on-drop; the backing file disappears when the last reference
//! goes away, never while a reader might still resolve pages through it.

pub(crate) mod applier;
pub(crate) mod recovery;

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crc::{Crc, CRC_32_ISO_HDLC};
use eyre::{ensure, Result, WrapErr};
use hashbrown::HashMap;
use memmap2::Mmap;
use parking_lot::{Mutex, RwLock};
use zerocopy::IntoBytes;

use crate::storage::{
    FreeSpaceState, TransactionHeader, TreeHeader, PAGE_SIZE, TX_COMMIT, TX_SPLIT, TX_START,
};

pub(crate) const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Minimum free pages a journal file must have to accept another
/// transaction: one header page plus at least one data page.
const MIN_USABLE_PAGES: u64 = 2;

pub(crate) fn journal_file_name(number: u64) -> String {
    format!("{:019}.journal", number)
}

/// One preallocated journal file: sequential writer, mmap reader, and the
/// committed page-translation table.
#[derive(Debug)]
pub(crate) struct JournalFile {
    number: u64,
    path: PathBuf,
    file: Mutex<File>,
    map: Mmap,
    capacity_pages: u64,
    table: RwLock<Arc<HashMap<u64, u64>>>,
    delete_on_drop: AtomicBool,
}

impl JournalFile {
    pub fn create(dir: &Path, number: u64, capacity_pages: u64) -> Result<Arc<Self>> {
        let path = dir.join(journal_file_name(number));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .wrap_err_with(|| format!("failed to create journal file at {:?}", path))?;

        file.set_len(capacity_pages * PAGE_SIZE as u64)
            .wrap_err("failed to preallocate journal file")?;
        file.sync_all()
            .wrap_err("failed to sync new journal file")?;

        // SAFETY: the file was just created and preallocated; its length is
        // fixed for the file's lifetime, so the map never outlives valid
        // bounds. Reads only target offsets behind a synced commit header.
        let map = unsafe {
            Mmap::map(&file).wrap_err_with(|| format!("failed to mmap journal at {:?}", path))?
        };

        Ok(Arc::new(Self {
            number,
            path,
            file: Mutex::new(file),
            map,
            capacity_pages,
            table: RwLock::new(Arc::new(HashMap::new())),
            delete_on_drop: AtomicBool::new(false),
        }))
    }

    pub fn open(path: &Path, number: u64) -> Result<Arc<Self>> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .wrap_err_with(|| format!("failed to open journal file at {:?}", path))?;

        // A crash can interrupt preallocation, so a short or ragged file is
        // tolerated: only whole pages are readable.
        let len = file
            .metadata()
            .wrap_err("failed to read journal metadata")?
            .len();
        ensure!(len > 0, "journal file {:?} is empty", path);

        // SAFETY: journal files are preallocated at creation and never
        // resized afterwards, so the map's bounds stay valid.
        let map = unsafe {
            Mmap::map(&file).wrap_err_with(|| format!("failed to mmap journal at {:?}", path))?
        };

        Ok(Arc::new(Self {
            number,
            path: path.to_path_buf(),
            file: Mutex::new(file),
            map,
            capacity_pages: len / PAGE_SIZE as u64,
            table: RwLock::new(Arc::new(HashMap::new())),
            delete_on_drop: AtomicBool::new(false),
        }))
    }

    pub fn number(&self) -> u64 {
        self.number
    }

    pub fn capacity_pages(&self) -> u64 {
        self.capacity_pages
    }

    pub fn read_page(&self, page_index: u64) -> Result<&[u8]> {
        ensure!(
            page_index < self.capacity_pages,
            "journal page {} out of bounds (capacity={})",
            page_index,
            self.capacity_pages
        );
        let offset = page_index as usize * PAGE_SIZE;
        Ok(&self.map[offset..offset + PAGE_SIZE])
    }

    /// Writes a page image at `page_index` without syncing.
    fn write_page(&self, page_index: u64, data: &[u8]) -> Result<()> {
        ensure!(
            page_index < self.capacity_pages,
            "journal write at page {} out of bounds (capacity={})",
            page_index,
            self.capacity_pages
        );
        debug_assert!(data.len() <= PAGE_SIZE);

        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(page_index * PAGE_SIZE as u64))
            .wrap_err("failed to seek in journal file")?;
        file.write_all(data)
            .wrap_err("failed to write journal page")?;
        if data.len() < PAGE_SIZE {
            let pad = vec![0u8; PAGE_SIZE - data.len()];
            file.write_all(&pad).wrap_err("failed to pad journal page")?;
        }
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.file
            .lock()
            .sync_data()
            .wrap_err("failed to sync journal file")
    }

    /// Merges committed translation entries. Entries always point at later
    /// offsets than anything already present for the same logical page.
    pub fn merge_table(&self, entries: &[(u64, u64)]) {
        if entries.is_empty() {
            return;
        }
        let mut guard = self.table.write();
        let mut next: HashMap<u64, u64> = (**guard).clone();
        for &(logical, index) in entries {
            next.insert(logical, index);
        }
        *guard = Arc::new(next);
    }

    pub fn table_snapshot(&self) -> Arc<HashMap<u64, u64>> {
        self.table.read().clone()
    }

    pub fn mark_for_deletion(&self) {
        self.delete_on_drop.store(true, Ordering::Release);
    }
}

impl Drop for JournalFile {
    fn drop(&mut self) {
        if self.delete_on_drop.load(Ordering::Acquire) {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// Immutable view of the journal published to readers: every file that may
/// still hold live pages, newest last, with a frozen translation table each.
#[derive(Debug)]
pub(crate) struct JournalSnapshot {
    pub files: Vec<(Arc<JournalFile>, Arc<HashMap<u64, u64>>)>,
}

impl JournalSnapshot {
    pub fn empty() -> Arc<Self> {
        Arc::new(Self { files: Vec::new() })
    }

    /// Resolves a logical page, newest journal first.
    pub fn lookup(&self, logical: u64) -> Option<(&Arc<JournalFile>, u64)> {
        for (file, table) in self.files.iter().rev() {
            if let Some(&index) = table.get(&logical) {
                return Some((file, index));
            }
        }
        None
    }
}

/// A committed transaction not yet applied to the data file.
pub(crate) struct TxnRecord {
    pub txid: u64,
    /// Per-chunk translation entries: (file, [(logical page, page index)]).
    pub chunks: Vec<(Arc<JournalFile>, Vec<(u64, u64)>)>,
    pub end_journal: u64,
    pub end_page: u64,
    pub next_page: u64,
    pub last_page: u64,
    pub root: TreeHeader,
    pub free_space: FreeSpaceState,
}

/// Everything the journal needs to append a commit.
pub(crate) struct AppendTransaction<'a> {
    pub txid: u64,
    pub next_page: u64,
    pub last_page: u64,
    pub root: TreeHeader,
    pub free_space: FreeSpaceState,
    /// Dirty pages sorted ascending by logical page number.
    pub pages: Vec<(u64, &'a [u8])>,
    pub overflow_page_count: u32,
}

pub(crate) struct Journal {
    dir: PathBuf,
    file_capacity_pages: u64,
    files: Vec<Arc<JournalFile>>,
    current: Option<Arc<JournalFile>>,
    write_page: u64,
    next_number: u64,
    /// Committed transactions awaiting application, oldest first.
    pending: Vec<TxnRecord>,
    pub data_flush_counter: i64,
    pub last_synced_journal: i64,
    pub last_synced_page: i64,
}

impl Journal {
    pub fn new(dir: PathBuf, file_capacity_pages: u64) -> Self {
        Self {
            dir,
            file_capacity_pages,
            files: Vec::new(),
            current: None,
            write_page: 0,
            next_number: 1,
            pending: Vec::new(),
            data_flush_counter: 0,
            last_synced_journal: -1,
            last_synced_page: -1,
        }
    }

    pub fn files(&self) -> &[Arc<JournalFile>] {
        &self.files
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub(crate) fn pending(&self) -> &[TxnRecord] {
        &self.pending
    }

    pub(crate) fn push_pending(&mut self, record: TxnRecord) {
        self.pending.push(record);
    }

    pub(crate) fn drain_pending(&mut self, count: usize) -> Vec<TxnRecord> {
        self.pending.drain(..count).collect()
    }

    pub(crate) fn restore_writer(
        &mut self,
        files: Vec<Arc<JournalFile>>,
        current: Option<Arc<JournalFile>>,
        write_page: u64,
        next_number: u64,
    ) {
        self.files = files;
        self.current = current;
        self.write_page = write_page;
        self.next_number = next_number;
    }

    pub fn recent_journal(&self) -> i64 {
        self.files.last().map(|f| f.number() as i64).unwrap_or(-1)
    }

    fn roll_to_new_file(&mut self) -> Result<Arc<JournalFile>> {
        let file = JournalFile::create(&self.dir, self.next_number, self.file_capacity_pages)?;
        self.next_number += 1;
        self.files.push(file.clone());
        self.current = Some(file.clone());
        self.write_page = 0;
        Ok(file)
    }

    fn ensure_current(&mut self) -> Result<Arc<JournalFile>> {
        match &self.current {
            Some(file) if file.capacity_pages() - self.write_page >= MIN_USABLE_PAGES => {
                Ok(file.clone())
            }
            _ => self.roll_to_new_file(),
        }
    }

    /// Writes one transaction chunk: header page, then `pages`, CRC over the
    /// page images in order. Returns the translation entries for the chunk.
    fn write_chunk(
        file: &JournalFile,
        header_page: u64,
        tx: &AppendTransaction<'_>,
        pages: &[(u64, &[u8])],
        tx_flags: u32,
    ) -> Result<Vec<(u64, u64)>> {
        let mut digest = CRC32.digest();
        let mut entries = Vec::with_capacity(pages.len());

        for (i, (logical, image)) in pages.iter().enumerate() {
            debug_assert_eq!(image.len(), PAGE_SIZE);
            let index = header_page + 1 + i as u64;
            file.write_page(index, image)?;
            digest.update(image);
            entries.push((*logical, index));
        }

        // page_count + overflow_page_count covers every image the CRC
        // covered. The overflow share is carried on the commit chunk.
        let overflow = if tx_flags & TX_COMMIT != 0 {
            tx.overflow_page_count.min(pages.len() as u32)
        } else {
            0
        };
        let header = TransactionHeader::new(
            tx.txid,
            tx.next_page,
            tx.last_page,
            pages.len() as u32 - overflow,
            overflow,
            digest.finalize(),
            tx_flags,
            tx.root,
            tx.free_space,
            header_page,
        );

        let mut page_image = [0u8; PAGE_SIZE];
        page_image[..header.as_bytes().len()].copy_from_slice(header.as_bytes());
        file.write_page(header_page, &page_image)?;
        file.sync()?;

        Ok(entries)
    }

    /// Appends a committed transaction and returns the new read snapshot.
    /// Fails with a transaction-too-large error (before writing anything)
    /// when the pages cannot fit in two journal files.
    pub fn append_transaction(&mut self, tx: &AppendTransaction<'_>) -> Result<Arc<JournalSnapshot>> {
        let first = self.ensure_current()?;
        let available = first.capacity_pages() - self.write_page;
        let total = tx.pages.len() as u64;

        let mut chunks: Vec<(Arc<JournalFile>, Vec<(u64, u64)>)> = Vec::new();
        let end_file;
        let end_page;

        if 1 + total <= available {
            let entries = Self::write_chunk(
                &first,
                self.write_page,
                tx,
                &tx.pages,
                TX_START | TX_COMMIT,
            )?;
            end_file = first.number();
            end_page = self.write_page + total;
            self.write_page += 1 + total;
            chunks.push((first.clone(), entries));
        } else {
            let first_count = (available - 1) as usize;
            let remaining = tx.pages.len() - first_count;
            ensure!(
                1 + remaining as u64 <= self.file_capacity_pages,
                "transaction too large: {} pages span more than two journal files",
                tx.pages.len()
            );

            let head_pages = &tx.pages[..first_count];
            let tail_pages = &tx.pages[first_count..];

            let entries =
                Self::write_chunk(&first, self.write_page, tx, head_pages, TX_START | TX_SPLIT)?;
            chunks.push((first.clone(), entries));

            let second = self.roll_to_new_file()?;
            let entries =
                Self::write_chunk(&second, 0, tx, tail_pages, TX_SPLIT | TX_COMMIT)?;
            end_file = second.number();
            end_page = remaining as u64;
            self.write_page = 1 + remaining as u64;
            chunks.push((second.clone(), entries));
        }

        for (file, entries) in &chunks {
            file.merge_table(entries);
        }

        self.push_pending(TxnRecord {
            txid: tx.txid,
            chunks,
            end_journal: end_file,
            end_page,
            next_page: tx.next_page,
            last_page: tx.last_page,
            root: tx.root,
            free_space: tx.free_space,
        });

        Ok(self.build_snapshot())
    }

    pub fn build_snapshot(&self) -> Arc<JournalSnapshot> {
        Arc::new(JournalSnapshot {
            files: self
                .files
                .iter()
                .map(|f| (f.clone(), f.table_snapshot()))
                .collect(),
        })
    }

    /// Drops files fully behind the sync barrier; their backing files are
    /// deleted once every reader snapshot referencing them is gone.
    pub fn retire_applied_files(&mut self) {
        let barrier = self.last_synced_journal;
        if barrier < 0 {
            return;
        }
        self.files.retain(|file| {
            if (file.number() as i64) < barrier {
                file.mark_for_deletion();
                false
            } else {
                true
            }
        });
    }

    /// True when enough commits have accumulated to warrant a data-file
    /// flush.
    pub fn wants_apply(&self, flush_interval: usize) -> bool {
        self.pending.len() >= flush_interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_tx<'a>(txid: u64, pages: Vec<(u64, &'a [u8])>) -> AppendTransaction<'a> {
        AppendTransaction {
            txid,
            next_page: 100,
            last_page: 99,
            root: TreeHeader::empty(),
            free_space: FreeSpaceState::new(2, 1, 0, 32704, 0),
            pages,
            overflow_page_count: 0,
        }
    }

    #[test]
    fn journal_file_name_is_zero_padded() {
        assert_eq!(journal_file_name(1), "0000000000000000001.journal");
        assert_eq!(journal_file_name(42), "0000000000000000042.journal");
    }

    #[test]
    fn append_single_chunk_transaction() {
        let dir = tempdir().unwrap();
        let mut journal = Journal::new(dir.path().to_path_buf(), 16);

        let image = vec![0xAA; PAGE_SIZE];
        let snapshot = journal
            .append_transaction(&sample_tx(1, vec![(50, &image)]))
            .unwrap();

        let (file, index) = snapshot.lookup(50).unwrap();
        assert_eq!(index, 1);
        assert_eq!(file.read_page(index).unwrap(), &image[..]);
        assert!(snapshot.lookup(51).is_none());
        assert_eq!(journal.pending_count(), 1);
    }

    #[test]
    fn append_writes_valid_header_and_crc() {
        let dir = tempdir().unwrap();
        let mut journal = Journal::new(dir.path().to_path_buf(), 16);

        let a = vec![1u8; PAGE_SIZE];
        let b = vec![2u8; PAGE_SIZE];
        journal
            .append_transaction(&sample_tx(1, vec![(10, &a), (11, &b)]))
            .unwrap();

        let file = journal.files()[0].clone();
        let header_bytes = file.read_page(0).unwrap();
        let header = TransactionHeader::from_bytes(header_bytes).unwrap();

        assert!(header.marker_valid());
        assert!(header.is_start());
        assert!(header.is_commit());
        assert_eq!(header.txid(), 1);
        assert_eq!(header.total_pages(), 2);

        let mut digest = CRC32.digest();
        digest.update(&a);
        digest.update(&b);
        assert_eq!(header.crc(), digest.finalize());
    }

    #[test]
    fn newest_journal_entry_wins_lookup() {
        let dir = tempdir().unwrap();
        let mut journal = Journal::new(dir.path().to_path_buf(), 16);

        let old = vec![1u8; PAGE_SIZE];
        let new = vec![2u8; PAGE_SIZE];
        journal
            .append_transaction(&sample_tx(1, vec![(10, &old)]))
            .unwrap();
        let snapshot = journal
            .append_transaction(&sample_tx(2, vec![(10, &new)]))
            .unwrap();

        let (file, index) = snapshot.lookup(10).unwrap();
        assert_eq!(file.read_page(index).unwrap()[0], 2);
    }

    #[test]
    fn transaction_splits_across_two_files() {
        let dir = tempdir().unwrap();
        let mut journal = Journal::new(dir.path().to_path_buf(), 8);

        let images: Vec<Vec<u8>> = (0..10u8).map(|i| vec![i; PAGE_SIZE]).collect();
        let pages: Vec<(u64, &[u8])> = images
            .iter()
            .enumerate()
            .map(|(i, v)| (100 + i as u64, v.as_slice()))
            .collect();

        let snapshot = journal.append_transaction(&sample_tx(1, pages)).unwrap();

        assert_eq!(journal.file_count(), 2);

        let first = journal.files()[0].clone();
        let head = TransactionHeader::from_bytes(first.read_page(0).unwrap()).unwrap();
        assert!(head.is_start() && head.is_split() && !head.is_commit());
        assert_eq!(head.page_count(), 7);

        let second = journal.files()[1].clone();
        let tail = TransactionHeader::from_bytes(second.read_page(0).unwrap()).unwrap();
        assert!(tail.is_split() && tail.is_commit() && !tail.is_start());
        assert_eq!(tail.page_count(), 3);

        // All ten pages resolve through the snapshot.
        for i in 0..10u64 {
            let (file, index) = snapshot.lookup(100 + i).unwrap();
            assert_eq!(file.read_page(index).unwrap()[0], i as u8);
        }
    }

    #[test]
    fn oversized_transaction_is_rejected_before_writing() {
        let dir = tempdir().unwrap();
        let mut journal = Journal::new(dir.path().to_path_buf(), 4);

        let images: Vec<Vec<u8>> = (0..10u8).map(|i| vec![i; PAGE_SIZE]).collect();
        let pages: Vec<(u64, &[u8])> = images
            .iter()
            .enumerate()
            .map(|(i, v)| (100 + i as u64, v.as_slice()))
            .collect();

        let result = journal.append_transaction(&sample_tx(1, pages));

        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("transaction too large"));
    }

    #[test]
    fn full_file_rolls_to_next_on_following_commit() {
        let dir = tempdir().unwrap();
        let mut journal = Journal::new(dir.path().to_path_buf(), 4);

        let image = vec![7u8; PAGE_SIZE];
        // header + 2 pages leaves 1 free page: file is full.
        journal
            .append_transaction(&sample_tx(1, vec![(10, &image), (11, &image)]))
            .unwrap();
        assert_eq!(journal.file_count(), 1);

        journal
            .append_transaction(&sample_tx(2, vec![(12, &image)]))
            .unwrap();

        assert_eq!(journal.file_count(), 2);
    }

    #[test]
    fn retire_applied_files_drops_old_files() {
        let dir = tempdir().unwrap();
        let mut journal = Journal::new(dir.path().to_path_buf(), 4);

        let image = vec![7u8; PAGE_SIZE];
        journal
            .append_transaction(&sample_tx(1, vec![(10, &image), (11, &image)]))
            .unwrap();
        journal
            .append_transaction(&sample_tx(2, vec![(12, &image)]))
            .unwrap();
        let first_path = dir.path().join(journal_file_name(1));
        assert!(first_path.exists());

        // The applier drains its records before retiring files; pending
        // records hold file references of their own.
        journal.drain_pending(2);
        journal.last_synced_journal = 2;
        journal.retire_applied_files();

        assert_eq!(journal.file_count(), 1);
        assert!(!first_path.exists(), "retired file is deleted on last drop");
    }

    #[test]
    fn empty_commit_is_valid() {
        let dir = tempdir().unwrap();
        let mut journal = Journal::new(dir.path().to_path_buf(), 8);

        journal.append_transaction(&sample_tx(1, vec![])).unwrap();

        let file = journal.files()[0].clone();
        let header = TransactionHeader::from_bytes(file.read_page(0).unwrap()).unwrap();
        assert_eq!(header.total_pages(), 0);
        assert_eq!(header.crc(), CRC32.digest().finalize());
    }
}
