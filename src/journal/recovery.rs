//! # Journal Recovery
//!
//! On environment open, the journal directory is scanned and every
//! transaction committed after the data file's last sync point is
//! re-discovered: its header sequence validated, its checksum recomputed,
//! and its page-translation entries republished. The scan stops at the
//! first invalid header or checksum — a torn transaction was by definition
//! never acknowledged, so everything after it is discarded and later
//! overwritten by the resuming writer.
//!
//! ## Validation Rules
//!
//! - The header's magic marker must match; a mismatch is the end of the
//!   valid region, not an error.
//! - Transaction ids are contiguous starting after the file header's id,
//!   except that a `Start|Split` chunk is continued by a `Split|Commit`
//!   chunk with the same id at the start of the next file.
//! - A `Start` marker is required unless a split is being continued.
//! - The CRC32 over the chunk's page images must match the header.
//!
//! A transaction is recovered only when its commit chunk validates; a
//! dangling `Start|Split` chunk is treated as uncommitted.
//!
//! ## Idempotence
//!
//! Recovery publishes translation tables and pending apply records; it
//! writes nothing. Running it twice over the same files yields the same
//! state, and pages already applied to the data file are simply shadowed by
//! their journal copies until the applier retires them.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use eyre::{Result, WrapErr};

use crate::storage::{FileHeader, FreeSpaceState, TransactionHeader, TreeHeader};
use crate::tree::node::PageHeader;

use super::{Journal, JournalFile, TxnRecord, CRC32};

/// The committed state carried by the newest recovered transaction; it
/// supersedes the data file header's copy.
#[derive(Debug, Clone)]
pub(crate) struct RecoveredState {
    pub txid: u64,
    pub next_page: u64,
    pub last_page: u64,
    pub root: TreeHeader,
    pub free_space: FreeSpaceState,
}

pub(crate) struct Recovery {
    pub journal: Journal,
    pub state: Option<RecoveredState>,
}

/// Journal files present in `dir`, sorted by number.
fn list_journal_files(dir: &Path) -> Result<Vec<(u64, PathBuf)>> {
    let mut found = Vec::new();
    for entry in std::fs::read_dir(dir)
        .wrap_err_with(|| format!("failed to read journal directory {:?}", dir))?
    {
        let entry = entry.wrap_err("failed to read directory entry")?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(number_part) = name.strip_suffix(".journal") {
            if number_part.len() == 19 {
                if let Ok(number) = number_part.parse::<u64>() {
                    found.push((number, entry.path()));
                }
            }
        }
    }
    found.sort();
    Ok(found)
}

struct PendingSplit {
    txid: u64,
    chunks: Vec<(Arc<JournalFile>, Vec<(u64, u64)>)>,
}

/// Scans one chunk at `idx` in `file`. Returns `None` when the chunk is
/// invalid (end of the journal's valid region), otherwise the chunk's
/// header and its translation entries.
fn read_chunk(
    file: &Arc<JournalFile>,
    idx: u64,
) -> Result<Option<(TransactionHeader, Vec<(u64, u64)>)>> {
    let header = *TransactionHeader::from_bytes(file.read_page(idx)?)?;
    if !header.marker_valid() {
        return Ok(None);
    }

    let total = header.total_pages();
    if idx + 1 + total > file.capacity_pages() {
        return Ok(None);
    }

    let mut digest = CRC32.digest();
    let mut entries = Vec::with_capacity(total as usize);
    for k in 0..total {
        let image = file.read_page(idx + 1 + k)?;
        digest.update(image);
        let page_header: &PageHeader = crate::storage::parse_zerocopy(image, "PageHeader")?;
        entries.push((page_header.page_no() as u64, idx + 1 + k));
    }

    if digest.finalize() != header.crc() {
        return Ok(None);
    }

    Ok(Some((header, entries)))
}

/// Rebuilds the journal from disk after choosing the current file header.
pub(crate) fn recover(
    dir: &Path,
    file_capacity_pages: u64,
    header: &FileHeader,
) -> Result<Recovery> {
    let info = header.journal_info();
    let last_synced = info.last_synced_journal();
    let last_synced_page = info.last_synced_journal_page();

    let mut files: Vec<Arc<JournalFile>> = Vec::new();
    for (number, path) in list_journal_files(dir)? {
        let stale = (number as i64) < last_synced;
        let empty = std::fs::metadata(&path).map(|m| m.len() == 0).unwrap_or(true);
        if stale || empty {
            // Fully applied before the last header flush, or preallocation
            // was interrupted before anything was written; either way
            // nothing can reference it.
            std::fs::remove_file(&path)
                .wrap_err_with(|| format!("failed to remove stale journal {:?}", path))?;
            continue;
        }
        files.push(JournalFile::open(&path, number)?);
    }

    let mut journal = Journal::new(dir.to_path_buf(), file_capacity_pages);
    journal.data_flush_counter = info.data_flush_counter();
    journal.last_synced_journal = last_synced;
    journal.last_synced_page = last_synced_page;

    let mut expected_txid = header.transaction_id() + 1;
    let mut split: Option<PendingSplit> = None;
    let mut state: Option<RecoveredState> = None;
    // (file index, next write page) after the last committed chunk.
    let mut writer_pos: Option<(usize, u64)> = None;

    'files: for (fi, file) in files.iter().enumerate() {
        let mut idx = if file.number() as i64 == last_synced {
            (last_synced_page + 1).max(0) as u64
        } else {
            0
        };

        while idx < file.capacity_pages() {
            let Some((th, entries)) = read_chunk(file, idx)? else {
                break 'files;
            };

            match &mut split {
                Some(pending) => {
                    // A split continuation must keep the txid and carry
                    // Split|Commit.
                    if th.txid() != pending.txid || !th.is_split() || !th.is_commit() {
                        break 'files;
                    }
                }
                None => {
                    if th.txid() != expected_txid || !th.is_start() {
                        break 'files;
                    }
                }
            }

            let chunk_end = idx + th.total_pages();
            idx += 1 + th.total_pages();

            if th.is_commit() {
                let mut chunks = match split.take() {
                    Some(pending) => pending.chunks,
                    None => Vec::new(),
                };
                chunks.push((file.clone(), entries));

                for (chunk_file, chunk_entries) in &chunks {
                    chunk_file.merge_table(chunk_entries);
                }

                journal.push_pending(TxnRecord {
                    txid: th.txid(),
                    chunks,
                    end_journal: file.number(),
                    end_page: chunk_end,
                    next_page: th.next_page_number(),
                    last_page: th.last_page_number(),
                    root: *th.root(),
                    free_space: *th.free_space(),
                });

                state = Some(RecoveredState {
                    txid: th.txid(),
                    next_page: th.next_page_number(),
                    last_page: th.last_page_number(),
                    root: *th.root(),
                    free_space: *th.free_space(),
                });
                writer_pos = Some((fi, idx));
                expected_txid = th.txid() + 1;
            } else {
                // Start|Split: continuation expected at the head of the
                // next file.
                split = Some(PendingSplit {
                    txid: th.txid(),
                    chunks: vec![(file.clone(), entries)],
                });
                continue 'files;
            }
        }
    }

    // When the header references journal files that are gone (a restored
    // backup, say), numbering continues past them rather than reusing a
    // number the header claims is already applied.
    let next_number = match files.last() {
        Some(file) => file.number() + 1,
        None if last_synced >= 0 => last_synced as u64 + 1,
        None => 1,
    };
    let (current, write_page) = match writer_pos {
        Some((fi, page)) => (Some(files[fi].clone()), page),
        None => match files.last() {
            // Journal files with no recovered commits past the sync point:
            // resume at the newest file's start.
            Some(last) => (
                Some(last.clone()),
                if last.number() as i64 == last_synced {
                    (last_synced_page + 1).max(0) as u64
                } else {
                    0
                },
            ),
            None => (None, 0),
        },
    };

    journal.restore_writer(files, current, write_page, next_number);

    Ok(Recovery { journal, state })
}
