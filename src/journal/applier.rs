//! # Journal Application
//!
//! The background half of durability: committed transactions are copied
//! from the journal into the data file, the data file is fsynced, and only
//! then is one of the two header pages rewritten. The header write is the
//! linearization point — a crash at any earlier moment leaves the previous
//! header current and recovery replays the journal instead.
//!
//! ## Reader Barrier
//!
//! Only transactions strictly older than every active transaction's anchor
//! are applied. A reader resolves pages through its journal snapshot first
//! and falls back to the data file; applying a transaction newer than the
//! reader's anchor would let that fallback observe post-snapshot bytes.
//! Transactions at or behind the oldest anchor are visible to every active
//! transaction already, so applying them changes nothing a reader can see.
//!
//! ## Retirement
//!
//! After the header is durable, journal files wholly behind the sync
//! barrier leave the journal's list and are marked delete-on-drop. Reader
//! snapshots still holding them keep the backing files alive until those
//! readers finish.

use std::collections::BTreeMap;
use std::sync::Arc;

use eyre::Result;
use zerocopy::IntoBytes;

use crate::env::EnvInner;
use crate::storage::{FileHeader, JournalInfo, FILE_HEADER_SIZE};

use super::JournalFile;

/// Applies every pending transaction behind the oldest active anchor.
/// Returns whether anything was applied. Concurrent calls coalesce: a
/// second caller finding the applier busy returns immediately.
pub(crate) fn apply_journal(env: &EnvInner) -> Result<bool> {
    let Some(_guard) = env.apply_lock.try_lock() else {
        return Ok(false);
    };

    let barrier = env
        .active
        .lock()
        .oldest_anchor()
        .unwrap_or(u64::MAX);

    let records = {
        let mut journal = env.journal.lock();
        let ready = journal
            .pending()
            .iter()
            .take_while(|record| record.txid <= barrier)
            .count();
        if ready == 0 {
            return Ok(false);
        }
        journal.drain_pending(ready)
    };

    // Union the translation tables; a later transaction's copy of a page
    // supersedes earlier ones.
    let mut pages: BTreeMap<u64, (Arc<JournalFile>, u64)> = BTreeMap::new();
    for record in &records {
        for (file, entries) in &record.chunks {
            for &(logical, index) in entries {
                pages.insert(logical, (file.clone(), index));
            }
        }
    }
    let last = records.last().expect("records is non-empty");

    {
        let mut pager = env.pager.write();
        let highest_target = pages.keys().next_back().map(|p| p + 1).unwrap_or(0);
        let needed = (last.last_page + 1)
            .max(highest_target)
            .max(pager.page_count());
        pager.allocate_more_pages(needed)?;

        for (logical, (file, index)) in &pages {
            let image = file.read_page(*index)?;
            pager.write_page_at(*logical, image)?;
        }
        pager.sync()?;
    }

    // Advance the in-memory header and persist it into the alternating
    // header slot.
    let header = {
        let mut journal = env.journal.lock();
        journal.data_flush_counter += 1;
        journal.last_synced_journal = last.end_journal as i64;
        journal.last_synced_page = last.end_page as i64;

        let info = JournalInfo::new(
            journal.recent_journal(),
            journal.file_count() as i64,
            journal.data_flush_counter,
            journal.last_synced_journal,
            journal.last_synced_page,
        );
        FileHeader::new(last.txid, last.last_page, info, last.free_space, last.root)
    };

    let slot = (header.journal_info().data_flush_counter() & 1) as u64;
    {
        let mut pager = env.pager.write();
        let image = {
            let temp = pager.temp_page();
            temp[..FILE_HEADER_SIZE].copy_from_slice(header.as_bytes());
            temp.to_vec()
        };
        pager.write_page_at(slot, &image)?;
        pager.flush_range(slot, 1)?;
        pager.sync()?;
    }

    // The header is durable; journal files behind the barrier can go.
    {
        let mut journal = env.journal.lock();
        journal.retire_applied_files();
        *env.snapshot.write() = journal.build_snapshot();
    }

    Ok(true)
}
