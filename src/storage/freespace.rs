//! # Free-Space Bit Maps
//!
//! Free-page tracking for the data file: one bit per tracked page (free = 1,
//! allocated = 0) held in a byte buffer that itself lives in data-file pages.
//!
//! ## Buffer Layout
//!
//! ```text
//! Offset              Contents
//! ------------------  -----------------------------------------
//! 0 .. C              Free bits, one per tracked page
//! C .. len-4          Modification bits, one per 4-KiB chunk
//! len-4 .. len        Reserved
//! ```
//!
//! `C = len - 4 - bytes_taken_by_modification_bits`, so the number of
//! trackable pages is `C * 8`. The free-bit array starts at offset 0 so
//! chunk k of the array coincides with file page k of the buffer region,
//! which keeps the incremental flush page-aligned.
//!
//! ## Modification Bits
//!
//! Every mutation sets the modification bit of the 4-KiB chunk containing
//! the touched free-bit byte. `copy_dirty_pages_to` then copies only the
//! in-use portion of dirty chunks between buffers, bounding the per-commit
//! synchronization work to what actually changed.
//!
//! ## Double Buffering
//!
//! The engine keeps two buffers in the data file and alternates them across
//! commits: readers observe the published (front) buffer's state while the
//! writer mutates the back buffer. Commit flushes the back buffer's dirty
//! chunks through the journal, syncs the front buffer from the back, and
//! swaps roles; rollback restores the back buffer from the front using the
//! same dirty-chunk machinery.
//!
//! ## Deferred Frees
//!
//! A page freed by transaction T may still be referenced by readers that
//! began before T committed. Freed page numbers are therefore parked in
//! `PendingFrees` keyed by T and only marked free once the oldest active
//! transaction anchor has reached T.

use std::collections::BTreeMap;

use eyre::{ensure, Result};

use super::{FreeSpaceState, PAGE_SIZE, PAGE_USABLE_SIZE};

/// Granularity of the modification bits.
pub const FREE_SPACE_CHUNK: usize = PAGE_SIZE;

/// Buffer bytes stored per data-file page: each page of the buffer region
/// carries the standard 16-byte page header so journal images of the region
/// stay self-describing.
pub const FREE_SPACE_PAGE_PAYLOAD: usize = PAGE_USABLE_SIZE;

const RESERVED_BYTES: usize = 4;

/// A bit array over a byte buffer with per-chunk modification tracking.
pub struct FreeSpaceBits {
    buf: Box<[u8]>,
    tracked_pages: u64,
    page_size: usize,
}

impl FreeSpaceBits {
    /// Wraps an existing buffer. `tracked_pages` must fit the buffer's
    /// capacity; `page_size` fixes both the chunk granularity and the
    /// bits-per-page quantum.
    pub fn from_buffer(buf: Vec<u8>, tracked_pages: u64, page_size: usize) -> Result<Self> {
        ensure!(page_size.is_power_of_two(), "page size must be a power of two");
        ensure!(
            buf.len() >= 2 * RESERVED_BYTES,
            "free-space buffer of {} bytes is too small",
            buf.len()
        );

        let bits = Self {
            buf: buf.into_boxed_slice(),
            tracked_pages,
            page_size,
        };

        ensure!(
            tracked_pages <= bits.max_number_of_pages(),
            "cannot track {} pages in a {}-byte buffer (max {})",
            tracked_pages,
            bits.buf.len(),
            bits.max_number_of_pages()
        );

        Ok(bits)
    }

    /// Allocates a zeroed buffer of `size_in_bytes` tracking `tracked_pages`.
    pub fn new(size_in_bytes: usize, tracked_pages: u64, page_size: usize) -> Result<Self> {
        Self::from_buffer(vec![0u8; size_in_bytes], tracked_pages, page_size)
    }

    pub fn size_in_bytes(&self) -> usize {
        self.buf.len()
    }

    pub fn tracked_pages(&self) -> u64 {
        self.tracked_pages
    }

    /// Total modification bits: one per chunk of the buffer.
    pub fn modification_bits_all(&self) -> usize {
        self.buf.len().div_ceil(self.page_size)
    }

    /// Modification bits actually needed for the tracked page count.
    pub fn modification_bits_in_use(&self) -> usize {
        (self.tracked_pages as usize).div_ceil(self.page_size * 8)
    }

    /// Bytes reserved at the tail for modification bits, rounded up to a
    /// 4-byte boundary.
    pub fn bytes_taken_by_modification_bits(&self) -> usize {
        self.modification_bits_all().div_ceil(8).next_multiple_of(4)
    }

    /// Page-tracking capacity of this buffer.
    pub fn max_number_of_pages(&self) -> u64 {
        let capacity_bytes = self.buf.len() - RESERVED_BYTES - self.bytes_taken_by_modification_bits();
        capacity_bytes as u64 * 8
    }

    /// Bytes of the free-bit array covering the tracked pages.
    fn bytes_in_use(&self) -> usize {
        (self.tracked_pages as usize).div_ceil(8)
    }

    fn modification_bits_offset(&self) -> usize {
        self.buf.len() - RESERVED_BYTES - self.bytes_taken_by_modification_bits()
    }

    pub fn is_free(&self, page: u64) -> bool {
        debug_assert!(page < self.tracked_pages);
        let byte = (page / 8) as usize;
        let bit = (page % 8) as u8;
        self.buf[byte] & (1 << bit) != 0
    }

    /// Sets or clears the free bit for `page` and marks the covering chunk
    /// as modified.
    pub fn mark_page(&mut self, page: u64, free: bool) -> Result<()> {
        ensure!(
            page < self.tracked_pages,
            "page {} beyond tracked range {}",
            page,
            self.tracked_pages
        );

        let byte = (page / 8) as usize;
        let bit = (page % 8) as u8;
        if free {
            self.buf[byte] |= 1 << bit;
        } else {
            self.buf[byte] &= !(1 << bit);
        }
        self.mark_chunk_modified(byte / self.page_size);
        Ok(())
    }

    fn mark_chunk_modified(&mut self, chunk: usize) {
        let offset = self.modification_bits_offset();
        self.buf[offset + chunk / 8] |= 1 << (chunk % 8);
    }

    fn chunk_is_modified(&self, chunk: usize) -> bool {
        let offset = self.modification_bits_offset();
        self.buf[offset + chunk / 8] & (1 << (chunk % 8)) != 0
    }

    pub fn clear_modified_bits(&mut self) {
        let offset = self.modification_bits_offset();
        let taken = self.bytes_taken_by_modification_bits();
        self.buf[offset..offset + taken].fill(0);
    }

    /// Chunk indexes whose modification bit is set.
    pub fn modified_chunks(&self) -> Vec<usize> {
        (0..self.modification_bits_all())
            .filter(|&c| self.chunk_is_modified(c))
            .collect()
    }

    /// Finds `count` contiguous free pages, clears their bits, and returns
    /// the first page number. Returns `None` when no such run exists.
    pub fn try_allocate(&mut self, count: u64) -> Option<u64> {
        if count == 0 || count > self.tracked_pages {
            return None;
        }

        let mut run_start = 0u64;
        let mut run_len = 0u64;
        let mut page = 0u64;

        while page < self.tracked_pages {
            // Skip whole bytes with no free bits when not inside a run.
            if run_len == 0 && page % 8 == 0 {
                let byte = (page / 8) as usize;
                if self.buf[byte] == 0 && page + 8 <= self.tracked_pages {
                    page += 8;
                    continue;
                }
            }

            if self.is_free(page) {
                if run_len == 0 {
                    run_start = page;
                }
                run_len += 1;
                if run_len == count {
                    for p in run_start..run_start + count {
                        let byte = (p / 8) as usize;
                        self.buf[byte] &= !(1 << (p % 8));
                        self.mark_chunk_modified(byte / self.page_size);
                    }
                    return Some(run_start);
                }
            } else {
                run_len = 0;
            }
            page += 1;
        }

        None
    }

    /// Copies the in-use span of every modified chunk into `other` and
    /// clears this buffer's modification bits. Returns the bytes copied.
    ///
    /// Copied chunks are marked modified on `other`: its file region has
    /// not seen these bytes, so the next commit that flushes `other` must
    /// include them.
    pub fn copy_dirty_pages_to(&mut self, other: &mut FreeSpaceBits) -> usize {
        debug_assert_eq!(self.buf.len(), other.buf.len());

        let in_use = self.bytes_in_use();
        let mut copied = 0;

        for chunk in 0..self.modification_bits_all() {
            if !self.chunk_is_modified(chunk) {
                continue;
            }
            let start = chunk * self.page_size;
            let end = ((chunk + 1) * self.page_size).min(in_use);
            if start < end {
                other.buf[start..end].copy_from_slice(&self.buf[start..end]);
                other.mark_chunk_modified(chunk);
                copied += end - start;
            }
        }

        self.clear_modified_bits();
        copied
    }

    /// Restores this buffer's modified chunks from `other` (the published
    /// state). Used on rollback. The modification bits stay set: the
    /// restored bytes still differ from this buffer's file region, which
    /// must be rewritten at the next commit.
    pub fn revert_dirty_from(&mut self, other: &FreeSpaceBits) {
        debug_assert_eq!(self.buf.len(), other.buf.len());

        let in_use = self.bytes_in_use();
        for chunk in 0..self.modification_bits_all() {
            if !self.chunk_is_modified(chunk) {
                continue;
            }
            let start = chunk * self.page_size;
            let end = ((chunk + 1) * self.page_size).min(in_use);
            if start < end {
                self.buf[start..end].copy_from_slice(&other.buf[start..end]);
            }
        }
    }

    /// Marks every chunk covering tracked pages as modified. Used after a
    /// crash-load, when the back buffer's file region cannot be assumed to
    /// match memory.
    pub fn mark_used_chunks_modified(&mut self) {
        let in_use = self.bytes_in_use().max(1);
        let last = (in_use - 1) / self.page_size;
        for chunk in 0..=last {
            self.mark_chunk_modified(chunk);
        }
    }

    pub fn free_page_count(&self) -> u64 {
        self.buf[..self.bytes_in_use()]
            .iter()
            .map(|b| b.count_ones() as u64)
            .sum()
    }

}

/// The front/back free-space buffer pair plus its placement in the file.
pub struct FreeSpace {
    buffers: [FreeSpaceBits; 2],
    current: usize,
    first_page: u32,
    buffer_pages: u32,
}

impl FreeSpace {
    /// Creates a fresh pair with zeroed buffers (everything allocated).
    pub fn create(first_page: u32, buffer_pages: u32) -> Result<Self> {
        let size = buffer_pages as usize * FREE_SPACE_PAGE_PAYLOAD;
        let probe = FreeSpaceBits::new(size, 0, PAGE_SIZE)?;
        let tracked = probe.max_number_of_pages();

        Ok(Self {
            buffers: [
                FreeSpaceBits::new(size, tracked, PAGE_SIZE)?,
                FreeSpaceBits::new(size, tracked, PAGE_SIZE)?,
            ],
            current: 0,
            first_page,
            buffer_pages,
        })
    }

    /// Reconstructs the pair from the images stored in the data file.
    pub fn load(state: &FreeSpaceState, buffer_a: Vec<u8>, buffer_b: Vec<u8>) -> Result<Self> {
        let tracked = state.tracked_pages();
        let mut a = FreeSpaceBits::from_buffer(buffer_a, tracked, PAGE_SIZE)?;
        let mut b = FreeSpaceBits::from_buffer(buffer_b, tracked, PAGE_SIZE)?;
        a.clear_modified_bits();
        b.clear_modified_bits();

        let current = state.current_buffer() as usize;
        ensure!(current < 2, "invalid free-space buffer index {}", current);

        // The back buffer must mirror the published one before the next
        // writer mutates it; after a crash the copies may have diverged.
        // Its file region is equally suspect, so every in-use chunk is
        // marked for rewrite at the next commit.
        let mut pair = Self {
            buffers: [a, b],
            current,
            first_page: state.first_page(),
            buffer_pages: state.buffer_pages(),
        };
        let (cur, back) = pair.split_current_back();
        back.buf.copy_from_slice(&cur.buf);
        back.clear_modified_bits();
        back.mark_used_chunks_modified();
        Ok(pair)
    }

    fn back_index(&self) -> usize {
        1 - self.current
    }

    fn split_current_back(&mut self) -> (&mut FreeSpaceBits, &mut FreeSpaceBits) {
        let (a, b) = self.buffers.split_at_mut(1);
        if self.current == 0 {
            (&mut a[0], &mut b[0])
        } else {
            (&mut b[0], &mut a[0])
        }
    }

    pub fn tracked_pages(&self) -> u64 {
        self.buffers[0].tracked_pages()
    }

    /// Allocates from the writer's back buffer.
    pub fn try_allocate(&mut self, count: u64) -> Option<u64> {
        let back = self.back_index();
        self.buffers[back].try_allocate(count)
    }

    /// Marks a page free in the writer's back buffer.
    pub fn free_page(&mut self, page: u64) -> Result<()> {
        let back = self.back_index();
        self.buffers[back].mark_page(page, true)
    }

    /// Free-page count of the published buffer.
    pub fn free_page_count(&self) -> u64 {
        self.buffers[self.current].free_page_count()
    }

    /// Dirty portions of the back buffer as `(file page number, payload)`
    /// pairs addressed at the back buffer's file region. The caller wraps
    /// each payload in a standard page header and journals it like any
    /// other dirty page.
    pub fn dirty_file_pages(&self) -> Vec<(u64, Vec<u8>)> {
        let back = self.back_index();
        let region_start = self.first_page as u64 + back as u64 * self.buffer_pages as u64;
        let bits = &self.buffers[back];
        let len = bits.size_in_bytes();

        let mut file_pages = std::collections::BTreeSet::new();
        for chunk in bits.modified_chunks() {
            let start = chunk * FREE_SPACE_CHUNK;
            let end = ((chunk + 1) * FREE_SPACE_CHUNK).min(len);
            if start < end {
                let first = start / FREE_SPACE_PAGE_PAYLOAD;
                let last = (end - 1) / FREE_SPACE_PAGE_PAYLOAD;
                file_pages.extend(first..=last);
            }
        }

        file_pages
            .into_iter()
            .map(|p| {
                let start = p * FREE_SPACE_PAGE_PAYLOAD;
                let end = (start + FREE_SPACE_PAGE_PAYLOAD).min(len);
                (region_start + p as u64, bits.buf[start..end].to_vec())
            })
            .collect()
    }

    /// The state the back buffer will publish if the commit succeeds.
    pub fn pending_state(&self) -> FreeSpaceState {
        let back = self.back_index();
        FreeSpaceState::new(
            self.first_page,
            self.buffer_pages,
            back as u32,
            self.tracked_pages(),
            self.buffers[back].free_page_count(),
        )
    }

    /// Commits the back buffer: syncs the old published buffer from it and
    /// swaps roles.
    pub fn publish(&mut self) {
        let back = self.back_index();
        let (cur, back_bits) = self.split_current_back();
        back_bits.copy_dirty_pages_to(cur);
        self.current = back;
    }

    /// Rolls the back buffer back to the published state.
    pub fn revert(&mut self) {
        let (cur, back) = self.split_current_back();
        back.revert_dirty_from(cur);
    }
}

/// Pages freed by committed transactions, parked until no active reader can
/// still observe them.
#[derive(Default)]
pub struct PendingFrees {
    freed_by_txid: BTreeMap<u64, Vec<u64>>,
}

impl PendingFrees {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, txid: u64, pages: Vec<u64>) {
        if !pages.is_empty() {
            self.freed_by_txid.entry(txid).or_default().extend(pages);
        }
    }

    /// Drains pages whose freeing transaction is at or before the oldest
    /// active anchor. With no active transactions everything drains.
    pub fn drain_reclaimable(&mut self, oldest_anchor: Option<u64>) -> Vec<u64> {
        let cutoff = oldest_anchor.unwrap_or(u64::MAX);

        let ready: Vec<u64> = self
            .freed_by_txid
            .range(..=cutoff)
            .map(|(txid, _)| *txid)
            .collect();

        let mut pages = Vec::new();
        for txid in ready {
            if let Some(mut freed) = self.freed_by_txid.remove(&txid) {
                pages.append(&mut freed);
            }
        }
        pages
    }

    pub fn is_empty(&self) -> bool {
        self.freed_by_txid.is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.freed_by_txid.values().map(|v| v.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizing_one_page_buffer_tracking_320_pages() {
        let bits = FreeSpaceBits::new(4096, 320, 4096).unwrap();

        assert_eq!(bits.max_number_of_pages(), 32704);
        assert_eq!(bits.modification_bits_all(), 1);
        assert_eq!(bits.modification_bits_in_use(), 1);
        assert_eq!(bits.bytes_taken_by_modification_bits(), 4);
    }

    #[test]
    fn sizing_two_page_buffer_tracking_40000_pages() {
        let bits = FreeSpaceBits::new(8192, 40_000, 4096).unwrap();

        assert_eq!(bits.max_number_of_pages(), 65_472);
        assert_eq!(bits.modification_bits_all(), 2);
        assert_eq!(bits.modification_bits_in_use(), 2);
        assert_eq!(bits.bytes_taken_by_modification_bits(), 4);
    }

    #[test]
    fn sizing_ten_page_buffer_tracking_90000_pages() {
        let bits = FreeSpaceBits::new(40_960, 90_000, 4096).unwrap();

        assert_eq!(bits.max_number_of_pages(), 327_616);
        assert_eq!(bits.modification_bits_all(), 10);
        assert_eq!(bits.modification_bits_in_use(), 3);
        assert_eq!(bits.bytes_taken_by_modification_bits(), 4);
    }

    #[test]
    fn copy_dirty_pages_single_chunk_copies_in_use_bytes() {
        let mut source = FreeSpaceBits::new(4096, 20, 4096).unwrap();
        let mut dest = FreeSpaceBits::new(4096, 20, 4096).unwrap();

        source.mark_page(10, true).unwrap();

        let copied = source.copy_dirty_pages_to(&mut dest);

        assert_eq!(copied, 3);
        assert!(dest.is_free(10));
    }

    #[test]
    fn copy_dirty_pages_two_chunks() {
        let mut source = FreeSpaceBits::new(8192, 60_000, 4096).unwrap();
        let mut dest = FreeSpaceBits::new(8192, 60_000, 4096).unwrap();

        source.mark_page(10, true).unwrap();
        source.mark_page(40_000, true).unwrap();

        let copied = source.copy_dirty_pages_to(&mut dest);

        assert_eq!(copied, 4096 + 3404);
        assert!(dest.is_free(10));
        assert!(dest.is_free(40_000));
    }

    #[test]
    fn copy_clears_modification_bits() {
        let mut source = FreeSpaceBits::new(4096, 100, 4096).unwrap();
        let mut dest = FreeSpaceBits::new(4096, 100, 4096).unwrap();
        source.mark_page(3, true).unwrap();

        source.copy_dirty_pages_to(&mut dest);

        assert!(source.modified_chunks().is_empty());
        assert_eq!(source.copy_dirty_pages_to(&mut dest), 0);
    }

    #[test]
    fn mark_and_read_bits() {
        let mut bits = FreeSpaceBits::new(4096, 64, 4096).unwrap();

        assert!(!bits.is_free(7));
        bits.mark_page(7, true).unwrap();
        assert!(bits.is_free(7));
        bits.mark_page(7, false).unwrap();
        assert!(!bits.is_free(7));
    }

    #[test]
    fn mark_beyond_tracked_range_is_rejected() {
        let mut bits = FreeSpaceBits::new(4096, 10, 4096).unwrap();

        assert!(bits.mark_page(10, true).is_err());
    }

    #[test]
    fn try_allocate_finds_contiguous_run() {
        let mut bits = FreeSpaceBits::new(4096, 64, 4096).unwrap();
        for p in [3, 4, 5, 8, 9] {
            bits.mark_page(p, true).unwrap();
        }

        let start = bits.try_allocate(3);

        assert_eq!(start, Some(3));
        assert!(!bits.is_free(3));
        assert!(!bits.is_free(4));
        assert!(!bits.is_free(5));
        assert!(bits.is_free(8));
    }

    #[test]
    fn try_allocate_returns_none_without_a_run() {
        let mut bits = FreeSpaceBits::new(4096, 64, 4096).unwrap();
        bits.mark_page(1, true).unwrap();
        bits.mark_page(3, true).unwrap();

        assert_eq!(bits.try_allocate(2), None);
        assert!(bits.is_free(1));
        assert!(bits.is_free(3));
    }

    #[test]
    fn try_allocate_skips_runs_crossing_byte_boundaries() {
        let mut bits = FreeSpaceBits::new(4096, 64, 4096).unwrap();
        for p in 6..12 {
            bits.mark_page(p, true).unwrap();
        }

        assert_eq!(bits.try_allocate(6), Some(6));
    }

    #[test]
    fn free_page_count_counts_set_bits() {
        let mut bits = FreeSpaceBits::new(4096, 1000, 4096).unwrap();
        for p in [0, 100, 999] {
            bits.mark_page(p, true).unwrap();
        }

        assert_eq!(bits.free_page_count(), 3);
    }

    #[test]
    fn freespace_pair_allocation_round_trip() {
        let mut fs = FreeSpace::create(2, 1).unwrap();

        assert_eq!(fs.try_allocate(1), None);

        fs.free_page(500).unwrap();
        fs.free_page(501).unwrap();

        assert_eq!(fs.try_allocate(2), Some(500));
        assert_eq!(fs.try_allocate(1), None);
    }

    #[test]
    fn freespace_publish_syncs_the_other_buffer() {
        let mut fs = FreeSpace::create(2, 1).unwrap();
        fs.free_page(42).unwrap();

        assert_eq!(fs.free_page_count(), 0);

        fs.publish();

        assert_eq!(fs.free_page_count(), 1);

        // The next writer's back buffer must already agree.
        assert_eq!(fs.try_allocate(1), Some(42));
    }

    #[test]
    fn freespace_revert_discards_back_buffer_changes() {
        let mut fs = FreeSpace::create(2, 1).unwrap();
        fs.free_page(7).unwrap();
        fs.publish();

        let reclaimed = fs.try_allocate(1);
        assert_eq!(reclaimed, Some(7));
        fs.revert();

        // The allocation was rolled back; page 7 is free again.
        assert_eq!(fs.try_allocate(1), Some(7));
    }

    #[test]
    fn freespace_dirty_file_pages_target_back_region() {
        let mut fs = FreeSpace::create(2, 1).unwrap();
        fs.free_page(9).unwrap();

        let dirty = fs.dirty_file_pages();

        assert_eq!(dirty.len(), 1);
        // current = buffer 0, so the back buffer region starts at page 3.
        assert_eq!(dirty[0].0, 3);
        assert_eq!(dirty[0].1.len(), FREE_SPACE_PAGE_PAYLOAD);
    }

    #[test]
    fn pending_frees_honor_the_oldest_anchor() {
        let mut pending = PendingFrees::new();
        pending.record(5, vec![10, 11]);
        pending.record(8, vec![20]);

        assert_eq!(pending.drain_reclaimable(Some(4)), Vec::<u64>::new());
        assert_eq!(pending.drain_reclaimable(Some(5)), vec![10, 11]);
        assert_eq!(pending.drain_reclaimable(None), vec![20]);
        assert!(pending.is_empty());
    }
}
