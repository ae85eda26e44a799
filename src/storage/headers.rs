//! # Header Definitions
//!
//! Type-safe, zerocopy-based header structs for the data file and the
//! write-ahead journal.
//!
//! ## FileHeader Layout (148 bytes, little-endian, packed)
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  ---------------------------------------------
//! 0       8     magic_marker
//! 8       4     version
//! 12      40    journal_info (recent, count, data_flush_counter,
//!               last_synced, last_synced_page; all i64, -1 = none)
//! 52      8     transaction_id
//! 60      8     last_page_number
//! 68      40    free_space state
//! 108     40    root tree header
//! ```
//!
//! Two copies live at pages 0 and 1 of the data file; the journal applier
//! alternates between them using its data-flush counter. At open, the copy
//! with the greater transaction id (and valid magic/version) is current.
//!
//! ## TransactionHeader Layout (136 bytes at the start of a journal page)
//!
//! The first page of every transaction chunk in a journal file is its
//! transaction header: marker, txid, next/last page counters, page counts,
//! CRC32 of the chunk's page images, marker bitset {Start, Split, Commit},
//! the root tree state and the free-space state (each in its own slot), and
//! the header's own page number within the journal file.
//!
//! ## Zerocopy Safety
//!
//! All header structs use zerocopy traits for safe, zero-copy serialization:
//! `FromBytes` (safe to read from arbitrary bytes), `IntoBytes` (safe to
//! write as bytes), `Immutable`, `KnownLayout`, `Unaligned` (works with
//! unaligned mmap offsets). Multi-byte fields use the `U32`/`U64`/`I64`
//! little-endian wrapper types.

use eyre::{ensure, Result};
use zerocopy::little_endian::{I64, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

pub const HEADER_MAGIC: &[u8; 8] = b"vellumdb";
pub const JOURNAL_TX_MAGIC: &[u8; 8] = b"vellumtx";
pub const VELLUM_VERSION: u32 = 1;

pub const FILE_HEADER_SIZE: usize = 148;
pub const TRANSACTION_HEADER_SIZE: usize = 136;

/// Transaction marker bits stored in `TransactionHeader::tx_flags`.
pub const TX_START: u32 = 1;
pub const TX_SPLIT: u32 = 2;
pub const TX_COMMIT: u32 = 4;

/// Persistent state of one B+ tree: its root page and bookkeeping counters.
/// Stored in the file header (root tree), in transaction headers, and as the
/// payload of multi-value tree references inside leaf nodes.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct TreeHeader {
    root_page: U64,
    depth: U32,
    flags: U32,
    page_count: U64,
    entry_count: U64,
    overflow_pages: U64,
}

const _: () = assert!(std::mem::size_of::<TreeHeader>() == 40);

impl TreeHeader {
    pub fn empty() -> Self {
        Self {
            root_page: U64::new(0),
            depth: U32::new(0),
            flags: U32::new(0),
            page_count: U64::new(0),
            entry_count: U64::new(0),
            overflow_pages: U64::new(0),
        }
    }

    pub fn new(
        root_page: u64,
        depth: u32,
        page_count: u64,
        entry_count: u64,
        overflow_pages: u64,
    ) -> Self {
        Self {
            root_page: U64::new(root_page),
            depth: U32::new(depth),
            flags: U32::new(0),
            page_count: U64::new(page_count),
            entry_count: U64::new(entry_count),
            overflow_pages: U64::new(overflow_pages),
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<&Self> {
        super::parse_zerocopy(bytes, "TreeHeader")
    }

    pub fn root_page(&self) -> u64 {
        self.root_page.get()
    }

    pub fn depth(&self) -> u32 {
        self.depth.get()
    }

    pub fn page_count(&self) -> u64 {
        self.page_count.get()
    }

    pub fn entry_count(&self) -> u64 {
        self.entry_count.get()
    }

    pub fn overflow_pages(&self) -> u64 {
        self.overflow_pages.get()
    }
}

/// Location and publication state of the two free-space buffers.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct FreeSpaceState {
    first_page: U32,
    buffer_pages: U32,
    current_buffer: U32,
    _pad: U32,
    tracked_pages: U64,
    free_page_count: U64,
    _reserved: U64,
}

const _: () = assert!(std::mem::size_of::<FreeSpaceState>() == 40);

impl FreeSpaceState {
    pub fn new(
        first_page: u32,
        buffer_pages: u32,
        current_buffer: u32,
        tracked_pages: u64,
        free_page_count: u64,
    ) -> Self {
        Self {
            first_page: U32::new(first_page),
            buffer_pages: U32::new(buffer_pages),
            current_buffer: U32::new(current_buffer),
            _pad: U32::new(0),
            tracked_pages: U64::new(tracked_pages),
            free_page_count: U64::new(free_page_count),
            _reserved: U64::new(0),
        }
    }

    pub fn first_page(&self) -> u32 {
        self.first_page.get()
    }

    pub fn buffer_pages(&self) -> u32 {
        self.buffer_pages.get()
    }

    pub fn current_buffer(&self) -> u32 {
        self.current_buffer.get()
    }

    pub fn tracked_pages(&self) -> u64 {
        self.tracked_pages.get()
    }

    pub fn free_page_count(&self) -> u64 {
        self.free_page_count.get()
    }
}

/// Journal bookkeeping block inside the file header. All fields are i64 with
/// -1 meaning "none yet".
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct JournalInfo {
    recent_journal: I64,
    journal_count: I64,
    data_flush_counter: I64,
    last_synced_journal: I64,
    last_synced_journal_page: I64,
}

const _: () = assert!(std::mem::size_of::<JournalInfo>() == 40);

impl JournalInfo {
    pub fn none() -> Self {
        Self {
            recent_journal: I64::new(-1),
            journal_count: I64::new(0),
            data_flush_counter: I64::new(0),
            last_synced_journal: I64::new(-1),
            last_synced_journal_page: I64::new(-1),
        }
    }

    pub fn new(
        recent_journal: i64,
        journal_count: i64,
        data_flush_counter: i64,
        last_synced_journal: i64,
        last_synced_journal_page: i64,
    ) -> Self {
        Self {
            recent_journal: I64::new(recent_journal),
            journal_count: I64::new(journal_count),
            data_flush_counter: I64::new(data_flush_counter),
            last_synced_journal: I64::new(last_synced_journal),
            last_synced_journal_page: I64::new(last_synced_journal_page),
        }
    }

    pub fn recent_journal(&self) -> i64 {
        self.recent_journal.get()
    }

    pub fn journal_count(&self) -> i64 {
        self.journal_count.get()
    }

    pub fn data_flush_counter(&self) -> i64 {
        self.data_flush_counter.get()
    }

    pub fn last_synced_journal(&self) -> i64 {
        self.last_synced_journal.get()
    }

    pub fn last_synced_journal_page(&self) -> i64 {
        self.last_synced_journal_page.get()
    }
}

/// The data-file header. Two copies live at pages 0 and 1.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct FileHeader {
    magic: [u8; 8],
    version: U32,
    journal_info: JournalInfo,
    transaction_id: U64,
    last_page_number: U64,
    free_space: FreeSpaceState,
    root: TreeHeader,
}

const _: () = assert!(std::mem::size_of::<FileHeader>() == FILE_HEADER_SIZE);

impl FileHeader {
    pub fn new(
        transaction_id: u64,
        last_page_number: u64,
        journal_info: JournalInfo,
        free_space: FreeSpaceState,
        root: TreeHeader,
    ) -> Self {
        Self {
            magic: *HEADER_MAGIC,
            version: U32::new(VELLUM_VERSION),
            journal_info,
            transaction_id: U64::new(transaction_id),
            last_page_number: U64::new(last_page_number),
            free_space,
            root,
        }
    }

    /// Parses and validates a header copy. Magic or version mismatch is an
    /// invalid-format error, fatal to the open attempt.
    pub fn from_bytes(bytes: &[u8]) -> Result<&Self> {
        let header: &Self = super::parse_zerocopy(bytes, "FileHeader")?;

        ensure!(
            &header.magic == HEADER_MAGIC,
            "invalid magic bytes in data file header"
        );
        ensure!(
            header.version.get() == VELLUM_VERSION,
            "unsupported data file version: {} (expected {})",
            header.version.get(),
            VELLUM_VERSION
        );

        Ok(header)
    }

    /// Picks the current header from the two candidate pages: the valid copy
    /// with the greater transaction id wins. Fails if neither validates.
    pub fn choose_current(page0: &[u8], page1: &[u8]) -> Result<Self> {
        let first = Self::from_bytes(page0);
        let second = Self::from_bytes(page1);

        match (first, second) {
            (Ok(a), Ok(b)) => {
                if a.transaction_id() >= b.transaction_id() {
                    Ok(*a)
                } else {
                    Ok(*b)
                }
            }
            (Ok(a), Err(_)) => Ok(*a),
            (Err(_), Ok(b)) => Ok(*b),
            (Err(e), Err(_)) => Err(e.wrap_err("neither file header copy is valid")),
        }
    }

    pub fn transaction_id(&self) -> u64 {
        self.transaction_id.get()
    }

    pub fn last_page_number(&self) -> u64 {
        self.last_page_number.get()
    }

    pub fn journal_info(&self) -> &JournalInfo {
        &self.journal_info
    }

    pub fn free_space(&self) -> &FreeSpaceState {
        &self.free_space
    }

    pub fn root(&self) -> &TreeHeader {
        &self.root
    }
}

/// Commit record written as the first page of each transaction chunk in a
/// journal file.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct TransactionHeader {
    marker: [u8; 8],
    txid: U64,
    next_page_number: U64,
    last_page_number: U64,
    page_count: U32,
    overflow_page_count: U32,
    crc: U32,
    tx_flags: U32,
    root: TreeHeader,
    free_space: FreeSpaceState,
    page_number_in_journal: U64,
}

const _: () = assert!(std::mem::size_of::<TransactionHeader>() == TRANSACTION_HEADER_SIZE);

impl TransactionHeader {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        txid: u64,
        next_page_number: u64,
        last_page_number: u64,
        page_count: u32,
        overflow_page_count: u32,
        crc: u32,
        tx_flags: u32,
        root: TreeHeader,
        free_space: FreeSpaceState,
        page_number_in_journal: u64,
    ) -> Self {
        Self {
            marker: *JOURNAL_TX_MAGIC,
            txid: U64::new(txid),
            next_page_number: U64::new(next_page_number),
            last_page_number: U64::new(last_page_number),
            page_count: U32::new(page_count),
            overflow_page_count: U32::new(overflow_page_count),
            crc: U32::new(crc),
            tx_flags: U32::new(tx_flags),
            root,
            free_space,
            page_number_in_journal: U64::new(page_number_in_journal),
        }
    }

    /// Parses a candidate header without validating the marker; recovery
    /// checks the marker itself to distinguish "end of valid data".
    pub fn from_bytes(bytes: &[u8]) -> Result<&Self> {
        super::parse_zerocopy(bytes, "TransactionHeader")
    }

    pub fn marker_valid(&self) -> bool {
        &self.marker == JOURNAL_TX_MAGIC
    }

    pub fn txid(&self) -> u64 {
        self.txid.get()
    }

    pub fn next_page_number(&self) -> u64 {
        self.next_page_number.get()
    }

    pub fn last_page_number(&self) -> u64 {
        self.last_page_number.get()
    }

    pub fn page_count(&self) -> u32 {
        self.page_count.get()
    }

    pub fn overflow_page_count(&self) -> u32 {
        self.overflow_page_count.get()
    }

    pub fn total_pages(&self) -> u64 {
        self.page_count.get() as u64 + self.overflow_page_count.get() as u64
    }

    pub fn crc(&self) -> u32 {
        self.crc.get()
    }

    pub fn tx_flags(&self) -> u32 {
        self.tx_flags.get()
    }

    pub fn is_start(&self) -> bool {
        self.tx_flags.get() & TX_START != 0
    }

    pub fn is_split(&self) -> bool {
        self.tx_flags.get() & TX_SPLIT != 0
    }

    pub fn is_commit(&self) -> bool {
        self.tx_flags.get() & TX_COMMIT != 0
    }

    pub fn root(&self) -> &TreeHeader {
        &self.root
    }

    pub fn free_space(&self) -> &FreeSpaceState {
        &self.free_space
    }

    pub fn page_number_in_journal(&self) -> u64 {
        self.page_number_in_journal.get()
    }
}
