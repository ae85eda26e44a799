//! # Storage Module
//!
//! This module provides the foundational storage layer for Vellum: a single
//! memory-mapped data file addressed as an array of fixed-size pages, the
//! double-buffered file header that anchors every crash-consistent state, and
//! the free-space bit map that tracks reusable pages.
//!
//! ## File Layout
//!
//! A Vellum environment is a directory holding one data file plus the
//! write-ahead journal files:
//!
//! ```text
//! environment_dir/
//! ├── data.vellum                  # The paged data file
//! ├── 0000000000000000001.journal  # Journal files, monotonically numbered
//! └── 0000000000000000002.journal
//! ```
//!
//! Inside the data file:
//!
//! ```text
//! Page 0, Page 1      Alternating FileHeader copies
//! Pages 2 .. 2+B      Free-space buffer A
//! Pages 2+B .. 2+2B   Free-space buffer B
//! Pages 2+2B ..       Data pages
//! ```
//!
//! At open, the header copy with the larger transaction id (and valid
//! magic/version) wins. B is the number of pages reserved for one free-space
//! buffer, fixed at environment creation.
//!
//! ## Durability Model
//!
//! The data file is never written by a committing transaction. Commits go to
//! the journal; a background application pass later copies committed pages
//! into the data file, fsyncs, and only then rewrites one of the two header
//! pages. The header write is the linearization point: a crash before it
//! leaves the prior header current.
//!
//! ## Safety Model
//!
//! Memory-mapped regions become invalid when the file is grown and remapped.
//! The pager's `grow` takes `&mut self`, so the borrow checker guarantees no
//! page view survives a remap. Cross-thread readers never hold mmap views;
//! they copy pages out under a short read lock (see the transaction layer).
//!
//! ## Module Organization
//!
//! - `pager`: memory-mapped data file access (`Pager`)
//! - `headers`: zerocopy file/transaction header structs
//! - `freespace`: free-space bit arrays with incremental dirty tracking

mod freespace;
mod headers;
mod pager;

pub use freespace::{
    FreeSpace, FreeSpaceBits, PendingFrees, FREE_SPACE_CHUNK, FREE_SPACE_PAGE_PAYLOAD,
};
pub use headers::{
    FileHeader, FreeSpaceState, JournalInfo, TransactionHeader, TreeHeader, FILE_HEADER_SIZE,
    HEADER_MAGIC, JOURNAL_TX_MAGIC, TRANSACTION_HEADER_SIZE, TX_COMMIT, TX_SPLIT, TX_START,
    VELLUM_VERSION,
};
pub use pager::Pager;

use eyre::{ensure, Result};
use zerocopy::{FromBytes, Immutable, KnownLayout};

pub const PAGE_SIZE: usize = 4096;
pub const PAGE_HEADER_SIZE: usize = 16;
pub const PAGE_USABLE_SIZE: usize = PAGE_SIZE - PAGE_HEADER_SIZE;

/// First page past the two header pages. The free-space buffers start here;
/// data pages follow them.
pub const FIRST_FREE_SPACE_PAGE: u32 = 2;

/// Parses a zerocopy struct from a byte slice with size validation.
#[inline]
pub fn parse_zerocopy<'a, T: FromBytes + KnownLayout + Immutable>(
    bytes: &'a [u8],
    type_name: &str,
) -> Result<&'a T> {
    let size = std::mem::size_of::<T>();
    ensure!(
        bytes.len() >= size,
        "buffer too small for {}: {} < {}",
        type_name,
        bytes.len(),
        size
    );
    T::ref_from_bytes(&bytes[..size])
        .map_err(|e| eyre::eyre!("failed to parse {}: {:?}", type_name, e))
}

/// Parses a mutable zerocopy struct from a byte slice with size validation.
#[inline]
pub fn parse_zerocopy_mut<'a, T: FromBytes + KnownLayout + zerocopy::IntoBytes>(
    bytes: &'a mut [u8],
    type_name: &str,
) -> Result<&'a mut T> {
    let size = std::mem::size_of::<T>();
    ensure!(
        bytes.len() >= size,
        "buffer too small for {}: {} < {}",
        type_name,
        bytes.len(),
        size
    );
    T::mut_from_bytes(&mut bytes[..size])
        .map_err(|e| eyre::eyre!("failed to parse {}: {:?}", type_name, e))
}
