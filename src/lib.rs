//! # Vellum - Embedded Copy-on-Write Key-Value Storage
//!
//! Vellum is an embedded, single-file key-value storage engine: a
//! copy-on-write B+ tree over 4 KiB pages, with multi-reader /
//! single-writer ACID transactions, snapshot isolation for readers, and
//! durability through a write-ahead journal.
//!
//! ## Quick Start
//!
//! ```ignore
//! use vellum::{Environment, TransactionKind};
//!
//! let env = Environment::create("./mydb")?;
//!
//! let mut txn = env.new_transaction(TransactionKind::ReadWrite)?;
//! let books = env.create_tree(&mut txn, "books")?;
//! books.add(&mut txn, b"moby-dick", b"melville")?;
//! txn.commit()?;
//!
//! let txn = env.new_transaction(TransactionKind::Read)?;
//! let books = env.get_tree(&txn, "books")?.unwrap();
//! assert_eq!(books.get(&txn, b"moby-dick")?, Some(b"melville".to_vec()));
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────┐
//! │       Environment (façade)           │
//! ├──────────────────────────────────────┤
//! │  Transactions │ Trees & Cursors      │
//! ├───────────────┼──────────────────────┤
//! │ Write-Ahead Journal │ Free-Space Map │
//! ├──────────────────────────────────────┤
//! │        Pager (mmap data file)        │
//! └──────────────────────────────────────┘
//! ```
//!
//! Writes copy pages instead of mutating them: a transaction owns fresh
//! copies of every page it touches, commits them to the journal under a
//! checksummed transaction header, and publishes the new tree roots
//! atomically. Readers keep resolving pages through the journal snapshot
//! they captured at begin, so a long scan is never perturbed by concurrent
//! writers. A background application pass folds committed journal pages
//! into the data file and flips the double-buffered file header.
//!
//! ## Crash Safety
//!
//! The journal is fsynced before a commit returns; the data file and its
//! header are only advanced afterwards, and the header write is the
//! linearization point. Recovery replays the journal's valid prefix:
//! headers are sequence-checked and every transaction's pages are
//! re-checksummed, so a torn tail is indistinguishable from "never
//! committed".
//!
//! ## Module Overview
//!
//! - [`storage`]: pager, file headers, free-space bit maps
//! - [`tree`]: the copy-on-write B+ tree, cursors, multi-value sub-trees
//! - [`txn`]: transaction lifecycle and page ownership
//! - `journal`: write-ahead journal, recovery, application
//! - [`env`]: the environment façade

pub mod env;
pub(crate) mod journal;
pub mod storage;
pub mod tree;
pub mod txn;

pub use env::{Environment, EnvironmentStats, Options, Snapshot};
pub use tree::{MultiIter, Tree, TreeIter, TreeStats, Upsert};
pub use txn::{Transaction, TransactionKind};
