//! # rowcc - Row-Level Concurrency Core
//!
//! rowcc is the row-level concurrency layer of a table engine that updates
//! rows in place and keeps older content in undo. It decides:
//!
//! - **Row locking**: lock a logical row, following the update chain to the
//!   newest version when the addressed one was superseded
//! - **Waiting**: block on, skip, or fail against the transaction in the way
//! - **Visibility classification**: whether a version is dead, live, recently
//!   dead, or being written by a running transaction
//! - **Bulk scans**: which versions an index build, an index validation or
//!   a sample takes
//!
//! ## Quick Start
//!
//! ```
//! use std::sync::Arc;
//! use rowcc::lock::{LockOutcome, LockRequest, RowLocker};
//! use rowcc::mvcc::TransactionTable;
//! use rowcc::storage::MemHeap;
//!
//! # fn main() -> eyre::Result<()> {
//! let table = Arc::new(TransactionTable::new());
//! let heap = MemHeap::new("accounts", table.clone());
//!
//! let writer = table.begin_txn()?;
//! let row = heap.insert(&writer.context(), "balance=10")?;
//! writer.commit();
//!
//! let locker = table.begin_txn()?;
//! let request = LockRequest::new().snapshot(locker.snapshot()).find_latest(true);
//! let result = RowLocker::new(&heap).lock(row, &request, &locker.context())?;
//! assert_eq!(result.outcome, LockOutcome::Acquired);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │   scan: IndexBuild / IndexValidate / Analyze │
//! ├──────────────────────┬──────────────────────┤
//! │ lock: RowLocker      │ mvcc: classify,      │
//! │   ChainWalker        │   satisfies_dirty,   │
//! │   WaitCoordinator    │   Snapshot           │
//! ├──────────────────────┴──────────────────────┤
//! │   storage: VersionStore (engine capability)  │
//! │            MemHeap (in-memory reference)     │
//! ├─────────────────────────────────────────────┤
//! │   mvcc: TransactionTable (TxnOracle)         │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! The core never owns pages, undo records or buffers. Everything it needs
//! from the engine goes through [`storage::VersionStore`], and everything it
//! needs to know about transactions goes through [`mvcc::TxnOracle`].
//!
//! ## Errors
//!
//! All fallible operations return `eyre::Result`. Conditions a caller may
//! want to react to (serialization failure, lock not available, cancellation,
//! inconsistent state) are raised as [`mvcc::ConcurrencyError`] and can be
//! recovered with [`mvcc::concurrency_error`].
//!
//! ## Module Overview
//!
//! - [`config`]: Reserved ids, slot limits and wait timing
//! - [`mvcc`]: Transaction ids, row versions, snapshots, visibility rules
//! - [`lock`]: Row locker, chain walker, wait coordinator
//! - [`storage`]: Engine capability trait and the in-memory heap
//! - [`scan`]: Index build, index validation, statistics and table sampling drivers

pub mod config;
pub mod lock;
pub mod mvcc;
pub mod scan;
pub mod storage;

pub use lock::{LockMode, LockOutcome, LockRequest, LockResult, RowLocker, WaitPolicy};
pub use mvcc::{ConcurrencyError, RowVersion, Snapshot, TransactionTable, TxnContext, VersionPointer, VisibilityClass};
pub use scan::ScanOptions;
pub use storage::{MemHeap, VersionStore};
