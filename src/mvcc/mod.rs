//! # Multi-Version Concurrency Control (MVCC)
//!
//! This module holds the version model and the visibility rules of the
//! concurrency core. Row versions live in an in-place-update engine: the
//! newest content of a row sits in its slot, older content lives in the
//! slot's undo history, and an update that cannot be done in place leaves the
//! old version behind with a link to the new one.
//!
//! ```text
//!    Slot (0,3)                                Slot (0,7)
//!   +---------------------------+            +---------------------------+
//!   | xmin: 12  xmax: 15        |  next ---> | xmin: 15  xmax: 0         |
//!   | payload: "Alice", 29      |            | payload: "Alice", 30      |
//!   +---------------------------+            +---------------------------+
//!              |                                        |
//!         undo history                             undo history
//!   +---------------------------+                  (empty)
//!   | xmin: 9   xmax: 12        |
//!   | payload: "Alice", 28      |    in-place update by 12 replaced
//!   +---------------------------+    this content inside slot (0,3)
//! ```
//!
//! ## Transaction Lifecycle
//!
//! ```text
//! begin_txn() ──> Active ──> commit() ──> Committed
//!                   │
//!                   └──> rollback() / drop ──> Aborted
//! ```
//!
//! Savepoints open a sub-transaction whose writes carry its `SubTxnId`.
//! Rolling back to the savepoint aborts those writes while the parent keeps
//! running.
//!
//! ## Visibility Regimes
//!
//! - `Snapshot::sees_version`: MVCC snapshot of a reader
//! - `satisfies_dirty`: sees in-flight writers and names them
//! - `classify`: five-way answer against the oldest-xmin horizon
//!
//! ## Key Structures
//!
//! - `TxnId`, `SubTxnId`, `CommandId`: identifier types
//! - `TxnContext`: the caller's own transaction, passed explicitly
//! - `TxnOracle`: status queries and waits, implemented by the host
//! - `TransactionTable`: in-memory `TxnOracle` with blocking waits
//! - `RowVersion` / `VersionPointer`: one physical version and its address
//! - `ConcurrencyError`: typed failures recoverable through `downcast_ref`

pub mod error;
pub mod row_version;
pub mod snapshot;
pub mod transaction;
pub mod visibility;

pub use error::{concurrency_error, ConcurrencyError};
pub use row_version::{flags, RowVersion, VersionPointer};
pub use snapshot::{DirtyView, InProgressTxn, Snapshot};
pub use transaction::{
    CommandId, SubTxnId, Transaction, TransactionTable, TxnContext, TxnId, TxnOracle, TxnState,
};
pub use visibility::{check_consistency, classify, satisfies_dirty, VisibilityClass};
