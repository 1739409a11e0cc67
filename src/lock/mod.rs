//! # Row Locking
//!
//! This module implements the row lock protocol of an in-place-update engine:
//! lock a logical row for update or delete, and when the addressed version
//! has been superseded, follow the update chain to the newest version and lock
//! that instead.
//!
//! ## Components
//!
//! ```text
//!                ┌──────────────┐
//!                │  RowLocker   │  lock(pointer, request, ctx)
//!                └──────┬───────┘
//!          ┌────────────┼───────────────┐
//!          v            v               v
//!   ┌─────────────┐ ┌──────────┐ ┌────────────────┐
//!   │ ChainWalker │ │ try_lock │ │ WaitCoordinator│
//!   │  (dirty     │ │ (engine  │ │ Block / Skip / │
//!   │   fetch)    │ │ primitive│ │ Error          │
//!   └─────────────┘ └──────────┘ └────────────────┘
//! ```
//!
//! ## Outcomes
//!
//! Exactly one `LockOutcome` is returned per call. Only `Acquired` carries a
//! locked version; every other outcome comes with a `FailureDetail` naming
//! the last version examined and who superseded it. `Deleted`, `WouldBlock`
//! and friends are values for the caller to act on, not errors. Errors are
//! reserved for serialization failures, lock-not-available under
//! ErrorOnConflict, cancellation and inconsistent state.
//!
//! ## Lock Modes
//!
//! | held \ requested | KeyShare | Share | NoKeyUpdate | Update |
//! |------------------|----------|-------|-------------|--------|
//! | KeyShare         |          |       |             |   X    |
//! | Share            |          |       |      X      |   X    |
//! | NoKeyUpdate      |          |   X   |      X      |   X    |
//! | Update           |    X     |   X   |      X      |   X    |
//!
//! The protocol itself treats the mode as an opaque token handed to the
//! engine primitive.

pub mod chain;
pub mod row_lock;
pub mod wait;

pub use chain::{ChainStep, ChainWalker};
pub use row_lock::{LockRequest, RowLocker};
pub use wait::{WaitCoordinator, WaitDecision, WaitPolicy};

use crate::config::INVALID_TXN_ID;
use crate::mvcc::{CommandId, RowVersion, TxnId, VersionPointer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockMode {
    KeyShare,
    Share,
    NoKeyUpdate,
    #[default]
    Update,
}

impl LockMode {
    pub fn conflicts_with(self, other: LockMode) -> bool {
        use LockMode::*;
        matches!(
            (self, other),
            (KeyShare, Update)
                | (Share, NoKeyUpdate)
                | (Share, Update)
                | (NoKeyUpdate, Share)
                | (NoKeyUpdate, NoKeyUpdate)
                | (NoKeyUpdate, Update)
                | (Update, _)
        )
    }

    /// Whether `self` is at least as strong as `other`.
    pub fn covers(self, other: LockMode) -> bool {
        self as u8 >= other as u8
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    Acquired,
    Invisible,
    SelfModified,
    UpdatedElsewhere,
    Deleted,
    WouldBlock,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureDetail {
    /// Last version examined.
    pub pointer: VersionPointer,
    /// Its superseded-by link; equals `pointer` after a delete or an
    /// in-place update.
    pub next: VersionPointer,
    /// Superseding (or blocking) transaction.
    pub xmax: TxnId,
    /// Superseding command id, only reported with `SelfModified`.
    pub cmax: Option<CommandId>,
    /// The search crossed into a later link of the chain.
    pub traversed: bool,
    pub in_place_updated: bool,
}

impl FailureDetail {
    pub fn at(pointer: VersionPointer) -> Self {
        Self {
            pointer,
            next: pointer,
            xmax: INVALID_TXN_ID,
            cmax: None,
            traversed: false,
            in_place_updated: false,
        }
    }

    pub fn superseded(pointer: VersionPointer, next: VersionPointer, xmax: TxnId) -> Self {
        Self {
            next,
            xmax,
            ..Self::at(pointer)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockResult {
    pub outcome: LockOutcome,
    pub detail: FailureDetail,
    pub version: Option<RowVersion>,
}

impl LockResult {
    pub fn acquired(version: RowVersion) -> Self {
        Self {
            outcome: LockOutcome::Acquired,
            detail: FailureDetail::at(version.pointer),
            version: Some(version),
        }
    }

    pub fn failed(outcome: LockOutcome, detail: FailureDetail) -> Self {
        Self {
            outcome,
            detail,
            version: None,
        }
    }

    pub fn is_acquired(&self) -> bool {
        self.outcome == LockOutcome::Acquired
    }

    pub(crate) fn traversed(mut self, traversed: bool) -> Self {
        self.detail.traversed = traversed;
        self
    }
}
