//! # Update Chain Walking
//!
//! When a row version has been superseded, its `next` link says where the
//! superseding version lives. A pointer handed out earlier stays addressable
//! but the slot behind it may have been pruned and reused by an unrelated row
//! in the meantime, so every step validates *continuity*: the fetched version,
//! or some older content of its slot, must have been written by the
//! transaction that superseded the previous link.
//!
//! ```text
//!   prior link          next link                   continuity
//!  ┌──────────┐        ┌───────────────────┐
//!  │ xmax: 15 │──────> │ xmin: 15  current │  ok: creator matches
//!  └──────────┘        └───────────────────┘
//!
//!  ┌──────────┐        ┌───────────────────┐
//!  │ xmax: 15 │──────> │ xmin: 21  current │  walk undo ...
//!  └──────────┘        ├───────────────────┤
//!                      │ xmin: 15  undo    │  ok: in-place update by 21
//!                      └───────────────────┘      on top of 15's write
//!
//!  ┌──────────┐        ┌───────────────────┐
//!  │ xmax: 15 │──────> │ xmin: 30  current │  no 15 anywhere: recycled
//!  └──────────┘        └───────────────────┘
//! ```
//!
//! Under a fixed dirty observation the chain only moves forward, so a failed
//! continuity check means the row is gone, never that the chain loops.

use crate::mvcc::{DirtyView, RowVersion, TxnContext, TxnId, VersionPointer};
use crate::storage::VersionStore;
use eyre::Result;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainStep {
    Found(DirtyView),
    /// The slot now holds a row unrelated to the chain.
    Recycled,
    Deleted,
    /// The row moved into another partition; its new location is unknown.
    CrossPartition,
}

pub struct ChainWalker<'a> {
    store: &'a dyn VersionStore,
    ctx: TxnContext,
}

impl<'a> ChainWalker<'a> {
    pub fn new(store: &'a dyn VersionStore, ctx: TxnContext) -> Self {
        Self { store, ctx }
    }

    pub fn advance(&self, pointer: VersionPointer, prior_xmax: TxnId) -> Result<ChainStep> {
        if pointer.indicates_moved_partitions() {
            return Ok(ChainStep::CrossPartition);
        }

        let Some(view) = self.store.fetch_dirty(pointer, &self.ctx)? else {
            debug!(%pointer, prior_xmax, "chain link has no row");
            return Ok(ChainStep::Deleted);
        };

        if !self.continues_from(&view.version, prior_xmax)? {
            debug!(%pointer, prior_xmax, xmin = view.version.xmin, "chain link was recycled");
            return Ok(ChainStep::Recycled);
        }

        if view.version.is_moved_partitions() && !view.visible {
            return Ok(ChainStep::CrossPartition);
        }

        debug!(%pointer, visible = view.visible, "following chain link");
        Ok(ChainStep::Found(view))
    }

    /// Whether `version` or older content of its slot was written by
    /// `prior_xmax`.
    pub fn continues_from(&self, version: &RowVersion, prior_xmax: TxnId) -> Result<bool> {
        if version.xmin == prior_xmax {
            return Ok(true);
        }
        let mut current = version.clone();
        while let Some(prior) = self.store.prior_version(&current)? {
            if prior.xmin == prior_xmax {
                return Ok(true);
            }
            if prior == current {
                break;
            }
            current = prior;
        }
        Ok(false)
    }
}
