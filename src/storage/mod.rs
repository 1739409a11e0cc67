//! # Storage Capability Interface
//!
//! The concurrency core does not own the page layout, the undo mechanism or
//! buffer management. It talks to the engine through the `VersionStore`
//! trait: a handful of capabilities over row versions addressed by
//! `VersionPointer`.
//!
//! ## Capabilities
//!
//! ```text
//! fetch_dirty(ptr, ctx)        current version under a dirty observation
//! fetch_visible(ptr, snapshot) version of the row visible to a snapshot
//! prior_version(v)             older content of the same slot (undo)
//! try_lock(ptr, ...)           engine row-lock primitive
//! read_slot(ptr)               raw slot state for physical-order scans
//! page_count / max_slot        physical extent
//! oracle()                     transaction status and XactWait
//! ```
//!
//! ## Slot States
//!
//! A slot is either unused (never filled or reclaimed), pruned (its row was
//! deleted and removed, but the slot is still referenced by indexes), or holds
//! the current version of a row. Unused slots may be reused by unrelated rows,
//! which is why chain walking validates continuity instead of trusting a
//! pointer.
//!
//! ## Thread Safety
//!
//! Implementations are `Send + Sync` and are shared by concurrent lockers and
//! scanners. Engine-internal locks must never be held while a caller waits on
//! another transaction.
//!
//! ## Module Organization
//!
//! - `heap`: `MemHeap`, the in-memory reference engine

mod heap;

pub use heap::{MemHeap, VacuumStats};

use crate::lock::{LockMode, LockResult, WaitPolicy};
use crate::mvcc::{
    classify, DirtyView, RowVersion, Snapshot, TxnContext, TxnId, TxnOracle, VersionPointer, VisibilityClass,
};
use eyre::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotState {
    Unused,
    Pruned,
    Occupied(RowVersion),
}

pub trait VersionStore: Send + Sync {
    fn relation_name(&self) -> &str;

    fn oracle(&self) -> &dyn TxnOracle;

    /// Current version at `pointer` under a dirty observation; `None` if the
    /// slot holds no row.
    fn fetch_dirty(&self, pointer: VersionPointer, ctx: &TxnContext) -> Result<Option<DirtyView>>;

    /// The version of the row at `pointer` visible to `snapshot`, searching
    /// the slot's undo history.
    fn fetch_visible(&self, pointer: VersionPointer, snapshot: &Snapshot) -> Result<Option<RowVersion>>;

    /// Older content of the slot `version` lives in, if still retained.
    fn prior_version(&self, version: &RowVersion) -> Result<Option<RowVersion>>;

    /// Engine row-lock primitive. With `snapshot == None` the snapshot check
    /// is skipped and the latest version is locked.
    fn try_lock(
        &self,
        pointer: VersionPointer,
        ctx: &TxnContext,
        mode: LockMode,
        policy: WaitPolicy,
        snapshot: Option<&Snapshot>,
    ) -> Result<LockResult>;

    fn read_slot(&self, pointer: VersionPointer) -> Result<SlotState>;

    fn page_count(&self) -> u32;

    /// Number of slots on `page`; slot numbers run from 0 below it.
    fn max_slot(&self, page: u32) -> u16;

    /// Visits every slot in physical order.
    fn scan_slots(&self, visitor: &mut dyn FnMut(VersionPointer, SlotState) -> Result<()>) -> Result<()> {
        for page in 0..self.page_count() {
            for slot in 0..self.max_slot(page) {
                let pointer = VersionPointer::new(page, slot);
                let state = self.read_slot(pointer)?;
                visitor(pointer, state)?;
            }
        }
        Ok(())
    }
}

/// Whether `pointer` addresses a slot that exists in `store`.
pub fn pointer_is_valid(store: &dyn VersionStore, pointer: VersionPointer) -> bool {
    !pointer.indicates_moved_partitions()
        && pointer.page < store.page_count()
        && pointer.slot < store.max_slot(pointer.page)
}

/// What an index-driven fetch found at a pointer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RowFetch {
    /// The version visible to the snapshot, if any.
    pub version: Option<RowVersion>,
    /// No version of the row can be visible to any transaction at the
    /// horizon, so index entries pointing here may be killed.
    pub all_dead: bool,
}

/// Fetches the version of the row at `pointer` visible to `snapshot`.
///
/// When nothing is visible, `oldest_xmin` decides whether the row is gone for
/// everyone: an empty or pruned slot always is, a row only when its current
/// version classifies as dead. Pointers outside the relation find nothing and
/// report no hint.
pub fn fetch_row_version(
    store: &dyn VersionStore,
    pointer: VersionPointer,
    snapshot: &Snapshot,
    oldest_xmin: TxnId,
) -> Result<RowFetch> {
    if !pointer_is_valid(store, pointer) {
        return Ok(RowFetch::default());
    }
    if let Some(version) = store.fetch_visible(pointer, snapshot)? {
        return Ok(RowFetch {
            version: Some(version),
            all_dead: false,
        });
    }
    let all_dead = match store.read_slot(pointer)? {
        SlotState::Unused | SlotState::Pruned => true,
        SlotState::Occupied(current) => classify(&current, oldest_xmin, store.oracle())? == VisibilityClass::Dead,
    };
    Ok(RowFetch {
        version: None,
        all_dead,
    })
}

/// Whether `version` as handed out earlier is still visible to `snapshot`.
pub fn version_satisfies_snapshot(store: &dyn VersionStore, version: &RowVersion, snapshot: &Snapshot) -> bool {
    snapshot.sees_version(version, store.oracle())
}
