//! # In-Memory Reference Heap
//!
//! `MemHeap` is a small in-place-update table engine that implements
//! `VersionStore`. It exists so the locking protocol and the scan drivers can
//! be exercised against real concurrent writers without a page format.
//!
//! ## Layout
//!
//! ```text
//! pages: RwLock<Vec<Vec<Slot>>>
//!
//!   page 0                     page 1
//!   ┌───────┬───────┬──────┐   ┌───────┬──────┐
//!   │ Row   │Pruned │Unused│   │ Row   │ ...  │
//!   └───┬───┴───────┴──────┘   └───────┴──────┘
//!       │
//!       ├── current: RowVersion        newest content
//!       ├── undo: Vec<RowVersion>      older content, newest last
//!       └── lockers: SmallVec<Locker>  row locks held until txn end
//! ```
//!
//! ## Writes
//!
//! - `update` replaces the content in place and pushes the old content onto
//!   the slot's undo history, stamped with the updater as xmax.
//! - `update_to_new_slot` writes the new content elsewhere and links the old
//!   version to it.
//! - `delete` and `move_to_other_partition` stamp xmax on the current content.
//!
//! Writes never wait: they fail if the row is superseded or locked by another
//! running transaction. Waiting is the job of `try_lock`.
//!
//! ## Rollback
//!
//! Aborted writes are undone lazily, the first time the slot is touched after
//! the abort: an aborted in-place update is replaced by its undo predecessor,
//! an aborted xmax is cleared, finished lockers are dropped.
//!
//! ## Locking Discipline
//!
//! The page lock is only held for the duration of one slot operation. The
//! row-lock primitive releases it before waiting on another transaction and
//! re-reads the slot afterwards.

use super::{SlotState, VersionStore};
use crate::config::MAX_SLOTS_PER_PAGE;
use crate::lock::{
    FailureDetail, LockMode, LockOutcome, LockResult, WaitCoordinator, WaitDecision, WaitPolicy,
};
use crate::mvcc::{
    check_consistency, classify, flags, satisfies_dirty, CommandId, ConcurrencyError, DirtyView,
    RowVersion, Snapshot, SubTxnId, TxnContext, TxnId, TxnOracle, TxnState, VersionPointer,
    VisibilityClass,
};
use eyre::{bail, Result};
use parking_lot::RwLock;
use smallvec::SmallVec;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy)]
struct Locker {
    xid: TxnId,
    subxid: Option<SubTxnId>,
    cid: CommandId,
    mode: LockMode,
}

#[derive(Debug, Clone)]
struct RowSlot {
    current: RowVersion,
    undo: Vec<RowVersion>,
    lockers: SmallVec<[Locker; 4]>,
}

impl RowSlot {
    fn new(current: RowVersion) -> Self {
        Self {
            current,
            undo: Vec::new(),
            lockers: SmallVec::new(),
        }
    }

    /// Fails unless `ctx` may supersede the current content.
    fn check_writable(&self, ctx: &TxnContext) -> Result<()> {
        let v = &self.current;
        if v.is_superseded() {
            bail!(
                "row {} was already updated or deleted by transaction {}",
                v.pointer,
                v.xmax
            );
        }
        if let Some(locker) = self.lockers.iter().find(|l| !ctx.is_current(l.xid)) {
            bail!("row {} is locked by transaction {}", v.pointer, locker.xid);
        }
        Ok(())
    }

    fn supersede(&mut self, ctx: &TxnContext, next: VersionPointer, flag: u8) {
        let v = &mut self.current;
        v.set_flag(flags::LOCK_ONLY, false);
        v.set_xmax(ctx.xid(), ctx.subxid(), ctx.cid());
        v.next = next;
        v.set_flag(flag, true);
    }
}

#[derive(Debug, Clone)]
enum Slot {
    Unused,
    Pruned,
    Row(RowSlot),
}

enum LockStep {
    Done(LockResult),
    Blocked { xid: TxnId, subxid: Option<SubTxnId> },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VacuumStats {
    /// Dead rows whose slot now only remembers that a row was there.
    pub pruned: usize,
    /// Slots of aborted inserts returned to the free pool.
    pub freed: usize,
    pub undo_discarded: usize,
}

pub struct MemHeap {
    name: String,
    oracle: Arc<dyn TxnOracle>,
    slots_per_page: u16,
    pages: RwLock<Vec<Vec<Slot>>>,
    dirty_fetches: AtomicU64,
}

impl MemHeap {
    pub fn new(name: impl Into<String>, oracle: Arc<dyn TxnOracle>) -> Self {
        Self {
            name: name.into(),
            oracle,
            slots_per_page: MAX_SLOTS_PER_PAGE,
            pages: RwLock::new(Vec::new()),
            dirty_fetches: AtomicU64::new(0),
        }
    }

    pub fn with_slots_per_page(mut self, slots: u16) -> Self {
        self.slots_per_page = slots.clamp(1, MAX_SLOTS_PER_PAGE);
        self
    }

    /// Number of dirty fetches served so far.
    pub fn dirty_fetches(&self) -> u64 {
        self.dirty_fetches.load(Ordering::Relaxed)
    }

    pub fn insert(&self, ctx: &TxnContext, payload: impl Into<Vec<u8>>) -> Result<VersionPointer> {
        let mut pages = self.pages.write();
        let pointer = allocate(&mut pages, self.slots_per_page)?;
        let version = RowVersion::new(pointer, ctx.xid(), ctx.cid(), payload.into())
            .with_xmin_subxid(ctx.subxid());
        pages[pointer.page as usize][pointer.slot as usize] = Slot::Row(RowSlot::new(version));
        trace!(relation = %self.name, %pointer, xid = ctx.xid(), "inserted row");
        Ok(pointer)
    }

    /// Replaces the row's content in place, keeping the old content in undo.
    pub fn update(&self, ctx: &TxnContext, pointer: VersionPointer, payload: impl Into<Vec<u8>>) -> Result<()> {
        let payload = payload.into();
        self.write_row(pointer, |row| {
            row.check_writable(ctx)?;
            let mut prior = row.current.clone();
            prior.set_flag(flags::LOCK_ONLY, false);
            prior.set_xmax(ctx.xid(), ctx.subxid(), ctx.cid());
            let mut next = RowVersion::new(pointer, ctx.xid(), ctx.cid(), payload)
                .with_xmin_subxid(ctx.subxid())
                .with_flags(flags::IN_PLACE_UPDATED);
            next.undo_seq = prior.undo_seq + 1;
            row.undo.push(prior);
            row.current = next;
            Ok(())
        })
    }

    /// Writes the new content to another slot and links the old version to it.
    pub fn update_to_new_slot(
        &self,
        ctx: &TxnContext,
        pointer: VersionPointer,
        payload: impl Into<Vec<u8>>,
    ) -> Result<VersionPointer> {
        let mut pages = self.pages.write();
        match slot_mut(&mut pages, self.oracle.as_ref(), pointer) {
            Some(Slot::Row(row)) => row.check_writable(ctx)?,
            _ => bail!("no row at {} in relation \"{}\"", pointer, self.name),
        }

        let new_pointer = allocate(&mut pages, self.slots_per_page)?;
        let version = RowVersion::new(new_pointer, ctx.xid(), ctx.cid(), payload.into())
            .with_xmin_subxid(ctx.subxid());
        pages[new_pointer.page as usize][new_pointer.slot as usize] = Slot::Row(RowSlot::new(version));

        if let Slot::Row(row) = &mut pages[pointer.page as usize][pointer.slot as usize] {
            row.supersede(ctx, new_pointer, 0);
        }
        Ok(new_pointer)
    }

    pub fn delete(&self, ctx: &TxnContext, pointer: VersionPointer) -> Result<()> {
        self.write_row(pointer, |row| {
            row.check_writable(ctx)?;
            row.supersede(ctx, pointer, flags::DELETED);
            Ok(())
        })
    }

    /// Supersedes the row by a move into another partition of the table.
    pub fn move_to_other_partition(&self, ctx: &TxnContext, pointer: VersionPointer) -> Result<()> {
        self.write_row(pointer, |row| {
            row.check_writable(ctx)?;
            row.supersede(ctx, VersionPointer::MOVED_PARTITIONS, flags::MOVED_PARTITIONS);
            Ok(())
        })
    }

    /// Prunes rows dead to every snapshot at `oldest_xmin` and discards undo
    /// content no snapshot can need anymore.
    pub fn vacuum(&self, oldest_xmin: TxnId) -> Result<VacuumStats> {
        let oracle = self.oracle.as_ref();
        let mut stats = VacuumStats::default();
        let mut pages = self.pages.write();
        for slot in pages.iter_mut().flat_map(|page| page.iter_mut()) {
            resolve_slot(oracle, slot);
            let Slot::Row(row) = &mut *slot else { continue };

            let before = row.undo.len();
            row.undo.retain(|v| {
                !(v.xmax < oldest_xmin && oracle.write_status(v.xmax, v.xmax_sub()) == TxnState::Committed)
            });
            stats.undo_discarded += before - row.undo.len();

            if classify(&row.current, oldest_xmin, oracle)? == VisibilityClass::Dead {
                if row.current.is_superseded() {
                    *slot = Slot::Pruned;
                    stats.pruned += 1;
                } else {
                    *slot = Slot::Unused;
                    stats.freed += 1;
                }
            }
        }
        debug!(relation = %self.name, oldest_xmin, ?stats, "vacuumed relation");
        Ok(stats)
    }

    /// Returns pruned slots to the free pool once nothing references them.
    pub fn reclaim_pruned(&self) -> usize {
        let mut pages = self.pages.write();
        let mut reclaimed = 0;
        for slot in pages.iter_mut().flat_map(|page| page.iter_mut()) {
            if matches!(slot, Slot::Pruned) {
                *slot = Slot::Unused;
                reclaimed += 1;
            }
        }
        reclaimed
    }

    fn write_row(&self, pointer: VersionPointer, f: impl FnOnce(&mut RowSlot) -> Result<()>) -> Result<()> {
        match self.with_slot(pointer, |slot| match slot {
            Slot::Row(row) => f(row),
            _ => bail!("no row at {}", pointer),
        }) {
            Some(result) => result,
            None => bail!("pointer {} out of range for relation \"{}\"", pointer, self.name),
        }
    }

    fn with_slot<R>(&self, pointer: VersionPointer, f: impl FnOnce(&mut Slot) -> R) -> Option<R> {
        let mut pages = self.pages.write();
        slot_mut(&mut pages, self.oracle.as_ref(), pointer).map(f)
    }
}

fn slot_mut<'p>(
    pages: &'p mut [Vec<Slot>],
    oracle: &dyn TxnOracle,
    pointer: VersionPointer,
) -> Option<&'p mut Slot> {
    let slot = pages
        .get_mut(pointer.page as usize)?
        .get_mut(pointer.slot as usize)?;
    resolve_slot(oracle, slot);
    Some(slot)
}

fn allocate(pages: &mut Vec<Vec<Slot>>, slots_per_page: u16) -> Result<VersionPointer> {
    for (page_no, page) in pages.iter().enumerate() {
        if let Some(slot_no) = page.iter().position(|s| matches!(s, Slot::Unused)) {
            return Ok(VersionPointer::new(page_no as u32, slot_no as u16));
        }
    }
    let page_count = pages.len();
    if let Some(last) = pages.last_mut() {
        if last.len() < slots_per_page as usize {
            last.push(Slot::Unused);
            return Ok(VersionPointer::new((page_count - 1) as u32, (last.len() - 1) as u16));
        }
    }
    if pages.len() >= u32::MAX as usize {
        bail!("relation is full");
    }
    pages.push(vec![Slot::Unused]);
    Ok(VersionPointer::new((pages.len() - 1) as u32, 0))
}

/// Applies pending rollbacks and forgets finished lockers.
fn resolve_slot(oracle: &dyn TxnOracle, slot: &mut Slot) {
    let Slot::Row(row) = slot else { return };

    while row.current.is_in_place_updated()
        && oracle.write_status(row.current.xmin, row.current.xmin_sub()) == TxnState::Aborted
    {
        let Some(mut prior) = row.undo.pop() else { break };
        prior.clear_xmax();
        row.current = prior;
    }

    if row.current.has_xmax() {
        let state = oracle.write_status(row.current.xmax, row.current.xmax_sub());
        if state == TxnState::Aborted || (row.current.is_lock_only() && state.is_finished()) {
            row.current.clear_xmax();
        }
    }

    row.lockers
        .retain(|l| oracle.write_status(l.xid, l.subxid) == TxnState::Active);
    if !row.current.has_xmax() {
        if let Some(l) = row.lockers.last() {
            row.current.set_xmax(l.xid, l.subxid, l.cid);
            row.current.set_flag(flags::LOCK_ONLY, true);
        }
    }
}

fn lock_step(
    oracle: &dyn TxnOracle,
    slot: &mut Slot,
    pointer: VersionPointer,
    ctx: &TxnContext,
    mode: LockMode,
    snapshot: Option<&Snapshot>,
) -> Result<LockStep> {
    let Slot::Row(row) = slot else {
        return Ok(LockStep::Done(LockResult::failed(
            LockOutcome::Deleted,
            FailureDetail::at(pointer),
        )));
    };
    check_consistency(&row.current)?;

    let v = &row.current;
    let in_place = v.is_in_place_updated();
    match oracle.write_status(v.xmin, v.xmin_sub()) {
        TxnState::Aborted => {
            return Ok(LockStep::Done(LockResult::failed(
                LockOutcome::Invisible,
                FailureDetail::at(pointer),
            )))
        }
        _ if ctx.is_current(v.xmin) => {
            if v.cmin >= ctx.cid() {
                let detail = FailureDetail {
                    xmax: v.xmin,
                    cmax: Some(v.cmin),
                    in_place_updated: in_place,
                    ..FailureDetail::at(pointer)
                };
                return Ok(LockStep::Done(LockResult::failed(
                    LockOutcome::SelfModified,
                    detail,
                )));
            }
        }
        TxnState::Active if in_place => {
            return Ok(LockStep::Blocked {
                xid: v.xmin,
                subxid: v.xmin_sub(),
            })
        }
        TxnState::Active => {
            return Ok(LockStep::Done(LockResult::failed(
                LockOutcome::Invisible,
                FailureDetail::at(pointer),
            )))
        }
        TxnState::Committed => {
            if in_place && snapshot.is_some_and(|snap| snap.treats_as_running(v.xmin)) {
                let detail = FailureDetail {
                    in_place_updated: true,
                    ..FailureDetail::superseded(pointer, pointer, v.xmin)
                };
                return Ok(LockStep::Done(LockResult::failed(
                    LockOutcome::UpdatedElsewhere,
                    detail,
                )));
            }
        }
    }

    if v.is_superseded() {
        let detail = FailureDetail::superseded(pointer, v.next, v.xmax);
        if ctx.is_current(v.xmax) {
            if v.cmax >= ctx.cid() {
                return Ok(LockStep::Done(LockResult::failed(
                    LockOutcome::SelfModified,
                    FailureDetail {
                        cmax: Some(v.cmax),
                        ..detail
                    },
                )));
            }
            let outcome = if v.is_deleted() {
                LockOutcome::Deleted
            } else {
                LockOutcome::UpdatedElsewhere
            };
            return Ok(LockStep::Done(LockResult::failed(outcome, detail)));
        }
        match oracle.write_status(v.xmax, v.xmax_sub()) {
            TxnState::Active => {
                return Ok(LockStep::Blocked {
                    xid: v.xmax,
                    subxid: v.xmax_sub(),
                })
            }
            TxnState::Committed => {
                return Ok(LockStep::Done(LockResult::failed(
                    LockOutcome::UpdatedElsewhere,
                    detail,
                )))
            }
            TxnState::Aborted => {}
        }
    }

    if let Some(l) = row
        .lockers
        .iter()
        .find(|l| !ctx.is_current(l.xid) && l.mode.conflicts_with(mode))
    {
        return Ok(LockStep::Blocked {
            xid: l.xid,
            subxid: l.subxid,
        });
    }

    match row.lockers.iter_mut().find(|l| ctx.is_current(l.xid)) {
        Some(held) if held.mode.covers(mode) => {}
        Some(held) => held.mode = mode,
        None => row.lockers.push(Locker {
            xid: ctx.xid(),
            subxid: ctx.subxid(),
            cid: ctx.cid(),
            mode,
        }),
    }
    if !row.current.is_superseded() {
        row.current.set_xmax(ctx.xid(), ctx.subxid(), ctx.cid());
        row.current.set_flag(flags::LOCK_ONLY, true);
    }
    Ok(LockStep::Done(LockResult::acquired(row.current.clone())))
}

impl VersionStore for MemHeap {
    fn relation_name(&self) -> &str {
        &self.name
    }

    fn oracle(&self) -> &dyn TxnOracle {
        self.oracle.as_ref()
    }

    fn fetch_dirty(&self, pointer: VersionPointer, ctx: &TxnContext) -> Result<Option<DirtyView>> {
        self.dirty_fetches.fetch_add(1, Ordering::Relaxed);
        let oracle = self.oracle.as_ref();
        Ok(self
            .with_slot(pointer, |slot| match slot {
                Slot::Row(row) => Some(satisfies_dirty(&row.current, ctx, oracle)),
                _ => None,
            })
            .flatten())
    }

    fn fetch_visible(&self, pointer: VersionPointer, snapshot: &Snapshot) -> Result<Option<RowVersion>> {
        let oracle = self.oracle.as_ref();
        Ok(self
            .with_slot(pointer, |slot| match slot {
                Slot::Row(row) => std::iter::once(&row.current)
                    .chain(row.undo.iter().rev())
                    .find(|v| snapshot.sees_version(v, oracle))
                    .cloned(),
                _ => None,
            })
            .flatten())
    }

    fn prior_version(&self, version: &RowVersion) -> Result<Option<RowVersion>> {
        Ok(self
            .with_slot(version.pointer, |slot| match slot {
                Slot::Row(row) => {
                    // undo is ordered oldest first, so the prior content is the
                    // newest entry older than `version`
                    if version.undo_seq > row.current.undo_seq {
                        return None;
                    }
                    row.undo
                        .iter()
                        .rev()
                        .find(|v| v.undo_seq < version.undo_seq)
                        .cloned()
                }
                _ => None,
            })
            .flatten())
    }

    fn try_lock(
        &self,
        pointer: VersionPointer,
        ctx: &TxnContext,
        mode: LockMode,
        policy: WaitPolicy,
        snapshot: Option<&Snapshot>,
    ) -> Result<LockResult> {
        let oracle = self.oracle.as_ref();
        let waits = WaitCoordinator::new(oracle, ctx.xid()).with_relation(&self.name);
        let mut waited_on: Option<(TxnId, Option<SubTxnId>)> = None;

        loop {
            let step = match self.with_slot(pointer, |slot| lock_step(oracle, slot, pointer, ctx, mode, snapshot)) {
                Some(step) => step?,
                None => LockStep::Done(LockResult::failed(
                    LockOutcome::Deleted,
                    FailureDetail::at(pointer),
                )),
            };

            match step {
                LockStep::Done(result) => {
                    trace!(relation = %self.name, %pointer, outcome = ?result.outcome, "row lock attempt");
                    return Ok(result);
                }
                LockStep::Blocked { xid, subxid } => {
                    if waited_on == Some((xid, subxid)) {
                        bail!(ConcurrencyError::inconsistent(
                            pointer,
                            format!("transaction {} still blocks the row after waiting for it", xid)
                        ));
                    }
                    match waits.wait(xid, subxid, policy)? {
                        WaitDecision::Retry | WaitDecision::Proceed => waited_on = Some((xid, subxid)),
                        WaitDecision::GiveUp => {
                            let detail = FailureDetail {
                                xmax: xid,
                                ..FailureDetail::at(pointer)
                            };
                            return Ok(LockResult::failed(LockOutcome::WouldBlock, detail));
                        }
                    }
                }
            }
        }
    }

    fn read_slot(&self, pointer: VersionPointer) -> Result<SlotState> {
        match self.with_slot(pointer, |slot| match slot {
            Slot::Unused => SlotState::Unused,
            Slot::Pruned => SlotState::Pruned,
            Slot::Row(row) => SlotState::Occupied(row.current.clone()),
        }) {
            Some(state) => Ok(state),
            None => bail!("pointer {} out of range for relation \"{}\"", pointer, self.name),
        }
    }

    fn page_count(&self) -> u32 {
        self.pages.read().len() as u32
    }

    fn max_slot(&self, page: u32) -> u16 {
        self.pages
            .read()
            .get(page as usize)
            .map(|p| p.len() as u16)
            .unwrap_or(0)
    }
}
