//! # Transaction Identifiers, Context and Status Table
//!
//! This module provides the transaction primitives the concurrency core
//! queries. The core never reaches for process-wide "current transaction"
//! state: every operation receives an explicit [`TxnContext`] and a
//! [`TxnOracle`] that answers status questions and performs waits.
//!
//! ## Transaction Identifiers
//!
//! Transaction IDs (`TxnId`) are 64-bit monotonically increasing integers
//! allocated from a global atomic counter.
//!
//! Special values:
//! - `TxnId = 0`: Invalid. An invalid xmax marks the tip of a chain.
//! - `TxnId = 1`: Frozen. Always committed, older than every snapshot.
//!
//! Sub-transactions (savepoints) are numbered per top-level transaction
//! starting at 1. `SubTxnId = 0` means "top level" and is exposed as `None`.
//!
//! ## Transaction States
//!
//! ```text
//! ┌─────────┐     commit()     ┌───────────┐
//! │ Active  │ ───────────────> │ Committed │
//! └─────────┘                  └───────────┘
//!      │
//!      │ rollback()
//!      v
//! ┌─────────┐
//! │ Aborted │
//! └─────────┘
//! ```
//!
//! Sub-transactions follow the same diagram. A committed sub-transaction is
//! only as committed as its parent: its effects become visible when the
//! top-level transaction commits.
//!
//! ## Horizon Slots
//!
//! The `TransactionTable` keeps a fixed-size slot array like a watermark
//! tracker. Each slot holds the *xmin horizon* of an active transaction: the
//! oldest transaction id that was still running when it began (or its own id
//! if none was). The minimum over all slots is the oldest-xmin horizon used by
//! maintenance scans: any version superseded by a committed transaction older
//! than that horizon is invisible to every possible snapshot.
//!
//! ## Waiting
//!
//! `wait_for` blocks on a condition variable that is notified whenever a
//! transaction or sub-transaction finishes. Waits are bounded by a timeout so
//! the caller can poll for cancellation between waits.

use crate::config::{
    FIRST_COMMAND_ID, FIRST_NORMAL_TXN_ID, FROZEN_TXN_ID, INVALID_SUB_TXN_ID, INVALID_TXN_ID,
    MAX_CONCURRENT_TXNS,
};
use crate::mvcc::error::ConcurrencyError;
use crate::mvcc::snapshot::Snapshot;
use eyre::{bail, Result};
use hashbrown::{HashMap, HashSet};
use parking_lot::{Condvar, Mutex};
use smallvec::SmallVec;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

pub type TxnId = u64;
pub type SubTxnId = u32;
pub type CommandId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TxnState {
    #[default]
    Active,
    Committed,
    Aborted,
}

impl TxnState {
    pub fn is_finished(self) -> bool {
        !matches!(self, TxnState::Active)
    }
}

pub fn txn_id_is_normal(xid: TxnId) -> bool {
    xid >= FIRST_NORMAL_TXN_ID
}

pub fn txn_id_is_valid(xid: TxnId) -> bool {
    xid != INVALID_TXN_ID
}

/// Maps the stored sub-transaction number to the API form.
pub fn sub_txn(subxid: SubTxnId) -> Option<SubTxnId> {
    (subxid != INVALID_SUB_TXN_ID).then_some(subxid)
}

/// The caller's own transaction, threaded explicitly through every call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxnContext {
    xid: TxnId,
    subxid: Option<SubTxnId>,
    cid: CommandId,
}

impl TxnContext {
    pub fn new(xid: TxnId, cid: CommandId) -> Self {
        Self {
            xid,
            subxid: None,
            cid,
        }
    }

    pub fn with_subxid(mut self, subxid: Option<SubTxnId>) -> Self {
        self.subxid = subxid;
        self
    }

    pub fn with_cid(mut self, cid: CommandId) -> Self {
        self.cid = cid;
        self
    }

    pub fn xid(&self) -> TxnId {
        self.xid
    }

    pub fn subxid(&self) -> Option<SubTxnId> {
        self.subxid
    }

    pub fn cid(&self) -> CommandId {
        self.cid
    }

    pub fn is_current(&self, xid: TxnId) -> bool {
        txn_id_is_valid(xid) && xid == self.xid
    }
}

/// Query interface onto the transaction lifecycle owned by the host engine.
pub trait TxnOracle: Send + Sync {
    fn status(&self, xid: TxnId) -> TxnState;

    /// Status of a sub-transaction. Once the parent has finished the
    /// sub-transaction reports the parent's final state unless it aborted
    /// on its own.
    fn sub_status(&self, xid: TxnId, subxid: SubTxnId) -> TxnState;

    /// Waits up to `timeout` for `xid` (or only `subxid` of it) to finish.
    /// A zero timeout is a non-blocking probe. Returns whether it finished.
    fn wait_for(&self, xid: TxnId, subxid: Option<SubTxnId>, timeout: Duration) -> bool;

    /// Fails if the waiting transaction has been asked to cancel.
    fn check_interrupts(&self, waiter: TxnId) -> Result<()>;

    /// Status of the write made by `xid` inside `subxid`: a write made in an
    /// aborted sub-transaction is aborted even while its parent runs.
    fn write_status(&self, xid: TxnId, subxid: Option<SubTxnId>) -> TxnState {
        if let Some(sub) = subxid {
            if self.sub_status(xid, sub) == TxnState::Aborted {
                return TxnState::Aborted;
            }
        }
        self.status(xid)
    }

    fn is_finished(&self, xid: TxnId, subxid: Option<SubTxnId>) -> bool {
        match subxid {
            Some(sub) => self.sub_status(xid, sub).is_finished(),
            None => self.status(xid).is_finished(),
        }
    }
}

#[derive(Debug)]
struct TxnEntry {
    state: TxnState,
    slot_idx: Option<usize>,
    next_subxid: SubTxnId,
    subs: HashMap<SubTxnId, TxnState>,
}

#[derive(Debug, Default)]
struct TxnStates {
    /// Status log of every transaction handed out.
    entries: HashMap<TxnId, TxnEntry>,
    /// Ids still active, ordered so the oldest is first.
    running: BTreeSet<TxnId>,
    cancel_requested: HashSet<TxnId>,
}

pub struct TransactionTable {
    pub(crate) global_ts: AtomicU64,
    pub(crate) active_slots: [AtomicU64; MAX_CONCURRENT_TXNS],
    states: Mutex<TxnStates>,
    finished: Condvar,
}

impl TransactionTable {
    #[allow(clippy::declare_interior_mutable_const)]
    pub fn new() -> Self {
        const INIT: AtomicU64 = AtomicU64::new(0);
        Self {
            global_ts: AtomicU64::new(FIRST_NORMAL_TXN_ID),
            #[allow(clippy::borrow_interior_mutable_const)]
            active_slots: [INIT; MAX_CONCURRENT_TXNS],
            states: Mutex::new(TxnStates::default()),
            finished: Condvar::new(),
        }
    }

    pub fn begin_txn(&self) -> Result<Transaction<'_>> {
        let mut states = self.states.lock();
        let xid = self.global_ts.fetch_add(1, Ordering::SeqCst);
        let horizon = states.running.first().copied().unwrap_or(xid).min(xid);

        let Some(slot_idx) = self
            .active_slots
            .iter()
            .position(|slot| slot.load(Ordering::Relaxed) == 0)
        else {
            bail!(
                "too many concurrent transactions (max {})",
                MAX_CONCURRENT_TXNS
            )
        };
        self.active_slots[slot_idx].store(horizon, Ordering::SeqCst);

        states.running.insert(xid);
        states.entries.insert(
            xid,
            TxnEntry {
                state: TxnState::Active,
                slot_idx: Some(slot_idx),
                next_subxid: INVALID_SUB_TXN_ID + 1,
                subs: HashMap::new(),
            },
        );
        Ok(Transaction::new(self, xid))
    }

    fn finish_txn(&self, xid: TxnId, state: TxnState) {
        let mut states = self.states.lock();
        if let Some(entry) = states.entries.get_mut(&xid) {
            if entry.state.is_finished() {
                return;
            }
            entry.state = state;
            for sub in entry.subs.values_mut() {
                if *sub != TxnState::Aborted {
                    *sub = state;
                }
            }
            if let Some(idx) = entry.slot_idx.take() {
                self.active_slots[idx].store(0, Ordering::SeqCst);
            }
        }
        states.running.remove(&xid);
        states.cancel_requested.remove(&xid);
        drop(states);
        self.finished.notify_all();
    }

    fn begin_sub(&self, xid: TxnId) -> Result<SubTxnId> {
        let mut states = self.states.lock();
        let Some(entry) = states.entries.get_mut(&xid) else {
            bail!("transaction {} is unknown", xid)
        };
        if entry.state != TxnState::Active {
            bail!("transaction {} is no longer active", xid);
        }
        let subxid = entry.next_subxid;
        entry.next_subxid += 1;
        entry.subs.insert(subxid, TxnState::Active);
        Ok(subxid)
    }

    fn finish_sub(&self, xid: TxnId, subxid: SubTxnId, state: TxnState) {
        let mut states = self.states.lock();
        if let Some(entry) = states.entries.get_mut(&xid) {
            entry.subs.insert(subxid, state);
        }
        drop(states);
        self.finished.notify_all();
    }

    /// Asks a running transaction to stop waiting; its next interrupt check
    /// fails with [`ConcurrencyError::Cancelled`].
    pub fn request_cancel(&self, xid: TxnId) {
        self.states.lock().cancel_requested.insert(xid);
        self.finished.notify_all();
    }

    /// Oldest transaction id any active snapshot could still need.
    pub fn oldest_xmin(&self) -> TxnId {
        let mut min_ts = self.global_ts.load(Ordering::Relaxed);
        for slot in &self.active_slots {
            let ts = slot.load(Ordering::Relaxed);
            if ts != 0 && ts < min_ts {
                min_ts = ts;
            }
        }
        min_ts
    }

    /// Takes an MVCC snapshot for `ctx` at the current instant.
    pub fn snapshot(&self, ctx: &TxnContext) -> Snapshot {
        let states = self.states.lock();
        let xmax = self.global_ts.load(Ordering::SeqCst);
        let running: SmallVec<[TxnId; 16]> = states
            .running
            .iter()
            .copied()
            .filter(|id| *id != ctx.xid())
            .collect();
        let xmin = running.first().copied().unwrap_or(xmax).min(xmax);
        Snapshot::new(xmin, xmax, running, ctx.xid(), ctx.cid())
    }
}

impl Default for TransactionTable {
    fn default() -> Self {
        Self::new()
    }
}

impl TxnOracle for TransactionTable {
    fn status(&self, xid: TxnId) -> TxnState {
        if !txn_id_is_normal(xid) {
            return unknown_txn_status(xid);
        }
        self.states
            .lock()
            .entries
            .get(&xid)
            .map(|e| e.state)
            .unwrap_or_else(|| unknown_txn_status(xid))
    }

    fn sub_status(&self, xid: TxnId, subxid: SubTxnId) -> TxnState {
        let states = self.states.lock();
        match states.entries.get(&xid) {
            Some(entry) => entry.subs.get(&subxid).copied().unwrap_or(entry.state),
            None => unknown_txn_status(xid),
        }
    }

    fn wait_for(&self, xid: TxnId, subxid: Option<SubTxnId>, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut states = self.states.lock();
        loop {
            let finished = match states.entries.get(&xid) {
                None => true,
                Some(entry) => match subxid {
                    Some(sub) => entry
                        .subs
                        .get(&sub)
                        .copied()
                        .unwrap_or(entry.state)
                        .is_finished(),
                    None => entry.state.is_finished(),
                },
            };
            if finished {
                return true;
            }
            if timeout.is_zero() {
                return false;
            }
            if self.finished.wait_until(&mut states, deadline).timed_out() {
                return false;
            }
        }
    }

    fn check_interrupts(&self, waiter: TxnId) -> Result<()> {
        if self.states.lock().cancel_requested.contains(&waiter) {
            bail!(ConcurrencyError::Cancelled { xid: waiter });
        }
        Ok(())
    }
}

/// Ids the table never handed out: frozen data is committed, the rest never ran.
fn unknown_txn_status(xid: TxnId) -> TxnState {
    if xid == FROZEN_TXN_ID {
        TxnState::Committed
    } else {
        TxnState::Aborted
    }
}

/// A running transaction of a [`TransactionTable`]. Dropping it without
/// committing rolls it back.
pub struct Transaction<'a> {
    id: TxnId,
    cid: CommandId,
    subxid: Option<SubTxnId>,
    state: TxnState,
    table: &'a TransactionTable,
    finished: bool,
}

impl<'a> Transaction<'a> {
    fn new(table: &'a TransactionTable, id: TxnId) -> Self {
        Self {
            id,
            cid: FIRST_COMMAND_ID,
            subxid: None,
            state: TxnState::Active,
            table,
            finished: false,
        }
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn cid(&self) -> CommandId {
        self.cid
    }

    pub fn state(&self) -> TxnState {
        self.state
    }

    pub fn subxid(&self) -> Option<SubTxnId> {
        self.subxid
    }

    pub fn context(&self) -> TxnContext {
        TxnContext::new(self.id, self.cid).with_subxid(self.subxid)
    }

    /// Makes the effects of earlier commands visible to later ones.
    pub fn advance_command(&mut self) -> CommandId {
        self.cid += 1;
        self.cid
    }

    pub fn snapshot(&self) -> Snapshot {
        self.table.snapshot(&self.context())
    }

    pub fn savepoint(&mut self) -> Result<SubTxnId> {
        if self.subxid.is_some() {
            bail!("nested savepoints are not supported");
        }
        let subxid = self.table.begin_sub(self.id)?;
        self.subxid = Some(subxid);
        Ok(subxid)
    }

    pub fn release_savepoint(&mut self) -> Result<()> {
        let Some(subxid) = self.subxid.take() else {
            bail!("no savepoint to release")
        };
        self.table.finish_sub(self.id, subxid, TxnState::Active);
        Ok(())
    }

    pub fn rollback_to_savepoint(&mut self) -> Result<()> {
        let Some(subxid) = self.subxid.take() else {
            bail!("no savepoint to roll back to")
        };
        self.table.finish_sub(self.id, subxid, TxnState::Aborted);
        Ok(())
    }

    pub fn commit(mut self) -> TxnId {
        self.state = TxnState::Committed;
        self.finished = true;
        self.table.finish_txn(self.id, TxnState::Committed);
        self.id
    }

    pub fn rollback(mut self) {
        self.state = TxnState::Aborted;
        self.finished = true;
        self.table.finish_txn(self.id, TxnState::Aborted);
    }
}

impl<'a> Drop for Transaction<'a> {
    fn drop(&mut self) {
        if !self.finished {
            self.table.finish_txn(self.id, TxnState::Aborted);
        }
    }
}
