//! # Row Locker
//!
//! `RowLocker::lock` acquires a logical lock on a row. The engine primitive
//! (`VersionStore::try_lock`) does the actual locking of one version; this
//! module decides what to do when that version turns out to be superseded.
//!
//! ## Protocol
//!
//! ```text
//! try_lock(pointer, snapshot)
//!     │
//!     ├── not UpdatedElsewhere, or find_latest off ──> return as is
//!     │
//!     └── UpdatedElsewhere
//!            │ link to itself and not in place ──> Deleted
//!            v
//!        ┌─> advance(next, prior_xmax) under a dirty observation
//!        │      CrossPartition          ──> SerializationFailure error
//!        │      Recycled / Deleted      ──> Deleted
//!        │      running writer          ──> wait per policy, re-fetch
//!        │      own write, cmin >= cid  ──> SelfModified
//!        │      superseded (committed   ──> delete: Deleted
//!        │        or own)                   update: follow next
//!        │      otherwise
//!        │         try_lock(target, no snapshot check)
//!        │            Acquired          ──> Acquired, traversed
//!        └─────────── UpdatedElsewhere
//!                     anything else     ──> returned with its detail
//! ```
//!
//! ## Termination
//!
//! Every iteration either returns, moves to a strictly later link of the
//! chain, or re-fetches the same link after the blocking transaction has
//! finished. Seeing the same running (xid, subxid) at the same pointer after
//! having waited for it can only come from an inconsistent engine and is
//! reported as `ConcurrencyError::Inconsistent` instead of spinning.
//!
//! ## Latest-Version Evaluation
//!
//! `eval_latest` asks for the latest version to be locked with the snapshot
//! check skipped, as a caller does when re-evaluating a row it already found
//! updated. The result is marked `traversed` up front; outside the chain-walk
//! loop that flag is only a hint.

use super::chain::{ChainStep, ChainWalker};
use super::wait::{WaitCoordinator, WaitDecision, WaitPolicy};
use super::{FailureDetail, LockMode, LockOutcome, LockResult};
use crate::mvcc::{ConcurrencyError, InProgressTxn, Snapshot, TxnContext, TxnId, VersionPointer};
use crate::storage::VersionStore;
use eyre::{bail, Result};
use tracing::debug;

#[derive(Debug, Clone, Default)]
pub struct LockRequest {
    snapshot: Option<Snapshot>,
    mode: LockMode,
    policy: WaitPolicy,
    find_latest: bool,
    eval_latest: bool,
}

impl LockRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(mut self, snapshot: Snapshot) -> Self {
        self.snapshot = Some(snapshot);
        self
    }

    pub fn mode(mut self, mode: LockMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn policy(mut self, policy: WaitPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Follow the update chain to the newest version when the addressed one
    /// was superseded.
    pub fn find_latest(mut self, on: bool) -> Self {
        self.find_latest = on;
        self
    }

    pub fn eval_latest(mut self, on: bool) -> Self {
        self.eval_latest = on;
        self
    }

    pub fn lock_mode(&self) -> LockMode {
        self.mode
    }

    pub fn wait_policy(&self) -> WaitPolicy {
        self.policy
    }
}

pub struct RowLocker<'a> {
    store: &'a dyn VersionStore,
}

impl<'a> RowLocker<'a> {
    pub fn new(store: &'a dyn VersionStore) -> Self {
        Self { store }
    }

    pub fn lock(&self, pointer: VersionPointer, request: &LockRequest, ctx: &TxnContext) -> Result<LockResult> {
        let snapshot = if request.eval_latest {
            None
        } else {
            request.snapshot.as_ref()
        };
        let result = self
            .store
            .try_lock(pointer, ctx, request.mode, request.policy, snapshot)?
            .traversed(request.eval_latest);

        if result.outcome != LockOutcome::UpdatedElsewhere || !request.find_latest {
            return Ok(result);
        }
        self.follow_chain(result.detail, request, ctx)
    }

    fn follow_chain(&self, mut detail: FailureDetail, request: &LockRequest, ctx: &TxnContext) -> Result<LockResult> {
        let walker = ChainWalker::new(self.store, *ctx);
        let waits = WaitCoordinator::new(self.store.oracle(), ctx.xid()).with_relation(self.store.relation_name());

        loop {
            if detail.next == detail.pointer && !detail.in_place_updated {
                debug!(pointer = %detail.pointer, xmax = detail.xmax, "row was deleted");
                return Ok(LockResult::failed(LockOutcome::Deleted, detail));
            }

            let target = match self.walk_to_lockable(detail.next, detail.xmax, request.policy, ctx, &walker, &waits)? {
                Walked::Target(target) => target,
                Walked::Finished(result) => return Ok(result.traversed(true)),
            };

            let result = self
                .store
                .try_lock(target, ctx, request.mode, request.policy, None)?
                .traversed(true);
            match result.outcome {
                LockOutcome::UpdatedElsewhere => {
                    debug!(pointer = %target, "locked version was superseded again");
                    detail = result.detail;
                }
                _ => return Ok(result),
            }
        }
    }

    /// Walks forward from `pointer` to the first version that is neither
    /// superseded nor being written by a running transaction.
    fn walk_to_lockable(
        &self,
        mut pointer: VersionPointer,
        mut prior_xmax: TxnId,
        policy: WaitPolicy,
        ctx: &TxnContext,
        walker: &ChainWalker<'_>,
        waits: &WaitCoordinator<'_>,
    ) -> Result<Walked> {
        let mut waited: Option<(InProgressTxn, VersionPointer)> = None;

        loop {
            let view = match walker.advance(pointer, prior_xmax)? {
                ChainStep::CrossPartition => {
                    bail!(ConcurrencyError::SerializationFailure { pointer })
                }
                ChainStep::Recycled | ChainStep::Deleted => {
                    let detail = FailureDetail::superseded(pointer, pointer, prior_xmax);
                    return Ok(Walked::Finished(LockResult::failed(LockOutcome::Deleted, detail)));
                }
                ChainStep::Found(view) => view,
            };
            let version = &view.version;

            if view.visible {
                if let Some(blocker) = view.blocker() {
                    if waited == Some((blocker, pointer)) {
                        bail!(ConcurrencyError::inconsistent(
                            pointer,
                            format!("transaction {} still running after waiting for it", blocker.xid)
                        ));
                    }
                    match waits.wait(blocker.xid, blocker.subxid, policy)? {
                        WaitDecision::Retry | WaitDecision::Proceed => {
                            waited = Some((blocker, pointer));
                            continue;
                        }
                        WaitDecision::GiveUp => {
                            let detail = FailureDetail::superseded(pointer, version.next, blocker.xid);
                            return Ok(Walked::Finished(LockResult::failed(
                                LockOutcome::WouldBlock,
                                detail,
                            )));
                        }
                    }
                }

                if ctx.is_current(version.xmin) && version.cmin >= ctx.cid() {
                    let detail = FailureDetail {
                        xmax: prior_xmax,
                        cmax: Some(version.cmin),
                        ..FailureDetail::at(pointer)
                    };
                    return Ok(Walked::Finished(LockResult::failed(
                        LockOutcome::SelfModified,
                        detail,
                    )));
                }
                return Ok(Walked::Target(pointer));
            }

            if !version.is_superseded() || version.is_chain_tip() {
                let detail = FailureDetail::superseded(pointer, version.next, version.xmax);
                return Ok(Walked::Finished(LockResult::failed(LockOutcome::Deleted, detail)));
            }

            debug!(from = %pointer, to = %version.next, xmax = version.xmax, "advancing along update chain");
            prior_xmax = version.xmax;
            pointer = version.next;
            waited = None;
        }
    }
}

enum Walked {
    Target(VersionPointer),
    Finished(LockResult),
}
