//! # Visibility Classification
//!
//! Three regimes decide whether a row version "exists":
//!
//! 1. **Oldest-xmin horizon** ([`classify`]): used by maintenance scans that
//!    must account for every version some snapshot might still need. The
//!    answer is one of five classes rather than a boolean.
//! 2. **Dirty observation** ([`satisfies_dirty`]): sees the effects of
//!    in-flight writers and reports who they are, so the caller can wait.
//! 3. **MVCC snapshot** ([`Snapshot::sees_version`]): the reader's own view.
//!
//! ## Horizon Classes
//!
//! ```text
//!                      creator (xmin)
//!          ┌──────────────┼────────────────────┐
//!       running        aborted             committed
//!          │              │                    │
//!   xmax == xmin?       Dead          xmax (superseding)
//!     │       │                  ┌──────┬──────┼──────────┐
//!    yes      no              none/   aborted running   committed
//!     │       │             lock-only   │       │          │
//! DeleteIn  InsertIn           Live    Live  DeleteIn  xmax < oldest_xmin?
//! Progress  Progress                          Progress    │          │
//!                                                        Dead   RecentlyDead
//! ```
//!
//! A write made inside an aborted sub-transaction counts as aborted even while
//! the parent is still running.
//!
//! The classifier is pure: the same version, horizon and oracle answers always
//! yield the same class. Version metadata that a sound engine can never
//! produce is reported as [`ConcurrencyError::Inconsistent`].

use super::error::ConcurrencyError;
use super::row_version::RowVersion;
use super::snapshot::{DirtyView, InProgressTxn, Snapshot};
use super::transaction::{SubTxnId, TxnContext, TxnId, TxnOracle, TxnState};
use eyre::{bail, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisibilityClass {
    Dead,
    Live,
    RecentlyDead,
    InsertInProgress {
        xid: TxnId,
        subxid: Option<SubTxnId>,
    },
    DeleteInProgress {
        xid: TxnId,
        subxid: Option<SubTxnId>,
    },
}

impl VisibilityClass {
    /// The running transaction behind an in-progress class.
    pub fn in_progress_xid(&self) -> Option<TxnId> {
        match self {
            VisibilityClass::InsertInProgress { xid, .. }
            | VisibilityClass::DeleteInProgress { xid, .. } => Some(*xid),
            _ => None,
        }
    }
}

/// Rejects flag combinations no writer produces.
pub fn check_consistency(version: &RowVersion) -> Result<()> {
    let reason = if version.is_lock_only() && !version.has_xmax() {
        "lock-only flag without a locker"
    } else if version.is_moved_partitions() && !version.has_xmax() {
        "moved to another partition without a superseding transaction"
    } else if version.is_lock_only() && version.is_deleted() {
        "deleted flag on a lock-only xmax"
    } else if version.is_in_place_updated() && version.is_moved_partitions() {
        "in-place updated and moved to another partition"
    } else {
        return Ok(());
    };
    bail!(ConcurrencyError::inconsistent(version.pointer, reason))
}

pub fn classify(
    version: &RowVersion,
    oldest_xmin: TxnId,
    oracle: &dyn TxnOracle,
) -> Result<VisibilityClass> {
    check_consistency(version)?;

    match oracle.write_status(version.xmin, version.xmin_sub()) {
        TxnState::Aborted => Ok(VisibilityClass::Dead),
        TxnState::Active => {
            if version.is_superseded() && version.xmax == version.xmin {
                Ok(VisibilityClass::DeleteInProgress {
                    xid: version.xmin,
                    subxid: version.xmin_sub(),
                })
            } else {
                Ok(VisibilityClass::InsertInProgress {
                    xid: version.xmin,
                    subxid: version.xmin_sub(),
                })
            }
        }
        TxnState::Committed => {
            if version.is_speculative() {
                bail!(ConcurrencyError::inconsistent(
                    version.pointer,
                    "speculative insert by a committed transaction"
                ));
            }
            if !version.is_superseded() {
                return Ok(VisibilityClass::Live);
            }
            match oracle.write_status(version.xmax, version.xmax_sub()) {
                TxnState::Aborted => Ok(VisibilityClass::Live),
                TxnState::Active => Ok(VisibilityClass::DeleteInProgress {
                    xid: version.xmax,
                    subxid: version.xmax_sub(),
                }),
                TxnState::Committed if version.xmax < oldest_xmin => Ok(VisibilityClass::Dead),
                TxnState::Committed => Ok(VisibilityClass::RecentlyDead),
            }
        }
    }
}

/// Dirty visibility: present unless its creator aborted or a finished (or
/// our own) transaction superseded it. Running writers are reported.
pub fn satisfies_dirty(version: &RowVersion, ctx: &TxnContext, oracle: &dyn TxnOracle) -> DirtyView {
    let mut view = DirtyView {
        version: version.clone(),
        visible: false,
        inserter: None,
        superseder: None,
    };

    let creator = oracle.write_status(version.xmin, version.xmin_sub());
    if creator == TxnState::Aborted {
        return view;
    }
    if creator == TxnState::Active && !ctx.is_current(version.xmin) {
        view.visible = true;
        view.inserter = Some(InProgressTxn {
            xid: version.xmin,
            subxid: version.xmin_sub(),
        });
        return view;
    }

    if !version.is_superseded() {
        view.visible = true;
        return view;
    }

    let superseder = oracle.write_status(version.xmax, version.xmax_sub());
    if ctx.is_current(version.xmax) {
        view.visible = superseder == TxnState::Aborted;
        return view;
    }
    match superseder {
        TxnState::Committed => {}
        TxnState::Aborted => view.visible = true,
        TxnState::Active => {
            view.visible = true;
            view.superseder = Some(InProgressTxn {
                xid: version.xmax,
                subxid: version.xmax_sub(),
            });
        }
    }
    view
}

impl Snapshot {
    fn sees_commit_of(&self, xid: TxnId, subxid: Option<SubTxnId>, oracle: &dyn TxnOracle) -> bool {
        !self.treats_as_running(xid) && oracle.write_status(xid, subxid) == TxnState::Committed
    }

    /// MVCC visibility of `version` to the owner of this snapshot.
    pub fn sees_version(&self, version: &RowVersion, oracle: &dyn TxnOracle) -> bool {
        if version.xmin == self.owner() {
            if oracle.write_status(version.xmin, version.xmin_sub()) == TxnState::Aborted {
                return false;
            }
            if version.cmin >= self.cid() {
                return false;
            }
        } else if !self.sees_commit_of(version.xmin, version.xmin_sub(), oracle) {
            return false;
        }

        if !version.is_superseded() {
            return true;
        }
        if version.xmax == self.owner() {
            if oracle.write_status(version.xmax, version.xmax_sub()) == TxnState::Aborted {
                return true;
            }
            return version.cmax >= self.cid();
        }
        !self.sees_commit_of(version.xmax, version.xmax_sub(), oracle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mvcc::row_version::{flags, VersionPointer};
    use hashbrown::HashMap;
    use proptest::prelude::*;
    use smallvec::smallvec;
    use std::time::Duration;

    #[derive(Default)]
    struct FixedOracle {
        states: HashMap<TxnId, TxnState>,
        aborted_subs: Vec<(TxnId, SubTxnId)>,
    }

    impl FixedOracle {
        fn with(states: &[(TxnId, TxnState)]) -> Self {
            Self {
                states: states.iter().copied().collect(),
                aborted_subs: Vec::new(),
            }
        }
    }

    impl TxnOracle for FixedOracle {
        fn status(&self, xid: TxnId) -> TxnState {
            self.states.get(&xid).copied().unwrap_or(TxnState::Aborted)
        }

        fn sub_status(&self, xid: TxnId, subxid: SubTxnId) -> TxnState {
            if self.aborted_subs.contains(&(xid, subxid)) {
                TxnState::Aborted
            } else {
                self.status(xid)
            }
        }

        fn wait_for(&self, _: TxnId, _: Option<SubTxnId>, _: Duration) -> bool {
            true
        }

        fn check_interrupts(&self, _: TxnId) -> Result<()> {
            Ok(())
        }
    }

    fn version(xmin: TxnId, xmax: TxnId) -> RowVersion {
        let mut v = RowVersion::new(VersionPointer::new(0, 1), xmin, 0, b"row".to_vec());
        if xmax != 0 {
            v.set_xmax(xmax, None, 0);
            v.next = VersionPointer::new(0, 2);
        }
        v
    }

    #[test]
    fn running_creator_is_insert_in_progress() {
        let oracle = FixedOracle::with(&[(10, TxnState::Active)]);
        let class = classify(&version(10, 0), 5, &oracle).unwrap();
        assert_eq!(
            class,
            VisibilityClass::InsertInProgress {
                xid: 10,
                subxid: None
            }
        );
    }

    #[test]
    fn running_creator_that_also_deleted_is_delete_in_progress() {
        let oracle = FixedOracle::with(&[(10, TxnState::Active)]);
        let class = classify(&version(10, 10), 5, &oracle).unwrap();
        assert!(matches!(
            class,
            VisibilityClass::DeleteInProgress { xid: 10, .. }
        ));
    }

    #[test]
    fn aborted_creator_is_dead() {
        let oracle = FixedOracle::with(&[(10, TxnState::Aborted)]);
        assert_eq!(
            classify(&version(10, 0), 5, &oracle).unwrap(),
            VisibilityClass::Dead
        );
    }

    #[test]
    fn committed_creator_classes_follow_xmax() {
        let oracle = FixedOracle::with(&[
            (3, TxnState::Committed),
            (4, TxnState::Committed),
            (7, TxnState::Committed),
            (8, TxnState::Aborted),
            (9, TxnState::Active),
        ]);
        assert_eq!(classify(&version(3, 0), 6, &oracle).unwrap(), VisibilityClass::Live);
        assert_eq!(classify(&version(3, 4), 6, &oracle).unwrap(), VisibilityClass::Dead);
        assert_eq!(
            classify(&version(3, 7), 6, &oracle).unwrap(),
            VisibilityClass::RecentlyDead
        );
        assert_eq!(classify(&version(3, 8), 6, &oracle).unwrap(), VisibilityClass::Live);
        assert!(matches!(
            classify(&version(3, 9), 6, &oracle).unwrap(),
            VisibilityClass::DeleteInProgress { xid: 9, .. }
        ));
    }

    #[test]
    fn lock_only_xmax_keeps_version_live() {
        let oracle = FixedOracle::with(&[(3, TxnState::Committed), (4, TxnState::Committed)]);
        let mut v = version(3, 4);
        v.set_flag(flags::LOCK_ONLY, true);
        v.next = v.pointer;
        assert_eq!(classify(&v, 10, &oracle).unwrap(), VisibilityClass::Live);
    }

    #[test]
    fn aborted_sub_transaction_write_is_dead_while_parent_runs() {
        let mut oracle = FixedOracle::with(&[(10, TxnState::Active)]);
        oracle.aborted_subs.push((10, 1));
        let v = version(10, 0).with_xmin_subxid(Some(1));
        assert_eq!(classify(&v, 5, &oracle).unwrap(), VisibilityClass::Dead);
    }

    #[test]
    fn impossible_flag_combinations_are_inconsistent() {
        let oracle = FixedOracle::with(&[(3, TxnState::Committed)]);
        let speculative = version(3, 0).with_flags(flags::SPECULATIVE);
        let lock_only_without_xmax = version(3, 0).with_flags(flags::LOCK_ONLY);
        let in_place_and_moved = version(3, 4).with_flags(flags::IN_PLACE_UPDATED | flags::MOVED_PARTITIONS);

        for v in [speculative, lock_only_without_xmax, in_place_and_moved] {
            let err = classify(&v, 10, &oracle).unwrap_err();
            assert!(matches!(
                err.downcast_ref::<ConcurrencyError>(),
                Some(ConcurrencyError::Inconsistent { .. })
            ));
        }
    }

    #[test]
    fn dirty_view_reports_running_inserter_and_superseder() {
        let oracle = FixedOracle::with(&[(3, TxnState::Committed), (9, TxnState::Active)]);
        let ctx = TxnContext::new(20, 0);

        let inserting = satisfies_dirty(&version(9, 0), &ctx, &oracle);
        assert!(inserting.visible);
        assert_eq!(inserting.inserter.map(|t| t.xid), Some(9));

        let superseding = satisfies_dirty(&version(3, 9), &ctx, &oracle);
        assert!(superseding.visible);
        assert_eq!(superseding.superseder.map(|t| t.xid), Some(9));
        assert_eq!(superseding.blocker().map(|t| t.xid), Some(9));
    }

    #[test]
    fn dirty_view_hides_committed_and_own_supersession() {
        let oracle = FixedOracle::with(&[(3, TxnState::Committed), (4, TxnState::Committed), (20, TxnState::Active)]);
        let ctx = TxnContext::new(20, 0);
        assert!(!satisfies_dirty(&version(3, 4), &ctx, &oracle).visible);
        assert!(!satisfies_dirty(&version(3, 20), &ctx, &oracle).visible);
        assert!(satisfies_dirty(&version(20, 0), &ctx, &oracle).visible);
    }

    #[test]
    fn snapshot_sees_only_committed_before_it() {
        let oracle = FixedOracle::with(&[(3, TxnState::Committed), (6, TxnState::Committed), (7, TxnState::Active)]);
        let snap = Snapshot::new(6, 8, smallvec![6, 7], 20, 0);
        assert!(snap.sees_version(&version(3, 0), &oracle));
        assert!(!snap.sees_version(&version(6, 0), &oracle));
        assert!(!snap.sees_version(&version(7, 0), &oracle));
        assert!(snap.sees_version(&version(3, 6), &oracle));
    }

    #[test]
    fn snapshot_respects_own_command_ids() {
        let oracle = FixedOracle::with(&[(20, TxnState::Active)]);
        let mut v = version(20, 0);
        v.cmin = 5;
        let early = Snapshot::new(20, 21, smallvec![], 20, 3);
        let late = Snapshot::new(20, 21, smallvec![], 20, 7);
        assert!(!early.sees_version(&v, &oracle));
        assert!(late.sees_version(&v, &oracle));
    }

    fn state_strategy() -> impl Strategy<Value = TxnState> {
        prop_oneof![
            Just(TxnState::Active),
            Just(TxnState::Committed),
            Just(TxnState::Aborted),
        ]
    }

    proptest! {
        #[test]
        fn classify_is_deterministic(
            xmin in 2u64..50,
            xmax in prop_oneof![Just(0u64), 2u64..50],
            oldest in 2u64..60,
            xmin_state in state_strategy(),
            xmax_state in state_strategy(),
            lock_only in any::<bool>(),
        ) {
            let oracle = FixedOracle::with(&[(xmin, xmin_state), (xmax, xmax_state)]);
            let mut v = version(xmin, xmax);
            if lock_only && xmax != 0 {
                v.set_flag(flags::LOCK_ONLY, true);
            }
            let first = classify(&v, oldest, &oracle).ok();
            let second = classify(&v.clone(), oldest, &oracle).ok();
            prop_assert_eq!(first, second);
        }

        #[test]
        fn committed_supersession_is_dead_exactly_below_horizon(
            xmax in 3u64..50,
            oldest in 2u64..60,
        ) {
            let oracle = FixedOracle::with(&[(2, TxnState::Committed), (xmax, TxnState::Committed)]);
            let class = classify(&version(2, xmax), oldest, &oracle).unwrap();
            if xmax < oldest {
                prop_assert_eq!(class, VisibilityClass::Dead);
            } else {
                prop_assert_eq!(class, VisibilityClass::RecentlyDead);
            }
        }
    }
}
