//! MVCC snapshots and dirty observations.
//!
//! A [`Snapshot`] fixes which transactions count as finished for one reader:
//! everything below `xmin` had finished when the snapshot was taken,
//! everything at or above `xmax` had not started, and the ids in `xip` were
//! running. The owning transaction sees its own writes from commands before
//! `cid`.
//!
//! A [`DirtyView`] is what a dirty fetch reports: the version itself, whether
//! a reader that ignores in-flight writes would treat it as present, and which
//! running transactions are inserting or superseding it.

use super::row_version::RowVersion;
use super::transaction::{CommandId, SubTxnId, TxnId};
use smallvec::SmallVec;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    xmin: TxnId,
    xmax: TxnId,
    xip: SmallVec<[TxnId; 16]>,
    owner: TxnId,
    cid: CommandId,
}

impl Snapshot {
    pub fn new(
        xmin: TxnId,
        xmax: TxnId,
        xip: SmallVec<[TxnId; 16]>,
        owner: TxnId,
        cid: CommandId,
    ) -> Self {
        Self {
            xmin,
            xmax,
            xip,
            owner,
            cid,
        }
    }

    pub fn xmin(&self) -> TxnId {
        self.xmin
    }

    pub fn xmax(&self) -> TxnId {
        self.xmax
    }

    pub fn owner(&self) -> TxnId {
        self.owner
    }

    pub fn cid(&self) -> CommandId {
        self.cid
    }

    pub fn in_progress(&self) -> &[TxnId] {
        &self.xip
    }

    /// Same snapshot as seen from a later command of the owner.
    pub fn with_cid(mut self, cid: CommandId) -> Self {
        self.cid = cid;
        self
    }

    /// Whether `xid` must be treated as still running by this snapshot,
    /// regardless of its current status.
    pub fn treats_as_running(&self, xid: TxnId) -> bool {
        if xid == self.owner {
            return false;
        }
        if xid < self.xmin {
            return false;
        }
        if xid >= self.xmax {
            return true;
        }
        self.xip.contains(&xid)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InProgressTxn {
    pub xid: TxnId,
    pub subxid: Option<SubTxnId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirtyView {
    pub version: RowVersion,
    pub visible: bool,
    pub inserter: Option<InProgressTxn>,
    pub superseder: Option<InProgressTxn>,
}

impl DirtyView {
    /// The running transaction this observation would have to wait for.
    pub fn blocker(&self) -> Option<InProgressTxn> {
        self.inserter.or(self.superseder)
    }
}
