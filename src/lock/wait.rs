//! # Wait Coordination
//!
//! `WaitCoordinator` decides what a caller does when it runs into a row
//! owned by another running (sub)transaction.
//!
//! | Policy          | Blocker running                 | Blocker finished |
//! |-----------------|---------------------------------|------------------|
//! | Block           | sleep until it finishes, Retry  | Retry            |
//! | SkipOnConflict  | GiveUp (caller: WouldBlock)     | Retry            |
//! | ErrorOnConflict | `LockNotAvailable` error        | Proceed          |
//!
//! Skip and Error never suspend the caller: they probe the blocker's status
//! with a zero-timeout wait. Block sleeps in bounded slices of
//! `WAIT_POLL_INTERVAL`, checking for cancellation of the waiting transaction
//! before each slice, so an abort request is honored between slices and never
//! in the middle of a fetch.

use crate::config::WAIT_POLL_INTERVAL;
use crate::mvcc::{ConcurrencyError, SubTxnId, TxnId, TxnOracle};
use eyre::{bail, Result};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WaitPolicy {
    #[default]
    Block,
    SkipOnConflict,
    ErrorOnConflict,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitDecision {
    /// Blocker had already finished; continue without re-reading.
    Proceed,
    /// Blocker finished (possibly after a wait); re-read and re-decide.
    Retry,
    /// Blocker still running and the policy forbids waiting.
    GiveUp,
}

pub struct WaitCoordinator<'a> {
    oracle: &'a dyn TxnOracle,
    waiter: TxnId,
    relation: &'a str,
}

impl<'a> WaitCoordinator<'a> {
    pub fn new(oracle: &'a dyn TxnOracle, waiter: TxnId) -> Self {
        Self {
            oracle,
            waiter,
            relation: "",
        }
    }

    pub fn with_relation(mut self, relation: &'a str) -> Self {
        self.relation = relation;
        self
    }

    pub fn wait(&self, xid: TxnId, subxid: Option<SubTxnId>, policy: WaitPolicy) -> Result<WaitDecision> {
        if xid == self.waiter {
            bail!("transaction {} cannot wait for itself", xid);
        }

        match policy {
            WaitPolicy::Block => {
                debug!(waiter = self.waiter, xid, ?subxid, relation = self.relation, "waiting for transaction");
                loop {
                    self.oracle.check_interrupts(self.waiter)?;
                    if self.oracle.wait_for(xid, subxid, WAIT_POLL_INTERVAL) {
                        return Ok(WaitDecision::Retry);
                    }
                }
            }
            WaitPolicy::SkipOnConflict => {
                if self.oracle.wait_for(xid, subxid, Duration::ZERO) {
                    Ok(WaitDecision::Retry)
                } else {
                    debug!(waiter = self.waiter, xid, ?subxid, "skipping row locked by running transaction");
                    Ok(WaitDecision::GiveUp)
                }
            }
            WaitPolicy::ErrorOnConflict => {
                if self.oracle.wait_for(xid, subxid, Duration::ZERO) {
                    Ok(WaitDecision::Proceed)
                } else {
                    bail!(ConcurrencyError::LockNotAvailable {
                        relation: self.relation.to_string(),
                        xid,
                        subxid,
                    })
                }
            }
        }
    }
}
