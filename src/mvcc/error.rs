//! Typed failures of the concurrency core.
//!
//! Everything fallible returns `eyre::Result`. The failures a caller needs to
//! tell apart are raised as `ConcurrencyError` through `bail!`, so they can be
//! recovered with `report.downcast_ref::<ConcurrencyError>()`. Outcomes such
//! as "row deleted" or "would block" are plain values of `LockOutcome`, not
//! errors.

use super::row_version::VersionPointer;
use super::transaction::{SubTxnId, TxnId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConcurrencyError {
    /// The row was moved to another partition by a concurrent update.
    SerializationFailure { pointer: VersionPointer },
    /// ErrorOnConflict met a transaction that is still running.
    LockNotAvailable {
        relation: String,
        xid: TxnId,
        subxid: Option<SubTxnId>,
    },
    /// Version metadata or chain state that cannot happen in a sound engine.
    Inconsistent { pointer: VersionPointer, reason: String },
    /// The waiting transaction was asked to cancel.
    Cancelled { xid: TxnId },
}

impl ConcurrencyError {
    pub fn inconsistent(pointer: VersionPointer, reason: impl Into<String>) -> Self {
        ConcurrencyError::Inconsistent {
            pointer,
            reason: reason.into(),
        }
    }
}

impl std::fmt::Display for ConcurrencyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConcurrencyError::SerializationFailure { pointer } => write!(
                f,
                "could not serialize access: row {} to be locked was already moved to another partition due to concurrent update",
                pointer
            ),
            ConcurrencyError::LockNotAvailable {
                relation,
                xid,
                subxid,
            } => {
                write!(
                    f,
                    "could not obtain lock on row in relation \"{}\" (held by transaction {}",
                    relation, xid
                )?;
                if let Some(sub) = subxid {
                    write!(f, ", subtransaction {}", sub)?;
                }
                write!(f, ")")
            }
            ConcurrencyError::Inconsistent { pointer, reason } => {
                write!(f, "inconsistent row version at {}: {}", pointer, reason)
            }
            ConcurrencyError::Cancelled { xid } => {
                write!(f, "canceling wait of transaction {} due to user request", xid)
            }
        }
    }
}

impl std::error::Error for ConcurrencyError {}

/// Returns the typed failure carried by `report`, if any.
pub fn concurrency_error(report: &eyre::Report) -> Option<&ConcurrencyError> {
    report.downcast_ref::<ConcurrencyError>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use eyre::{bail, Result, WrapErr};

    fn fails_with_lock_not_available() -> Result<()> {
        bail!(ConcurrencyError::LockNotAvailable {
            relation: "accounts".to_string(),
            xid: 12,
            subxid: None,
        })
    }

    #[test]
    fn typed_error_survives_bail_for_downcast() {
        let err = fails_with_lock_not_available().unwrap_err();
        assert!(matches!(
            concurrency_error(&err),
            Some(ConcurrencyError::LockNotAvailable { xid: 12, .. })
        ));
    }

    #[test]
    fn typed_error_survives_wrap_err() {
        let err = fails_with_lock_not_available()
            .wrap_err("locking row for update")
            .unwrap_err();
        assert!(concurrency_error(&err).is_some());
    }

    #[test]
    fn lock_not_available_message_names_relation() {
        let err = ConcurrencyError::LockNotAvailable {
            relation: "accounts".to_string(),
            xid: 12,
            subxid: Some(3),
        };
        let msg = err.to_string();
        assert!(msg.contains("could not obtain lock on row in relation \"accounts\""));
        assert!(msg.contains("subtransaction 3"));
    }
}
