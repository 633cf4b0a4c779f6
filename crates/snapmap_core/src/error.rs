//! Error types for snapmap.

use crate::cancel::CancelReason;
use thiserror::Error;

/// Result type for transaction operations.
pub type TxResult<T> = Result<T, TxError>;

/// Errors surfaced at the transaction boundary.
///
/// All faults surface here; there is no local recovery. Internal invariant
/// violations (pin underflow, a missing current version) are programmer
/// errors and panic instead.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TxError {
    /// A key in the write set was overwritten by another transaction after
    /// this transaction's snapshot was taken. Restart the transaction to
    /// retry on fresh data.
    #[error("write-write conflict: key overwritten since snapshot")]
    Conflict,

    /// The transaction already committed or rolled back.
    #[error("transaction already completed")]
    TxDone,

    /// The transaction was aborted by the deadlock detector.
    #[error("transaction aborted: chosen as deadlock victim")]
    Deadlock,

    /// The transaction's cancellation token fired.
    #[error("transaction canceled: {reason}")]
    Canceled {
        /// Why the token fired.
        reason: CancelReason,
    },
}

impl TxError {
    /// Maps a fired cancellation token to the error the caller observes.
    ///
    /// A deadlock-victim cancellation is reported as [`TxError::Deadlock`]
    /// so callers can tell it apart from their own cancellation.
    pub(crate) fn from_cancel(reason: CancelReason) -> Self {
        match reason {
            CancelReason::Deadlock => TxError::Deadlock,
            reason => TxError::Canceled { reason },
        }
    }

    /// Check if this error may succeed when the transaction is retried
    /// from a fresh snapshot.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, TxError::Conflict)
    }

    /// Check if this is a write-write conflict.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, TxError::Conflict)
    }
}
