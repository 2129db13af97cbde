//! Error types for transaction coordination.

use crate::types::TransactionState;
use grouptx_coord::CoordError;
use thiserror::Error;

/// Result type for transaction coordination operations.
pub type TxResult<T> = Result<T, TxError>;

/// Errors that can occur while coordinating transactions.
#[derive(Debug, Error)]
pub enum TxError {
    /// The coordination service is unreachable. Always retryable.
    #[error("no connection to coordination service: {source}")]
    NoConnection {
        /// The underlying client failure.
        #[source]
        source: CoordError,
    },

    /// The transaction is blacklisted, deleted, or was never issued.
    #[error("invalid transaction {txid}: {reason}")]
    InvalidTransaction {
        /// The offending transaction ID.
        txid: u64,
        /// Why the transaction is invalid.
        reason: String,
    },

    /// The transaction outlived its maximum lifetime and was expired.
    #[error("transaction {txid} expired")]
    ExpiredTransaction {
        /// The expired transaction ID.
        txid: u64,
    },

    /// The entity group is locked by another transaction.
    #[error("entity group {key} is locked by transaction {holder}")]
    LockConflict {
        /// The contended entity-group key.
        key: String,
        /// The transaction holding the lock.
        holder: u64,
    },

    /// A single-group transaction tried to lock a second entity group.
    #[error("transaction {txid} is bound to entity group {locked}, cannot lock {requested}")]
    DifferentRootKey {
        /// The transaction.
        txid: u64,
        /// The group the transaction already touched.
        locked: String,
        /// The group it tried to lock.
        requested: String,
    },

    /// A cross-group transaction reached its group limit.
    #[error("transaction {txid} already holds the maximum of {limit} entity groups")]
    TooManyGroups {
        /// The transaction.
        txid: u64,
        /// The configured limit.
        limit: usize,
    },

    /// The transaction handle cannot move to the requested state.
    #[error("cannot move transaction from {from} to {to}")]
    InvalidStateTransition {
        /// Current state.
        from: TransactionState,
        /// Requested state.
        to: TransactionState,
    },

    /// The caller does not hold the lock it tried to use or release.
    #[error("lock on {key} is not held by transaction {txid}")]
    LockNotHeld {
        /// The entity-group key.
        key: String,
        /// The transaction that expected to hold the lock.
        txid: u64,
        /// The actual holder, if any.
        holder: Option<u64>,
    },

    /// A node in the coordination tree has unexpected contents.
    #[error("corrupt node {path}: {message}")]
    CorruptNode {
        /// The node path.
        path: String,
        /// Description of the problem.
        message: String,
    },

    /// A coordination request failed for a reason other than connectivity.
    #[error("coordination error: {source}")]
    Coordination {
        /// The underlying client failure.
        #[source]
        source: CoordError,
    },

    /// Internal invariant violation.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the problem.
        message: String,
    },
}

impl TxError {
    /// Creates an invalid transaction error.
    pub fn invalid_transaction(txid: u64, reason: impl Into<String>) -> Self {
        Self::InvalidTransaction {
            txid,
            reason: reason.into(),
        }
    }

    /// Creates a corrupt node error.
    pub fn corrupt_node(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::CorruptNode {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if the caller may retry the same operation.
    ///
    /// `NoConnection` is retryable immediately, `LockConflict` after a backoff.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NoConnection { .. } | Self::LockConflict { .. })
    }

    /// Returns true if the transaction ID can no longer be used.
    #[must_use]
    pub fn is_terminal_for_transaction(&self) -> bool {
        matches!(
            self,
            Self::InvalidTransaction { .. } | Self::ExpiredTransaction { .. }
        )
    }
}

impl From<CoordError> for TxError {
    fn from(source: CoordError) -> Self {
        if source.is_connection_error() {
            Self::NoConnection { source }
        } else {
            Self::Coordination { source }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_failures_are_retryable() {
        let err: TxError = CoordError::ConnectionLoss.into();
        assert!(matches!(err, TxError::NoConnection { .. }));
        assert!(err.is_retryable());

        let err: TxError = CoordError::SessionExpired {
            session: "s".into(),
        }
        .into();
        assert!(err.is_retryable());
    }

    #[test]
    fn other_coordination_failures_are_not() {
        let err: TxError = CoordError::no_node("/x").into();
        assert!(matches!(err, TxError::Coordination { .. }));
        assert!(!err.is_retryable());
    }

    #[test]
    fn lock_conflict_is_retryable() {
        let err = TxError::LockConflict {
            key: "k".into(),
            holder: 3,
        };
        assert!(err.is_retryable());
        assert!(!err.is_terminal_for_transaction());
    }

    #[test]
    fn invalid_and_expired_are_terminal() {
        assert!(TxError::invalid_transaction(1, "blacklisted").is_terminal_for_transaction());
        assert!(TxError::ExpiredTransaction { txid: 1 }.is_terminal_for_transaction());
        assert!(!TxError::ExpiredTransaction { txid: 1 }.is_retryable());
    }

    #[test]
    fn error_display() {
        let err = TxError::TooManyGroups { txid: 9, limit: 5 };
        assert_eq!(
            err.to_string(),
            "transaction 9 already holds the maximum of 5 entity groups"
        );
    }
}
