//! Core type definitions for grouptx.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Unique identifier for a transaction within a tenant.
///
/// Transaction IDs are monotonically increasing and never mutated once
/// issued. `0` is never issued; it means "no valid version".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransactionId(pub u64);

impl TransactionId {
    /// The "no valid version" sentinel.
    pub const NONE: Self = Self(0);

    /// Creates a new transaction ID.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw ID value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns true for the "no valid version" sentinel.
    #[must_use]
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn:{}", self.0)
    }
}

impl From<u64> for TransactionId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// State of a transaction driven through the [`crate::Transaction`] handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// An ID has been issued; no locks are held yet.
    Created,
    /// At least one entity-group lock is held.
    Locked,
    /// The transaction is checking it may still commit.
    Validating,
    /// Writes were registered and locks released.
    Committed,
    /// The ID was blacklisted and locks released.
    Aborted,
}

impl TransactionState {
    /// Returns true for `Committed` and `Aborted`.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Committed | Self::Aborted)
    }

    /// Returns true if moving from `self` to `next` is allowed.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        use TransactionState::{Aborted, Committed, Created, Locked, Validating};
        matches!(
            (self, next),
            (Created, Locked | Committed | Aborted)
                | (Locked, Locked | Validating | Committed | Aborted)
                | (Validating, Committed | Aborted)
        )
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Locked => "locked",
            Self::Validating => "validating",
            Self::Committed => "committed",
            Self::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// Milliseconds since the Unix epoch.
pub(crate) fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transaction_id_display() {
        assert_eq!(TransactionId::new(42).to_string(), "txn:42");
        assert!(TransactionId::NONE.is_none());
        assert!(!TransactionId::new(1).is_none());
    }

    #[test]
    fn transaction_id_ordering() {
        assert!(TransactionId::new(1) < TransactionId::new(2));
        assert_eq!(TransactionId::from(7).as_u64(), 7);
    }

    #[test]
    fn terminal_states_have_no_way_back() {
        use TransactionState::*;
        for next in [Created, Locked, Validating, Committed, Aborted] {
            assert!(!Committed.can_transition_to(next));
            assert!(!Aborted.can_transition_to(next));
        }
        assert!(Committed.is_terminal());
        assert!(!Locked.is_terminal());
    }

    #[test]
    fn forward_transitions() {
        use TransactionState::*;
        assert!(Created.can_transition_to(Locked));
        assert!(Locked.can_transition_to(Locked));
        assert!(Locked.can_transition_to(Validating));
        assert!(Validating.can_transition_to(Committed));
        assert!(!Validating.can_transition_to(Locked));
        assert!(!Created.can_transition_to(Validating));
    }
}
