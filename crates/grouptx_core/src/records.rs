//! JSON payloads stored in coordination nodes.

use crate::error::{TxError, TxResult};
use crate::types::TransactionId;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Payload of a counter node (`txids*/tx<seq>`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct CounterRecord {
    pub created_at_ms: u64,
}

/// Payload of a lock node: which transaction holds the entity group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockOwner {
    /// Holding transaction.
    pub txid: u64,
    /// When the lock was taken, in Unix milliseconds.
    pub acquired_at_ms: u64,
}

/// Why a transaction was blacklisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlacklistReason {
    /// Rolled back by its owner or found without commit evidence.
    Failed,
    /// Exceeded the maximum transaction lifetime.
    Expired,
}

/// Payload of a blacklist node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlacklistEntry {
    /// Why the transaction was blacklisted.
    pub reason: BlacklistReason,
    /// When, in Unix milliseconds.
    pub blacklisted_at_ms: u64,
}

/// Final outcome claimed on a transaction's counter node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum TransactionOutcome {
    Committed,
    Aborted,
    Expired,
}

/// Payload of a validity record and of a transaction's updated-key marker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ValidityRecord {
    pub key: String,
    pub target: u64,
    pub registered_at_ms: u64,
}

/// A key registered by a transaction, with the version it declared valid.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct UpdatedKey {
    /// The entity key.
    pub key: String,
    /// The transaction whose write is authoritative for the key.
    pub target: TransactionId,
}

/// Payload of the groomer lock node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct GroomerLockHolder {
    pub session: String,
    pub acquired_at_ms: u64,
}

pub(crate) fn encode<T: Serialize>(value: &T) -> TxResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| TxError::internal(format!("encoding node payload: {e}")))
}

pub(crate) fn decode<T: DeserializeOwned>(path: &str, bytes: &[u8]) -> TxResult<T> {
    serde_json::from_slice(bytes).map_err(|e| TxError::corrupt_node(path, e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blacklist_reason_is_lowercase() {
        let entry = BlacklistEntry {
            reason: BlacklistReason::Expired,
            blacklisted_at_ms: 5,
        };
        let bytes = encode(&entry).unwrap();
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            r#"{"reason":"expired","blacklisted_at_ms":5}"#
        );
    }

    #[test]
    fn decode_garbage_is_corrupt_node() {
        let result: TxResult<LockOwner> = decode("/x/locks/k", b"not json");
        match result {
            Err(TxError::CorruptNode { path, .. }) => assert_eq!(path, "/x/locks/k"),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
