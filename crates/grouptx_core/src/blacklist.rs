//! Per-tenant blacklist of failed transactions.

use crate::error::{TxError, TxResult};
use crate::paths::TenantPaths;
use crate::records::{decode, encode, BlacklistEntry, BlacklistReason};
use crate::types::{unix_millis, TransactionId};
use grouptx_coord::{CoordinationClient, CreateMode};
use std::sync::Arc;
use tracing::{debug, info};

/// The set of transaction IDs a tenant's readers must ignore.
///
/// Entries are only ever added by callers; removal is reserved for the
/// groomer once no in-flight reader can still need them.
pub struct Blacklist {
    client: Arc<dyn CoordinationClient>,
    paths: TenantPaths,
}

impl Blacklist {
    /// Creates a blacklist handle for one tenant.
    #[must_use]
    pub fn new(client: Arc<dyn CoordinationClient>, paths: TenantPaths) -> Self {
        Self { client, paths }
    }

    /// Adds `txid` to the blacklist. Adding it again is a no-op.
    ///
    /// Returns true if this call created the entry.
    pub fn add(&self, txid: TransactionId, reason: BlacklistReason) -> TxResult<bool> {
        let entry = BlacklistEntry {
            reason,
            blacklisted_at_ms: unix_millis(),
        };
        let node = self.paths.blacklist_node(txid.as_u64());
        match self
            .client
            .create_with_parents(&node, &encode(&entry)?, CreateMode::Persistent)
        {
            Ok(_) => {
                info!(
                    tenant = self.paths.tenant(),
                    txid = txid.as_u64(),
                    ?reason,
                    "transaction blacklisted"
                );
                Ok(true)
            }
            Err(e) if e.is_node_exists() => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Returns the blacklist entry of `txid`, if any.
    pub fn entry(&self, txid: TransactionId) -> TxResult<Option<BlacklistEntry>> {
        let node = self.paths.blacklist_node(txid.as_u64());
        match self.client.get(&node) {
            Ok((data, _)) => Ok(Some(decode(&node, &data)?)),
            Err(e) if e.is_no_node() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Returns true if `txid` is blacklisted.
    ///
    /// `entity_group_key` only adds context to the trace output; membership
    /// is per transaction, not per group.
    pub fn contains(&self, txid: TransactionId, entity_group_key: Option<&str>) -> TxResult<bool> {
        let node = self.paths.blacklist_node(txid.as_u64());
        let listed = self.client.exists(&node, None)?.is_some();
        debug!(
            tenant = self.paths.tenant(),
            txid = txid.as_u64(),
            key = entity_group_key,
            listed,
            "blacklist lookup"
        );
        Ok(listed)
    }

    /// Fails if `txid` is blacklisted, naming the reason.
    pub fn ensure_usable(&self, txid: TransactionId) -> TxResult<()> {
        match self.entry(txid)? {
            None => Ok(()),
            Some(BlacklistEntry {
                reason: BlacklistReason::Expired,
                ..
            }) => Err(TxError::ExpiredTransaction {
                txid: txid.as_u64(),
            }),
            Some(BlacklistEntry {
                reason: BlacklistReason::Failed,
                ..
            }) => Err(TxError::invalid_transaction(txid.as_u64(), "transaction is blacklisted")),
        }
    }

    /// Lists every entry in ascending ID order.
    pub fn entries(&self) -> TxResult<Vec<(TransactionId, BlacklistEntry)>> {
        let dir = self.paths.blacklist_dir();
        let children = match self.client.get_children(&dir) {
            Ok(children) => children,
            Err(e) if e.is_no_node() => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut entries = Vec::with_capacity(children.len());
        for name in children {
            let Ok(txid) = name.parse::<u64>() else {
                continue;
            };
            if let Some(entry) = self.entry(TransactionId::new(txid))? {
                entries.push((TransactionId::new(txid), entry));
            }
        }
        entries.sort_unstable_by_key(|(txid, _)| *txid);
        Ok(entries)
    }

    /// Removes the entry of `txid`. Used by the groomer only.
    pub(crate) fn remove(&self, txid: TransactionId) -> TxResult<()> {
        match self
            .client
            .delete(&self.paths.blacklist_node(txid.as_u64()), None)
        {
            Ok(()) => Ok(()),
            Err(e) if e.is_no_node() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl std::fmt::Debug for Blacklist {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Blacklist")
            .field("tenant", &self.paths.tenant())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use grouptx_coord::InMemoryCoordinator;

    fn blacklist(service: &InMemoryCoordinator) -> Blacklist {
        Blacklist::new(Arc::new(service.connect()), TenantPaths::new("/grouptx", "app"))
    }

    #[test]
    fn add_is_idempotent() {
        let service = InMemoryCoordinator::new();
        let blacklist = blacklist(&service);
        let txid = TransactionId::new(4);

        assert!(!blacklist.contains(txid, None).unwrap());
        assert!(blacklist.add(txid, BlacklistReason::Failed).unwrap());
        assert!(!blacklist.add(txid, BlacklistReason::Failed).unwrap());
        assert!(blacklist.contains(txid, Some("Greeting:1")).unwrap());
        assert_eq!(blacklist.entries().unwrap().len(), 1);
    }

    #[test]
    fn first_reason_wins() {
        let service = InMemoryCoordinator::new();
        let blacklist = blacklist(&service);
        let txid = TransactionId::new(4);

        blacklist.add(txid, BlacklistReason::Expired).unwrap();
        blacklist.add(txid, BlacklistReason::Failed).unwrap();
        assert!(matches!(
            blacklist.ensure_usable(txid),
            Err(TxError::ExpiredTransaction { txid: 4 })
        ));
    }

    #[test]
    fn failed_transactions_are_invalid() {
        let service = InMemoryCoordinator::new();
        let blacklist = blacklist(&service);
        blacklist.add(TransactionId::new(2), BlacklistReason::Failed).unwrap();

        assert!(blacklist.ensure_usable(TransactionId::new(1)).is_ok());
        assert!(matches!(
            blacklist.ensure_usable(TransactionId::new(2)),
            Err(TxError::InvalidTransaction { txid: 2, .. })
        ));
    }

    #[test]
    fn entries_are_sorted_numerically() {
        let service = InMemoryCoordinator::new();
        let blacklist = blacklist(&service);
        for txid in [10, 9, 100] {
            blacklist
                .add(TransactionId::new(txid), BlacklistReason::Failed)
                .unwrap();
        }
        let ids: Vec<u64> = blacklist
            .entries()
            .unwrap()
            .into_iter()
            .map(|(txid, _)| txid.as_u64())
            .collect();
        assert_eq!(ids, vec![9, 10, 100]);

        blacklist.remove(TransactionId::new(10)).unwrap();
        blacklist.remove(TransactionId::new(10)).unwrap();
        assert!(!blacklist.contains(TransactionId::new(10), None).unwrap());
    }

    #[test]
    fn unreachable_service_is_no_connection() {
        let service = InMemoryCoordinator::new();
        let blacklist = blacklist(&service);
        service.set_available(false);
        let err = blacklist.contains(TransactionId::new(1), None).unwrap_err();
        assert!(matches!(err, TxError::NoConnection { .. }));
    }
}
