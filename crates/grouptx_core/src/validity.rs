//! Per-key valid-version tracking.
//!
//! Every registration is stored twice: as a validity record
//! `validlist/<key-hash>/<writer>` that readers walk, and as an updated-key
//! marker `ukey<key-hash>` under the writer's counter node so a rollback
//! can enumerate what the transaction touched.

use crate::blacklist::Blacklist;
use crate::error::{TxError, TxResult};
use crate::paths::{key_hash, TenantPaths, UPDATED_KEY_PREFIX};
use crate::records::{decode, encode, UpdatedKey, ValidityRecord};
use crate::txid::TxidAllocator;
use crate::types::{unix_millis, TransactionId};
use grouptx_coord::{path, CoordError, CoordResult, CoordinationClient, CreateMode};
use std::collections::BTreeSet;
use std::ops::Bound;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Records which transaction owns the visible value of each key.
pub struct ValidityRegistry {
    client: Arc<dyn CoordinationClient>,
    paths: TenantPaths,
    allocator: Arc<TxidAllocator>,
    blacklist: Arc<Blacklist>,
}

impl ValidityRegistry {
    /// Creates a registry for one tenant.
    #[must_use]
    pub fn new(
        client: Arc<dyn CoordinationClient>,
        paths: TenantPaths,
        allocator: Arc<TxidAllocator>,
        blacklist: Arc<Blacklist>,
    ) -> Self {
        Self {
            client,
            paths,
            allocator,
            blacklist,
        }
    }

    /// Records that, as of `current`'s write, `key`'s authoritative version is
    /// `target`.
    ///
    /// `target` is normally `current`; it differs when a writer re-validates
    /// an older version after resolving a conflict.
    ///
    /// # Errors
    ///
    /// Returns [`TxError::InvalidTransaction`] if `current` is not open or
    /// either ID is blacklisted.
    pub fn register_updated_key(
        &self,
        current: TransactionId,
        target: TransactionId,
        key: &str,
    ) -> TxResult<()> {
        self.blacklist.ensure_usable(current)?;
        if target.is_none() {
            return Err(TxError::invalid_transaction(
                target.as_u64(),
                "cannot register the empty version",
            ));
        }
        if target != current && self.blacklist.contains(target, None)? {
            return Err(TxError::invalid_transaction(
                target.as_u64(),
                "target version is blacklisted",
            ));
        }

        let data = encode(&ValidityRecord {
            key: key.to_string(),
            target: target.as_u64(),
            registered_at_ms: unix_millis(),
        })?;

        let marker = path::join(
            &self.allocator.counter_path(current)?,
            &format!("{UPDATED_KEY_PREFIX}{}", key_hash(key)),
        );
        match upsert(self.client.as_ref(), &marker, &data, false) {
            Ok(()) => {}
            Err(e) if e.is_no_node() => {
                return Err(TxError::invalid_transaction(
                    current.as_u64(),
                    "transaction is not open",
                ))
            }
            Err(e) => return Err(e.into()),
        }
        upsert(
            self.client.as_ref(),
            &self.paths.validity_record(key, current.as_u64()),
            &data,
            true,
        )?;

        debug!(
            tenant = self.paths.tenant(),
            txid = current.as_u64(),
            target = target.as_u64(),
            key,
            "registered updated key"
        );
        Ok(())
    }

    /// Resolves which version of `key` a reader holding `target` should see.
    ///
    /// Returns `target` if it is not blacklisted. Otherwise walks the key's
    /// registrations from newest to oldest, starting below `target`, and
    /// returns the first whose writer and target are both not blacklisted.
    /// Returns [`TransactionId::NONE`] if there is none.
    pub fn get_valid_transaction_id(
        &self,
        target: TransactionId,
        key: &str,
    ) -> TxResult<TransactionId> {
        if !self.blacklist.contains(target, Some(key))? {
            return Ok(target);
        }

        let records = self.records_in(&self.paths.validity_dir(key))?;
        for (writer, record) in records.iter().rev() {
            if *writer >= target {
                continue;
            }
            if self.blacklist.contains(*writer, None)? {
                continue;
            }
            let candidate = TransactionId::new(record.target);
            if candidate != *writer && self.blacklist.contains(candidate, None)? {
                continue;
            }
            debug!(
                tenant = self.paths.tenant(),
                key,
                requested = target.as_u64(),
                resolved = candidate.as_u64(),
                "resolved past blacklisted version"
            );
            return Ok(candidate);
        }
        Ok(TransactionId::NONE)
    }

    /// Returns every key `txid` registered, sorted by key.
    ///
    /// # Errors
    ///
    /// Returns [`TxError::InvalidTransaction`] if `txid` is not open.
    pub fn get_update_key_list(&self, txid: TransactionId) -> TxResult<Vec<UpdatedKey>> {
        let counter = self.allocator.counter_path(txid)?;
        let children = match self.client.get_children(&counter) {
            Ok(children) => children,
            Err(e) if e.is_no_node() => {
                return Err(TxError::invalid_transaction(
                    txid.as_u64(),
                    "transaction is not open",
                ))
            }
            Err(e) => return Err(e.into()),
        };

        let mut keys = Vec::new();
        for name in children.iter().filter(|n| n.starts_with(UPDATED_KEY_PREFIX)) {
            let node = path::join(&counter, name);
            let data = match self.client.get(&node) {
                Ok((data, _)) => data,
                Err(e) if e.is_no_node() => continue,
                Err(e) => return Err(e.into()),
            };
            let record: ValidityRecord = decode(&node, &data)?;
            keys.push(UpdatedKey {
                key: record.key,
                target: TransactionId::new(record.target),
            });
        }
        keys.sort();
        Ok(keys)
    }

    /// Reads the validity records in one key directory, oldest writer first.
    fn records_in(&self, dir: &str) -> TxResult<Vec<(TransactionId, ValidityRecord)>> {
        let children = match self.client.get_children(dir) {
            Ok(children) => children,
            Err(e) if e.is_no_node() => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut records = Vec::with_capacity(children.len());
        for name in children {
            let Ok(writer) = name.parse::<u64>() else {
                continue;
            };
            let node = path::join(dir, &name);
            match self.client.get(&node) {
                Ok((data, _)) => records.push((TransactionId::new(writer), decode(&node, &data)?)),
                Err(e) if e.is_no_node() => {}
                Err(e) => return Err(e.into()),
            }
        }
        records.sort_unstable_by_key(|(writer, _)| *writer);
        Ok(records)
    }

    /// Deletes the validity records `txid` wrote. Returns how many were removed.
    pub(crate) fn forget_transaction(&self, txid: TransactionId) -> TxResult<usize> {
        let keys = match self.get_update_key_list(txid) {
            Ok(keys) => keys,
            Err(TxError::InvalidTransaction { .. }) => return Ok(0),
            Err(e) => return Err(e),
        };
        let mut removed = 0;
        for updated in keys {
            let node = self.paths.validity_record(&updated.key, txid.as_u64());
            if delete_if_present(self.client.as_ref(), &node)? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Removes records no reader can resolve to any more.
    ///
    /// Records written by or pointing at blacklisted transactions are
    /// dropped. Per key, once a committed record is older than `retention`,
    /// older records are dropped as well, except the newest record below
    /// each transaction that is still blacklisted or open: a reader holding
    /// that ID walks back to exactly that record.
    pub(crate) fn prune(&self, retention: Duration) -> TxResult<usize> {
        let dir = self.paths.validlist_dir();
        let key_dirs = match self.client.get_children(&dir) {
            Ok(children) => children,
            Err(e) if e.is_no_node() => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        let retention_ms = u64::try_from(retention.as_millis()).unwrap_or(u64::MAX);
        let horizon = unix_millis().saturating_sub(retention_ms);
        let unresolved: BTreeSet<TransactionId> = self
            .blacklist
            .entries()?
            .into_iter()
            .map(|(txid, _)| txid)
            .chain(self.allocator.get_open_transactions()?)
            .collect();
        let mut removed = 0;

        for name in key_dirs {
            let key_dir = path::join(&dir, &name);
            let record_node =
                |writer: TransactionId| path::join(&key_dir, &writer.as_u64().to_string());
            let mut live = Vec::new();
            for (writer, record) in self.records_in(&key_dir)? {
                let dead = self.blacklist.contains(writer, None)?
                    || self
                        .blacklist
                        .contains(TransactionId::new(record.target), None)?;
                if dead {
                    if delete_if_present(self.client.as_ref(), &record_node(writer))? {
                        removed += 1;
                    }
                } else {
                    live.push((writer, record));
                }
            }

            let mut settled = None;
            for (index, (writer, record)) in live.iter().enumerate().rev() {
                if record.registered_at_ms <= horizon && !self.allocator.is_open(*writer)? {
                    settled = Some(index);
                    break;
                }
            }
            if let Some(settled) = settled {
                for pair in live[..=settled].windows(2) {
                    let (writer, next) = (pair[0].0, pair[1].0);
                    let still_needed = unresolved
                        .range((Bound::Excluded(writer), Bound::Included(next)))
                        .next()
                        .is_some();
                    if still_needed {
                        continue;
                    }
                    if delete_if_present(self.client.as_ref(), &record_node(writer))? {
                        removed += 1;
                    }
                }
            }

            match self.client.delete(&key_dir, None) {
                Ok(()) | Err(CoordError::NotEmpty { .. } | CoordError::NoNode { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(removed)
    }
}

impl std::fmt::Debug for ValidityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValidityRegistry")
            .field("tenant", &self.paths.tenant())
            .finish_non_exhaustive()
    }
}

fn upsert(
    client: &dyn CoordinationClient,
    node: &str,
    data: &[u8],
    make_parents: bool,
) -> CoordResult<()> {
    let created = if make_parents {
        client.create_with_parents(node, data, CreateMode::Persistent)
    } else {
        client.create(node, data, CreateMode::Persistent)
    };
    match created {
        Ok(_) => Ok(()),
        Err(e) if e.is_node_exists() => client.set(node, data, None).map(|_| ()),
        Err(e) => Err(e),
    }
}

fn delete_if_present(client: &dyn CoordinationClient, node: &str) -> TxResult<bool> {
    match client.delete(node, None) {
        Ok(()) => Ok(true),
        Err(e) if e.is_no_node() => Ok(false),
        Err(e) => Err(e.into()),
    }
}
