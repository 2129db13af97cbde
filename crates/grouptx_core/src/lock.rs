//! Entity-group locks.
//!
//! A lock is an ephemeral node `locks/<key>` holding the owning transaction.
//! Acquisition is a single atomic create and never blocks; contention is an
//! ordinary [`LockOutcome`]. The groups a transaction has locked are listed
//! in its counter node's `groups` child, which is only updated with a
//! version check.

use crate::blacklist::Blacklist;
use crate::error::{TxError, TxResult};
use crate::paths::{TenantPaths, GROUPS_NODE};
use crate::records::{decode, encode, LockOwner};
use crate::txid::TxidAllocator;
use crate::types::{unix_millis, TransactionId};
use grouptx_coord::{path, CoordError, CoordinationClient, CreateMode};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Result of a lock attempt that did not fail outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    /// The lock was created for the caller.
    Acquired,
    /// The caller already held the lock.
    AlreadyHeld,
    /// Another transaction holds the lock.
    Conflict {
        /// The holding transaction.
        holder: TransactionId,
    },
}

impl LockOutcome {
    /// Returns true if the caller holds the lock.
    #[must_use]
    pub fn is_held(&self) -> bool {
        matches!(self, Self::Acquired | Self::AlreadyHeld)
    }

    /// Turns a conflict into [`TxError::LockConflict`].
    pub fn into_result(self) -> TxResult<()> {
        self.into_result_for("")
    }

    /// Like [`LockOutcome::into_result`], naming `key` in the error.
    pub fn into_result_for(self, key: &str) -> TxResult<()> {
        match self {
            Self::Acquired | Self::AlreadyHeld => Ok(()),
            Self::Conflict { holder } => Err(TxError::LockConflict {
                key: key.to_string(),
                holder: holder.as_u64(),
            }),
        }
    }
}

/// Acquires and releases one tenant's entity-group locks.
pub struct LockManager {
    client: Arc<dyn CoordinationClient>,
    paths: TenantPaths,
    allocator: Arc<TxidAllocator>,
    blacklist: Arc<Blacklist>,
    max_groups_per_xg: usize,
}

/// Entity groups a transaction has locked, with the node version read.
struct GroupList {
    node: String,
    groups: Vec<String>,
    version: i32,
}

impl LockManager {
    /// Creates a lock manager for one tenant.
    #[must_use]
    pub fn new(
        client: Arc<dyn CoordinationClient>,
        paths: TenantPaths,
        allocator: Arc<TxidAllocator>,
        blacklist: Arc<Blacklist>,
        max_groups_per_xg: usize,
    ) -> Self {
        Self {
            client,
            paths,
            allocator,
            blacklist,
            max_groups_per_xg,
        }
    }

    fn read_groups(&self, txid: TransactionId) -> TxResult<GroupList> {
        let node = path::join(&self.allocator.counter_path(txid)?, GROUPS_NODE);
        match self.client.get(&node) {
            Ok((data, stat)) => Ok(GroupList {
                groups: decode(&node, &data)?,
                version: stat.version,
                node,
            }),
            Err(e) if e.is_no_node() => Err(TxError::invalid_transaction(
                txid.as_u64(),
                "transaction is not open",
            )),
            Err(e) => Err(e.into()),
        }
    }

    /// Returns the entity groups `txid` has locked, in acquisition order.
    pub fn locked_groups(&self, txid: TransactionId) -> TxResult<Vec<String>> {
        Ok(self.read_groups(txid)?.groups)
    }

    fn check_admission(&self, txid: TransactionId, key: &str, list: &GroupList) -> TxResult<()> {
        if list.groups.iter().any(|group| group == key) {
            return Ok(());
        }
        if self.allocator.is_xg(txid)? {
            if list.groups.len() >= self.max_groups_per_xg {
                return Err(TxError::TooManyGroups {
                    txid: txid.as_u64(),
                    limit: self.max_groups_per_xg,
                });
            }
        } else if let Some(locked) = list.groups.first() {
            return Err(TxError::DifferentRootKey {
                txid: txid.as_u64(),
                locked: locked.clone(),
                requested: key.to_string(),
            });
        }
        Ok(())
    }

    /// Tries to lock entity group `key` for `txid`.
    ///
    /// # Errors
    ///
    /// - [`TxError::InvalidTransaction`] if `txid` is blacklisted or not open
    /// - [`TxError::ExpiredTransaction`] if the groomer expired `txid`
    /// - [`TxError::DifferentRootKey`] if a single-group transaction asks for
    ///   a second group
    /// - [`TxError::TooManyGroups`] if a cross-group transaction is at its limit
    ///
    /// Both limits count every group `txid` has ever locked. Releasing a lock
    /// does not free a slot, though the released group may be locked again.
    pub fn acquire(&self, txid: TransactionId, key: &str) -> TxResult<LockOutcome> {
        self.blacklist.ensure_usable(txid)?;
        let list = self.read_groups(txid)?;
        self.check_admission(txid, key, &list)?;

        let node = self.paths.lock_node(key);
        let owner = LockOwner {
            txid: txid.as_u64(),
            acquired_at_ms: unix_millis(),
        };
        let data = encode(&owner)?;

        let mut outcome = self.try_create(&node, &data, txid)?;
        if let Some(holder) = self.orphaned_holder(&outcome)? {
            warn!(
                tenant = self.paths.tenant(),
                key,
                holder = holder.as_u64(),
                "removing orphaned lock"
            );
            self.delete_if_owned_by(&node, holder)?;
            outcome = self.try_create(&node, &data, txid)?;
        }

        if outcome.is_held() {
            if let Err(e) = self.record_group(txid, key, list) {
                if outcome == LockOutcome::Acquired {
                    self.delete_if_owned_by(&node, txid)?;
                }
                return Err(e);
            }
        }

        debug!(tenant = self.paths.tenant(), txid = txid.as_u64(), key, ?outcome, "lock attempt");
        Ok(outcome)
    }

    fn try_create(&self, node: &str, data: &[u8], txid: TransactionId) -> TxResult<LockOutcome> {
        match self
            .client
            .create_with_parents(node, data, CreateMode::Ephemeral)
        {
            Ok(_) => Ok(LockOutcome::Acquired),
            Err(e) if e.is_node_exists() => match self.holder(node)? {
                Some(holder) if holder == txid => Ok(LockOutcome::AlreadyHeld),
                Some(holder) => Ok(LockOutcome::Conflict { holder }),
                // Released between our create and read; report it as taken
                // so the caller backs off and retries.
                None => Ok(LockOutcome::Conflict {
                    holder: TransactionId::NONE,
                }),
            },
            Err(e) => Err(e.into()),
        }
    }

    /// Returns the holder of a conflicting lock if that holder is finished.
    fn orphaned_holder(&self, outcome: &LockOutcome) -> TxResult<Option<TransactionId>> {
        let LockOutcome::Conflict { holder } = *outcome else {
            return Ok(None);
        };
        if holder.is_none() {
            return Ok(None);
        }
        if !self.allocator.is_open(holder)? || self.blacklist.contains(holder, None)? {
            return Ok(Some(holder));
        }
        Ok(None)
    }

    fn record_group(&self, txid: TransactionId, key: &str, mut list: GroupList) -> TxResult<()> {
        loop {
            if list.groups.iter().any(|group| group == key) {
                return Ok(());
            }
            self.check_admission(txid, key, &list)?;
            list.groups.push(key.to_string());
            match self
                .client
                .set(&list.node, &encode(&list.groups)?, Some(list.version))
            {
                Ok(_) => return Ok(()),
                Err(CoordError::BadVersion { .. }) => list = self.read_groups(txid)?,
                Err(e) if e.is_no_node() => {
                    return Err(TxError::invalid_transaction(
                        txid.as_u64(),
                        "transaction is not open",
                    ))
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Returns the transaction holding `key`'s lock node, if any.
    fn holder(&self, node: &str) -> TxResult<Option<TransactionId>> {
        match self.client.get(node) {
            Ok((data, _)) => Ok(Some(TransactionId::new(decode::<LockOwner>(node, &data)?.txid))),
            Err(e) if e.is_no_node() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn delete_if_owned_by(&self, node: &str, txid: TransactionId) -> TxResult<bool> {
        let (data, stat) = match self.client.get(node) {
            Ok(found) => found,
            Err(e) if e.is_no_node() => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        if decode::<LockOwner>(node, &data)?.txid != txid.as_u64() {
            return Ok(false);
        }
        match self.client.delete(node, Some(stat.version)) {
            Ok(()) => Ok(true),
            Err(e) if e.is_no_node() => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Releases `txid`'s lock on `key`.
    ///
    /// Returns false if the lock was already gone. `key` stays in the
    /// transaction's group list.
    ///
    /// # Errors
    ///
    /// Returns [`TxError::LockNotHeld`] if another transaction holds the lock.
    pub fn release(&self, txid: TransactionId, key: &str) -> TxResult<bool> {
        let node = self.paths.lock_node(key);
        match self.holder(&node)? {
            None => Ok(false),
            Some(holder) if holder != txid => Err(TxError::LockNotHeld {
                key: key.to_string(),
                txid: txid.as_u64(),
                holder: Some(holder.as_u64()),
            }),
            Some(_) => {
                let released = self.delete_if_owned_by(&node, txid)?;
                debug!(
                    tenant = self.paths.tenant(),
                    txid = txid.as_u64(),
                    key,
                    released,
                    "lock released"
                );
                Ok(released)
            }
        }
    }

    /// Releases every lock `txid` holds and returns the released groups.
    ///
    /// Groups whose lock is gone or now held by someone else are skipped.
    pub fn release_all(&self, txid: TransactionId) -> TxResult<Vec<String>> {
        let groups = match self.read_groups(txid) {
            Ok(list) => list.groups,
            Err(TxError::InvalidTransaction { .. }) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut released = Vec::with_capacity(groups.len());
        for group in groups {
            if self.delete_if_owned_by(&self.paths.lock_node(&group), txid)? {
                released.push(group);
            }
        }
        Ok(released)
    }

    /// Lists every lock node with its owner.
    pub fn locks(&self) -> TxResult<Vec<(String, LockOwner)>> {
        let dir = self.paths.locks_dir();
        let children = match self.client.get_children(&dir) {
            Ok(children) => children,
            Err(e) if e.is_no_node() => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut locks = Vec::with_capacity(children.len());
        for name in children {
            let node = path::join(&dir, &name);
            let (data, _) = match self.client.get(&node) {
                Ok(found) => found,
                Err(e) if e.is_no_node() => continue,
                Err(e) => return Err(e.into()),
            };
            let key = path::unescape(&name)
                .ok_or_else(|| TxError::corrupt_node(&node, "lock name is not a valid escape"))?;
            locks.push((key, decode(&node, &data)?));
        }
        Ok(locks)
    }

    /// Deletes `key`'s lock if it is still held by `owner`. Used by the groomer.
    pub(crate) fn break_lock(&self, key: &str, owner: TransactionId) -> TxResult<bool> {
        let broken = self.delete_if_owned_by(&self.paths.lock_node(key), owner)?;
        if broken {
            info!(tenant = self.paths.tenant(), key, txid = owner.as_u64(), "lock broken");
        }
        Ok(broken)
    }
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockManager")
            .field("tenant", &self.paths.tenant())
            .field("max_groups_per_xg", &self.max_groups_per_xg)
            .finish_non_exhaustive()
    }
}
