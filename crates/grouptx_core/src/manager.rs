//! Transaction coordination façade.

use crate::blacklist::Blacklist;
use crate::config::CoordinatorConfig;
use crate::error::{TxError, TxResult};
use crate::groomer::GroomerLock;
use crate::lock::{LockManager, LockOutcome};
use crate::paths::TenantPaths;
use crate::records::{BlacklistReason, TransactionOutcome, UpdatedKey};
use crate::txid::TxidAllocator;
use crate::types::{TransactionId, TransactionState};
use crate::validity::ValidityRegistry;
use grouptx_coord::{path, CoordinationClient};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// The components serving one tenant.
pub struct TenantTransactions {
    paths: TenantPaths,
    allocator: Arc<TxidAllocator>,
    blacklist: Arc<Blacklist>,
    locks: LockManager,
    validity: ValidityRegistry,
}

impl TenantTransactions {
    fn open(
        client: &Arc<dyn CoordinationClient>,
        config: &CoordinatorConfig,
        tenant: &str,
    ) -> TxResult<Self> {
        let paths = TenantPaths::new(&config.root_path, tenant);
        let allocator = Arc::new(TxidAllocator::new(Arc::clone(client), paths.clone())?);
        let blacklist = Arc::new(Blacklist::new(Arc::clone(client), paths.clone()));
        let locks = LockManager::new(
            Arc::clone(client),
            paths.clone(),
            Arc::clone(&allocator),
            Arc::clone(&blacklist),
            config.max_groups_per_xg,
        );
        let validity = ValidityRegistry::new(
            Arc::clone(client),
            paths.clone(),
            Arc::clone(&allocator),
            Arc::clone(&blacklist),
        );
        Ok(Self {
            paths,
            allocator,
            blacklist,
            locks,
            validity,
        })
    }

    /// Claims the commit of `txid`.
    fn claim_commit(&self, txid: TransactionId) -> TxResult<()> {
        match self
            .allocator
            .claim_outcome(txid, TransactionOutcome::Committed)?
        {
            TransactionOutcome::Committed => Ok(()),
            TransactionOutcome::Expired => Err(TxError::ExpiredTransaction {
                txid: txid.as_u64(),
            }),
            TransactionOutcome::Aborted => Err(TxError::invalid_transaction(
                txid.as_u64(),
                "transaction was aborted",
            )),
        }
    }

    /// Claims the abort of `txid`. Returns false if it already committed.
    ///
    /// Once the counter node is gone the outcome is no longer recorded and
    /// the abort is allowed.
    fn claim_abort(&self, txid: TransactionId) -> TxResult<bool> {
        match self.allocator.claim_outcome(txid, TransactionOutcome::Aborted) {
            Ok(TransactionOutcome::Committed) => Ok(false),
            Ok(_) | Err(TxError::InvalidTransaction { .. }) => Ok(true),
            Err(e) => Err(e),
        }
    }

    /// Releases the locks of a finished transaction and deletes its ID.
    fn finish(&self, txid: TransactionId) -> TxResult<()> {
        self.locks.release_all(txid)?;
        self.allocator.delete_transaction_id(txid)
    }

    /// Returns the tenant name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.paths.tenant()
    }

    /// Returns the tenant layout.
    #[must_use]
    pub fn paths(&self) -> &TenantPaths {
        &self.paths
    }

    /// Returns the transaction ID allocator.
    #[must_use]
    pub fn allocator(&self) -> &TxidAllocator {
        &self.allocator
    }

    /// Returns the blacklist.
    #[must_use]
    pub fn blacklist(&self) -> &Blacklist {
        &self.blacklist
    }

    /// Returns the lock manager.
    #[must_use]
    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    /// Returns the validity registry.
    #[must_use]
    pub fn validity(&self) -> &ValidityRegistry {
        &self.validity
    }
}

impl std::fmt::Debug for TenantTransactions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantTransactions")
            .field("tenant", &self.name())
            .finish_non_exhaustive()
    }
}

/// Coordinates transactions for every tenant sharing a coordination tree.
///
/// The coordinator is the single entry point used by storage engines and
/// request handlers. Tenants are created implicitly on first use. Every
/// method maps to a handful of coordination requests; none of them retries
/// on its own, so a [`TxError::NoConnection`] reaches the caller unchanged.
///
/// Most callers drive transactions through [`Coordinator::begin`] and the
/// returned [`Transaction`] handle. The per-operation methods exist for
/// engines that keep transaction state themselves.
pub struct Coordinator {
    client: Arc<dyn CoordinationClient>,
    config: CoordinatorConfig,
    tenants: RwLock<HashMap<String, Arc<TenantTransactions>>>,
}

impl Coordinator {
    /// Creates a coordinator using `client` for all requests.
    #[must_use]
    pub fn new(client: Arc<dyn CoordinationClient>, config: CoordinatorConfig) -> Self {
        Self {
            client,
            config,
            tenants: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Returns the coordination client.
    #[must_use]
    pub fn client(&self) -> &Arc<dyn CoordinationClient> {
        &self.client
    }

    /// Returns the components serving `tenant`, creating them on first use.
    pub fn tenant(&self, tenant: &str) -> TxResult<Arc<TenantTransactions>> {
        if let Some(existing) = self.tenants.read().get(tenant) {
            return Ok(Arc::clone(existing));
        }
        let opened = Arc::new(TenantTransactions::open(&self.client, &self.config, tenant)?);
        let mut tenants = self.tenants.write();
        let entry = tenants
            .entry(tenant.to_string())
            .or_insert_with(|| Arc::clone(&opened));
        Ok(Arc::clone(entry))
    }

    /// Lists the tenants present in the coordination tree.
    pub fn tenants(&self) -> TxResult<Vec<String>> {
        let apps = TenantPaths::apps_dir(&self.config.root_path);
        let children = match self.client.get_children(&apps) {
            Ok(children) => children,
            Err(e) if e.is_no_node() => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut tenants = Vec::with_capacity(children.len());
        for name in children {
            let tenant = path::unescape(&name).ok_or_else(|| {
                TxError::corrupt_node(path::join(&apps, &name), "tenant name is not a valid escape")
            })?;
            tenants.push(tenant);
        }
        tenants.sort();
        Ok(tenants)
    }

    /// Returns the cluster-wide groomer lock.
    #[must_use]
    pub fn groomer_lock(&self) -> GroomerLock {
        GroomerLock::new(Arc::clone(&self.client), &self.config.root_path)
    }

    /// Starts a transaction in `tenant`.
    pub fn begin(&self, tenant: &str, xg: bool) -> TxResult<Transaction> {
        let tenant = self.tenant(tenant)?;
        let id = tenant.allocator.create_transaction_id(xg)?;
        debug!(tenant = tenant.name(), txid = id.as_u64(), xg, "transaction started");
        Ok(Transaction {
            tenant,
            id,
            xg,
            state: TransactionState::Created,
            groups: Vec::new(),
            writes: BTreeMap::new(),
        })
    }

    /// Issues a new transaction ID.
    pub fn create_transaction_id(&self, tenant: &str, xg: bool) -> TxResult<TransactionId> {
        self.tenant(tenant)?.allocator.create_transaction_id(xg)
    }

    /// Deletes a transaction ID and everything recorded under it.
    pub fn delete_transaction_id(&self, tenant: &str, txid: TransactionId) -> TxResult<()> {
        self.tenant(tenant)?.allocator.delete_transaction_id(txid)
    }

    /// Lists the tenant's open transactions in ascending order.
    pub fn get_open_transactions(&self, tenant: &str) -> TxResult<Vec<TransactionId>> {
        self.tenant(tenant)?.allocator.get_open_transactions()
    }

    /// Tries to lock entity group `key` for `txid`.
    pub fn acquire_lock(
        &self,
        tenant: &str,
        txid: TransactionId,
        key: &str,
    ) -> TxResult<LockOutcome> {
        self.tenant(tenant)?.locks.acquire(txid, key)
    }

    /// Releases `txid`'s lock on `key`. Returns false if it was already gone.
    pub fn release_lock(&self, tenant: &str, txid: TransactionId, key: &str) -> TxResult<bool> {
        self.tenant(tenant)?.locks.release(txid, key)
    }

    /// Returns true if `txid` is blacklisted.
    pub fn is_blacklisted(
        &self,
        tenant: &str,
        txid: TransactionId,
        entity_group_key: Option<&str>,
    ) -> TxResult<bool> {
        self.tenant(tenant)?.blacklist.contains(txid, entity_group_key)
    }

    /// Resolves the version of `key` a reader holding `target` should see.
    pub fn get_valid_transaction_id(
        &self,
        tenant: &str,
        target: TransactionId,
        key: &str,
    ) -> TxResult<TransactionId> {
        self.tenant(tenant)?
            .validity
            .get_valid_transaction_id(target, key)
    }

    /// Records `target` as the authoritative version of `key` as of `current`.
    pub fn register_updated_key(
        &self,
        tenant: &str,
        current: TransactionId,
        target: TransactionId,
        key: &str,
    ) -> TxResult<()> {
        self.tenant(tenant)?
            .validity
            .register_updated_key(current, target, key)
    }

    /// Returns every key `txid` registered.
    pub fn get_update_key_list(
        &self,
        tenant: &str,
        txid: TransactionId,
    ) -> TxResult<Vec<UpdatedKey>> {
        self.tenant(tenant)?.validity.get_update_key_list(txid)
    }

    /// Blacklists `txid`. Calling it again has no effect.
    ///
    /// Returns false if `txid` was already blacklisted or has already
    /// committed; a committed transaction is never blacklisted.
    pub fn notify_failed_transaction(&self, tenant: &str, txid: TransactionId) -> TxResult<bool> {
        let tenant = self.tenant(tenant)?;
        if !tenant.claim_abort(txid)? {
            debug!(tenant = tenant.name(), txid = txid.as_u64(), "already committed");
            return Ok(false);
        }
        tenant.blacklist.add(txid, BlacklistReason::Failed)
    }

    /// Commits a transaction driven through the raw interface.
    ///
    /// Call it once every written key has been registered with
    /// [`Coordinator::register_updated_key`]. The commit is claimed first,
    /// so the groomer can no longer expire the transaction; then its locks
    /// are released and its ID deleted.
    ///
    /// # Errors
    ///
    /// - [`TxError::ExpiredTransaction`] if the groomer expired it first
    /// - [`TxError::InvalidTransaction`] if it is blacklisted, was aborted
    ///   or is not open
    pub fn commit_transaction(&self, tenant: &str, txid: TransactionId) -> TxResult<()> {
        let tenant = self.tenant(tenant)?;
        tenant.blacklist.ensure_usable(txid)?;
        tenant.claim_commit(txid)?;
        info!(tenant = tenant.name(), txid = txid.as_u64(), "transaction committed");
        tenant.finish(txid)
    }

    /// Makes one attempt to take the groomer lock.
    ///
    /// The lock stays held until [`Coordinator::release_groomer_lock`] is
    /// called or this client's session ends.
    pub fn get_groomer_lock(&self) -> TxResult<bool> {
        match self.groomer_lock().try_acquire()? {
            Some(guard) => {
                guard.keep();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Releases the groomer lock if this client's session holds it.
    pub fn release_groomer_lock(&self) -> TxResult<bool> {
        self.groomer_lock().release()
    }

    /// Sets the tenant's manual transaction ID offset.
    pub fn set_manual_offset(&self, tenant: &str, offset: u64) -> TxResult<()> {
        self.tenant(tenant)?.allocator.set_manual_offset(offset)
    }

    /// Returns true if `txid` was issued as a cross-group transaction.
    pub fn is_xg(&self, tenant: &str, txid: TransactionId) -> TxResult<bool> {
        self.tenant(tenant)?.allocator.is_xg(txid)
    }
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("config", &self.config)
            .field("tenants", &self.tenants.read().len())
            .finish_non_exhaustive()
    }
}

/// A transaction driven through its lifecycle.
///
/// ```text
/// Created -> Locked -> Validating -> Committed
///                 \________________-> Aborted
/// ```
///
/// Dropping a transaction that has neither committed nor aborted aborts it.
pub struct Transaction {
    tenant: Arc<TenantTransactions>,
    id: TransactionId,
    xg: bool,
    state: TransactionState,
    /// Entity groups this handle has locked.
    groups: Vec<String>,
    /// Written key -> entity group it belongs to.
    writes: BTreeMap<String, String>,
}

impl Transaction {
    /// Returns the transaction ID.
    #[must_use]
    pub fn id(&self) -> TransactionId {
        self.id
    }

    /// Returns the tenant name.
    #[must_use]
    pub fn tenant(&self) -> &str {
        self.tenant.name()
    }

    /// Returns true for cross-group transactions.
    #[must_use]
    pub fn is_xg(&self) -> bool {
        self.xg
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Returns the entity groups locked so far.
    #[must_use]
    pub fn groups(&self) -> &[String] {
        &self.groups
    }

    fn ensure_can_move_to(&self, next: TransactionState) -> TxResult<()> {
        if self.state.can_transition_to(next) {
            Ok(())
        } else {
            Err(TxError::InvalidStateTransition {
                from: self.state,
                to: next,
            })
        }
    }

    /// Tries to lock entity group `group`.
    ///
    /// Contention is reported as [`LockOutcome::Conflict`] and leaves the
    /// transaction unchanged.
    pub fn lock(&mut self, group: &str) -> TxResult<LockOutcome> {
        self.ensure_can_move_to(TransactionState::Locked)?;
        let outcome = self.tenant.locks.acquire(self.id, group)?;
        if outcome.is_held() {
            if !self.groups.iter().any(|held| held == group) {
                self.groups.push(group.to_string());
            }
            self.state = TransactionState::Locked;
        }
        Ok(outcome)
    }

    /// Records that `key`, inside entity group `group`, was written.
    ///
    /// # Errors
    ///
    /// Returns [`TxError::LockNotHeld`] if `group` is not locked.
    pub fn record_write(&mut self, group: &str, key: &str) -> TxResult<()> {
        if self.state != TransactionState::Locked {
            return Err(TxError::InvalidStateTransition {
                from: self.state,
                to: TransactionState::Locked,
            });
        }
        if !self.groups.iter().any(|held| held == group) {
            return Err(TxError::LockNotHeld {
                key: group.to_string(),
                txid: self.id.as_u64(),
                holder: None,
            });
        }
        self.writes.insert(key.to_string(), group.to_string());
        Ok(())
    }

    /// Checks the transaction may still commit.
    ///
    /// # Errors
    ///
    /// Returns [`TxError::InvalidTransaction`] or
    /// [`TxError::ExpiredTransaction`] if it was blacklisted or reclaimed.
    pub fn validate(&mut self) -> TxResult<()> {
        self.ensure_can_move_to(TransactionState::Validating)?;
        self.check_usable()?;
        self.state = TransactionState::Validating;
        Ok(())
    }

    fn check_usable(&self) -> TxResult<()> {
        self.tenant.blacklist.ensure_usable(self.id)?;
        if !self.tenant.allocator.is_open(self.id)? {
            return Err(TxError::invalid_transaction(
                self.id.as_u64(),
                "transaction is not open",
            ));
        }
        Ok(())
    }

    /// Registers every written key as valid at this transaction, releases
    /// the locks and deletes the transaction ID.
    ///
    /// Returns the registered keys. An error before the commit is claimed
    /// leaves the transaction non-terminal, to be aborted. Once the claim is
    /// won the transaction is committed even if the cleanup after it fails;
    /// the error is still returned and the groomer removes the leftovers.
    pub fn commit(&mut self) -> TxResult<Vec<String>> {
        self.ensure_can_move_to(TransactionState::Committed)?;
        let state = self.state;
        match state {
            TransactionState::Locked => self.validate()?,
            TransactionState::Created => self.check_usable()?,
            _ => {}
        }

        for key in self.writes.keys() {
            self.tenant
                .validity
                .register_updated_key(self.id, self.id, key)?;
        }

        self.tenant.claim_commit(self.id)?;
        self.state = TransactionState::Committed;
        info!(
            tenant = self.tenant.name(),
            txid = self.id.as_u64(),
            keys = self.writes.len(),
            "transaction committed"
        );

        self.tenant.finish(self.id)?;
        Ok(self.writes.keys().cloned().collect())
    }

    /// Blacklists the transaction, releases its locks and deletes its ID.
    ///
    /// Returns the keys whose writes must be rolled back: those recorded on
    /// this handle plus any the transaction registered. If the commit was
    /// already claimed, the transaction is finished as committed instead and
    /// nothing needs rolling back.
    pub fn abort(&mut self) -> TxResult<Vec<String>> {
        self.ensure_can_move_to(TransactionState::Aborted)?;
        if !self.tenant.claim_abort(self.id)? {
            self.state = TransactionState::Committed;
            debug!(
                tenant = self.tenant.name(),
                txid = self.id.as_u64(),
                "abort after commit claim, finishing commit"
            );
            self.tenant.finish(self.id)?;
            return Ok(Vec::new());
        }
        self.tenant.blacklist.add(self.id, BlacklistReason::Failed)?;

        let mut keys: BTreeSet<String> = self.writes.keys().cloned().collect();
        match self.tenant.validity.get_update_key_list(self.id) {
            Ok(updated) => keys.extend(updated.into_iter().map(|u| u.key)),
            Err(TxError::InvalidTransaction { .. }) => {}
            Err(e) => return Err(e),
        }

        self.tenant.finish(self.id)?;
        self.state = TransactionState::Aborted;
        info!(
            tenant = self.tenant.name(),
            txid = self.id.as_u64(),
            keys = keys.len(),
            "transaction aborted"
        );
        Ok(keys.into_iter().collect())
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        if let Err(e) = self.abort() {
            warn!(
                tenant = self.tenant.name(),
                txid = self.id.as_u64(),
                error = %e,
                "failed to abort dropped transaction"
            );
        }
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("tenant", &self.tenant.name())
            .field("id", &self.id)
            .field("xg", &self.xg)
            .field("state", &self.state)
            .field("groups", &self.groups)
            .field("writes", &self.writes.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paths::OUTCOME_NODE;
    use grouptx_coord::InMemoryCoordinator;

    fn coordinator(service: &InMemoryCoordinator) -> Coordinator {
        Coordinator::new(Arc::new(service.connect()), CoordinatorConfig::default())
    }

    #[test]
    fn tenants_are_created_lazily() {
        let service = InMemoryCoordinator::new();
        let coordinator = coordinator(&service);
        assert!(coordinator.tenants().unwrap().is_empty());

        coordinator.create_transaction_id("b app", false).unwrap();
        coordinator.create_transaction_id("a", false).unwrap();
        assert_eq!(
            coordinator.tenants().unwrap(),
            vec!["a".to_string(), "b app".to_string()]
        );
    }

    #[test]
    fn tenant_handles_are_shared() {
        let service = InMemoryCoordinator::new();
        let coordinator = coordinator(&service);
        let first = coordinator.tenant("app").unwrap();
        let second = coordinator.tenant("app").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn tenants_are_isolated() {
        let service = InMemoryCoordinator::new();
        let coordinator = coordinator(&service);
        let a = coordinator.create_transaction_id("a", false).unwrap();
        let b = coordinator.create_transaction_id("b", false).unwrap();
        assert_eq!(a, b);

        coordinator.acquire_lock("a", a, "k").unwrap();
        assert_eq!(
            coordinator.acquire_lock("b", b, "k").unwrap(),
            LockOutcome::Acquired
        );
        coordinator.notify_failed_transaction("a", a).unwrap();
        assert!(!coordinator.is_blacklisted("b", b, None).unwrap());
    }

    #[test]
    fn commit_registers_writes_and_cleans_up() {
        let service = InMemoryCoordinator::new();
        let coordinator = coordinator(&service);
        let mut txn = coordinator.begin("app", false).unwrap();
        let id = txn.id();

        assert_eq!(txn.lock("g").unwrap(), LockOutcome::Acquired);
        txn.record_write("g", "g/k2").unwrap();
        txn.record_write("g", "g/k1").unwrap();
        let keys = txn.commit().unwrap();

        assert_eq!(keys, vec!["g/k1".to_string(), "g/k2".to_string()]);
        assert_eq!(txn.state(), TransactionState::Committed);
        assert!(coordinator.get_open_transactions("app").unwrap().is_empty());
        assert!(coordinator.tenant("app").unwrap().locks().locks().unwrap().is_empty());
        assert_eq!(
            coordinator.get_valid_transaction_id("app", id, "g/k1").unwrap(),
            id
        );
    }

    #[test]
    fn abort_blacklists_and_reports_keys() {
        let service = InMemoryCoordinator::new();
        let coordinator = coordinator(&service);
        let mut txn = coordinator.begin("app", false).unwrap();
        let id = txn.id();
        txn.lock("g").unwrap();
        txn.record_write("g", "g/k").unwrap();

        assert_eq!(txn.abort().unwrap(), vec!["g/k".to_string()]);
        assert!(coordinator.is_blacklisted("app", id, None).unwrap());
        assert!(matches!(
            txn.commit(),
            Err(TxError::InvalidStateTransition { .. })
        ));
    }

    #[test]
    fn write_outside_locked_group_is_rejected() {
        let service = InMemoryCoordinator::new();
        let coordinator = coordinator(&service);
        let mut txn = coordinator.begin("app", true).unwrap();
        assert!(matches!(
            txn.record_write("g", "g/k"),
            Err(TxError::InvalidStateTransition { .. })
        ));
        txn.lock("g").unwrap();
        assert!(matches!(
            txn.record_write("h", "h/k"),
            Err(TxError::LockNotHeld { .. })
        ));
    }

    #[test]
    fn conflict_leaves_transaction_unlocked() {
        let service = InMemoryCoordinator::new();
        let coordinator = coordinator(&service);
        let mut first = coordinator.begin("app", false).unwrap();
        let mut second = coordinator.begin("app", false).unwrap();

        first.lock("g").unwrap();
        let outcome = second.lock("g").unwrap();
        assert_eq!(outcome, LockOutcome::Conflict { holder: first.id() });
        assert_eq!(second.state(), TransactionState::Created);
    }

    #[test]
    fn dropped_transaction_is_aborted() {
        let service = InMemoryCoordinator::new();
        let coordinator = coordinator(&service);
        let id = {
            let mut txn = coordinator.begin("app", false).unwrap();
            txn.lock("g").unwrap();
            txn.id()
        };
        assert!(coordinator.is_blacklisted("app", id, None).unwrap());
        let other = coordinator.create_transaction_id("app", false).unwrap();
        assert_eq!(
            coordinator.acquire_lock("app", other, "g").unwrap(),
            LockOutcome::Acquired
        );
    }

    #[test]
    fn commit_survives_cleanup_failure() {
        let service = InMemoryCoordinator::new();
        let coordinator = coordinator(&service);
        let tenant = coordinator.tenant("app").unwrap();
        let id = {
            let mut txn = coordinator.begin("app", false).unwrap();
            txn.lock("g").unwrap();
            txn.record_write("g", "g/k").unwrap();

            let outcome = path::join(
                &tenant.allocator().counter_path(txn.id()).unwrap(),
                OUTCOME_NODE,
            );
            let unreachable = service.clone();
            coordinator
                .client()
                .exists(
                    &outcome,
                    Some(Box::new(move |_| unreachable.set_available(false))),
                )
                .unwrap();

            assert!(matches!(txn.commit(), Err(TxError::NoConnection { .. })));
            assert_eq!(txn.state(), TransactionState::Committed);
            service.set_available(true);
            txn.id()
        };

        assert!(!coordinator.is_blacklisted("app", id, None).unwrap());
        assert_eq!(
            coordinator.get_valid_transaction_id("app", id, "g/k").unwrap(),
            id
        );
    }

    #[test]
    fn abort_after_commit_claim_finishes_commit() {
        let service = InMemoryCoordinator::new();
        let coordinator = coordinator(&service);
        let tenant = coordinator.tenant("app").unwrap();
        let mut txn = coordinator.begin("app", false).unwrap();
        txn.lock("g").unwrap();
        txn.record_write("g", "g/k").unwrap();
        tenant
            .allocator()
            .claim_outcome(txn.id(), TransactionOutcome::Committed)
            .unwrap();

        assert!(txn.abort().unwrap().is_empty());
        assert_eq!(txn.state(), TransactionState::Committed);
        assert!(!coordinator.is_blacklisted("app", txn.id(), None).unwrap());
        assert!(coordinator.get_open_transactions("app").unwrap().is_empty());
        assert!(tenant.locks().locks().unwrap().is_empty());
    }

    #[test]
    fn failure_notice_after_commit_is_ignored() {
        let service = InMemoryCoordinator::new();
        let coordinator = coordinator(&service);
        let id = coordinator.create_transaction_id("app", false).unwrap();
        coordinator.acquire_lock("app", id, "g").unwrap();
        coordinator.register_updated_key("app", id, id, "g/k").unwrap();
        let tenant = coordinator.tenant("app").unwrap();
        tenant
            .allocator()
            .claim_outcome(id, TransactionOutcome::Committed)
            .unwrap();

        assert!(!coordinator.notify_failed_transaction("app", id).unwrap());
        assert!(!coordinator.is_blacklisted("app", id, None).unwrap());
    }

    #[test]
    fn raw_commit_is_refused_after_failure_notice() {
        let service = InMemoryCoordinator::new();
        let coordinator = coordinator(&service);
        let id = coordinator.create_transaction_id("app", false).unwrap();
        assert!(coordinator.notify_failed_transaction("app", id).unwrap());
        assert!(matches!(
            coordinator.commit_transaction("app", id),
            Err(TxError::InvalidTransaction { .. })
        ));
    }

    #[test]
    fn groomer_lock_round_trip() {
        let service = InMemoryCoordinator::new();
        let first = coordinator(&service);
        let second = coordinator(&service);

        assert!(first.get_groomer_lock().unwrap());
        assert!(!second.get_groomer_lock().unwrap());
        assert!(!second.release_groomer_lock().unwrap());
        assert!(first.release_groomer_lock().unwrap());
        assert!(second.get_groomer_lock().unwrap());
    }
}
