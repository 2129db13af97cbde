//! The groomer lock and the grooming sweep.
//!
//! One groomer runs at a time across the whole deployment, admitted by an
//! ephemeral `groomerlock` node. While it holds the lock it reclaims, per
//! tenant:
//!
//! 1. transactions older than the maximum lifetime (blacklisted unless they
//!    already claimed a committed outcome) together with their locks
//! 2. locks whose owner is finished or blacklisted
//! 3. validity records no reader can resolve to any more
//! 4. blacklist entries past retention that predate every open transaction

use crate::config::GroomerConfig;
use crate::error::{TxError, TxResult};
use crate::manager::{Coordinator, TenantTransactions};
use crate::paths::TenantPaths;
use crate::records::{decode, encode, BlacklistReason, GroomerLockHolder, TransactionOutcome};
use crate::types::{unix_millis, TransactionId};
use grouptx_coord::{CoordinationClient, CreateMode};
use rand::Rng;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// How often a sleeping groomer checks for cancellation.
const CANCEL_CHECK_INTERVAL: Duration = Duration::from_millis(50);

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// The cluster-wide lock admitting a single groomer.
pub struct GroomerLock {
    client: Arc<dyn CoordinationClient>,
    node: String,
}

impl GroomerLock {
    /// Creates a handle on the groomer lock under `root`.
    #[must_use]
    pub fn new(client: Arc<dyn CoordinationClient>, root: &str) -> Self {
        Self {
            client,
            node: TenantPaths::groomer_lock(root),
        }
    }

    /// Makes one attempt to take the lock. Never blocks.
    ///
    /// Returns `None` if another session holds it.
    pub fn try_acquire(&self) -> TxResult<Option<GroomerLockGuard>> {
        let holder = GroomerLockHolder {
            session: self.client.session_id().to_string(),
            acquired_at_ms: unix_millis(),
        };
        match self
            .client
            .create_with_parents(&self.node, &encode(&holder)?, CreateMode::Ephemeral)
        {
            Ok(_) => {
                debug!(session = %holder.session, "groomer lock acquired");
                Ok(Some(GroomerLockGuard {
                    client: Arc::clone(&self.client),
                    node: self.node.clone(),
                    armed: true,
                }))
            }
            Err(e) if e.is_node_exists() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Returns the session currently holding the lock.
    pub fn holder(&self) -> TxResult<Option<String>> {
        match self.client.get(&self.node) {
            Ok((data, _)) => Ok(Some(decode::<GroomerLockHolder>(&self.node, &data)?.session)),
            Err(e) if e.is_no_node() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Releases the lock if this client's session holds it.
    pub fn release(&self) -> TxResult<bool> {
        release_if_owned(self.client.as_ref(), &self.node)
    }
}

impl fmt::Debug for GroomerLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GroomerLock")
            .field("node", &self.node)
            .finish_non_exhaustive()
    }
}

fn release_if_owned(client: &dyn CoordinationClient, node: &str) -> TxResult<bool> {
    let stat = match client.exists(node, None)? {
        Some(stat) => stat,
        None => return Ok(false),
    };
    if stat.ephemeral_owner != Some(client.session_id()) {
        return Ok(false);
    }
    match client.delete(node, Some(stat.version)) {
        Ok(()) => {
            debug!("groomer lock released");
            Ok(true)
        }
        Err(e) if e.is_no_node() => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Holds the groomer lock until released or dropped.
#[must_use = "the groomer lock is released when the guard is dropped"]
pub struct GroomerLockGuard {
    client: Arc<dyn CoordinationClient>,
    node: String,
    armed: bool,
}

impl GroomerLockGuard {
    /// Releases the lock, reporting failures.
    pub fn release(mut self) -> TxResult<()> {
        self.armed = false;
        release_if_owned(self.client.as_ref(), &self.node).map(|_| ())
    }

    /// Keeps the lock held after the guard is gone.
    ///
    /// The lock then lives until released through [`GroomerLock::release`]
    /// or until the session ends.
    pub fn keep(mut self) {
        self.armed = false;
    }
}

impl Drop for GroomerLockGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Err(e) = release_if_owned(self.client.as_ref(), &self.node) {
            warn!(error = %e, "failed to release groomer lock; it expires with the session");
        }
    }
}

impl fmt::Debug for GroomerLockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GroomerLockGuard")
            .field("node", &self.node)
            .field("armed", &self.armed)
            .finish_non_exhaustive()
    }
}

/// What one grooming pass reclaimed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GroomReport {
    /// Tenants visited.
    pub tenants: usize,
    /// Transactions blacklisted for exceeding their lifetime.
    pub expired_transactions: usize,
    /// Committed or aborted transactions whose leftovers were cleaned up.
    pub finished_transactions: usize,
    /// Lock nodes removed.
    pub locks_broken: usize,
    /// Validity records removed.
    pub validity_pruned: usize,
    /// Blacklist entries purged.
    pub blacklist_purged: usize,
}

impl fmt::Display for GroomReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} tenants, {} expired, {} finished, {} locks broken, {} validity records pruned, {} blacklist entries purged",
            self.tenants,
            self.expired_transactions,
            self.finished_transactions,
            self.locks_broken,
            self.validity_pruned,
            self.blacklist_purged
        )
    }
}

/// Periodically reclaims expired transactions and stale metadata.
pub struct Groomer {
    coordinator: Arc<Coordinator>,
    config: GroomerConfig,
    cancelled: AtomicBool,
}

impl Groomer {
    /// Creates a groomer over every tenant of `coordinator`.
    #[must_use]
    pub fn new(coordinator: Arc<Coordinator>, config: GroomerConfig) -> Self {
        Self {
            coordinator,
            config,
            cancelled: AtomicBool::new(false),
        }
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &GroomerConfig {
        &self.config
    }

    /// Asks a running [`Groomer::run`] loop to stop.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Returns true once [`Groomer::cancel`] was called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Runs one pass if the groomer lock is free.
    ///
    /// Returns `None` when another groomer holds the lock. The lock is
    /// released before returning, on error paths too.
    pub fn run_once(&self) -> TxResult<Option<GroomReport>> {
        let Some(guard) = self.coordinator.groomer_lock().try_acquire()? else {
            debug!("groomer lock held elsewhere");
            return Ok(None);
        };

        let mut report = GroomReport::default();
        for name in self.coordinator.tenants()? {
            let tenant = self.coordinator.tenant(&name)?;
            self.groom_tenant(&tenant, &mut report)?;
            report.tenants += 1;
        }
        guard.release()?;

        info!(%report, "grooming pass complete");
        Ok(Some(report))
    }

    /// Runs passes until cancelled, sleeping a random time up to the poll
    /// period between attempts.
    pub fn run(&self) {
        while !self.is_cancelled() {
            if let Err(e) = self.run_once() {
                warn!(error = %e, retryable = e.is_retryable(), "grooming pass failed");
            }
            self.sleep(self.next_delay());
        }
        debug!("groomer stopped");
    }

    /// Picks the wait before the next attempt.
    #[must_use]
    pub fn next_delay(&self) -> Duration {
        let upper = self.config.poll_period;
        if upper.is_zero() {
            return Duration::ZERO;
        }
        let lower = upper.min(Duration::from_secs(1));
        rand::thread_rng().gen_range(lower..=upper)
    }

    fn sleep(&self, delay: Duration) {
        let deadline = Instant::now() + delay;
        while !self.is_cancelled() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            std::thread::sleep((deadline - now).min(CANCEL_CHECK_INTERVAL));
        }
    }

    fn groom_tenant(&self, tenant: &TenantTransactions, report: &mut GroomReport) -> TxResult<()> {
        self.expire_transactions(tenant, report)?;
        self.break_orphaned_locks(tenant, report)?;
        report.validity_pruned += tenant.validity().prune(self.config.validity_retention)?;
        self.purge_blacklist(tenant, report)?;
        Ok(())
    }

    fn expire_transactions(
        &self,
        tenant: &TenantTransactions,
        report: &mut GroomReport,
    ) -> TxResult<()> {
        let lifetime = millis(self.coordinator.config().max_transaction_lifetime);
        let now = unix_millis();

        for txid in tenant.allocator().get_open_transactions()? {
            let Some(created_at) = tenant.allocator().created_at(txid)? else {
                continue;
            };
            if now.saturating_sub(created_at) < lifetime {
                continue;
            }

            let outcome = match tenant
                .allocator()
                .claim_outcome(txid, TransactionOutcome::Expired)
            {
                Ok(outcome) => outcome,
                Err(TxError::InvalidTransaction { .. }) => continue,
                Err(e) => return Err(e),
            };

            match outcome {
                TransactionOutcome::Committed => {
                    report.locks_broken += tenant.locks().release_all(txid)?.len();
                    report.finished_transactions += 1;
                }
                TransactionOutcome::Aborted => {
                    tenant.blacklist().add(txid, BlacklistReason::Failed)?;
                    report.locks_broken += tenant.locks().release_all(txid)?.len();
                    report.validity_pruned += tenant.validity().forget_transaction(txid)?;
                    report.finished_transactions += 1;
                }
                TransactionOutcome::Expired => {
                    tenant.blacklist().add(txid, BlacklistReason::Expired)?;
                    report.locks_broken += tenant.locks().release_all(txid)?.len();
                    report.validity_pruned += tenant.validity().forget_transaction(txid)?;
                    report.expired_transactions += 1;
                    info!(tenant = tenant.name(), txid = txid.as_u64(), "transaction expired");
                }
            }
            tenant.allocator().delete_transaction_id(txid)?;
        }
        Ok(())
    }

    fn break_orphaned_locks(
        &self,
        tenant: &TenantTransactions,
        report: &mut GroomReport,
    ) -> TxResult<()> {
        for (key, owner) in tenant.locks().locks()? {
            let txid = TransactionId::new(owner.txid);
            let orphaned = !tenant.allocator().is_open(txid)?
                || tenant.blacklist().contains(txid, Some(&key))?;
            if orphaned && tenant.locks().break_lock(&key, txid)? {
                report.locks_broken += 1;
            }
        }
        Ok(())
    }

    fn purge_blacklist(
        &self,
        tenant: &TenantTransactions,
        report: &mut GroomReport,
    ) -> TxResult<()> {
        let horizon = unix_millis().saturating_sub(millis(self.config.blacklist_retention));
        let oldest_open = tenant.allocator().get_open_transactions()?.first().copied();

        for (txid, entry) in tenant.blacklist().entries()? {
            if entry.blacklisted_at_ms > horizon {
                continue;
            }
            if oldest_open.is_some_and(|open| txid >= open) {
                continue;
            }
            tenant.blacklist().remove(txid)?;
            report.blacklist_purged += 1;
        }
        Ok(())
    }
}

impl fmt::Debug for Groomer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Groomer")
            .field("config", &self.config)
            .field("cancelled", &self.is_cancelled())
            .finish_non_exhaustive()
    }
}
