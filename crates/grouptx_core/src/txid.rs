//! Transaction ID allocation.
//!
//! IDs come from sequential children of a tenant's counter buckets. The
//! coordination service numbers sequential children with a signed 32-bit
//! counter, so each bucket yields at most 2^31 IDs. When a bucket's counter
//! wraps the allocator moves on to the next bucket:
//!
//! ```text
//! id = manual_offset + bucket_index * 2^31 + sequence
//! ```
//!
//! Resolving an ID back to its counter node is pure arithmetic, so any
//! process can delete or inspect a transaction without reading the tree.

use crate::error::{TxError, TxResult};
use crate::paths::{TenantPaths, GROUPS_NODE, OUTCOME_NODE, XG_NODE};
use crate::records::{decode, encode, CounterRecord, TransactionOutcome};
use crate::types::{unix_millis, TransactionId};
use grouptx_coord::{path, CoordinationClient, CreateMode, Watcher};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Largest sequence number a bucket hands out (2^31 - 1).
pub const MAX_SEQUENCE: u64 = i32::MAX as u64;

/// Number of IDs covered by one counter bucket (2^31).
pub const BUCKET_SPAN: u64 = MAX_SEQUENCE + 1;

pub(crate) fn compose(offset: u64, bucket: u32, sequence: u64) -> u64 {
    offset + u64::from(bucket) * BUCKET_SPAN + sequence
}

pub(crate) fn decompose(offset: u64, txid: u64) -> Option<(u32, u64)> {
    let corrected = txid.checked_sub(offset)?;
    let bucket = u32::try_from(corrected / BUCKET_SPAN).ok()?;
    Some((bucket, corrected % BUCKET_SPAN))
}

/// Allocates, resolves and deletes one tenant's transaction IDs.
pub struct TxidAllocator {
    client: Arc<dyn CoordinationClient>,
    paths: TenantPaths,
    /// Manual offset mirrored from the `txid_offset` node.
    offset: Arc<AtomicU64>,
    /// Cleared when re-arming the offset watch failed.
    offset_watched: Arc<AtomicBool>,
    /// Cached index of the bucket new IDs come from.
    active_bucket: Mutex<Option<u32>>,
    /// Older buckets seen empty; they can never gain children again.
    inactive_buckets: Mutex<BTreeSet<u32>>,
}

impl TxidAllocator {
    /// Creates an allocator and starts watching the tenant's manual offset.
    ///
    /// # Errors
    ///
    /// Fails if the offset node cannot be read.
    pub fn new(client: Arc<dyn CoordinationClient>, paths: TenantPaths) -> TxResult<Self> {
        let allocator = Self {
            client,
            paths,
            offset: Arc::new(AtomicU64::new(0)),
            offset_watched: Arc::new(AtomicBool::new(false)),
            active_bucket: Mutex::new(None),
            inactive_buckets: Mutex::new(BTreeSet::new()),
        };
        allocator.watch_offset()?;
        Ok(allocator)
    }

    /// Returns the tenant layout.
    #[must_use]
    pub fn paths(&self) -> &TenantPaths {
        &self.paths
    }

    /// Returns the manual offset currently applied to IDs.
    #[must_use]
    pub fn offset(&self) -> u64 {
        self.offset.load(Ordering::SeqCst)
    }

    fn watch_offset(&self) -> TxResult<()> {
        arm_offset_watch(
            &self.client,
            &self.paths.offset_node(),
            &self.offset,
            &self.offset_watched,
        )
    }

    /// Stores a new manual offset for the tenant.
    ///
    /// Every allocator watching the tenant picks the value up. IDs issued
    /// before the change resolve to different counter nodes afterwards, so
    /// this is an administrative operation for empty or migrated tenants.
    pub fn set_manual_offset(&self, offset: u64) -> TxResult<()> {
        let node = self.paths.offset_node();
        let data = encode(&offset)?;
        match self.client.set(&node, &data, None) {
            Ok(_) => {}
            Err(e) if e.is_no_node() => {
                match self.client.create_with_parents(&node, &data, CreateMode::Persistent) {
                    Ok(_) => {}
                    Err(e) if e.is_node_exists() => {
                        self.client.set(&node, &data, None)?;
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            Err(e) => return Err(e.into()),
        }
        self.offset.store(offset, Ordering::SeqCst);
        info!(tenant = self.paths.tenant(), offset, "manual transaction id offset set");
        Ok(())
    }

    fn active_bucket(&self) -> TxResult<u32> {
        let mut active = self.active_bucket.lock();
        if let Some(bucket) = *active {
            return Ok(bucket);
        }
        let bucket = self.bucket_indexes()?.last().copied().unwrap_or(0);
        *active = Some(bucket);
        Ok(bucket)
    }

    fn bucket_indexes(&self) -> TxResult<Vec<u32>> {
        let children = match self.client.get_children(self.paths.base()) {
            Ok(children) => children,
            Err(e) if e.is_no_node() => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut buckets: Vec<u32> = children
            .iter()
            .filter_map(|name| TenantPaths::parse_bucket(name))
            .collect();
        buckets.sort_unstable();
        Ok(buckets)
    }

    fn advance_bucket(&self, exhausted: u32) -> TxResult<()> {
        let next = exhausted
            .checked_add(1)
            .ok_or_else(|| TxError::internal("transaction id space exhausted"))?;
        self.client.ensure_path(&self.paths.bucket_dir(next))?;
        let mut active = self.active_bucket.lock();
        if active.map_or(true, |current| current < next) {
            *active = Some(next);
        }
        info!(tenant = self.paths.tenant(), bucket = next, "rolled over to next counter bucket");
        Ok(())
    }

    /// Issues a new transaction ID.
    ///
    /// IDs are strictly increasing per tenant and `0` is never returned.
    /// A cross-group transaction gets an `xg` marker under its counter node.
    ///
    /// # Errors
    ///
    /// Returns [`TxError::NoConnection`] if the service is unreachable; the
    /// caller may retry.
    pub fn create_transaction_id(&self, xg: bool) -> TxResult<TransactionId> {
        if !self.offset_watched.load(Ordering::SeqCst) {
            self.watch_offset()?;
        }
        let record = encode(&CounterRecord {
            created_at_ms: unix_millis(),
        })?;

        loop {
            let bucket = self.active_bucket()?;
            let created = self.client.create_with_parents(
                &self.paths.counter_prefix(bucket),
                &record,
                CreateMode::PersistentSequential,
            )?;
            let sequence = TenantPaths::parse_sequence(path::basename(&created))
                .ok_or_else(|| TxError::corrupt_node(&created, "unparseable sequence number"))?;

            let sequence = match u64::try_from(sequence) {
                Ok(sequence) if sequence <= MAX_SEQUENCE => sequence,
                _ => {
                    debug!(tenant = self.paths.tenant(), bucket, "counter bucket wrapped");
                    self.discard(&created);
                    self.advance_bucket(bucket)?;
                    continue;
                }
            };

            let txid = compose(self.offset(), bucket, sequence);
            if txid == 0 {
                self.discard(&created);
                continue;
            }

            self.client
                .create(&path::join(&created, GROUPS_NODE), b"[]", CreateMode::Persistent)?;
            if xg {
                self.client
                    .create(&path::join(&created, XG_NODE), b"", CreateMode::Persistent)?;
            }
            debug!(tenant = self.paths.tenant(), txid, xg, "allocated transaction id");
            return Ok(TransactionId::new(txid));
        }
    }

    fn discard(&self, node: &str) {
        if let Err(e) = self.client.delete(node, None) {
            warn!(path = node, error = %e, "failed to discard unusable counter node");
        }
    }

    /// Returns the counter node of `txid`, computed from the ID alone.
    ///
    /// # Errors
    ///
    /// Returns [`TxError::InvalidTransaction`] for IDs below the manual offset.
    pub fn counter_path(&self, txid: TransactionId) -> TxResult<String> {
        let (bucket, sequence) = decompose(self.offset(), txid.as_u64()).ok_or_else(|| {
            TxError::invalid_transaction(txid.as_u64(), "below the manual id offset")
        })?;
        Ok(self.paths.counter_node(bucket, sequence))
    }

    /// Deletes the counter node of `txid` and everything recorded under it.
    ///
    /// Deleting an ID that is already gone succeeds.
    pub fn delete_transaction_id(&self, txid: TransactionId) -> TxResult<()> {
        let node = self.counter_path(txid)?;
        self.client.delete_recursive(&node)?;
        debug!(tenant = self.paths.tenant(), txid = txid.as_u64(), "deleted transaction id");
        Ok(())
    }

    /// Returns true if `txid` has a counter node.
    pub fn is_open(&self, txid: TransactionId) -> TxResult<bool> {
        let node = match self.counter_path(txid) {
            Ok(node) => node,
            Err(TxError::InvalidTransaction { .. }) => return Ok(false),
            Err(e) => return Err(e),
        };
        Ok(self.client.exists(&node, None)?.is_some())
    }

    /// Returns true if `txid` was issued as a cross-group transaction.
    pub fn is_xg(&self, txid: TransactionId) -> TxResult<bool> {
        let node = path::join(&self.counter_path(txid)?, XG_NODE);
        Ok(self.client.exists(&node, None)?.is_some())
    }

    /// Returns when `txid` was issued, or `None` if it is no longer open.
    pub fn created_at(&self, txid: TransactionId) -> TxResult<Option<u64>> {
        let node = self.counter_path(txid)?;
        match self.client.get(&node) {
            Ok((data, _)) => Ok(Some(decode::<CounterRecord>(&node, &data)?.created_at_ms)),
            Err(e) if e.is_no_node() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Claims the final outcome of `txid`, returning whichever outcome won.
    ///
    /// Commit and expiry race through this single create, so a transaction
    /// can never be both committed and expired.
    pub(crate) fn claim_outcome(
        &self,
        txid: TransactionId,
        outcome: TransactionOutcome,
    ) -> TxResult<TransactionOutcome> {
        let node = path::join(&self.counter_path(txid)?, OUTCOME_NODE);
        match self.client.create(&node, &encode(&outcome)?, CreateMode::Persistent) {
            Ok(_) => Ok(outcome),
            Err(e) if e.is_node_exists() => match self.client.get(&node) {
                Ok((data, _)) => decode(&node, &data),
                Err(e) if e.is_no_node() => Err(TxError::invalid_transaction(
                    txid.as_u64(),
                    "transaction is not open",
                )),
                Err(e) => Err(e.into()),
            },
            Err(e) if e.is_no_node() => Err(TxError::invalid_transaction(
                txid.as_u64(),
                "transaction is not open",
            )),
            Err(e) => Err(e.into()),
        }
    }

    /// Lists every open transaction of the tenant in ascending order.
    ///
    /// Every bucket that may still hold counter nodes is scanned. Buckets
    /// below the newest one that are found empty are skipped from then on.
    pub fn get_open_transactions(&self) -> TxResult<Vec<TransactionId>> {
        let buckets = self.bucket_indexes()?;
        let newest = buckets.last().copied();
        let offset = self.offset();
        let mut open = Vec::new();

        for bucket in buckets {
            if self.inactive_buckets.lock().contains(&bucket) {
                continue;
            }
            let children = match self.client.get_children(&self.paths.bucket_dir(bucket)) {
                Ok(children) => children,
                Err(e) if e.is_no_node() => continue,
                Err(e) => return Err(e.into()),
            };
            let before = open.len();
            open.extend(
                children
                    .iter()
                    .filter_map(|name| TenantPaths::parse_sequence(name))
                    .filter_map(|sequence| u64::try_from(sequence).ok())
                    .filter(|sequence| *sequence <= MAX_SEQUENCE)
                    .map(|sequence| TransactionId::new(compose(offset, bucket, sequence))),
            );
            if open.len() == before && Some(bucket) != newest {
                debug!(tenant = self.paths.tenant(), bucket, "counter bucket drained");
                self.inactive_buckets.lock().insert(bucket);
            }
        }

        open.sort_unstable();
        Ok(open)
    }
}

impl std::fmt::Debug for TxidAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxidAllocator")
            .field("tenant", &self.paths.tenant())
            .field("offset", &self.offset())
            .field("active_bucket", &*self.active_bucket.lock())
            .finish_non_exhaustive()
    }
}

/// Reads the offset node and leaves a watch that repeats this on change.
fn arm_offset_watch(
    client: &Arc<dyn CoordinationClient>,
    node: &str,
    offset: &Arc<AtomicU64>,
    watched: &Arc<AtomicBool>,
) -> TxResult<()> {
    let weak = Arc::downgrade(client);
    let (watch_node, watch_offset, watch_flag) =
        (node.to_string(), Arc::clone(offset), Arc::clone(watched));
    let watcher: Watcher = Box::new(move |_event| {
        let Some(client) = weak.upgrade() else {
            return;
        };
        if let Err(e) = arm_offset_watch(&client, &watch_node, &watch_offset, &watch_flag) {
            watch_flag.store(false, Ordering::SeqCst);
            warn!(path = %watch_node, error = %e, "failed to refresh manual id offset");
        }
    });

    let value = match client.exists(node, Some(watcher))? {
        None => 0,
        Some(_) => match client.get(node) {
            Ok((data, _)) => decode::<u64>(node, &data)?,
            Err(e) if e.is_no_node() => 0,
            Err(e) => return Err(e.into()),
        },
    };
    offset.store(value, Ordering::SeqCst);
    watched.store(true, Ordering::SeqCst);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use grouptx_coord::InMemoryCoordinator;
    use proptest::prelude::*;

    fn allocator(service: &InMemoryCoordinator) -> TxidAllocator {
        let client: Arc<dyn CoordinationClient> = Arc::new(service.connect());
        TxidAllocator::new(client, TenantPaths::new("/grouptx", "app")).unwrap()
    }

    #[test]
    fn first_id_is_one() {
        let service = InMemoryCoordinator::new();
        let allocator = allocator(&service);
        assert_eq!(allocator.create_transaction_id(false).unwrap().as_u64(), 1);
        assert_eq!(allocator.create_transaction_id(false).unwrap().as_u64(), 2);
    }

    #[test]
    fn xg_marker_is_recorded() {
        let service = InMemoryCoordinator::new();
        let allocator = allocator(&service);
        let plain = allocator.create_transaction_id(false).unwrap();
        let xg = allocator.create_transaction_id(true).unwrap();
        assert!(!allocator.is_xg(plain).unwrap());
        assert!(allocator.is_xg(xg).unwrap());
    }

    #[test]
    fn delete_resolves_node_from_id() {
        let service = InMemoryCoordinator::new();
        let allocator = allocator(&service);
        let txid = allocator.create_transaction_id(true).unwrap();
        assert_eq!(
            allocator.counter_path(txid).unwrap(),
            "/grouptx/apps/app/txids/tx0000000001"
        );
        assert!(allocator.is_open(txid).unwrap());

        allocator.delete_transaction_id(txid).unwrap();
        assert!(!allocator.is_open(txid).unwrap());
        // Deleting twice is fine
        allocator.delete_transaction_id(txid).unwrap();
    }

    #[test]
    fn created_at_is_recorded() {
        let service = InMemoryCoordinator::new();
        let allocator = allocator(&service);
        let txid = allocator.create_transaction_id(false).unwrap();
        assert!(allocator.created_at(txid).unwrap().is_some());
        allocator.delete_transaction_id(txid).unwrap();
        assert!(allocator.created_at(txid).unwrap().is_none());
    }

    #[test]
    fn first_outcome_claim_wins() {
        let service = InMemoryCoordinator::new();
        let allocator = allocator(&service);
        let txid = allocator.create_transaction_id(false).unwrap();

        let won = allocator
            .claim_outcome(txid, TransactionOutcome::Committed)
            .unwrap();
        assert_eq!(won, TransactionOutcome::Committed);
        let lost = allocator
            .claim_outcome(txid, TransactionOutcome::Expired)
            .unwrap();
        assert_eq!(lost, TransactionOutcome::Committed);

        allocator.delete_transaction_id(txid).unwrap();
        assert!(matches!(
            allocator.claim_outcome(txid, TransactionOutcome::Expired),
            Err(TxError::InvalidTransaction { .. })
        ));
    }

    #[test]
    fn open_transactions_are_sorted() {
        let service = InMemoryCoordinator::new();
        let allocator = allocator(&service);
        let ids: Vec<_> = (0..5)
            .map(|_| allocator.create_transaction_id(false).unwrap())
            .collect();
        allocator.delete_transaction_id(ids[2]).unwrap();

        let open = allocator.get_open_transactions().unwrap();
        assert_eq!(open, vec![ids[0], ids[1], ids[3], ids[4]]);
    }

    #[test]
    fn offset_watch_tracks_other_writers() {
        let service = InMemoryCoordinator::new();
        let first = allocator(&service);
        let second = allocator(&service);

        first.set_manual_offset(500).unwrap();
        assert_eq!(second.offset(), 500);
        assert_eq!(second.create_transaction_id(false).unwrap().as_u64(), 500);

        first.set_manual_offset(900).unwrap();
        assert_eq!(second.offset(), 900);
    }

    proptest! {
        #[test]
        fn bucket_math_inverts(
            offset in 0u64..1_000_000,
            bucket in 0u32..64,
            sequence in 0u64..=MAX_SEQUENCE,
        ) {
            let txid = compose(offset, bucket, sequence);
            prop_assert_eq!(decompose(offset, txid), Some((bucket, sequence)));
        }

        #[test]
        fn ids_below_offset_do_not_resolve(offset in 1u64..1_000_000, below in 0u64..1_000_000) {
            prop_assume!(below < offset);
            prop_assert_eq!(decompose(offset, below), None);
        }
    }
}
