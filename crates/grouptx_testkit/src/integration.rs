//! Consistency harness for end-to-end tests.
//!
//! Drives transactions through a real [`Coordinator`] while keeping a
//! model of which writers committed, then checks that version resolution
//! agrees with the model.

use crate::fixtures::{TestCluster, TestProcess};
use crate::generators::WorkloadTxn;
use grouptx_core::{Coordinator, TransactionId};
use std::collections::{BTreeMap, BTreeSet};

/// A test harness tracking committed and aborted writers per key.
pub struct ConsistencyHarness {
    cluster: TestCluster,
    process: TestProcess,
    tenant: String,
    /// Key -> every writer that touched it, in issue order.
    writers: BTreeMap<String, Vec<TransactionId>>,
    aborted: BTreeSet<TransactionId>,
}

impl ConsistencyHarness {
    /// Creates a harness over a fresh cluster.
    pub fn new(tenant: &str) -> Self {
        let cluster = TestCluster::new();
        let process = cluster.process();
        Self {
            cluster,
            process,
            tenant: tenant.to_string(),
            writers: BTreeMap::new(),
            aborted: BTreeSet::new(),
        }
    }

    /// Returns the cluster the harness runs on.
    pub fn cluster(&self) -> &TestCluster {
        &self.cluster
    }

    /// Returns the coordinator the harness drives.
    pub fn coordinator(&self) -> &Coordinator {
        &self.process
    }

    /// Runs one transaction writing `keys` in `group`, then commits or
    /// aborts it. Returns its ID.
    pub fn write(&mut self, group: &str, keys: &[String], commit: bool) -> TransactionId {
        let mut txn = self
            .process
            .begin(&self.tenant, false)
            .expect("Failed to begin transaction");
        txn.lock(group)
            .and_then(|outcome| outcome.into_result_for(group))
            .expect("Failed to lock entity group");
        for key in keys {
            txn.record_write(group, key).expect("Failed to record write");
        }

        let id = txn.id();
        if commit {
            txn.commit().expect("Failed to commit");
        } else {
            txn.abort().expect("Failed to abort");
            self.aborted.insert(id);
        }
        for key in keys {
            self.writers.entry(key.clone()).or_default().push(id);
        }
        id
    }

    /// Replays a generated workload.
    pub fn run(&mut self, workload: &[WorkloadTxn]) {
        for txn in workload {
            self.write(&txn.group, &txn.keys, txn.commit);
        }
    }

    /// Returns the version a reader who saw `seen` on `key` should resolve
    /// to, according to the model.
    pub fn expected_version(&self, seen: TransactionId, key: &str) -> TransactionId {
        if !self.aborted.contains(&seen) {
            return seen;
        }
        self.writers
            .get(key)
            .into_iter()
            .flatten()
            .rev()
            .find(|writer| **writer < seen && !self.aborted.contains(writer))
            .copied()
            .unwrap_or(TransactionId::NONE)
    }

    /// Checks the coordinator resolves `seen` on `key` like the model does.
    pub fn verify(&self, seen: TransactionId, key: &str) {
        let actual = self
            .process
            .get_valid_transaction_id(&self.tenant, seen, key)
            .expect("Failed to resolve version");
        assert_eq!(
            actual,
            self.expected_version(seen, key),
            "version mismatch for {key} read at {seen}"
        );
    }

    /// Checks every key as read at its latest writer.
    pub fn verify_all(&self) {
        for (key, writers) in &self.writers {
            if let Some(latest) = writers.last() {
                self.verify(*latest, key);
            }
        }
    }

    /// Returns the number of keys written so far.
    pub fn tracked_keys(&self) -> usize {
        self.writers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(names: &[&str]) -> Vec<String> {
        names.iter().map(|k| k.to_string()).collect()
    }

    #[test]
    fn aborted_write_resolves_to_previous_commit() {
        let mut harness = ConsistencyHarness::new("guestbook");
        let a = harness.write("Greeting:1", &keys(&["key1"]), true);
        let b = harness.write("Greeting:1", &keys(&["key1"]), false);

        assert_eq!(harness.expected_version(b, "key1"), a);
        harness.verify(b, "key1");
        harness.verify_all();
    }

    #[test]
    fn key_with_only_aborted_writers_has_no_version() {
        let mut harness = ConsistencyHarness::new("guestbook");
        let b = harness.write("Greeting:1", &keys(&["key1"]), false);
        assert!(harness.expected_version(b, "key1").is_none());
        harness.verify(b, "key1");
    }

    #[test]
    fn tenant_with_special_characters() {
        let mut harness = ConsistencyHarness::new("my app/with%chars");
        harness.write("G:1", &keys(&["a", "b"]), true);
        harness.write("G:1", &keys(&["a"]), false);
        harness.verify_all();
        assert_eq!(harness.tracked_keys(), 2);
        assert_eq!(
            harness.coordinator().tenants().unwrap(),
            vec!["my app/with%chars".to_string()]
        );
    }
}
