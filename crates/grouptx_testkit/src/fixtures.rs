//! Test fixtures and cluster helpers.
//!
//! A [`TestCluster`] owns one in-memory coordination service. Every
//! [`TestProcess`] it hands out has its own session, so tests can model
//! several application servers sharing the service and crash them
//! individually.

use grouptx_coord::{CoordinationClient, InMemoryCoordinator, InMemorySession};
use grouptx_core::{Coordinator, CoordinatorConfig, Groomer, GroomerConfig};
use serde_json::Value;
use std::collections::BTreeMap;
use std::ops::Deref;
use std::sync::Arc;

/// Tenant name used by fixtures that need only one.
pub const TEST_TENANT: &str = "testapp";

/// An in-memory coordination service shared by test processes.
#[derive(Debug, Clone, Default)]
pub struct TestCluster {
    service: InMemoryCoordinator,
}

impl TestCluster {
    /// Creates a cluster with an empty service.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the underlying service, for fault injection.
    pub fn service(&self) -> &InMemoryCoordinator {
        &self.service
    }

    /// Starts a process with the default configuration.
    pub fn process(&self) -> TestProcess {
        self.process_with(CoordinatorConfig::default())
    }

    /// Starts a process with `config`.
    pub fn process_with(&self, config: CoordinatorConfig) -> TestProcess {
        let session = Arc::new(self.service.connect());
        let client = Arc::clone(&session) as Arc<dyn CoordinationClient>;
        TestProcess {
            coordinator: Arc::new(Coordinator::new(client, config)),
            session,
            service: self.service.clone(),
        }
    }

    /// Returns every node under `prefix` (inclusive), sorted by path.
    pub fn nodes_under(&self, prefix: &str) -> Vec<String> {
        let nested = format!("{}/", prefix.trim_end_matches('/'));
        self.service
            .dump()
            .into_iter()
            .map(|(path, _)| path)
            .filter(|path| path == prefix || path.starts_with(&nested))
            .collect()
    }

    /// Renders the whole tree as path -> payload.
    ///
    /// JSON payloads are decoded, empty payloads become `null` and anything
    /// else is shown as lossy UTF-8.
    pub fn snapshot(&self) -> BTreeMap<String, Value> {
        self.service
            .dump()
            .into_iter()
            .map(|(path, data)| {
                let value = if data.is_empty() {
                    Value::Null
                } else {
                    serde_json::from_slice(&data).unwrap_or_else(|_| {
                        Value::String(String::from_utf8_lossy(&data).into_owned())
                    })
                };
                (path, value)
            })
            .collect()
    }
}

/// One application process: a coordinator over its own session.
pub struct TestProcess {
    coordinator: Arc<Coordinator>,
    session: Arc<InMemorySession>,
    service: InMemoryCoordinator,
}

impl TestProcess {
    /// Returns a shareable handle to the coordinator.
    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    /// Returns the process's session.
    pub fn session(&self) -> &Arc<InMemorySession> {
        &self.session
    }

    /// Simulates a process crash: the session expires and every ephemeral
    /// node it owned disappears.
    pub fn crash(&self) {
        self.service.expire_session(self.session.session_id());
    }

    /// Re-establishes the session after [`TestProcess::crash`].
    pub fn reconnect(&self) {
        self.session.reconnect().expect("Failed to reconnect session");
    }

    /// Builds a groomer driven by this process.
    pub fn groomer(&self, config: GroomerConfig) -> Groomer {
        Groomer::new(Arc::clone(&self.coordinator), config)
    }
}

impl Deref for TestProcess {
    type Target = Coordinator;

    fn deref(&self) -> &Self::Target {
        &self.coordinator
    }
}

impl std::fmt::Debug for TestProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestProcess")
            .field("session", &self.session.session_id())
            .finish_non_exhaustive()
    }
}

/// Runs a closure against a fresh cluster.
pub fn with_cluster<F, R>(f: F) -> R
where
    F: FnOnce(&TestCluster) -> R,
{
    let cluster = TestCluster::new();
    f(&cluster)
}

#[cfg(test)]
mod tests {
    use super::*;
    use grouptx_core::{LockOutcome, DEFAULT_ROOT_PATH};

    #[test]
    fn processes_share_the_service() {
        with_cluster(|cluster| {
            let a = cluster.process();
            let b = cluster.process();
            let first = a.create_transaction_id(TEST_TENANT, false).unwrap();
            let second = b.create_transaction_id(TEST_TENANT, false).unwrap();
            assert!(second > first);
            assert_eq!(
                a.get_open_transactions(TEST_TENANT).unwrap(),
                vec![first, second]
            );
        });
    }

    #[test]
    fn crash_drops_ephemeral_locks() {
        with_cluster(|cluster| {
            let a = cluster.process();
            let b = cluster.process();
            let held = a.create_transaction_id(TEST_TENANT, false).unwrap();
            let waiting = b.create_transaction_id(TEST_TENANT, false).unwrap();
            a.acquire_lock(TEST_TENANT, held, "g").unwrap();
            assert_eq!(
                b.acquire_lock(TEST_TENANT, waiting, "g").unwrap(),
                LockOutcome::Conflict { holder: held }
            );

            a.crash();
            assert_eq!(
                b.acquire_lock(TEST_TENANT, waiting, "g").unwrap(),
                LockOutcome::Acquired
            );

            a.reconnect();
            assert!(a.create_transaction_id(TEST_TENANT, false).is_ok());
        });
    }

    #[test]
    fn snapshot_decodes_payloads() {
        with_cluster(|cluster| {
            let process = cluster.process();
            process.create_transaction_id(TEST_TENANT, true).unwrap();

            let base = format!("{DEFAULT_ROOT_PATH}/apps/{TEST_TENANT}");
            let snapshot = cluster.snapshot();
            let counter = format!("{base}/txids/tx0000000001");
            assert!(snapshot[&counter].is_object());
            assert_eq!(snapshot[&format!("{counter}/groups")], serde_json::json!([]));
            assert_eq!(snapshot[&format!("{counter}/xg")], Value::Null);

            let nodes = cluster.nodes_under(&counter);
            assert_eq!(nodes.len(), 3);
        });
    }
}
