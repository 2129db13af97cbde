//! In-memory coordination service for tests and simulations.

use crate::client::{
    CoordinationClient, CreateMode, SessionId, SessionState, Stat, WatchEvent, WatchEventKind,
    Watcher,
};
use crate::error::{CoordError, CoordResult};
use crate::path;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

type Fired = Vec<(Watcher, WatchEvent)>;

#[derive(Debug)]
struct Node {
    data: Vec<u8>,
    version: i32,
    ephemeral_owner: Option<SessionId>,
    /// Suffix handed to the next sequential child. Wraps like a signed 32-bit counter.
    next_sequence: i32,
}

impl Node {
    fn new(data: Vec<u8>, ephemeral_owner: Option<SessionId>) -> Self {
        Self {
            data,
            version: 0,
            ephemeral_owner,
            next_sequence: 0,
        }
    }
}

struct Tree {
    nodes: BTreeMap<String, Node>,
    live_sessions: HashSet<SessionId>,
    watches: HashMap<String, Vec<Watcher>>,
}

impl Tree {
    fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(path::ROOT.to_string(), Node::new(Vec::new(), None));
        Self {
            nodes,
            live_sessions: HashSet::new(),
            watches: HashMap::new(),
        }
    }

    fn children_of(&self, parent: &str) -> Vec<String> {
        let prefix = if parent == path::ROOT {
            path::ROOT.to_string()
        } else {
            format!("{parent}/")
        };
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .map(|(key, _)| &key[prefix.len()..])
            .filter(|rest| !rest.is_empty() && !rest.contains(path::SEPARATOR))
            .map(str::to_string)
            .collect()
    }

    fn stat(&self, node_path: &str) -> Option<Stat> {
        let node = self.nodes.get(node_path)?;
        Some(Stat {
            version: node.version,
            ephemeral_owner: node.ephemeral_owner,
            num_children: self.children_of(node_path).len(),
        })
    }

    fn trigger(&mut self, node_path: &str, kind: WatchEventKind, fired: &mut Fired) {
        if let Some(watchers) = self.watches.remove(node_path) {
            for watcher in watchers {
                let event = WatchEvent {
                    kind,
                    path: node_path.to_string(),
                };
                fired.push((watcher, event));
            }
        }
    }

    fn expire(&mut self, session: SessionId, fired: &mut Fired) {
        if !self.live_sessions.remove(&session) {
            return;
        }
        let owned: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.ephemeral_owner == Some(session))
            .map(|(key, _)| key.clone())
            .collect();
        debug!(%session, ephemerals = owned.len(), "expiring session");
        for key in owned {
            self.nodes.remove(&key);
            self.trigger(&key, WatchEventKind::Deleted, fired);
        }
    }
}

struct Shared {
    tree: Mutex<Tree>,
    available: AtomicBool,
}

fn fire(fired: Fired) {
    for (watcher, event) in fired {
        watcher(event);
    }
}

/// A process-local coordination service.
///
/// The service owns the node tree. Clients are obtained with
/// [`InMemoryCoordinator::connect`]; every [`InMemorySession`] has its own
/// session, so ephemeral nodes created through one session disappear when
/// that session is closed or expired, exactly as they would if the owning
/// process died.
///
/// Sequential children are numbered from a per-parent signed 32-bit counter,
/// zero-padded to 10 digits. After `2147483647` the counter wraps to a
/// negative value.
///
/// # Thread Safety
///
/// The service and its sessions can be shared across threads. Watch
/// callbacks run on the thread that performed the triggering request, after
/// the tree lock has been released.
///
/// # Example
///
/// ```rust
/// use grouptx_coord::{CoordinationClient, CreateMode, InMemoryCoordinator};
///
/// let service = InMemoryCoordinator::new();
/// let a = service.connect();
/// let b = service.connect();
///
/// a.create("/lock", b"a", CreateMode::Ephemeral).unwrap();
/// assert!(b.create("/lock", b"b", CreateMode::Ephemeral).is_err());
///
/// a.close().unwrap();
/// assert!(b.create("/lock", b"b", CreateMode::Ephemeral).is_ok());
/// ```
#[derive(Clone)]
pub struct InMemoryCoordinator {
    shared: Arc<Shared>,
}

impl InMemoryCoordinator {
    /// Creates a service holding only the root node.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                tree: Mutex::new(Tree::new()),
                available: AtomicBool::new(true),
            }),
        }
    }

    /// Opens a new client session.
    #[must_use]
    pub fn connect(&self) -> InMemorySession {
        let session = SessionId::random();
        self.shared.tree.lock().live_sessions.insert(session);
        debug!(%session, "session opened");
        InMemorySession {
            shared: Arc::clone(&self.shared),
            session: Mutex::new(session),
            closed: AtomicBool::new(false),
        }
    }

    /// Makes the service reachable or unreachable for every session.
    ///
    /// While unreachable every request fails with [`CoordError::ConnectionLoss`]
    /// and sessions keep their ephemeral nodes.
    pub fn set_available(&self, available: bool) {
        self.shared.available.store(available, Ordering::SeqCst);
    }

    /// Returns true if requests are being served.
    #[must_use]
    pub fn is_available(&self) -> bool {
        self.shared.available.load(Ordering::SeqCst)
    }

    /// Expires a session as if its owner crashed.
    pub fn expire_session(&self, session: SessionId) {
        let mut fired = Vec::new();
        self.shared.tree.lock().expire(session, &mut fired);
        fire(fired);
    }

    /// Overrides the next sequence number handed out under `parent`.
    ///
    /// # Errors
    ///
    /// Returns [`CoordError::NoNode`] if `parent` does not exist.
    pub fn set_next_sequence(&self, parent: &str, next: i32) -> CoordResult<()> {
        let mut tree = self.shared.tree.lock();
        let node = tree
            .nodes
            .get_mut(parent)
            .ok_or_else(|| CoordError::no_node(parent))?;
        node.next_sequence = next;
        Ok(())
    }

    /// Returns the number of nodes, including the root.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.shared.tree.lock().nodes.len()
    }

    /// Returns the number of live sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.shared.tree.lock().live_sessions.len()
    }

    /// Returns every node path with its data, in path order.
    #[must_use]
    pub fn dump(&self) -> Vec<(String, Vec<u8>)> {
        self.shared
            .tree
            .lock()
            .nodes
            .iter()
            .map(|(key, node)| (key.clone(), node.data.clone()))
            .collect()
    }
}

impl Default for InMemoryCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for InMemoryCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryCoordinator")
            .field("nodes", &self.node_count())
            .field("available", &self.is_available())
            .finish_non_exhaustive()
    }
}

/// A client session of an [`InMemoryCoordinator`].
pub struct InMemorySession {
    shared: Arc<Shared>,
    session: Mutex<SessionId>,
    closed: AtomicBool,
}

impl InMemorySession {
    /// Runs `op` against the tree after checking the session is usable, then
    /// delivers any watch events it triggered.
    fn with_tree<T>(
        &self,
        op: impl FnOnce(&mut Tree, SessionId, &mut Fired) -> CoordResult<T>,
    ) -> CoordResult<T> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CoordError::Closed);
        }
        if !self.shared.available.load(Ordering::SeqCst) {
            return Err(CoordError::ConnectionLoss);
        }
        let mut fired = Vec::new();
        let result = {
            let mut tree = self.shared.tree.lock();
            let session = *self.session.lock();
            if !tree.live_sessions.contains(&session) {
                return Err(CoordError::SessionExpired {
                    session: session.to_string(),
                });
            }
            op(&mut tree, session, &mut fired)
        };
        fire(fired);
        result
    }
}

fn check_version(node_path: &str, node: &Node, expected: Option<i32>) -> CoordResult<()> {
    match expected {
        Some(expected) if expected != node.version => Err(CoordError::BadVersion {
            path: node_path.to_string(),
            expected,
            actual: node.version,
        }),
        _ => Ok(()),
    }
}

impl CoordinationClient for InMemorySession {
    fn create(&self, node_path: &str, data: &[u8], mode: CreateMode) -> CoordResult<String> {
        path::validate(node_path)?;
        let parent = path::parent(node_path).ok_or_else(|| CoordError::node_exists(node_path))?;
        self.with_tree(|tree, session, fired| {
            let parent_node = tree
                .nodes
                .get_mut(parent)
                .ok_or_else(|| CoordError::no_node(parent))?;
            if parent_node.ephemeral_owner.is_some() {
                return Err(CoordError::NoChildrenForEphemerals {
                    path: parent.to_string(),
                });
            }

            let actual = if mode.is_sequential() {
                let sequence = parent_node.next_sequence;
                parent_node.next_sequence = sequence.wrapping_add(1);
                format!("{node_path}{sequence:010}")
            } else {
                node_path.to_string()
            };

            if tree.nodes.contains_key(&actual) {
                return Err(CoordError::node_exists(actual));
            }

            let owner = mode.is_ephemeral().then_some(session);
            tree.nodes.insert(actual.clone(), Node::new(data.to_vec(), owner));
            tree.trigger(&actual, WatchEventKind::Created, fired);
            Ok(actual)
        })
    }

    fn get(&self, node_path: &str) -> CoordResult<(Vec<u8>, Stat)> {
        path::validate(node_path)?;
        self.with_tree(|tree, _, _| {
            let data = tree
                .nodes
                .get(node_path)
                .map(|node| node.data.clone())
                .ok_or_else(|| CoordError::no_node(node_path))?;
            let stat = tree
                .stat(node_path)
                .ok_or_else(|| CoordError::no_node(node_path))?;
            Ok((data, stat))
        })
    }

    fn set(&self, node_path: &str, data: &[u8], expected_version: Option<i32>) -> CoordResult<Stat> {
        path::validate(node_path)?;
        self.with_tree(|tree, _, fired| {
            let node = tree
                .nodes
                .get_mut(node_path)
                .ok_or_else(|| CoordError::no_node(node_path))?;
            check_version(node_path, node, expected_version)?;
            node.data = data.to_vec();
            node.version = node.version.wrapping_add(1);
            tree.trigger(node_path, WatchEventKind::DataChanged, fired);
            tree.stat(node_path)
                .ok_or_else(|| CoordError::no_node(node_path))
        })
    }

    fn delete(&self, node_path: &str, expected_version: Option<i32>) -> CoordResult<()> {
        path::validate(node_path)?;
        if node_path == path::ROOT {
            return Err(CoordError::InvalidPath {
                path: node_path.to_string(),
                reason: "the root cannot be deleted",
            });
        }
        self.with_tree(|tree, _, fired| {
            let node = tree
                .nodes
                .get(node_path)
                .ok_or_else(|| CoordError::no_node(node_path))?;
            check_version(node_path, node, expected_version)?;
            if !tree.children_of(node_path).is_empty() {
                return Err(CoordError::NotEmpty {
                    path: node_path.to_string(),
                });
            }
            tree.nodes.remove(node_path);
            tree.trigger(node_path, WatchEventKind::Deleted, fired);
            Ok(())
        })
    }

    fn get_children(&self, node_path: &str) -> CoordResult<Vec<String>> {
        path::validate(node_path)?;
        self.with_tree(|tree, _, _| {
            if !tree.nodes.contains_key(node_path) {
                return Err(CoordError::no_node(node_path));
            }
            Ok(tree.children_of(node_path))
        })
    }

    fn exists(&self, node_path: &str, watch: Option<Watcher>) -> CoordResult<Option<Stat>> {
        path::validate(node_path)?;
        self.with_tree(|tree, _, _| {
            if let Some(watcher) = watch {
                tree.watches
                    .entry(node_path.to_string())
                    .or_default()
                    .push(watcher);
            }
            Ok(tree.stat(node_path))
        })
    }

    fn session_id(&self) -> SessionId {
        *self.session.lock()
    }

    fn state(&self) -> SessionState {
        if self.closed.load(Ordering::SeqCst) {
            return SessionState::Closed;
        }
        let tree = self.shared.tree.lock();
        let session = *self.session.lock();
        if !tree.live_sessions.contains(&session) {
            SessionState::Expired
        } else if !self.shared.available.load(Ordering::SeqCst) {
            SessionState::Disconnected
        } else {
            SessionState::Connected
        }
    }

    fn reconnect(&self) -> CoordResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CoordError::Closed);
        }
        if !self.shared.available.load(Ordering::SeqCst) {
            return Err(CoordError::ConnectionLoss);
        }
        let mut fired = Vec::new();
        {
            let mut tree = self.shared.tree.lock();
            let mut session = self.session.lock();
            tree.expire(*session, &mut fired);
            let fresh = SessionId::random();
            tree.live_sessions.insert(fresh);
            debug!(old = %*session, new = %fresh, "session re-established");
            *session = fresh;
        }
        fire(fired);
        Ok(())
    }

    fn close(&self) -> CoordResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut fired = Vec::new();
        {
            let mut tree = self.shared.tree.lock();
            let session = *self.session.lock();
            tree.expire(session, &mut fired);
        }
        fire(fired);
        Ok(())
    }
}

impl fmt::Debug for InMemorySession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemorySession")
            .field("session", &self.session_id())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Drop for InMemorySession {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[test]
    fn create_get_set_delete() {
        let service = InMemoryCoordinator::new();
        let client = service.connect();

        assert_eq!(client.create("/a", b"one", CreateMode::Persistent).unwrap(), "/a");
        let (data, stat) = client.get("/a").unwrap();
        assert_eq!(data, b"one");
        assert_eq!(stat.version, 0);

        let stat = client.set("/a", b"two", Some(0)).unwrap();
        assert_eq!(stat.version, 1);
        assert_eq!(client.get("/a").unwrap().0, b"two");

        client.delete("/a", Some(1)).unwrap();
        assert!(client.exists("/a", None).unwrap().is_none());
    }

    #[test]
    fn create_twice_fails() {
        let service = InMemoryCoordinator::new();
        let client = service.connect();
        client.create("/a", b"", CreateMode::Persistent).unwrap();
        let result = client.create("/a", b"", CreateMode::Persistent);
        assert!(matches!(result, Err(CoordError::NodeExists { .. })));
    }

    #[test]
    fn create_without_parent_fails() {
        let service = InMemoryCoordinator::new();
        let client = service.connect();
        let result = client.create("/a/b", b"", CreateMode::Persistent);
        assert!(matches!(result, Err(CoordError::NoNode { ref path }) if path == "/a"));

        client
            .create_with_parents("/a/b/c", b"x", CreateMode::Persistent)
            .unwrap();
        assert_eq!(client.get("/a/b/c").unwrap().0, b"x");
    }

    #[test]
    fn set_with_stale_version_fails() {
        let service = InMemoryCoordinator::new();
        let client = service.connect();
        client.create("/a", b"", CreateMode::Persistent).unwrap();
        client.set("/a", b"x", None).unwrap();

        let result = client.set("/a", b"y", Some(0));
        assert!(matches!(
            result,
            Err(CoordError::BadVersion { expected: 0, actual: 1, .. })
        ));
        let result = client.delete("/a", Some(0));
        assert!(matches!(result, Err(CoordError::BadVersion { .. })));
    }

    #[test]
    fn delete_non_empty_fails() {
        let service = InMemoryCoordinator::new();
        let client = service.connect();
        client.ensure_path("/a/b").unwrap();

        let result = client.delete("/a", None);
        assert!(matches!(result, Err(CoordError::NotEmpty { .. })));

        client.delete_recursive("/a").unwrap();
        assert!(client.exists("/a", None).unwrap().is_none());
        // Deleting a missing tree is fine
        client.delete_recursive("/a").unwrap();
    }

    #[test]
    fn sequential_children_are_numbered() {
        let service = InMemoryCoordinator::new();
        let client = service.connect();
        client.ensure_path("/seq").unwrap();

        let first = client
            .create("/seq/tx", b"", CreateMode::PersistentSequential)
            .unwrap();
        let second = client
            .create("/seq/tx", b"", CreateMode::PersistentSequential)
            .unwrap();
        assert_eq!(first, "/seq/tx0000000000");
        assert_eq!(second, "/seq/tx0000000001");
        assert_eq!(
            client.get_children("/seq").unwrap(),
            vec!["tx0000000000".to_string(), "tx0000000001".to_string()]
        );
    }

    #[test]
    fn sequential_counter_wraps_negative() {
        let service = InMemoryCoordinator::new();
        let client = service.connect();
        client.ensure_path("/seq").unwrap();
        service.set_next_sequence("/seq", i32::MAX).unwrap();

        let last = client
            .create("/seq/tx", b"", CreateMode::PersistentSequential)
            .unwrap();
        assert_eq!(last, "/seq/tx2147483647");

        let wrapped = client
            .create("/seq/tx", b"", CreateMode::PersistentSequential)
            .unwrap();
        let suffix: i64 = path::basename(&wrapped)
            .trim_start_matches("tx")
            .parse()
            .unwrap();
        assert!(suffix < 0);
    }

    #[test]
    fn ephemeral_nodes_die_with_session() {
        let service = InMemoryCoordinator::new();
        let owner = service.connect();
        let observer = service.connect();

        owner.create("/lock", b"", CreateMode::Ephemeral).unwrap();
        let stat = observer.exists("/lock", None).unwrap().unwrap();
        assert_eq!(stat.ephemeral_owner, Some(owner.session_id()));

        owner.close().unwrap();
        assert_eq!(owner.state(), SessionState::Closed);
        assert!(observer.exists("/lock", None).unwrap().is_none());
        assert!(matches!(owner.get("/lock"), Err(CoordError::Closed)));
    }

    #[test]
    fn ephemeral_cannot_have_children() {
        let service = InMemoryCoordinator::new();
        let client = service.connect();
        client.create("/e", b"", CreateMode::Ephemeral).unwrap();
        let result = client.create("/e/child", b"", CreateMode::Persistent);
        assert!(matches!(result, Err(CoordError::NoChildrenForEphemerals { .. })));
    }

    #[test]
    fn expired_session_reports_expired_until_reconnect() {
        let service = InMemoryCoordinator::new();
        let client = service.connect();
        client.create("/e", b"", CreateMode::Ephemeral).unwrap();
        let old = client.session_id();

        service.expire_session(old);
        assert_eq!(client.state(), SessionState::Expired);
        assert!(matches!(
            client.get("/"),
            Err(CoordError::SessionExpired { .. })
        ));

        client.reconnect().unwrap();
        assert_ne!(client.session_id(), old);
        assert!(client.is_connected());
        assert!(client.exists("/e", None).unwrap().is_none());
    }

    #[test]
    fn unavailable_service_loses_connection() {
        let service = InMemoryCoordinator::new();
        let client = service.connect();

        service.set_available(false);
        assert_eq!(client.state(), SessionState::Disconnected);
        assert!(matches!(client.get("/"), Err(CoordError::ConnectionLoss)));
        assert!(matches!(client.reconnect(), Err(CoordError::ConnectionLoss)));

        service.set_available(true);
        assert!(client.get("/").is_ok());
    }

    #[test]
    fn watch_fires_once() {
        let service = InMemoryCoordinator::new();
        let client = service.connect();
        let hits = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&hits);
        let stat = client
            .exists(
                "/w",
                Some(Box::new(move |event| {
                    assert_eq!(event.kind, WatchEventKind::Created);
                    counter.fetch_add(1, Ordering::SeqCst);
                })),
            )
            .unwrap();
        assert!(stat.is_none());

        client.create("/w", b"", CreateMode::Persistent).unwrap();
        client.set("/w", b"x", None).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn watch_callback_may_call_back_into_client() {
        let service = InMemoryCoordinator::new();
        let client = Arc::new(service.connect());
        client.create("/w", b"1", CreateMode::Persistent).unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let (inner, sink) = (Arc::clone(&client), Arc::clone(&seen));
        client
            .exists(
                "/w",
                Some(Box::new(move |event| {
                    let (data, _) = inner.get(&event.path).unwrap();
                    sink.lock().push(data);
                })),
            )
            .unwrap();

        client.set("/w", b"2", None).unwrap();
        assert_eq!(*seen.lock(), vec![b"2".to_vec()]);
    }

    #[test]
    fn concurrent_ephemeral_create_has_one_winner() {
        let service = InMemoryCoordinator::new();
        let sessions: Vec<_> = (0..8).map(|_| Arc::new(service.connect())).collect();
        let winners = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = sessions
            .iter()
            .map(|session| {
                let session = Arc::clone(session);
                let winners = Arc::clone(&winners);
                thread::spawn(move || {
                    if session.create("/only", b"", CreateMode::Ephemeral).is_ok() {
                        winners.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(winners.load(Ordering::SeqCst), 1);
    }
}
