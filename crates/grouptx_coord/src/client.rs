//! Coordination client trait definition.

use crate::error::{CoordError, CoordResult};
use crate::path;
use std::fmt;
use uuid::Uuid;

/// Identifier of a client session.
///
/// Ephemeral nodes are owned by the session that created them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub Uuid);

impl SessionId {
    /// Creates a fresh random session ID.
    #[must_use]
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session:{}", self.0.simple())
    }
}

/// Connection state of a client session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// The session is live and requests are served.
    Connected,
    /// The service is unreachable; the session may still recover.
    Disconnected,
    /// The service expired the session. Ephemeral nodes are gone.
    Expired,
    /// The handle was closed by its owner.
    Closed,
}

/// How a node is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    /// Plain node that outlives its creator.
    Persistent,
    /// Persistent node whose name gets a 10-digit sequence suffix.
    PersistentSequential,
    /// Node deleted when the creating session ends.
    Ephemeral,
    /// Ephemeral node with a sequence suffix.
    EphemeralSequential,
}

impl CreateMode {
    /// Returns true if the node is tied to the creating session.
    pub fn is_ephemeral(self) -> bool {
        matches!(self, CreateMode::Ephemeral | CreateMode::EphemeralSequential)
    }

    /// Returns true if the service appends a sequence number to the name.
    pub fn is_sequential(self) -> bool {
        matches!(
            self,
            CreateMode::PersistentSequential | CreateMode::EphemeralSequential
        )
    }
}

/// Metadata of a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stat {
    /// Data version, incremented by every successful `set`.
    pub version: i32,
    /// Owning session for ephemeral nodes.
    pub ephemeral_owner: Option<SessionId>,
    /// Number of direct children.
    pub num_children: usize,
}

/// Kind of change reported to a watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    /// The watched node was created.
    Created,
    /// The watched node was deleted.
    Deleted,
    /// The watched node's data changed.
    DataChanged,
}

/// A change notification delivered to a watcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    /// What happened.
    pub kind: WatchEventKind,
    /// The watched path.
    pub path: String,
}

/// A one-shot watch callback. It fires at most once; re-register to keep watching.
pub type Watcher = Box<dyn FnOnce(WatchEvent) + Send>;

/// A client handle to the coordination service.
///
/// Every method is a single atomic request. Multi-step sequences built on top
/// of these are not atomic and must be made idempotent by the caller.
///
/// # Implementors
///
/// - [`super::InMemorySession`] - For tests and simulations
pub trait CoordinationClient: Send + Sync {
    /// Creates a node and returns the path actually created.
    ///
    /// For sequential modes `path` is a prefix and the returned path carries
    /// the sequence suffix.
    ///
    /// # Errors
    ///
    /// - [`CoordError::NodeExists`] if a non-sequential node is already there
    /// - [`CoordError::NoNode`] if the parent does not exist
    /// - [`CoordError::NoChildrenForEphemerals`] if the parent is ephemeral
    fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> CoordResult<String>;

    /// Reads a node's data and metadata.
    ///
    /// # Errors
    ///
    /// Returns [`CoordError::NoNode`] if the node does not exist.
    fn get(&self, path: &str) -> CoordResult<(Vec<u8>, Stat)>;

    /// Replaces a node's data, optionally only if its version matches.
    ///
    /// # Errors
    ///
    /// - [`CoordError::NoNode`] if the node does not exist
    /// - [`CoordError::BadVersion`] if `expected_version` does not match
    fn set(&self, path: &str, data: &[u8], expected_version: Option<i32>) -> CoordResult<Stat>;

    /// Deletes a node, optionally only if its version matches.
    ///
    /// # Errors
    ///
    /// - [`CoordError::NoNode`] if the node does not exist
    /// - [`CoordError::NotEmpty`] if the node has children
    /// - [`CoordError::BadVersion`] if `expected_version` does not match
    fn delete(&self, path: &str, expected_version: Option<i32>) -> CoordResult<()>;

    /// Lists the names (not full paths) of a node's children, sorted.
    ///
    /// # Errors
    ///
    /// Returns [`CoordError::NoNode`] if the node does not exist.
    fn get_children(&self, path: &str) -> CoordResult<Vec<String>>;

    /// Returns the node's metadata if it exists, optionally leaving a watch.
    ///
    /// The watch fires once when the node is created, deleted or changed,
    /// whether or not it existed at registration time.
    fn exists(&self, path: &str, watch: Option<Watcher>) -> CoordResult<Option<Stat>>;

    /// Returns the current session ID.
    fn session_id(&self) -> SessionId;

    /// Returns the current session state.
    fn state(&self) -> SessionState;

    /// Establishes a new session, expiring the previous one.
    ///
    /// # Errors
    ///
    /// Returns [`CoordError::ConnectionLoss`] if the service is unreachable.
    fn reconnect(&self) -> CoordResult<()>;

    /// Closes the session. Its ephemeral nodes are removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the service could not be told about the close.
    fn close(&self) -> CoordResult<()>;

    /// Returns true if requests are currently being served.
    fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    /// Creates `path` and any missing ancestors as empty persistent nodes.
    ///
    /// Nodes that already exist are left untouched.
    fn ensure_path(&self, path: &str) -> CoordResult<()> {
        path::validate(path)?;
        if path == path::ROOT {
            return Ok(());
        }
        let mut current = String::new();
        for component in path[1..].split(path::SEPARATOR) {
            current.push(path::SEPARATOR);
            current.push_str(component);
            match self.create(&current, b"", CreateMode::Persistent) {
                Ok(_) => {}
                Err(CoordError::NodeExists { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Like [`CoordinationClient::create`], creating missing ancestors first.
    fn create_with_parents(&self, path: &str, data: &[u8], mode: CreateMode) -> CoordResult<String> {
        match self.create(path, data, mode) {
            Err(CoordError::NoNode { .. }) => {
                if let Some(parent) = path::parent(path) {
                    self.ensure_path(parent)?;
                }
                self.create(path, data, mode)
            }
            other => other,
        }
    }

    /// Deletes `path` and everything below it. A missing node is not an error.
    fn delete_recursive(&self, path: &str) -> CoordResult<()> {
        let children = match self.get_children(path) {
            Ok(children) => children,
            Err(CoordError::NoNode { .. }) => return Ok(()),
            Err(e) => return Err(e),
        };
        for child in children {
            self.delete_recursive(&path::join(path, &child))?;
        }
        match self.delete(path, None) {
            Ok(()) | Err(CoordError::NoNode { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }
}
