//! Error types for coordination-service operations.

use thiserror::Error;

/// Result type for coordination-service operations.
pub type CoordResult<T> = Result<T, CoordError>;

/// Errors that can occur while talking to the coordination service.
#[derive(Debug, Error)]
pub enum CoordError {
    /// The service could not be reached. The outcome of the request is unknown.
    #[error("connection to coordination service lost")]
    ConnectionLoss,

    /// The session was expired by the service; its ephemeral nodes are gone.
    #[error("session {session} expired")]
    SessionExpired {
        /// The expired session.
        session: String,
    },

    /// The client handle was closed.
    #[error("client is closed")]
    Closed,

    /// The node (or the parent of a node being created) does not exist.
    #[error("no node: {path}")]
    NoNode {
        /// The missing path.
        path: String,
    },

    /// The node already exists.
    #[error("node exists: {path}")]
    NodeExists {
        /// The existing path.
        path: String,
    },

    /// A conditional write found a different version.
    #[error("bad version for {path}: expected {expected}, found {actual}")]
    BadVersion {
        /// The node path.
        path: String,
        /// The version the caller expected.
        expected: i32,
        /// The version stored by the service.
        actual: i32,
    },

    /// The node still has children and cannot be deleted.
    #[error("node not empty: {path}")]
    NotEmpty {
        /// The node path.
        path: String,
    },

    /// Ephemeral nodes cannot have children.
    #[error("ephemeral node cannot have children: {path}")]
    NoChildrenForEphemerals {
        /// The ephemeral parent path.
        path: String,
    },

    /// The path is syntactically invalid.
    #[error("invalid path {path:?}: {reason}")]
    InvalidPath {
        /// The offending path.
        path: String,
        /// Why the path was rejected.
        reason: &'static str,
    },
}

impl CoordError {
    /// Creates a no-node error.
    pub fn no_node(path: impl Into<String>) -> Self {
        Self::NoNode { path: path.into() }
    }

    /// Creates a node-exists error.
    pub fn node_exists(path: impl Into<String>) -> Self {
        Self::NodeExists { path: path.into() }
    }

    /// Returns true if the error means the service or session is unusable.
    ///
    /// Callers may retry these once the connection is re-established.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            CoordError::ConnectionLoss | CoordError::SessionExpired { .. } | CoordError::Closed
        )
    }

    /// Returns true for [`CoordError::NoNode`].
    pub fn is_no_node(&self) -> bool {
        matches!(self, CoordError::NoNode { .. })
    }

    /// Returns true for [`CoordError::NodeExists`].
    pub fn is_node_exists(&self) -> bool {
        matches!(self, CoordError::NodeExists { .. })
    }
}
