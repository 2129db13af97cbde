//! # grouptx Coordination
//!
//! Coordination-service client abstraction for grouptx.
//!
//! This crate provides the lowest-level shared-state abstraction used by the
//! transaction core. A coordination service is a hierarchical store of small
//! nodes with a handful of atomic primitives; the core never relies on any
//! other shared state.
//!
//! ## Design Principles
//!
//! - Clients expose only the primitives the core needs: create (optionally
//!   sequential and/or ephemeral), get, versioned set, versioned delete,
//!   list children and exists with a one-shot watch
//! - Clients carry an explicit session lifecycle (connect, reconnect, close);
//!   ephemeral nodes die with the session that created them
//! - Node payloads are opaque bytes
//! - Must be `Send + Sync` so one handle can serve many threads
//!
//! ## Available Implementations
//!
//! - [`InMemoryCoordinator`] - A process-local coordination service for tests
//!   and simulations. Each [`InMemorySession`] it hands out behaves like an
//!   independent client process.
//!
//! ## Example
//!
//! ```rust
//! use grouptx_coord::{CoordinationClient, CreateMode, InMemoryCoordinator};
//!
//! let service = InMemoryCoordinator::new();
//! let client = service.connect();
//! client.ensure_path("/app/counters").unwrap();
//! let created = client
//!     .create("/app/counters/tx", b"", CreateMode::PersistentSequential)
//!     .unwrap();
//! assert_eq!(created, "/app/counters/tx0000000000");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod client;
mod error;
mod memory;
pub mod path;

pub use client::{
    CoordinationClient, CreateMode, SessionId, SessionState, Stat, WatchEvent, WatchEventKind,
    Watcher,
};
pub use error::{CoordError, CoordResult};
pub use memory::{InMemoryCoordinator, InMemorySession};
