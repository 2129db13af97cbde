//! # grouptx Core
//!
//! Entity-group transaction coordination for a multi-tenant datastore.
//!
//! This crate provides:
//! - Transaction ID allocation from bucketed sequential counters
//! - Entity-group locks for single-group and cross-group (XG) transactions
//! - Per-key valid-version tracking
//! - Transaction blacklisting (abort propagation)
//! - The cluster-wide groomer lock and the grooming sweep
//! - A [`Coordinator`] façade composing all of the above
//!
//! All shared state lives in a coordination service reached through
//! [`grouptx_coord::CoordinationClient`]. Nothing held in process memory is
//! trusted across processes; the in-process caches here (active counter
//! bucket, manual offset) are rebuilt from the tree on demand.
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use grouptx_coord::InMemoryCoordinator;
//! use grouptx_core::{Coordinator, CoordinatorConfig};
//!
//! let service = InMemoryCoordinator::new();
//! let coordinator = Coordinator::new(Arc::new(service.connect()), CoordinatorConfig::default());
//!
//! let mut txn = coordinator.begin("guestbook", false).unwrap();
//! txn.lock("Greeting:1").unwrap().into_result().unwrap();
//! txn.record_write("Greeting:1", "Greeting:1/Comment:7").unwrap();
//! let written = txn.commit().unwrap();
//! assert_eq!(written, vec!["Greeting:1/Comment:7".to_string()]);
//!
//! let valid = coordinator
//!     .get_valid_transaction_id("guestbook", txn.id(), "Greeting:1/Comment:7")
//!     .unwrap();
//! assert_eq!(valid, txn.id());
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod blacklist;
mod config;
mod error;
mod groomer;
mod lock;
mod manager;
mod paths;
mod records;
mod txid;
mod types;
mod validity;

pub use blacklist::Blacklist;
pub use config::{CoordinatorConfig, GroomerConfig, DEFAULT_ROOT_PATH};
pub use error::{TxError, TxResult};
pub use groomer::{GroomReport, Groomer, GroomerLock, GroomerLockGuard};
pub use lock::{LockManager, LockOutcome};
pub use manager::{Coordinator, TenantTransactions, Transaction};
pub use paths::TenantPaths;
pub use records::{BlacklistEntry, BlacklistReason, LockOwner, UpdatedKey};
pub use txid::{TxidAllocator, BUCKET_SPAN, MAX_SEQUENCE};
pub use types::{TransactionId, TransactionState};
pub use validity::ValidityRegistry;

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
