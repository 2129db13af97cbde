//! # grouptx Testkit
//!
//! Test utilities for grouptx.
//!
//! This crate provides:
//! - A test cluster of coordinator "processes" sharing one in-memory service
//! - Property-based test generators using proptest
//! - A consistency harness that checks version resolution against a model
//! - Stress testing utilities
//!
//! ## Usage
//!
//! ```rust
//! use grouptx_testkit::prelude::*;
//!
//! with_cluster(|cluster| {
//!     let process = cluster.process();
//!     let txid = process.create_transaction_id(TEST_TENANT, false).unwrap();
//!     assert!(!txid.is_none());
//! });
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod integration;
pub mod stress;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::integration::*;
    pub use crate::stress::*;
}

pub use fixtures::*;
pub use generators::*;
pub use integration::*;
pub use stress::*;
