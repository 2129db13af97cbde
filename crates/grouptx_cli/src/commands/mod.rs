//! CLI command implementations.

pub mod allocate;
pub mod simulate;
