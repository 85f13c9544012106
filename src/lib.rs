//! ledgerlens library crate
//!
//! Exposes the extraction engine so the CLI, benchmarks and integration
//! tests drive the same code paths.

pub mod api;
pub mod config;
pub mod extract;
pub mod util;
