//! Core data models for refund-audit.
//!
//! - `config`: TOML configuration and defaults
//! - `error`: error taxonomy shared by every layer
//! - `task`: persisted task records, snapshots, history events
//! - `row`: datasets, working rows, row listings
//! - `columns`: column lookup and identity keys
//! - `evidence`: evidence reference extraction
//! - `report`: consistency reports and export manifests

mod columns;
mod config;
mod error;
mod evidence;
mod report;
mod row;
mod task;

pub use columns::*;
pub use config::*;
pub use error::*;
pub use evidence::*;
pub use report::*;
pub use row::*;
pub use task::*;

#[cfg(test)]
pub(crate) use task::fixtures;
