//! Durable, crash-safe persistence of task state.
//!
//! Provides `CheckpointStore`: task records, working rows, source snapshots,
//! operation history and per-task runtime logs.

mod store;

pub use store::*;
pub(crate) use store::{replace_atomic, write_atomic};
