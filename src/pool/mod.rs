//! Pool module - per-task workers and the registry that tracks them.

mod registry;
mod worker;

pub use registry::*;
pub use worker::*;
