//! Pipeline module - task runner, consistency check and artifact export.

mod consistency;
mod export;
mod runner;

pub use consistency::*;
pub use export::*;
pub use runner::*;
