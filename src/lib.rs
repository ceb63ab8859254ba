//! refund-audit - Resumable, rate-limited verification of refund shipping-fee
//! claims against screenshot evidence.
//!
//! ## Architecture
//!
//! - **Checkpoint store**: task records, row sets, history and runtime logs on
//!   disk, written atomically
//! - **Client**: the `EvidenceClassifier` seam, its HTTP implementation, the
//!   rate limiter and the retrying wrapper
//! - **Pool**: one worker per running task, tracked by a registry
//! - **Pipeline**: the task runner state machine, consistency check and
//!   artifact export
//!
//! ## Task lifecycle
//!
//! `pending → running → {paused, error, completed}`, with `paused` and `error`
//! resumable from the last checkpoint. Row-level failures never stop a task;
//! they become the row's verdict.

pub mod checkpoint;
pub mod client;
pub mod models;
pub mod pipeline;
pub mod pool;

// Re-exports for convenience
pub use checkpoint::CheckpointStore;
pub use client::{Credentials, EvidenceClassifier, RateLimiter, RetryingClient, VisionClient};
pub use models::{
    AuditError, Config, ConsistencyReport, Dataset, ExportManifest, Result, RowScope, Task,
    TaskOptions, TaskSnapshot, TaskStatus,
};
pub use pipeline::{compare, Exporter, TaskRunner};
pub use pool::{Worker, WorkerRegistry};
