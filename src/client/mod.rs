//! Classification service client module.
//!
//! - `classifier`: the `EvidenceClassifier` seam and credentials
//! - `vision`: reqwest implementation for OpenAI-compatible endpoints
//! - `verdict`: prompt and reply parsing
//! - `retry`: retry/backoff wrapper that never fails
//! - `rate_limiter`: minimum spacing between calls

mod classifier;
mod rate_limiter;
mod retry;
mod verdict;
mod vision;

pub use classifier::*;
pub use rate_limiter::*;
pub use retry::*;
pub use verdict::*;
pub use vision::*;

#[cfg(test)]
pub(crate) use classifier::testing;
