//! Minimum-interval rate limiter for classification calls.
//!
//! One limiter belongs to one worker. Every outbound attempt, retries
//! included, takes a slot first. Slots are spaced at least `min_interval`
//! apart on a monotonic clock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

/// Spaces outbound calls by a minimum interval.
#[derive(Debug)]
pub struct RateLimiter {
    /// When the previous slot was granted
    last_slot: Mutex<Option<Instant>>,
    slots_granted: AtomicU64,
    total_wait_ms: AtomicU64,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    /// Create a limiter whose first slot is granted immediately.
    pub fn new() -> Self {
        Self {
            last_slot: Mutex::new(None),
            slots_granted: AtomicU64::new(0),
            total_wait_ms: AtomicU64::new(0),
        }
    }

    /// Wait until `min_interval` has passed since the previous slot, then
    /// take a slot.
    ///
    /// Returns the duration waited.
    pub async fn wait_for_slot(&self, min_interval: Duration) -> Duration {
        let mut last = self.last_slot.lock().await;

        let wait_time = match *last {
            Some(previous) => (previous + min_interval).saturating_duration_since(Instant::now()),
            None => Duration::ZERO,
        };

        if wait_time > Duration::ZERO {
            debug!(wait_ms = wait_time.as_millis(), "Waiting for rate limit slot");
            self.total_wait_ms
                .fetch_add(wait_time.as_millis() as u64, Ordering::Relaxed);
            tokio::time::sleep(wait_time).await;
        }

        *last = Some(Instant::now());
        self.slots_granted.fetch_add(1, Ordering::Relaxed);
        wait_time
    }

    /// Get statistics.
    pub fn stats(&self) -> RateLimiterStats {
        RateLimiterStats {
            slots_granted: self.slots_granted.load(Ordering::Relaxed),
            total_wait_secs: self.total_wait_ms.load(Ordering::Relaxed) as f64 / 1000.0,
        }
    }
}

/// Rate limiter statistics.
#[derive(Debug, Clone)]
pub struct RateLimiterStats {
    pub slots_granted: u64,
    pub total_wait_secs: f64,
}
