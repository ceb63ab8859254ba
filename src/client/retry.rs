//! One verification call with bounded retry.
//!
//! `RetryingClient::call` never fails: every outcome, including exhausted
//! retries and non-retryable service errors, comes back as a [`CallResult`].

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::verdict::parse_reply;
use super::{ClassifyRequest, Credentials, EvidenceClassifier, RateLimiter};
use crate::models::{MatchVerdict, RateConfig, ServiceError};

/// Retry bounds derived from a task's rate configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    /// Minimum spacing between attempts
    pub min_interval: Duration,
}

impl RetryPolicy {
    pub fn from_rate(rate: &RateConfig) -> Self {
        Self {
            max_retries: rate.max_retries,
            backoff_base: secs(rate.backoff_base_sec),
            backoff_cap: secs(rate.backoff_cap_sec),
            min_interval: secs(rate.min_interval_sec),
        }
    }

    /// Delay after failed attempt `attempt` (0-based): `base * 2^attempt`,
    /// capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2f64.powi(attempt.min(31) as i32);
        let delay = self.backoff_base.as_secs_f64() * factor;
        secs(delay).min(self.backoff_cap)
    }
}

fn secs(value: f64) -> Duration {
    if value.is_finite() && value > 0.0 {
        Duration::try_from_secs_f64(value).unwrap_or(Duration::MAX)
    } else {
        Duration::ZERO
    }
}

/// Terminal outcome of one row's verification.
#[derive(Debug, Clone, PartialEq)]
pub struct CallResult {
    pub extracted_amount: Option<f64>,
    pub verdict: MatchVerdict,
    pub reason: String,
    /// Calls made to the service
    pub attempts: u32,
}

impl CallResult {
    fn failed(error: &ServiceError, attempts: u32) -> Self {
        Self {
            extracted_amount: None,
            verdict: MatchVerdict::Unknown,
            reason: format!("error: {error}"),
            attempts,
        }
    }
}

/// Classifier wrapped with rate limiting, retry and reply parsing.
pub struct RetryingClient {
    classifier: Arc<dyn EvidenceClassifier>,
    limiter: RateLimiter,
}

impl RetryingClient {
    pub fn new(classifier: Arc<dyn EvidenceClassifier>) -> Self {
        Self {
            classifier,
            limiter: RateLimiter::new(),
        }
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Verify one request, retrying transient failures.
    ///
    /// At most `max_retries + 1` calls are made, each after a rate limiter
    /// slot.
    pub async fn call(
        &self,
        request: &ClassifyRequest,
        credentials: &Credentials,
        policy: &RetryPolicy,
    ) -> CallResult {
        let mut attempt: u32 = 0;

        loop {
            self.limiter.wait_for_slot(policy.min_interval).await;

            let outcome = self
                .classifier
                .classify(request, credentials)
                .await
                .and_then(|raw| parse_reply(&raw, request.expected_amount));
            let calls = attempt + 1;

            let error = match outcome {
                Ok(parsed) => {
                    return CallResult {
                        extracted_amount: parsed.paid_amount,
                        verdict: parsed.verdict,
                        reason: parsed.reason,
                        attempts: calls,
                    }
                }
                Err(e) => e,
            };

            if !error.is_retryable() {
                warn!(error = %error, attempts = calls, "Classification failed, not retrying");
                return CallResult::failed(&error, calls);
            }

            if attempt >= policy.max_retries {
                warn!(error = %error, attempts = calls, "Classification retries exhausted");
                return CallResult::failed(&error, calls);
            }

            let mut backoff = policy.backoff(attempt);
            if let Some(hint) = error.retry_after() {
                backoff = backoff.max(secs(hint).min(policy.backoff_cap));
            }
            debug!(
                attempt,
                backoff_ms = backoff.as_millis(),
                error = %error,
                "Retrying classification"
            );
            tokio::time::sleep(backoff).await;
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::classifier::testing::ScriptedClassifier;

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            backoff_base: Duration::from_millis(1),
            backoff_cap: Duration::from_millis(20),
            min_interval: Duration::ZERO,
        }
    }

    fn request(url: &str) -> ClassifyRequest {
        ClassifyRequest {
            model: "vision-test".into(),
            evidence: vec![url.to_string()],
            expected_amount: 6.0,
        }
    }

    fn creds() -> Credentials {
        Credentials::new("sk-test").unwrap()
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let p = RetryPolicy {
            max_retries: 10,
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(60),
            min_interval: Duration::ZERO,
        };
        assert_eq!(p.backoff(0), Duration::from_secs(1));
        assert_eq!(p.backoff(3), Duration::from_secs(8));
        assert_eq!(p.backoff(6), Duration::from_secs(60));
        assert_eq!(p.backoff(40), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_busy_then_success() {
        let fake = Arc::new(ScriptedClassifier::new());
        fake.script(
            "u1",
            vec![
                Err(ServiceError::Busy { status: 503 }),
                Err(ServiceError::Busy { status: 503 }),
                ScriptedClassifier::matching_reply(6.0),
            ],
        );
        let client = RetryingClient::new(fake.clone());

        let result = client.call(&request("u1"), &creds(), &policy(4)).await;
        assert_eq!(result.verdict, MatchVerdict::Matched);
        assert_eq!(result.attempts, 3);
        assert_eq!(fake.call_count(), 3);
        assert_eq!(client.rate_limiter().stats().slots_granted, 3);
    }

    #[tokio::test]
    async fn test_exhaustion_makes_max_retries_plus_one_calls() {
        let fake = Arc::new(ScriptedClassifier::new());
        fake.script(
            "u1",
            (0..10)
                .map(|_| Err(ServiceError::RateLimited { retry_after_secs: None }))
                .collect(),
        );
        let client = RetryingClient::new(fake.clone());

        let result = client.call(&request("u1"), &creds(), &policy(2)).await;
        assert_eq!(fake.call_count(), 3);
        assert_eq!(result.attempts, 3);
        assert_eq!(result.verdict, MatchVerdict::Unknown);
        assert!(result.reason.starts_with("error: "));
    }

    #[tokio::test]
    async fn test_auth_failure_is_not_retried() {
        let fake = Arc::new(ScriptedClassifier::new());
        fake.script("u1", vec![Err(ServiceError::AuthenticationFailed)]);
        let client = RetryingClient::new(fake.clone());

        let result = client.call(&request("u1"), &creds(), &policy(4)).await;
        assert_eq!(fake.call_count(), 1);
        assert_eq!(result.attempts, 1);
        assert!(result.reason.contains("authentication failed"));
    }

    #[tokio::test]
    async fn test_garbled_reply_is_retried() {
        let fake = Arc::new(ScriptedClassifier::new());
        fake.script(
            "u1",
            vec![
                Ok("sorry, no idea".to_string()),
                Ok(r#"{"paid_amount": 9, "is_match": false, "reason": "运费9元"}"#.to_string()),
            ],
        );
        let client = RetryingClient::new(fake.clone());

        let result = client.call(&request("u1"), &creds(), &policy(4)).await;
        assert_eq!(result.attempts, 2);
        assert_eq!(result.verdict, MatchVerdict::Mismatched);
        assert_eq!(result.extracted_amount, Some(9.0));
        assert_eq!(result.reason, "运费9元");
    }

    #[tokio::test]
    async fn test_zero_retries_means_one_call() {
        let fake = Arc::new(ScriptedClassifier::new());
        fake.script("u1", vec![Err(ServiceError::Network("reset".into()))]);
        let client = RetryingClient::new(fake.clone());

        let result = client.call(&request("u1"), &creds(), &policy(0)).await;
        assert_eq!(fake.call_count(), 1);
        assert_eq!(result.reason, "error: network error: reset");
    }
}
