//! HTTP classifier for OpenAI-compatible multimodal chat endpoints.
//!
//! Sends the evidence images plus a verification prompt to
//! `{base_url}/chat/completions` and returns the assistant's text. Retrying is
//! left to [`RetryingClient`](super::RetryingClient); this client makes exactly
//! one request per `classify` call.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE, RETRY_AFTER};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

use super::verdict::build_prompt;
use super::{ClassifyRequest, Credentials, EvidenceClassifier};
use crate::models::{AuditError, Result, ServiceConfig, ServiceError};

/// Chat completion request payload.
#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f64,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: Vec<ContentPart>,
}

/// One part of a multimodal user message.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart {
    ImageUrl { image_url: ImageUrl },
    Text { text: String },
}

#[derive(Debug, Serialize)]
struct ImageUrl {
    url: String,
}

/// Chat completion response.
#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ResponseMessage,
}

/// Content is a string on most endpoints, a list of parts on some.
#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Value,
}

/// API error response (OpenAI-compatible).
#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

/// Reqwest-backed [`EvidenceClassifier`].
pub struct VisionClient {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
    total_requests: AtomicU64,
    total_failures: AtomicU64,
}

impl VisionClient {
    /// Create a client for the configured endpoint.
    pub fn new(config: &ServiceConfig) -> Result<Self> {
        let timeout = Duration::from_secs(config.timeout_secs);
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AuditError::Internal(format!("building HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            timeout,
            total_requests: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Requests sent and requests that failed.
    pub fn stats(&self) -> (u64, u64) {
        (
            self.total_requests.load(Ordering::Relaxed),
            self.total_failures.load(Ordering::Relaxed),
        )
    }

    fn headers(credentials: &Credentials) -> std::result::Result<HeaderMap, ServiceError> {
        let mut headers = HeaderMap::new();
        let bearer = HeaderValue::from_str(&format!("Bearer {}", credentials.api_key()))
            .map_err(|_| ServiceError::AuthenticationFailed)?;
        headers.insert(AUTHORIZATION, bearer);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(headers)
    }

    async fn send(
        &self,
        request: &ClassifyRequest,
        credentials: &Credentials,
    ) -> std::result::Result<String, ServiceError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = build_request_body(request);

        let response = self
            .client
            .post(&url)
            .headers(Self::headers(credentials)?)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ServiceError::Timeout(self.timeout)
                } else {
                    ServiceError::Network(e.to_string())
                }
            })?;

        let status = response.status().as_u16();
        if !response.status().is_success() {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.trim().parse::<f64>().ok());
            let error_body = response.text().await.unwrap_or_default();
            return Err(map_http_error(status, &error_body, retry_after));
        }

        let text = response
            .text()
            .await
            .map_err(|e| ServiceError::Network(e.to_string()))?;
        extract_reply_text(&text)
    }
}

#[async_trait]
impl EvidenceClassifier for VisionClient {
    async fn classify(
        &self,
        request: &ClassifyRequest,
        credentials: &Credentials,
    ) -> std::result::Result<String, ServiceError> {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        let result = self.send(request, credentials).await;
        if let Err(e) = &result {
            self.total_failures.fetch_add(1, Ordering::Relaxed);
            debug!(model = %request.model, error = %e, "Classification request failed");
        }
        result
    }
}

fn build_request_body(request: &ClassifyRequest) -> ChatCompletionRequest {
    let mut content: Vec<ContentPart> = request
        .evidence
        .iter()
        .map(|url| ContentPart::ImageUrl {
            image_url: ImageUrl { url: url.clone() },
        })
        .collect();
    content.push(ContentPart::Text {
        text: build_prompt(request.expected_amount),
    });

    ChatCompletionRequest {
        model: request.model.clone(),
        messages: vec![ChatMessage {
            role: "user",
            content,
        }],
        temperature: 0.0,
    }
}

/// Map a non-success status to a service error.
fn map_http_error(status: u16, body: &str, retry_after: Option<f64>) -> ServiceError {
    let message = serde_json::from_str::<ApiErrorResponse>(body)
        .map(|e| e.error.message)
        .unwrap_or_else(|_| body.trim().to_string());

    match status {
        401 | 403 => ServiceError::AuthenticationFailed,
        429 => ServiceError::RateLimited {
            retry_after_secs: retry_after,
        },
        500 | 502 | 503 | 504 => ServiceError::Busy { status },
        _ => ServiceError::Api { status, message },
    }
}

/// Pull the assistant text out of a chat completion body.
fn extract_reply_text(body: &str) -> std::result::Result<String, ServiceError> {
    let parsed: ChatCompletionResponse = serde_json::from_str(body)
        .map_err(|e| ServiceError::InvalidResponse(format!("bad completion envelope: {e}")))?;

    let content = parsed
        .choices
        .into_iter()
        .next()
        .map(|c| c.message.content)
        .ok_or_else(|| ServiceError::InvalidResponse("no choices in response".to_string()))?;

    let text = match content {
        Value::String(s) => s,
        Value::Array(parts) => parts
            .iter()
            .filter_map(|p| p.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    };

    if text.trim().is_empty() {
        return Err(ServiceError::InvalidResponse("empty reply content".to_string()));
    }
    Ok(text)
}
