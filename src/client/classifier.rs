//! The classification service seam.

use async_trait::async_trait;
use std::fmt;

use crate::models::{AuditError, Result, ServiceError};

/// One verification request: evidence references and the claimed amount.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassifyRequest {
    pub model: String,
    pub evidence: Vec<String>,
    pub expected_amount: f64,
}

/// Credentials for the classification service. Supplied per start/resume,
/// never persisted.
#[derive(Clone)]
pub struct Credentials {
    api_key: String,
}

impl Credentials {
    /// Reject empty or blank keys.
    pub fn new(api_key: impl Into<String>) -> Result<Self> {
        let api_key = api_key.into().trim().to_string();
        if api_key.is_empty() {
            return Err(AuditError::MissingCredentials);
        }
        Ok(Self { api_key })
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &"<redacted>")
            .finish()
    }
}

/// A multimodal service that reads evidence and answers in text.
///
/// Implementations return the raw reply; interpreting it is the caller's job.
#[async_trait]
pub trait EvidenceClassifier: Send + Sync {
    async fn classify(
        &self,
        request: &ClassifyRequest,
        credentials: &Credentials,
    ) -> std::result::Result<String, ServiceError>;
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blank_credentials_rejected() {
        assert!(matches!(
            Credentials::new("   "),
            Err(AuditError::MissingCredentials)
        ));
        assert_eq!(Credentials::new(" sk-1 ").unwrap().api_key(), "sk-1");
    }

    #[test]
    fn test_debug_redacts_key() {
        let creds = Credentials::new("sk-secret").unwrap();
        assert!(!format!("{creds:?}").contains("sk-secret"));
    }
}
