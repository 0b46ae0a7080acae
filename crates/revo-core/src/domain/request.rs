//! The incoming review request and its correlation identifier.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::error::{OrchestratorError, Result};

/// Key tying a request to its state, its logs and its single delivery.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Generate a fresh random correlation id.
    pub fn new() -> Self {
        CorrelationId(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for CorrelationId {
    fn from(s: &str) -> Self {
        CorrelationId(s.to_string())
    }
}

impl From<String> for CorrelationId {
    fn from(s: String) -> Self {
        CorrelationId(s)
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A request to review one merge request. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewRequest {
    repository: String,
    change_id: String,
    correlation_id: CorrelationId,
    submitted_at: DateTime<Utc>,
    post_comments: bool,
}

impl ReviewRequest {
    /// New request with a random correlation id, stamped now, posting enabled.
    pub fn new(repository: impl Into<String>, change_id: impl Into<String>) -> Self {
        Self {
            repository: repository.into(),
            change_id: change_id.into(),
            correlation_id: CorrelationId::new(),
            submitted_at: Utc::now(),
            post_comments: true,
        }
    }

    /// Use a caller-supplied correlation id (end-to-end retries reuse it).
    pub fn with_correlation_id(mut self, id: impl Into<CorrelationId>) -> Self {
        self.correlation_id = id.into();
        self
    }

    pub fn with_submitted_at(mut self, at: DateTime<Utc>) -> Self {
        self.submitted_at = at;
        self
    }

    /// Return the review to the caller without posting it.
    pub fn without_posting(mut self) -> Self {
        self.post_comments = false;
        self
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    pub fn change_id(&self) -> &str {
        &self.change_id
    }

    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    pub fn submitted_at(&self) -> DateTime<Utc> {
        self.submitted_at
    }

    pub fn post_comments(&self) -> bool {
        self.post_comments
    }

    /// `repository!change` label used in summaries and logs.
    pub fn target(&self) -> String {
        format!("{}!{}", self.repository, self.change_id)
    }

    /// Check that the request names a resolvable repository and change.
    pub fn validate(&self) -> Result<()> {
        check_identifier("repository", &self.repository)?;
        check_identifier("change id", &self.change_id)?;
        if self.correlation_id.as_str().trim().is_empty() {
            return Err(OrchestratorError::InvalidRequest {
                reason: "correlation id must not be empty".to_string(),
            });
        }
        Ok(())
    }
}

fn check_identifier(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(OrchestratorError::InvalidRequest {
            reason: format!("{field} must not be empty"),
        });
    }
    if value.chars().any(char::is_whitespace) {
        return Err(OrchestratorError::InvalidRequest {
            reason: format!("{field} '{value}' contains whitespace"),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_request_passes_validation() {
        let req = ReviewRequest::new("org/service", "42");
        assert!(req.validate().is_ok());
        assert!(req.post_comments());
        assert_eq!(req.target(), "org/service!42");
    }

    #[test]
    fn test_blank_repository_is_invalid() {
        let req = ReviewRequest::new("  ", "42");
        match req.validate() {
            Err(OrchestratorError::InvalidRequest { reason }) => {
                assert!(reason.contains("repository"))
            }
            other => panic!("expected InvalidRequest, got {other:?}"),
        }
    }

    #[test]
    fn test_change_id_with_whitespace_is_invalid() {
        let req = ReviewRequest::new("org/service", "4 2");
        assert!(matches!(
            req.validate(),
            Err(OrchestratorError::InvalidRequest { .. })
        ));
    }

    #[test]
    fn test_caller_supplied_correlation_id_is_kept() {
        let req = ReviewRequest::new("org/service", "7")
            .with_correlation_id("retry-key")
            .without_posting();
        assert_eq!(req.correlation_id().as_str(), "retry-key");
        assert!(!req.post_comments());
    }
}
