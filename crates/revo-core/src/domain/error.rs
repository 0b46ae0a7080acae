//! Request-level error taxonomy.
//!
//! Every terminal outcome of a review request is either a
//! [`ConsolidatedReview`](crate::domain::review::ConsolidatedReview) or one of
//! these variants. Stage-level failures live in
//! [`AgentError`](crate::agents::error::AgentError) and only surface here once
//! the retry manager has given up on a required stage.

/// Terminal errors returned to the requester.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OrchestratorError {
    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },

    #[error("invalid task graph: {reason}")]
    InvalidGraph { reason: String },

    #[error("incomplete review: required stages {missing:?} did not complete ({reason})")]
    IncompleteReview { missing: Vec<String>, reason: String },

    #[error("empty review for request {correlation_id}: no comments and no summary")]
    EmptyReview { correlation_id: String },

    #[error("delivery failed for request {correlation_id} after {attempts} attempt(s): {reason}")]
    DeliveryFailure {
        correlation_id: String,
        attempts: u32,
        reason: String,
    },

    #[error("request {correlation_id} is already in flight")]
    RequestInFlight { correlation_id: String },

    #[error("configuration error: {0}")]
    Config(String),
}

impl OrchestratorError {
    /// Short machine-readable kind, used in status snapshots and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            OrchestratorError::InvalidRequest { .. } => "invalid_request",
            OrchestratorError::InvalidGraph { .. } => "invalid_graph",
            OrchestratorError::IncompleteReview { .. } => "incomplete_review",
            OrchestratorError::EmptyReview { .. } => "empty_review",
            OrchestratorError::DeliveryFailure { .. } => "delivery_failure",
            OrchestratorError::RequestInFlight { .. } => "request_in_flight",
            OrchestratorError::Config(_) => "config",
        }
    }
}

/// Result type for orchestrator operations.
pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_incomplete_review_lists_missing_stages() {
        let err = OrchestratorError::IncompleteReview {
            missing: vec!["analyze_code".to_string()],
            reason: "retries exhausted".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("analyze_code"));
        assert!(msg.contains("retries exhausted"));
        assert_eq!(err.kind(), "incomplete_review");
    }

    #[test]
    fn test_delivery_failure_displays_attempts() {
        let err = OrchestratorError::DeliveryFailure {
            correlation_id: "corr-1".to_string(),
            attempts: 3,
            reason: "rejected".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("corr-1"));
        assert!(msg.contains("3 attempt"));
    }
}
