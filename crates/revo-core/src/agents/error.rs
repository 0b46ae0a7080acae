//! Collaborator failure taxonomy.

use thiserror::Error;

/// A failed collaborator invocation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AgentError {
    /// Network or availability failure; worth retrying.
    #[error("collaborator unreachable: {reason}")]
    Unreachable { reason: String },

    /// The collaborator understood the task and refused it.
    #[error("collaborator rejected the task: {reason}")]
    Rejected { reason: String },

    #[error("invocation timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    /// The requested repository or change does not exist.
    #[error("not found: {resource}")]
    NotFound { resource: String },
}

impl AgentError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AgentError::Unreachable { .. } | AgentError::Timeout { .. }
        )
    }

    pub fn kind(&self) -> &'static str {
        match self {
            AgentError::Unreachable { .. } => "unreachable",
            AgentError::Rejected { .. } => "rejected",
            AgentError::Timeout { .. } => "timeout",
            AgentError::NotFound { .. } => "not_found",
        }
    }
}

pub type AgentResult<T> = std::result::Result<T, AgentError>;
