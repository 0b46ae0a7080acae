//! Error types for task-graph construction.

use thiserror::Error;

use crate::domain::error::OrchestratorError;

/// Errors produced while building or validating a task graph.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    /// Adding an edge would have closed a cycle.
    #[error("dependency cycle detected involving stages: {stages:?}")]
    DependencyCycle { stages: Vec<String> },

    #[error("stage not found in graph: {stage}")]
    StageNotFound { stage: String },

    #[error("duplicate stage id: {stage}")]
    DuplicateStage { stage: String },

    /// The graph violates a structural invariant (root, terminal, convergence).
    #[error("invalid graph shape: {reason}")]
    InvalidShape { reason: String },
}

/// Convenience result alias.
pub type GraphResult<T> = std::result::Result<T, GraphError>;

impl From<GraphError> for OrchestratorError {
    fn from(err: GraphError) -> Self {
        OrchestratorError::InvalidGraph {
            reason: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_error_displays_stage_names() {
        let err = GraphError::DependencyCycle {
            stages: vec!["a".to_string(), "b".to_string()],
        };
        let msg = err.to_string();
        assert!(msg.contains("a"));
        assert!(msg.contains("b"));
    }

    #[test]
    fn test_graph_error_converts_to_invalid_graph() {
        let err: OrchestratorError = GraphError::StageNotFound {
            stage: "analyze_code".to_string(),
        }
        .into();
        assert!(matches!(err, OrchestratorError::InvalidGraph { .. }));
    }
}
