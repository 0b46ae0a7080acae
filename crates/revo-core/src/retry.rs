//! Failure policy: what to do after a stage attempt fails.

use std::time::Duration;

use crate::agents::error::AgentError;
use crate::graph::stage::StageSpec;

/// Verdict for one failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Run the stage again after the delay.
    Retry(Duration),
    /// Give up on an optional stage; the review goes ahead without it.
    Degrade,
    /// Give up on a required stage; the request fails.
    Abort,
}

/// Stateless policy; all inputs come from the stage spec and the error.
#[derive(Debug, Clone, Copy, Default)]
pub struct FailureManager;

impl FailureManager {
    pub fn new() -> Self {
        Self
    }

    /// Decide after attempt `attempt` (1-based) of `stage` failed with `error`.
    ///
    /// Transient errors are retried with exponential backoff while the
    /// attempt budget lasts. Rejections and missing resources are final.
    pub fn decide(&self, stage: &StageSpec, error: &AgentError, attempt: u32) -> Decision {
        if error.is_retryable() && attempt < stage.retry.max_attempts {
            return Decision::Retry(stage.retry.delay_after(attempt));
        }
        if stage.is_required() {
            Decision::Abort
        } else {
            Decision::Degrade
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::stage::{Requirement, RetryPolicy, StageKind};

    fn stage(requirement: Requirement) -> StageSpec {
        StageSpec::new(StageKind::RetrieveContext, requirement).with_retry(RetryPolicy {
            max_attempts: 3,
            backoff_base: Duration::from_millis(100),
            multiplier: 2,
            backoff_ceiling: Duration::from_millis(150),
        })
    }

    fn unreachable() -> AgentError {
        AgentError::Unreachable {
            reason: "connection refused".into(),
        }
    }

    #[test]
    fn test_transient_failure_is_retried_with_backoff() {
        let fm = FailureManager::new();
        let s = stage(Requirement::Optional);
        assert_eq!(
            fm.decide(&s, &unreachable(), 1),
            Decision::Retry(Duration::from_millis(100))
        );
        assert_eq!(
            fm.decide(&s, &AgentError::Timeout { elapsed_ms: 5 }, 2),
            Decision::Retry(Duration::from_millis(150))
        );
    }

    #[test]
    fn test_exhausted_optional_degrades_and_required_aborts() {
        let fm = FailureManager::new();
        assert_eq!(
            fm.decide(&stage(Requirement::Optional), &unreachable(), 3),
            Decision::Degrade
        );
        assert_eq!(
            fm.decide(&stage(Requirement::Required), &unreachable(), 3),
            Decision::Abort
        );
    }

    #[test]
    fn test_rejection_is_never_retried() {
        let fm = FailureManager::new();
        let rejected = AgentError::Rejected {
            reason: "diff too large".into(),
        };
        assert_eq!(
            fm.decide(&stage(Requirement::Optional), &rejected, 1),
            Decision::Degrade
        );
        let missing = AgentError::NotFound {
            resource: "org/service!9".into(),
        };
        assert_eq!(
            fm.decide(&stage(Requirement::Required), &missing, 1),
            Decision::Abort
        );
    }
}
