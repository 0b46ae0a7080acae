//! Stage vocabulary: ids, kinds, requirement, retry policy, lifecycle status.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::agents::client::Capability;

/// Stable identifier of a stage within one task graph.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StageId(String);

impl StageId {
    pub fn new(id: impl Into<String>) -> Self {
        StageId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for StageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a stage does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    FetchMetadata,
    RetrieveContext,
    AnalyzeCode,
    CollectAnalytics,
    Consolidate,
    PostComments,
}

impl StageKind {
    pub fn name(&self) -> &'static str {
        match self {
            StageKind::FetchMetadata => "fetch_metadata",
            StageKind::RetrieveContext => "retrieve_context",
            StageKind::AnalyzeCode => "analyze_code",
            StageKind::CollectAnalytics => "collect_analytics",
            StageKind::Consolidate => "consolidate",
            StageKind::PostComments => "post_comments",
        }
    }

    /// The id this kind gets in builder-produced graphs.
    pub fn default_id(&self) -> StageId {
        StageId::new(self.name())
    }

    /// The collaborator capability an engine-dispatched stage invokes.
    ///
    /// `Consolidate` and `PostComments` run in-process and have none.
    pub fn capability(&self) -> Option<Capability> {
        match self {
            StageKind::FetchMetadata => Some(Capability::RepositoryMetadata),
            StageKind::RetrieveContext => Some(Capability::ContextRetrieval),
            StageKind::AnalyzeCode => Some(Capability::CodeAnalysis),
            StageKind::CollectAnalytics => Some(Capability::Analytics),
            StageKind::Consolidate | StageKind::PostComments => None,
        }
    }

    /// Analysis-type stages feed the consolidator.
    pub fn is_analysis(&self) -> bool {
        matches!(
            self,
            StageKind::RetrieveContext | StageKind::AnalyzeCode | StageKind::CollectAnalytics
        )
    }

    /// Consolidation priority: lower sorts first.
    pub fn consolidation_rank(&self) -> u8 {
        match self {
            StageKind::AnalyzeCode => 0,
            StageKind::RetrieveContext => 1,
            StageKind::CollectAnalytics => 2,
            StageKind::FetchMetadata => 3,
            StageKind::Consolidate => 4,
            StageKind::PostComments => 5,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "fetch_metadata" => Some(StageKind::FetchMetadata),
            "retrieve_context" => Some(StageKind::RetrieveContext),
            "analyze_code" => Some(StageKind::AnalyzeCode),
            "collect_analytics" => Some(StageKind::CollectAnalytics),
            "consolidate" => Some(StageKind::Consolidate),
            "post_comments" => Some(StageKind::PostComments),
            _ => None,
        }
    }
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Whether a stage's permanent failure aborts the request or degrades it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Requirement {
    Required,
    Optional,
}

/// Attempt budget and exponential backoff shape for one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one (minimum 1).
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub multiplier: u32,
    pub backoff_ceiling: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_millis(500),
            multiplier: 2,
            backoff_ceiling: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// Run once, never retry.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before the attempt that follows failed attempt `attempt` (1-based):
    /// `base * multiplier^(attempt-1)`, capped at the ceiling.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1);
        let factor = self.multiplier.max(1).saturating_pow(exp);
        self.backoff_base
            .saturating_mul(factor)
            .min(self.backoff_ceiling)
    }
}

/// A node of the task graph. Dependencies are the graph's edges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageSpec {
    pub id: StageId,
    pub kind: StageKind,
    pub requirement: Requirement,
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

impl StageSpec {
    pub fn new(kind: StageKind, requirement: Requirement) -> Self {
        Self {
            id: kind.default_id(),
            kind,
            requirement,
            timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn is_required(&self) -> bool {
        self.requirement == Requirement::Required
    }
}

/// Lifecycle of a stage inside one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    /// Optional stage whose output is missing; execution continued without it.
    Skipped,
}

impl StageStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StageStatus::Succeeded | StageStatus::Failed | StageStatus::Skipped
        )
    }

    /// Terminal and non-failed: dependents may start.
    pub fn satisfies_dependents(&self) -> bool {
        matches!(self, StageStatus::Succeeded | StageStatus::Skipped)
    }
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StageStatus::Pending => "pending",
            StageStatus::Running => "running",
            StageStatus::Succeeded => "succeeded",
            StageStatus::Failed => "failed",
            StageStatus::Skipped => "skipped",
        };
        write!(f, "{s}")
    }
}
