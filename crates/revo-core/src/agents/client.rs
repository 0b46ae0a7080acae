//! Uniform "submit a task, get a result or a failure" interface.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::agents::error::AgentResult;
use crate::domain::payload::{ChangeMetadata, Finding, StagePayload};
use crate::domain::request::ReviewRequest;
use crate::graph::stage::{StageId, StageKind};

/// What a collaborator can do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    RepositoryMetadata,
    ContextRetrieval,
    CodeAnalysis,
    Analytics,
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Capability::RepositoryMetadata => "repository_metadata",
            Capability::ContextRetrieval => "context_retrieval",
            Capability::CodeAnalysis => "code_analysis",
            Capability::Analytics => "analytics",
        };
        write!(f, "{s}")
    }
}

/// Everything a stage gets to work with: the request, the change metadata once
/// fetched, and the payloads of its succeeded dependencies.
#[derive(Debug, Clone)]
pub struct StageInput {
    pub request: ReviewRequest,
    pub stage: StageId,
    pub kind: StageKind,
    pub metadata: Option<ChangeMetadata>,
    pub upstream: BTreeMap<StageId, StagePayload>,
}

impl StageInput {
    /// Findings from every upstream analysis report, in stage-id order.
    pub fn upstream_findings(&self) -> Vec<Finding> {
        self.upstream
            .values()
            .filter_map(StagePayload::as_analysis)
            .flat_map(|r| r.findings.iter().cloned())
            .collect()
    }
}

/// Per-attempt invocation bounds, handed through to every collaborator call.
///
/// Collaborators stop work once `cancel` fires or `deadline` passes; the
/// caller also enforces both, so a collaborator that ignores them is only
/// slower to release its resources.
#[derive(Debug, Clone)]
pub struct InvocationContext {
    /// `min(attempt timeout, request deadline)`.
    pub deadline: Instant,
    /// Cancelled when the request is aborted, cancelled, or out of time.
    pub cancel: CancellationToken,
    /// 1-based attempt number.
    pub attempt: u32,
}

impl InvocationContext {
    /// First attempt bounded by `deadline`.
    pub fn new(deadline: Instant, cancel: CancellationToken) -> Self {
        Self {
            deadline,
            cancel,
            attempt: 1,
        }
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    /// Whether the attempt should stop: cancelled or past its deadline.
    pub fn is_expired(&self) -> bool {
        self.cancel.is_cancelled() || Instant::now() >= self.deadline
    }
}

#[async_trait]
pub trait AgentClient: Send + Sync {
    fn capability(&self) -> Capability;

    async fn invoke(&self, input: &StageInput, ctx: &InvocationContext)
        -> AgentResult<StagePayload>;
}

/// Capability → client lookup used by the engine.
#[derive(Clone, Default)]
pub struct AgentRegistry {
    clients: HashMap<Capability, Arc<dyn AgentClient>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `client` under its own capability, replacing any previous one.
    pub fn register(&mut self, client: Arc<dyn AgentClient>) {
        self.clients.insert(client.capability(), client);
    }

    pub fn with(mut self, client: Arc<dyn AgentClient>) -> Self {
        self.register(client);
        self
    }

    pub fn get(&self, capability: Capability) -> Option<Arc<dyn AgentClient>> {
        self.clients.get(&capability).cloned()
    }

    pub fn contains(&self, capability: Capability) -> bool {
        self.clients.contains_key(&capability)
    }
}

impl std::fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut caps: Vec<_> = self.clients.keys().collect();
        caps.sort();
        f.debug_struct("AgentRegistry")
            .field("capabilities", &caps)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::payload::{AnalysisReport, Locator, Severity};

    struct Echo;

    #[async_trait]
    impl AgentClient for Echo {
        fn capability(&self) -> Capability {
            Capability::Analytics
        }

        async fn invoke(
            &self,
            _input: &StageInput,
            _ctx: &InvocationContext,
        ) -> AgentResult<StagePayload> {
            Ok(StagePayload::Analytics { notes: vec![] })
        }
    }

    #[test]
    fn test_registry_keys_clients_by_capability() {
        let registry = AgentRegistry::new().with(Arc::new(Echo));
        assert!(registry.contains(Capability::Analytics));
        assert!(registry.get(Capability::CodeAnalysis).is_none());
    }

    #[test]
    fn test_upstream_findings_flatten_reports() {
        let finding = Finding {
            locator: Locator::new("src/lib.rs", 1),
            severity: Severity::Info,
            message: "m".into(),
        };
        let input = StageInput {
            request: ReviewRequest::new("org/service", "1"),
            stage: StageKind::CollectAnalytics.default_id(),
            kind: StageKind::CollectAnalytics,
            metadata: None,
            upstream: BTreeMap::from([
                (
                    StageKind::AnalyzeCode.default_id(),
                    StagePayload::Analysis(AnalysisReport {
                        findings: vec![finding.clone()],
                        summary: None,
                    }),
                ),
                (
                    StageKind::RetrieveContext.default_id(),
                    StagePayload::Context { items: vec![] },
                ),
            ]),
        };
        assert_eq!(input.upstream_findings(), vec![finding]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_context_expires_at_deadline_or_on_cancel() {
        let deadline = Instant::now() + std::time::Duration::from_secs(2);
        let ctx = InvocationContext::new(deadline, CancellationToken::new()).with_attempt(2);
        assert_eq!(ctx.attempt, 2);
        assert!(!ctx.is_expired());

        tokio::time::advance(std::time::Duration::from_secs(2)).await;
        assert!(ctx.is_expired());

        let fresh = InvocationContext::new(
            Instant::now() + std::time::Duration::from_secs(60),
            CancellationToken::new(),
        );
        assert!(!fresh.is_expired());
        fresh.cancel.cancel();
        assert!(fresh.is_expired());
    }
}
