//! Capability protocols and the adapters that present them as [`AgentClient`]s.
//!
//! Each external collaborator speaks its own protocol (a trait below). The
//! engine only ever sees [`AgentClient`]; adapters translate between the two.
//! Every protocol call receives the attempt's [`InvocationContext`] so a real
//! client can bound its own I/O by the deadline and stop on cancellation.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::agents::client::{AgentClient, AgentRegistry, Capability, InvocationContext, StageInput};
use crate::agents::error::{AgentError, AgentResult};
use crate::domain::payload::{
    AnalysisReport, AnalyticsNote, ChangeMetadata, ContextItem, Finding, StagePayload,
};
use crate::domain::review::ConsolidatedReview;

/// Repository-hosting integration.
#[async_trait]
pub trait RepositoryIntegration: Send + Sync {
    /// `NotFound` when the change does not exist.
    async fn fetch_change_metadata(
        &self,
        repository: &str,
        change_id: &str,
        ctx: &InvocationContext,
    ) -> AgentResult<ChangeMetadata>;

    /// Post the review; returns the provider's receipt id.
    ///
    /// Calls carrying the same `idempotency_token` describe the same post.
    async fn post_comments(
        &self,
        repository: &str,
        change_id: &str,
        review: &ConsolidatedReview,
        idempotency_token: &str,
        ctx: &InvocationContext,
    ) -> AgentResult<String>;
}

/// History / context retriever. An empty result is not an error.
#[async_trait]
pub trait ContextRetriever: Send + Sync {
    async fn retrieve_context(
        &self,
        metadata: &ChangeMetadata,
        ctx: &InvocationContext,
    ) -> AgentResult<Vec<ContextItem>>;
}

#[async_trait]
pub trait CodeAnalyzer: Send + Sync {
    async fn analyze(
        &self,
        metadata: &ChangeMetadata,
        ctx: &InvocationContext,
    ) -> AgentResult<AnalysisReport>;
}

#[async_trait]
pub trait AnalyticsCollector: Send + Sync {
    async fn collect(
        &self,
        metadata: &ChangeMetadata,
        findings: &[Finding],
        ctx: &InvocationContext,
    ) -> AgentResult<Vec<AnalyticsNote>>;
}

/// The set of collaborators one supervisor talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub repository: Arc<dyn RepositoryIntegration>,
    pub context: Option<Arc<dyn ContextRetriever>>,
    pub analyzer: Arc<dyn CodeAnalyzer>,
    pub analytics: Option<Arc<dyn AnalyticsCollector>>,
}

impl Collaborators {
    /// Wrap every collaborator in its adapter and register it.
    pub fn registry(&self) -> AgentRegistry {
        let mut registry = AgentRegistry::new()
            .with(Arc::new(MetadataClient::new(Arc::clone(&self.repository))))
            .with(Arc::new(AnalysisClient::new(Arc::clone(&self.analyzer))));
        if let Some(context) = &self.context {
            registry.register(Arc::new(ContextClient::new(Arc::clone(context))));
        }
        if let Some(analytics) = &self.analytics {
            registry.register(Arc::new(AnalyticsClient::new(Arc::clone(analytics))));
        }
        registry
    }
}

fn require_metadata(input: &StageInput) -> AgentResult<&ChangeMetadata> {
    input.metadata.as_ref().ok_or_else(|| AgentError::Rejected {
        reason: format!("stage {} started without change metadata", input.stage),
    })
}

/// An attempt that is already cancelled or out of time never reaches the
/// collaborator.
fn ensure_live(input: &StageInput, ctx: &InvocationContext) -> AgentResult<()> {
    if ctx.is_expired() {
        return Err(AgentError::Timeout { elapsed_ms: 0 });
    }
    debug!(stage = %input.stage, attempt = ctx.attempt, "invoking collaborator");
    Ok(())
}

pub struct MetadataClient {
    inner: Arc<dyn RepositoryIntegration>,
}

impl MetadataClient {
    pub fn new(inner: Arc<dyn RepositoryIntegration>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl AgentClient for MetadataClient {
    fn capability(&self) -> Capability {
        Capability::RepositoryMetadata
    }

    async fn invoke(
        &self,
        input: &StageInput,
        ctx: &InvocationContext,
    ) -> AgentResult<StagePayload> {
        ensure_live(input, ctx)?;
        self.inner
            .fetch_change_metadata(input.request.repository(), input.request.change_id(), ctx)
            .await
            .map(StagePayload::Metadata)
    }
}

pub struct ContextClient {
    inner: Arc<dyn ContextRetriever>,
}

impl ContextClient {
    pub fn new(inner: Arc<dyn ContextRetriever>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl AgentClient for ContextClient {
    fn capability(&self) -> Capability {
        Capability::ContextRetrieval
    }

    async fn invoke(
        &self,
        input: &StageInput,
        ctx: &InvocationContext,
    ) -> AgentResult<StagePayload> {
        let metadata = require_metadata(input)?;
        ensure_live(input, ctx)?;
        let items = self.inner.retrieve_context(metadata, ctx).await?;
        Ok(StagePayload::Context { items })
    }
}

pub struct AnalysisClient {
    inner: Arc<dyn CodeAnalyzer>,
}

impl AnalysisClient {
    pub fn new(inner: Arc<dyn CodeAnalyzer>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl AgentClient for AnalysisClient {
    fn capability(&self) -> Capability {
        Capability::CodeAnalysis
    }

    async fn invoke(
        &self,
        input: &StageInput,
        ctx: &InvocationContext,
    ) -> AgentResult<StagePayload> {
        let metadata = require_metadata(input)?;
        ensure_live(input, ctx)?;
        self.inner
            .analyze(metadata, ctx)
            .await
            .map(StagePayload::Analysis)
    }
}

/// Analytics sees whatever findings its dependencies produced; in the
/// parallel shape that is none.
pub struct AnalyticsClient {
    inner: Arc<dyn AnalyticsCollector>,
}

impl AnalyticsClient {
    pub fn new(inner: Arc<dyn AnalyticsCollector>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl AgentClient for AnalyticsClient {
    fn capability(&self) -> Capability {
        Capability::Analytics
    }

    async fn invoke(
        &self,
        input: &StageInput,
        ctx: &InvocationContext,
    ) -> AgentResult<StagePayload> {
        let metadata = require_metadata(input)?;
        ensure_live(input, ctx)?;
        let findings = input.upstream_findings();
        let notes = self.inner.collect(metadata, &findings, ctx).await?;
        Ok(StagePayload::Analytics { notes })
    }
}
