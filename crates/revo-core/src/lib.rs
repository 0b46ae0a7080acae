//! Revo Core Library
//!
//! Supervises merge-request reviews: builds a per-request stage graph, runs
//! collaborator stages with bounded parallelism, retries and degradation,
//! consolidates their outputs into one review and posts it exactly once.

pub mod agents;
pub mod config;
pub mod consolidate;
pub mod delivery;
pub mod domain;
pub mod engine;
pub mod graph;
pub mod metrics;
pub mod obs;
pub mod retry;
pub mod supervisor;
pub mod telemetry;

pub use agents::{AgentClient, AgentError, AgentRegistry, Capability, Collaborators};
pub use config::OrchestratorConfig;
pub use consolidate::Consolidator;
pub use delivery::{idempotency_token, DeliveryGate, DeliverySettings};
pub use domain::{
    Ack, AnalysisReport, AnalyticsNote, ChangeMetadata, ConsolidatedReview, ContextItem,
    CorrelationId, Finding, Locator, OrchestratorError, Result, ReviewComment, ReviewOutcome,
    ReviewRequest, Severity, StagePayload,
};
pub use engine::{RequestPhase, RequestState, StatusSnapshot, WorkflowEngine};
pub use graph::{
    GraphOptions, GraphShape, Requirement, StageId, StageKind, StageSpec, StageStatus, TaskGraph,
    TaskGraphBuilder,
};
pub use retry::{Decision, FailureManager};
pub use supervisor::{Acceptance, Admission, Supervisor};
pub use telemetry::{init_tracing, LogFormat};
