//! Per-request execution state.
//!
//! A [`RequestState`] has exactly one writer, the engine's driver loop (and,
//! after the engine returns, the supervisor's pipeline). Everyone else reads
//! [`StatusSnapshot`]s.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::agents::client::StageInput;
use crate::agents::error::AgentError;
use crate::domain::payload::{ChangeMetadata, StagePayload};
use crate::domain::request::{CorrelationId, ReviewRequest};
use crate::graph::stage::{Requirement, StageId, StageKind, StageSpec, StageStatus};
use crate::graph::task_graph::TaskGraph;

/// Lifecycle of the whole request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestPhase {
    Accepted,
    Running,
    Consolidating,
    Delivering,
    Completed,
    Failed,
}

impl RequestPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestPhase::Completed | RequestPhase::Failed)
    }
}

impl std::fmt::Display for RequestPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RequestPhase::Accepted => "accepted",
            RequestPhase::Running => "running",
            RequestPhase::Consolidating => "consolidating",
            RequestPhase::Delivering => "delivering",
            RequestPhase::Completed => "completed",
            RequestPhase::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// Mutable bookkeeping for one stage.
#[derive(Debug, Clone)]
pub struct StageRecord {
    pub spec: StageSpec,
    pub status: StageStatus,
    /// Attempts started so far.
    pub attempts: u32,
    pub last_error: Option<AgentError>,
    /// Earliest time the next attempt may start.
    pub not_before: Option<Instant>,
    pub payload: Option<StagePayload>,
}

impl StageRecord {
    fn new(spec: StageSpec) -> Self {
        Self {
            spec,
            status: StageStatus::Pending,
            attempts: 0,
            last_error: None,
            not_before: None,
            payload: None,
        }
    }

    /// Engine-dispatched stages call a collaborator; the rest run in-process.
    pub fn is_dispatched(&self) -> bool {
        self.spec.kind.capability().is_some()
    }
}

/// How a terminal stage ended, from the consolidator's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Success,
    /// Optional stage whose output is missing.
    Degraded,
    Failed,
}

/// Terminal outcome of one stage, handed to the consolidator.
#[derive(Debug, Clone)]
pub struct StageResult {
    pub stage: StageId,
    pub kind: StageKind,
    pub requirement: Requirement,
    pub status: ResultStatus,
    pub payload: Option<StagePayload>,
    pub attempts: u32,
    pub last_error: Option<AgentError>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageSnapshot {
    pub stage: String,
    pub kind: StageKind,
    pub requirement: Requirement,
    pub status: StageStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
}

/// Read-only view of a request, published over a `watch` channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub correlation_id: CorrelationId,
    pub target: String,
    pub phase: RequestPhase,
    pub stages: Vec<StageSnapshot>,
    pub accepted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub error: Option<String>,
}

impl StatusSnapshot {
    pub fn stage(&self, id: &str) -> Option<&StageSnapshot> {
        self.stages.iter().find(|s| s.stage == id)
    }
}

#[derive(Debug, Clone)]
pub struct RequestState {
    request: ReviewRequest,
    graph: TaskGraph,
    phase: RequestPhase,
    records: BTreeMap<StageId, StageRecord>,
    /// Stage ids in topological order; snapshots and results follow it.
    order: Vec<StageId>,
    accepted_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    error: Option<String>,
}

impl RequestState {
    /// Fresh state in the `Accepted` phase with every stage `Pending`.
    pub fn new(request: ReviewRequest, graph: TaskGraph) -> Self {
        let order: Vec<StageId> = graph
            .topological_order()
            .map(|stages| stages.into_iter().map(|s| s.id.clone()).collect())
            .unwrap_or_else(|_| graph.stages().map(|s| s.id.clone()).collect());
        let records = graph
            .stages()
            .map(|s| (s.id.clone(), StageRecord::new(s.clone())))
            .collect();
        let now = Utc::now();
        Self {
            request,
            graph,
            phase: RequestPhase::Accepted,
            records,
            order,
            accepted_at: now,
            updated_at: now,
            error: None,
        }
    }

    pub fn request(&self) -> &ReviewRequest {
        &self.request
    }

    pub fn graph(&self) -> &TaskGraph {
        &self.graph
    }

    pub fn phase(&self) -> RequestPhase {
        self.phase
    }

    pub fn set_phase(&mut self, phase: RequestPhase) {
        self.phase = phase;
        self.touch();
    }

    /// Move to `Failed`, remembering why.
    pub fn fail(&mut self, error: &dyn std::fmt::Display) {
        self.error = Some(error.to_string());
        self.set_phase(RequestPhase::Failed);
    }

    /// Reopen a request whose delivery failed so the post can be retried.
    pub fn reopen_for_delivery(&mut self) {
        self.error = None;
        self.set_phase(RequestPhase::Delivering);
    }

    pub fn record(&self, id: &StageId) -> Option<&StageRecord> {
        self.records.get(id)
    }

    pub fn record_of_kind(&self, kind: StageKind) -> Option<&StageRecord> {
        self.records.values().find(|r| r.spec.kind == kind)
    }

    /// Dispatchable stages whose dependencies are satisfied and whose backoff
    /// (if any) has elapsed. Empty unless the request is `Running`.
    pub fn ready_stages(&self, now: Instant) -> Vec<StageId> {
        if self.phase != RequestPhase::Running {
            return Vec::new();
        }
        self.order
            .iter()
            .filter_map(|id| self.records.get(id))
            .filter(|r| r.is_dispatched() && r.status == StageStatus::Pending)
            .filter(|r| r.not_before.map_or(true, |t| t <= now))
            .filter(|r| self.dependencies_satisfied(&r.spec.id))
            .map(|r| r.spec.id.clone())
            .collect()
    }

    fn dependencies_satisfied(&self, id: &StageId) -> bool {
        self.graph.dependencies_of(id).map_or(false, |deps| {
            deps.iter().all(|d| {
                self.records
                    .get(d)
                    .map_or(false, |r| r.status.satisfies_dependents())
            })
        })
    }

    /// Transition `Pending → Running`; returns the new attempt number.
    pub fn mark_running(&mut self, id: &StageId) -> u32 {
        let attempt = match self.records.get_mut(id) {
            Some(r) => {
                r.status = StageStatus::Running;
                r.attempts += 1;
                r.not_before = None;
                r.attempts
            }
            None => 0,
        };
        self.touch();
        attempt
    }

    /// Whether a completion for `attempt` of `id` may be recorded: the request
    /// is still running and the stage is running that very attempt.
    pub fn accepts(&self, id: &StageId, attempt: u32) -> bool {
        self.phase == RequestPhase::Running
            && self
                .records
                .get(id)
                .map_or(false, |r| r.status == StageStatus::Running && r.attempts == attempt)
    }

    pub fn mark_succeeded(&mut self, id: &StageId, payload: StagePayload) {
        self.update(id, |r| {
            r.status = StageStatus::Succeeded;
            r.payload = Some(payload);
        });
    }

    /// `Running → Pending`, to be retried at `not_before`.
    pub fn schedule_retry(&mut self, id: &StageId, error: AgentError, not_before: Instant) {
        self.update(id, |r| {
            r.status = StageStatus::Pending;
            r.last_error = Some(error);
            r.not_before = Some(not_before);
        });
    }

    pub fn mark_skipped(&mut self, id: &StageId, error: Option<AgentError>) {
        self.update(id, |r| {
            r.status = StageStatus::Skipped;
            r.not_before = None;
            if error.is_some() {
                r.last_error = error;
            }
        });
    }

    pub fn mark_failed(&mut self, id: &StageId, error: AgentError) {
        self.update(id, |r| {
            r.status = StageStatus::Failed;
            r.not_before = None;
            r.last_error = Some(error);
        });
    }

    /// Set the status of an in-process stage (consolidate, post) by kind.
    pub fn set_in_process_status(&mut self, kind: StageKind, status: StageStatus) {
        let ids: Vec<StageId> = self
            .records
            .values()
            .filter(|r| r.spec.kind == kind && !r.is_dispatched())
            .map(|r| r.spec.id.clone())
            .collect();
        for id in ids {
            self.update(&id, |r| {
                r.status = status;
                if status == StageStatus::Running {
                    r.attempts += 1;
                }
            });
        }
    }

    /// Skip every non-terminal optional stage downstream of `id`; returns
    /// the stages that were skipped.
    pub fn skip_optional_dependents(&mut self, id: &StageId) -> Vec<StageId> {
        let dependents = self.graph.transitive_dependents_of(id).unwrap_or_default();
        let skipped: Vec<StageId> = dependents
            .into_iter()
            .filter(|d| {
                self.records.get(d).map_or(false, |r| {
                    r.is_dispatched() && !r.spec.is_required() && !r.status.is_terminal()
                })
            })
            .collect();
        for d in &skipped {
            self.mark_skipped(d, None);
        }
        skipped
    }

    /// Required dispatched stages that have not succeeded.
    pub fn unfinished_required(&self) -> Vec<StageId> {
        self.dispatched()
            .filter(|r| r.spec.is_required() && r.status != StageStatus::Succeeded)
            .map(|r| r.spec.id.clone())
            .collect()
    }

    /// Dispatched stages that are not yet terminal, in topological order.
    pub fn incomplete(&self) -> Vec<StageId> {
        self.dispatched()
            .filter(|r| !r.status.is_terminal())
            .map(|r| r.spec.id.clone())
            .collect()
    }

    /// Every dispatched stage is terminal.
    pub fn dispatch_complete(&self) -> bool {
        self.dispatched().all(|r| r.status.is_terminal())
    }

    /// Earliest pending backoff deadline.
    pub fn next_retry_at(&self) -> Option<Instant> {
        self.dispatched()
            .filter(|r| r.status == StageStatus::Pending)
            .filter_map(|r| r.not_before)
            .min()
    }

    pub fn running_count(&self) -> usize {
        self.dispatched()
            .filter(|r| r.status == StageStatus::Running)
            .count()
    }

    pub fn metadata(&self) -> Option<&ChangeMetadata> {
        self.record_of_kind(StageKind::FetchMetadata)
            .and_then(|r| r.payload.as_ref())
            .and_then(StagePayload::as_metadata)
    }

    /// Input for the next attempt of `id`: request, metadata and the payloads
    /// of its succeeded direct dependencies.
    pub fn stage_input(&self, id: &StageId) -> StageInput {
        let mut upstream = BTreeMap::new();
        let deps = self
            .graph
            .dependencies_of(id)
            .cloned()
            .unwrap_or_else(|_| BTreeSet::new());
        for dep in deps {
            if let Some(payload) = self.records.get(&dep).and_then(|r| r.payload.clone()) {
                upstream.insert(dep, payload);
            }
        }
        let kind = self
            .records
            .get(id)
            .map(|r| r.spec.kind)
            .unwrap_or(StageKind::FetchMetadata);
        StageInput {
            request: self.request.clone(),
            stage: id.clone(),
            kind,
            metadata: self.metadata().cloned(),
            upstream,
        }
    }

    /// Terminal outcomes of the stages feeding consolidate, in topological order.
    pub fn results(&self) -> Vec<StageResult> {
        self.order
            .iter()
            .filter_map(|id| self.records.get(id))
            .filter(|r| r.is_dispatched() && r.status.is_terminal())
            .map(|r| StageResult {
                stage: r.spec.id.clone(),
                kind: r.spec.kind,
                requirement: r.spec.requirement,
                status: match r.status {
                    StageStatus::Succeeded => ResultStatus::Success,
                    StageStatus::Skipped => ResultStatus::Degraded,
                    _ => ResultStatus::Failed,
                },
                payload: r.payload.clone(),
                attempts: r.attempts,
                last_error: r.last_error.clone(),
            })
            .collect()
    }

    /// Names of skipped stages, in topological order.
    pub fn degraded_stages(&self) -> Vec<String> {
        self.order
            .iter()
            .filter_map(|id| self.records.get(id))
            .filter(|r| r.status == StageStatus::Skipped)
            .map(|r| r.spec.id.to_string())
            .collect()
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            correlation_id: self.request.correlation_id().clone(),
            target: self.request.target(),
            phase: self.phase,
            stages: self
                .order
                .iter()
                .filter_map(|id| self.records.get(id))
                .map(|r| StageSnapshot {
                    stage: r.spec.id.to_string(),
                    kind: r.spec.kind,
                    requirement: r.spec.requirement,
                    status: r.status,
                    attempts: r.attempts,
                    last_error: r.last_error.as_ref().map(ToString::to_string),
                })
                .collect(),
            accepted_at: self.accepted_at,
            updated_at: self.updated_at,
            error: self.error.clone(),
        }
    }

    fn dispatched(&self) -> impl Iterator<Item = &StageRecord> {
        self.order
            .iter()
            .filter_map(|id| self.records.get(id))
            .filter(|r| r.is_dispatched())
    }

    fn update(&mut self, id: &StageId, f: impl FnOnce(&mut StageRecord)) {
        if let Some(r) = self.records.get_mut(id) {
            f(r);
        }
        self.touch();
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
