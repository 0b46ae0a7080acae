//! Executes a request's task graph.
//!
//! The driver loop is the only writer of [`RequestState`]. Each dispatched
//! attempt runs in its own task, bounded by a permit from the shared worker
//! pool and by `min(stage timeout, request deadline)`. Workers report back over
//! an `mpsc` channel tagged with the attempt number; the driver records a
//! result only if that attempt is still the one it is waiting for.

use std::sync::Arc;

use tokio::sync::{mpsc, watch, Semaphore};
use tokio::time::{sleep_until, timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::agents::client::{AgentRegistry, InvocationContext};
use crate::agents::error::AgentError;
use crate::domain::error::{OrchestratorError, Result};
use crate::domain::payload::StagePayload;
use crate::engine::state::{RequestPhase, RequestState, StatusSnapshot};
use crate::graph::stage::{StageId, StageKind};
use crate::metrics::METRICS;
use crate::obs;
use crate::retry::{Decision, FailureManager};

/// What a worker sends back when its attempt finishes.
#[derive(Debug)]
struct StageCompletion {
    stage: StageId,
    attempt: u32,
    result: std::result::Result<StagePayload, AgentError>,
    started_at: Instant,
    finished_at: Instant,
}

/// Drives task graphs to completion against an [`AgentRegistry`].
#[derive(Clone)]
pub struct WorkflowEngine {
    registry: AgentRegistry,
    pool: Arc<Semaphore>,
    failures: FailureManager,
}

impl WorkflowEngine {
    /// `pool` is shared by every request this engine runs.
    pub fn new(registry: AgentRegistry, pool: Arc<Semaphore>) -> Self {
        Self {
            registry,
            pool,
            failures: FailureManager::new(),
        }
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    /// Run every dispatched stage of `state` to a terminal status.
    ///
    /// On success the request is left in `Consolidating`. A required stage
    /// failing permanently, or still incomplete at `deadline`, fails the
    /// request with `IncompleteReview` (`InvalidRequest` when the change does
    /// not exist). Cancelling `cancel` abandons all in-flight attempts.
    #[instrument(skip_all, fields(correlation_id = %state.request().correlation_id()))]
    pub async fn run(
        &self,
        state: &mut RequestState,
        deadline: Instant,
        cancel: &CancellationToken,
        status: &watch::Sender<StatusSnapshot>,
    ) -> Result<()> {
        self.check_clients(state)?;

        let started = Instant::now();
        let token = cancel.child_token();
        let (tx, mut rx) = mpsc::unbounded_channel::<StageCompletion>();
        let correlation_id = state.request().correlation_id().to_string();

        state.set_phase(RequestPhase::Running);
        status.send_replace(state.snapshot());

        loop {
            for id in state.ready_stages(Instant::now()) {
                self.dispatch(state, &id, deadline, &token, &tx);
            }
            status.send_replace(state.snapshot());

            if state.dispatch_complete() {
                state.set_phase(RequestPhase::Consolidating);
                status.send_replace(state.snapshot());
                return Ok(());
            }

            let next_retry = state.next_retry_at();
            if state.running_count() == 0 && next_retry.is_none() {
                // Nothing running, nothing scheduled, yet stages remain.
                return self.give_up(state, &token, &mut rx, status, "no stage can make progress");
            }

            tokio::select! {
                biased;
                Some(done) = rx.recv() => {
                    if let Err(e) = self.handle(state, done, &token, &correlation_id) {
                        token.cancel();
                        state.fail(&e);
                        status.send_replace(state.snapshot());
                        return Err(e);
                    }
                }
                _ = sleep_until(next_retry.unwrap_or(deadline)), if next_retry.is_some() => {}
                _ = sleep_until(deadline) => {
                    let budget_ms = deadline.duration_since(started).as_millis() as u64;
                    return self.expire(state, &token, &mut rx, status, budget_ms);
                }
                _ = cancel.cancelled() => {
                    return self.give_up(state, &token, &mut rx, status, "request cancelled");
                }
            }
        }
    }

    fn check_clients(&self, state: &RequestState) -> Result<()> {
        for spec in state.graph().stages() {
            if let Some(cap) = spec.kind.capability() {
                if !self.registry.contains(cap) {
                    return Err(OrchestratorError::InvalidGraph {
                        reason: format!("no collaborator registered for {cap} (stage {})", spec.id),
                    });
                }
            }
        }
        Ok(())
    }

    fn dispatch(
        &self,
        state: &mut RequestState,
        id: &StageId,
        request_deadline: Instant,
        token: &CancellationToken,
        tx: &mpsc::UnboundedSender<StageCompletion>,
    ) {
        let Some(spec) = state.record(id).map(|r| r.spec.clone()) else {
            return;
        };
        let Some(client) = spec.kind.capability().and_then(|c| self.registry.get(c)) else {
            return;
        };
        let input = state.stage_input(id);
        let attempt = state.mark_running(id);

        METRICS.inc_stages_dispatched();
        obs::emit_stage_dispatched(
            state.request().correlation_id().as_str(),
            id.as_str(),
            attempt,
        );

        let pool = Arc::clone(&self.pool);
        let token = token.clone();
        let tx = tx.clone();
        let stage = id.clone();

        tokio::spawn(async move {
            let permit = tokio::select! {
                biased;
                _ = token.cancelled() => return,
                permit = pool.acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => return,
                },
            };

            let started_at = Instant::now();
            let deadline = (started_at + spec.timeout).min(request_deadline);
            let ctx = InvocationContext::new(deadline, token.clone()).with_attempt(attempt);

            let result = tokio::select! {
                biased;
                _ = token.cancelled() => return,
                r = timeout_at(deadline, client.invoke(&input, &ctx)) => match r {
                    Ok(r) => r,
                    Err(_) => Err(AgentError::Timeout {
                        elapsed_ms: started_at.elapsed().as_millis() as u64,
                    }),
                },
            };
            drop(permit);

            let _ = tx.send(StageCompletion {
                stage,
                attempt,
                result,
                started_at,
                finished_at: Instant::now(),
            });
        });
    }

    fn handle(
        &self,
        state: &mut RequestState,
        done: StageCompletion,
        token: &CancellationToken,
        correlation_id: &str,
    ) -> Result<()> {
        let stage = done.stage.as_str();
        if !state.accepts(&done.stage, done.attempt) {
            METRICS.inc_late_results_discarded();
            obs::emit_late_result_discarded(correlation_id, stage, done.attempt);
            return Ok(());
        }
        let duration_ms = done.finished_at.duration_since(done.started_at).as_millis() as u64;

        let error = match done.result {
            Ok(payload) => {
                obs::emit_stage_finished(correlation_id, stage, done.attempt, "succeeded", duration_ms);
                state.mark_succeeded(&done.stage, payload);
                return Ok(());
            }
            Err(e) => e,
        };

        let Some(spec) = state.record(&done.stage).map(|r| r.spec.clone()) else {
            return Ok(());
        };
        match self.failures.decide(&spec, &error, done.attempt) {
            Decision::Retry(delay) => {
                METRICS.inc_retries_scheduled();
                obs::emit_retry_scheduled(
                    correlation_id,
                    stage,
                    done.attempt,
                    delay.as_millis() as u64,
                    &error,
                );
                state.schedule_retry(&done.stage, error, Instant::now() + delay);
                Ok(())
            }
            Decision::Degrade => {
                METRICS.inc_stages_degraded();
                obs::emit_stage_finished(correlation_id, stage, done.attempt, "skipped", duration_ms);
                obs::emit_stage_degraded(correlation_id, stage, &error.to_string());
                state.mark_skipped(&done.stage, Some(error));
                Ok(())
            }
            Decision::Abort => {
                obs::emit_stage_finished(correlation_id, stage, done.attempt, "failed", duration_ms);
                token.cancel();
                state.mark_failed(&done.stage, error.clone());
                for skipped in state.skip_optional_dependents(&done.stage) {
                    obs::emit_stage_degraded(correlation_id, skipped.as_str(), "dependency failed");
                }
                Err(abort_error(state, &done.stage, spec.kind, &error))
            }
        }
    }

    /// The request deadline passed: cancel everything, skip optional stages,
    /// fail if any required stage is still incomplete.
    fn expire(
        &self,
        state: &mut RequestState,
        token: &CancellationToken,
        rx: &mut mpsc::UnboundedReceiver<StageCompletion>,
        status: &watch::Sender<StatusSnapshot>,
        budget_ms: u64,
    ) -> Result<()> {
        token.cancel();
        state.set_phase(RequestPhase::Consolidating);
        discard_pending(state, rx);

        let correlation_id = state.request().correlation_id().to_string();
        let mut missing = Vec::new();
        for id in state.incomplete() {
            let required = state.record(&id).map_or(false, |r| r.spec.is_required());
            let error = AgentError::Timeout {
                elapsed_ms: budget_ms,
            };
            if required {
                state.mark_failed(&id, error);
                missing.push(id.to_string());
            } else {
                METRICS.inc_stages_degraded();
                obs::emit_stage_degraded(&correlation_id, id.as_str(), "request deadline exceeded");
                state.mark_skipped(&id, Some(error));
            }
        }

        if missing.is_empty() {
            debug!("request deadline reached with only optional stages outstanding");
            status.send_replace(state.snapshot());
            return Ok(());
        }
        let err = OrchestratorError::IncompleteReview {
            missing,
            reason: "request deadline exceeded".to_string(),
        };
        state.fail(&err);
        status.send_replace(state.snapshot());
        Err(err)
    }

    fn give_up(
        &self,
        state: &mut RequestState,
        token: &CancellationToken,
        rx: &mut mpsc::UnboundedReceiver<StageCompletion>,
        status: &watch::Sender<StatusSnapshot>,
        reason: &str,
    ) -> Result<()> {
        token.cancel();
        let missing: Vec<String> = state
            .unfinished_required()
            .iter()
            .map(ToString::to_string)
            .collect();
        let err = OrchestratorError::IncompleteReview {
            missing,
            reason: reason.to_string(),
        };
        state.fail(&err);
        discard_pending(state, rx);
        status.send_replace(state.snapshot());
        Err(err)
    }
}

/// Drop completions that were queued when the request left `Running`.
fn discard_pending(state: &RequestState, rx: &mut mpsc::UnboundedReceiver<StageCompletion>) {
    let correlation_id = state.request().correlation_id().to_string();
    while let Ok(done) = rx.try_recv() {
        METRICS.inc_late_results_discarded();
        obs::emit_late_result_discarded(&correlation_id, done.stage.as_str(), done.attempt);
    }
}

fn abort_error(
    state: &RequestState,
    failed: &StageId,
    kind: StageKind,
    error: &AgentError,
) -> OrchestratorError {
    if kind == StageKind::FetchMetadata {
        if let AgentError::NotFound { resource } = error {
            return OrchestratorError::InvalidRequest {
                reason: format!("change not found: {resource}"),
            };
        }
    }
    let mut missing = vec![failed.to_string()];
    missing.extend(
        state
            .unfinished_required()
            .into_iter()
            .filter(|id| id != failed)
            .map(|id| id.to_string()),
    );
    OrchestratorError::IncompleteReview {
        missing,
        reason: format!("stage {failed} failed: {error}"),
    }
}
