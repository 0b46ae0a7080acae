//! Request submission and status surfaces.
//!
//! The supervisor owns one engine, one consolidator and one delivery gate, and
//! keeps a registry of requests keyed by correlation id. Every request runs in
//! its own task: build graph, execute, consolidate, deliver. Callers either
//! await the outcome directly ([`Supervisor::review`]) or submit and poll
//! ([`Supervisor::submit`], [`Supervisor::status`], [`Supervisor::wait`]).
//! Finished requests are forgotten once the retention window has passed.
//!
//! The request deadline and the request's cancellation token bound the whole
//! pipeline, delivery included. When delivery fails, the consolidated review
//! is kept with the failed entry; resubmitting that correlation id retries the
//! post with the same review instead of running the stages again.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::agents::adapters::Collaborators;
use crate::config::OrchestratorConfig;
use crate::consolidate::Consolidator;
use crate::delivery::DeliveryGate;
use crate::domain::error::{OrchestratorError, Result};
use crate::domain::request::{CorrelationId, ReviewRequest};
use crate::domain::review::{ConsolidatedReview, ReviewOutcome};
use crate::engine::state::{RequestPhase, RequestState, StatusSnapshot};
use crate::engine::workflow::WorkflowEngine;
use crate::graph::builder::TaskGraphBuilder;
use crate::graph::stage::{StageKind, StageStatus};
use crate::graph::task_graph::TaskGraph;
use crate::metrics::METRICS;
use crate::obs;

/// How a submission was admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Admission {
    /// A new pipeline was started.
    Started,
    /// The correlation id is already running; no new work was started.
    InFlight,
    /// The correlation id completed within the retention window.
    Finished,
    /// An earlier delivery of this correlation id failed; posting of its
    /// stored review was restarted.
    Resumed,
}

/// Receipt for an asynchronous submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Acceptance {
    pub correlation_id: CorrelationId,
    pub accepted_at: DateTime<Utc>,
    pub admission: Admission,
}

#[derive(Debug, Clone)]
struct Finished {
    result: Result<ReviewOutcome>,
    /// Present when the review was built but could not be posted.
    undelivered: Option<Arc<Undelivered>>,
    at: Instant,
}

/// A consolidated review whose delivery failed, with the state it came from.
#[derive(Debug)]
struct Undelivered {
    state: RequestState,
    review: ConsolidatedReview,
}

/// What a pipeline run leaves behind.
struct Run {
    result: Result<ReviewOutcome>,
    undelivered: Option<Undelivered>,
}

impl Run {
    fn failed(error: OrchestratorError) -> Self {
        Self {
            result: Err(error),
            undelivered: None,
        }
    }
}

/// Where a submission starts.
enum Job {
    Pipeline(RequestState),
    Redeliver(Arc<Undelivered>),
}

struct Entry {
    accepted_at: DateTime<Utc>,
    status: watch::Receiver<StatusSnapshot>,
    outcome: watch::Receiver<Option<Finished>>,
    cancel: CancellationToken,
}

impl Entry {
    fn finished(&self) -> Option<Finished> {
        self.outcome.borrow().clone()
    }
}

struct Inner {
    config: OrchestratorConfig,
    builder: TaskGraphBuilder,
    engine: WorkflowEngine,
    consolidator: Consolidator,
    gate: DeliveryGate,
    requests: Mutex<HashMap<CorrelationId, Entry>>,
}

/// Cheap to clone; clones share the registry, pool and delivery gate.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    pub fn new(config: OrchestratorConfig, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;
        let pool = Arc::new(Semaphore::new(config.worker_pool_size));
        let engine = WorkflowEngine::new(collaborators.registry(), pool);
        let gate = DeliveryGate::new(
            Arc::clone(&collaborators.repository),
            config.delivery.clone(),
            config.retention(),
        );
        Ok(Self {
            inner: Arc::new(Inner {
                builder: config.graph_builder(),
                engine,
                consolidator: Consolidator::new(),
                gate,
                requests: Mutex::new(HashMap::new()),
                config,
            }),
        })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    /// The graph `request` would run with.
    pub fn plan(&self, request: &ReviewRequest) -> Result<TaskGraph> {
        self.inner.builder.build(request)
    }

    /// Run `request` and wait for its review (and Ack, when posting).
    ///
    /// Fails with `RequestInFlight` if the correlation id is already running.
    /// A correlation id that completed within the retention window returns the
    /// stored outcome without running again.
    pub async fn review(&self, request: ReviewRequest) -> Result<ReviewOutcome> {
        let acceptance = self.submit(request)?;
        if acceptance.admission == Admission::InFlight {
            return Err(OrchestratorError::RequestInFlight {
                correlation_id: acceptance.correlation_id.to_string(),
            });
        }
        self.wait(&acceptance.correlation_id).await
    }

    /// Start `request` in the background and return immediately.
    ///
    /// Must be called from within a Tokio runtime. Resubmitting a running
    /// correlation id returns its existing acceptance. Resubmitting one whose
    /// delivery failed retries the post of the stored review; resubmitting one
    /// that failed earlier starts it afresh.
    pub fn submit(&self, request: ReviewRequest) -> Result<Acceptance> {
        let graph = self.inner.builder.build(&request)?;
        let id = request.correlation_id().clone();

        let mut requests = self.lock_requests();
        self.purge(&mut requests);

        let mut resume = None;
        if let Some(entry) = requests.get(&id) {
            let admission = match entry.finished() {
                None => Some(Admission::InFlight),
                Some(f) if f.result.is_ok() => Some(Admission::Finished),
                Some(f) => {
                    resume = f.undelivered;
                    None
                }
            };
            if let Some(admission) = admission {
                return Ok(Acceptance {
                    correlation_id: id,
                    accepted_at: entry.accepted_at,
                    admission,
                });
            }
        }

        let (job, admission) = match resume {
            Some(pending) => (Job::Redeliver(pending), Admission::Resumed),
            None => (Job::Pipeline(RequestState::new(request, graph)), Admission::Started),
        };
        let snapshot = match &job {
            Job::Pipeline(state) => state.snapshot(),
            Job::Redeliver(pending) => pending.state.snapshot(),
        };
        let accepted_at = snapshot.accepted_at;
        let (status_tx, status_rx) = watch::channel(snapshot);
        let (outcome_tx, outcome_rx) = watch::channel(None);
        let cancel = CancellationToken::new();

        requests.insert(
            id.clone(),
            Entry {
                accepted_at,
                status: status_rx,
                outcome: outcome_rx,
                cancel: cancel.clone(),
            },
        );
        drop(requests);

        let inner = Arc::clone(&self.inner);
        let correlation_id = id.to_string();
        tokio::spawn(async move {
            let target = match &job {
                Job::Pipeline(state) => state.request().target(),
                Job::Redeliver(pending) => pending.state.request().target(),
            };
            let span = obs::RequestSpan::span(&correlation_id, &target);
            let started = Instant::now();

            let run = async {
                match job {
                    Job::Pipeline(state) => inner.execute(state, &status_tx, &cancel).await,
                    Job::Redeliver(pending) => {
                        let deadline = Instant::now() + inner.config.request_deadline();
                        let mut state = pending.state.clone();
                        state.reopen_for_delivery();
                        let review = pending.review.clone();
                        inner.deliver(state, review, deadline, &status_tx, &cancel).await
                    }
                }
            }
            .instrument(span)
            .await;

            let outcome = match &run.result {
                Ok(_) => "completed",
                Err(e) => e.kind(),
            };
            obs::emit_request_finished(
                &correlation_id,
                started.elapsed().as_millis() as u64,
                outcome,
            );
            outcome_tx.send_replace(Some(Finished {
                result: run.result,
                undelivered: run.undelivered.map(Arc::new),
                at: Instant::now(),
            }));
        });

        Ok(Acceptance {
            correlation_id: id,
            accepted_at,
            admission,
        })
    }

    /// Wait for the outcome of a submitted request.
    pub async fn wait(&self, id: &CorrelationId) -> Result<ReviewOutcome> {
        let mut outcome = {
            let requests = self.lock_requests();
            match requests.get(id) {
                Some(entry) => entry.outcome.clone(),
                None => {
                    return Err(OrchestratorError::InvalidRequest {
                        reason: format!("unknown correlation id {id}"),
                    })
                }
            }
        };
        let finished = match outcome.wait_for(Option::is_some).await {
            Ok(done) => done.clone(),
            Err(_) => None,
        };
        match finished {
            Some(f) => f.result,
            None => Err(OrchestratorError::IncompleteReview {
                missing: Vec::new(),
                reason: "request task ended without an outcome".to_string(),
            }),
        }
    }

    /// Current snapshot of a request; `None` if unknown or expired.
    pub fn status(&self, id: &CorrelationId) -> Option<StatusSnapshot> {
        let mut requests = self.lock_requests();
        self.purge(&mut requests);
        requests.get(id).map(|e| e.status.borrow().clone())
    }

    /// A receiver that sees every published snapshot of the request.
    pub fn subscribe(&self, id: &CorrelationId) -> Option<watch::Receiver<StatusSnapshot>> {
        let requests = self.lock_requests();
        requests.get(id).map(|e| e.status.clone())
    }

    /// Abandon a running request. Returns `false` if it is unknown or finished.
    pub fn cancel(&self, id: &CorrelationId) -> bool {
        let requests = self.lock_requests();
        match requests.get(id) {
            Some(entry) if entry.finished().is_none() => {
                entry.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    /// Requests currently remembered (running or within retention).
    pub fn tracked(&self) -> usize {
        let mut requests = self.lock_requests();
        self.purge(&mut requests);
        requests.len()
    }

    fn lock_requests(&self) -> MutexGuard<'_, HashMap<CorrelationId, Entry>> {
        self.inner
            .requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn purge(&self, requests: &mut HashMap<CorrelationId, Entry>) {
        let now = Instant::now();
        let retention = self.inner.config.retention();
        requests.retain(|_, entry| match entry.finished() {
            Some(f) => now.duration_since(f.at) < retention,
            None => true,
        });
    }
}

impl Inner {
    /// Engine, then consolidation, then (optionally) delivery. Every phase
    /// change is published on `status`.
    async fn execute(
        &self,
        mut state: RequestState,
        status: &watch::Sender<StatusSnapshot>,
        cancel: &CancellationToken,
    ) -> Run {
        let request = state.request().clone();
        obs::emit_request_accepted(
            request.correlation_id().as_str(),
            &request.target(),
            state.graph().len(),
        );

        let deadline = Instant::now() + self.config.request_deadline();
        if let Err(e) = self.engine.run(&mut state, deadline, cancel, status).await {
            return Run::failed(Self::failed(&mut state, status, e));
        }

        state.set_in_process_status(StageKind::Consolidate, StageStatus::Running);
        status.send_replace(state.snapshot());
        let review = match self.consolidator.consolidate(&state) {
            Ok(review) => review,
            Err(e) => {
                state.set_in_process_status(StageKind::Consolidate, StageStatus::Failed);
                return Run::failed(Self::failed(&mut state, status, e));
            }
        };
        state.set_in_process_status(StageKind::Consolidate, StageStatus::Succeeded);

        self.deliver(state, review, deadline, status, cancel).await
    }

    /// Post `review` unless the request opted out, then complete the request.
    /// A failed post keeps the review so a resubmission can retry it.
    async fn deliver(
        &self,
        mut state: RequestState,
        review: ConsolidatedReview,
        deadline: Instant,
        status: &watch::Sender<StatusSnapshot>,
        cancel: &CancellationToken,
    ) -> Run {
        let id = state.request().correlation_id().clone();
        let ack = if state.request().post_comments() {
            state.set_phase(RequestPhase::Delivering);
            state.set_in_process_status(StageKind::PostComments, StageStatus::Running);
            status.send_replace(state.snapshot());
            match self.gate.deliver(&id, &review, deadline, cancel).await {
                Ok(ack) => {
                    state.set_in_process_status(StageKind::PostComments, StageStatus::Succeeded);
                    Some(ack)
                }
                Err(e) => {
                    state.set_in_process_status(StageKind::PostComments, StageStatus::Failed);
                    let error = Self::failed(&mut state, status, e);
                    return Run {
                        result: Err(error),
                        undelivered: Some(Undelivered { state, review }),
                    };
                }
            }
        } else {
            None
        };

        state.set_phase(RequestPhase::Completed);
        status.send_replace(state.snapshot());
        METRICS.flush();
        Run {
            result: Ok(ReviewOutcome { review, ack }),
            undelivered: None,
        }
    }

    fn failed(
        state: &mut RequestState,
        status: &watch::Sender<StatusSnapshot>,
        error: OrchestratorError,
    ) -> OrchestratorError {
        if state.phase() != RequestPhase::Failed {
            state.fail(&error);
        }
        status.send_replace(state.snapshot());
        error
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::agents::fakes::{sample_metadata, Scripted, ScriptedRepository, Step};
    use crate::domain::payload::{AnalysisReport, Finding, Locator, Severity};

    fn collaborators(repo: Arc<ScriptedRepository>, delay: Duration) -> Collaborators {
        Collaborators {
            repository: repo,
            context: Some(Arc::new(Scripted::context(vec![Step::ok(vec![])]))),
            analyzer: Arc::new(Scripted::analyzer(vec![Step::ok(AnalysisReport {
                findings: vec![Finding {
                    locator: Locator::new("src/lib.rs", 7),
                    severity: Severity::Error,
                    message: "panics on empty input".into(),
                }],
                summary: None,
            })
            .after(delay)])),
            analytics: None,
        }
    }

    fn config() -> OrchestratorConfig {
        let mut cfg = OrchestratorConfig::default();
        cfg.graph.analysis_stages = vec!["retrieve_context".into(), "analyze_code".into()];
        cfg
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_review_posts_once() {
        let repo = Arc::new(ScriptedRepository::new(sample_metadata("org/service", "42")));
        let sup = Supervisor::new(config(), collaborators(repo.clone(), Duration::ZERO)).unwrap();
        let outcome = sup
            .review(ReviewRequest::new("org/service", "42").with_correlation_id("corr-s"))
            .await
            .unwrap();
        assert_eq!(outcome.review.comments.len(), 1);
        assert!(outcome.ack.is_some());
        assert_eq!(repo.post_calls(), 1);
        let snap = sup.status(&"corr-s".into()).unwrap();
        assert_eq!(snap.phase, RequestPhase::Completed);
        assert_eq!(
            snap.stage("post_comments").unwrap().status,
            StageStatus::Succeeded
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_review_of_running_id_is_rejected() {
        let repo = Arc::new(ScriptedRepository::new(sample_metadata("org/service", "42")));
        let sup = Supervisor::new(config(), collaborators(repo, Duration::from_secs(5))).unwrap();
        let request = ReviewRequest::new("org/service", "42").with_correlation_id("corr-dup");
        let acceptance = sup.submit(request.clone()).unwrap();
        assert_eq!(acceptance.admission, Admission::Started);
        let err = sup.review(request.clone()).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::RequestInFlight { .. }));
        let again = sup.submit(request).unwrap();
        assert_eq!(again.admission, Admission::InFlight);
        assert_eq!(again.accepted_at, acceptance.accepted_at);
        assert!(sup.wait(&"corr-dup".into()).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_request_fails_before_acceptance() {
        let repo = Arc::new(ScriptedRepository::new(sample_metadata("org/service", "42")));
        let sup = Supervisor::new(config(), collaborators(repo, Duration::ZERO)).unwrap();
        let err = sup.submit(ReviewRequest::new("org/service", "")).unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidRequest { .. }));
        assert_eq!(sup.tracked(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_on_unknown_id_is_invalid_request() {
        let repo = Arc::new(ScriptedRepository::new(sample_metadata("org/service", "42")));
        let sup = Supervisor::new(config(), collaborators(repo, Duration::ZERO)).unwrap();
        assert!(matches!(
            sup.wait(&"nope".into()).await,
            Err(OrchestratorError::InvalidRequest { .. })
        ));
        assert!(sup.status(&"nope".into()).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_fails_running_request() {
        let repo = Arc::new(ScriptedRepository::new(sample_metadata("org/service", "42")));
        let sup = Supervisor::new(config(), collaborators(repo.clone(), Duration::from_secs(30)))
            .unwrap();
        let id = CorrelationId::from("corr-cancel");
        sup.submit(ReviewRequest::new("org/service", "42").with_correlation_id(id.clone()))
            .unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(sup.cancel(&id));
        assert!(sup.wait(&id).await.is_err());
        assert_eq!(sup.status(&id).unwrap().phase, RequestPhase::Failed);
        assert_eq!(repo.post_calls(), 0);
        assert!(!sup.cancel(&id));
    }

    #[test]
    fn test_zero_pool_config_is_rejected() {
        let repo = Arc::new(ScriptedRepository::new(sample_metadata("org/service", "42")));
        let cfg = OrchestratorConfig {
            worker_pool_size: 0,
            ..config()
        };
        assert!(matches!(
            Supervisor::new(cfg, collaborators(repo, Duration::ZERO)),
            Err(OrchestratorError::Config(_))
        ));
    }
}
