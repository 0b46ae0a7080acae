//! In-memory scripted collaborators.
//!
//! Every fake plays back a script of steps (delay, then result). Once the
//! script runs out, the last step repeats. Calls are counted and, when a shared
//! [`InvocationLog`] is attached, timestamped with tokio's clock so tests under
//! `start_paused` can assert on ordering and overlap. A scripted delay is cut
//! short by the call's deadline (`Timeout`) or cancellation, as a real client
//! bounded by its [`InvocationContext`] would be.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{sleep_until, Instant};

use crate::agents::adapters::{
    AnalyticsCollector, CodeAnalyzer, ContextRetriever, RepositoryIntegration,
};
use crate::agents::client::InvocationContext;
use crate::agents::error::{AgentError, AgentResult};
use crate::domain::payload::{
    AnalysisReport, AnalyticsNote, ChangeMetadata, ContextItem, Finding,
};
use crate::domain::review::ConsolidatedReview;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One scripted response.
#[derive(Debug, Clone)]
pub struct Step<T> {
    pub delay: Duration,
    pub result: AgentResult<T>,
}

impl<T> Step<T> {
    pub fn ok(value: T) -> Self {
        Self {
            delay: Duration::ZERO,
            result: Ok(value),
        }
    }

    pub fn err(error: AgentError) -> Self {
        Self {
            delay: Duration::ZERO,
            result: Err(error),
        }
    }

    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// Start/end timestamps of one fake invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationRecord {
    pub label: String,
    /// 1-based call number for this fake.
    pub call: usize,
    /// Attempt number the caller passed in.
    pub attempt: u32,
    pub started: Instant,
    /// `None` if the invocation was cut short before its delay elapsed.
    pub finished: Option<Instant>,
}

/// Shared, append-only log of fake invocations.
#[derive(Debug, Clone, Default)]
pub struct InvocationLog {
    records: Arc<Mutex<Vec<InvocationRecord>>>,
}

impl InvocationLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn start(&self, label: &str, call: usize, attempt: u32) -> usize {
        let mut records = lock(&self.records);
        records.push(InvocationRecord {
            label: label.to_string(),
            call,
            attempt,
            started: Instant::now(),
            finished: None,
        });
        records.len() - 1
    }

    fn finish(&self, index: usize) {
        if let Some(record) = lock(&self.records).get_mut(index) {
            record.finished = Some(Instant::now());
        }
    }

    pub fn records(&self) -> Vec<InvocationRecord> {
        lock(&self.records).clone()
    }

    pub fn for_label(&self, label: &str) -> Vec<InvocationRecord> {
        lock(&self.records)
            .iter()
            .filter(|r| r.label == label)
            .cloned()
            .collect()
    }
}

/// Script playback shared by every fake.
#[derive(Debug)]
struct Script<T> {
    label: String,
    steps: Vec<Step<T>>,
    calls: AtomicUsize,
    log: Option<InvocationLog>,
}

impl<T: Clone> Script<T> {
    fn new(label: &str, steps: Vec<Step<T>>) -> Self {
        Self {
            label: label.to_string(),
            steps,
            calls: AtomicUsize::new(0),
            log: None,
        }
    }

    async fn play(&self, ctx: &InvocationContext) -> AgentResult<T> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        let step = self.steps.get(n).or_else(|| self.steps.last()).cloned();
        let Some(step) = step else {
            return Err(AgentError::Rejected {
                reason: format!("{} has no scripted response", self.label),
            });
        };
        let entry = self
            .log
            .as_ref()
            .map(|log| log.start(&self.label, n + 1, ctx.attempt));
        if !step.delay.is_zero() {
            let started = Instant::now();
            let due = started + step.delay;
            tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => {
                    return Err(AgentError::Unreachable {
                        reason: format!("{} call cancelled", self.label),
                    });
                }
                _ = sleep_until(due.min(ctx.deadline)) => {}
            }
            if due > ctx.deadline {
                return Err(AgentError::Timeout {
                    elapsed_ms: started.elapsed().as_millis() as u64,
                });
            }
        }
        if let (Some(log), Some(index)) = (&self.log, entry) {
            log.finish(index);
        }
        step.result
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

/// A change record good enough for tests and demos.
pub fn sample_metadata(repository: &str, change_id: &str) -> ChangeMetadata {
    ChangeMetadata {
        repository: repository.to_string(),
        change_id: change_id.to_string(),
        title: format!("Change {change_id}"),
        author: "dev".to_string(),
        source_branch: format!("feature/{change_id}"),
        target_branch: "main".to_string(),
        head_sha: "0000000000000000000000000000000000000000".to_string(),
        changed_files: vec!["src/lib.rs".to_string()],
    }
}

/// A post the fake repository accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostRecord {
    pub idempotency_token: String,
    pub review_digest: String,
    pub receipt_id: String,
}

/// Scripted repository-hosting integration.
#[derive(Debug)]
pub struct ScriptedRepository {
    metadata: Script<ChangeMetadata>,
    posts: Script<String>,
    accepted: Mutex<Vec<PostRecord>>,
}

impl ScriptedRepository {
    /// Always returns `metadata`; every post succeeds.
    pub fn new(metadata: ChangeMetadata) -> Self {
        Self {
            metadata: Script::new("fetch_metadata", vec![Step::ok(metadata)]),
            posts: Script::new("post_comments", vec![Step::ok("receipt-1".to_string())]),
            accepted: Mutex::new(Vec::new()),
        }
    }

    pub fn with_metadata_script(mut self, steps: Vec<Step<ChangeMetadata>>) -> Self {
        self.metadata = Script {
            log: self.metadata.log.take(),
            ..Script::new("fetch_metadata", steps)
        };
        self
    }

    pub fn with_post_script(mut self, steps: Vec<Step<String>>) -> Self {
        self.posts = Script {
            log: self.posts.log.take(),
            ..Script::new("post_comments", steps)
        };
        self
    }

    pub fn with_log(mut self, log: InvocationLog) -> Self {
        self.metadata.log = Some(log.clone());
        self.posts.log = Some(log);
        self
    }

    pub fn metadata_calls(&self) -> usize {
        self.metadata.calls()
    }

    /// Every post attempt, successful or not.
    pub fn post_calls(&self) -> usize {
        self.posts.calls()
    }

    /// Successful posts only.
    pub fn accepted_posts(&self) -> Vec<PostRecord> {
        lock(&self.accepted).clone()
    }
}

#[async_trait]
impl RepositoryIntegration for ScriptedRepository {
    async fn fetch_change_metadata(
        &self,
        _repository: &str,
        _change_id: &str,
        ctx: &InvocationContext,
    ) -> AgentResult<ChangeMetadata> {
        self.metadata.play(ctx).await
    }

    async fn post_comments(
        &self,
        _repository: &str,
        _change_id: &str,
        review: &ConsolidatedReview,
        idempotency_token: &str,
        ctx: &InvocationContext,
    ) -> AgentResult<String> {
        let receipt_id = self.posts.play(ctx).await?;
        lock(&self.accepted).push(PostRecord {
            idempotency_token: idempotency_token.to_string(),
            review_digest: review.digest(),
            receipt_id: receipt_id.clone(),
        });
        Ok(receipt_id)
    }
}

/// Scripted analysis-type collaborator; `T` is the payload it returns.
#[derive(Debug)]
pub struct Scripted<T> {
    script: Script<T>,
}

impl<T: Clone> Scripted<T> {
    pub fn with_log(mut self, log: InvocationLog) -> Self {
        self.script.log = Some(log);
        self
    }

    pub fn calls(&self) -> usize {
        self.script.calls()
    }
}

impl Scripted<Vec<ContextItem>> {
    pub fn context(steps: Vec<Step<Vec<ContextItem>>>) -> Self {
        Self {
            script: Script::new("retrieve_context", steps),
        }
    }
}

impl Scripted<AnalysisReport> {
    pub fn analyzer(steps: Vec<Step<AnalysisReport>>) -> Self {
        Self {
            script: Script::new("analyze_code", steps),
        }
    }
}

impl Scripted<Vec<AnalyticsNote>> {
    pub fn analytics(steps: Vec<Step<Vec<AnalyticsNote>>>) -> Self {
        Self {
            script: Script::new("collect_analytics", steps),
        }
    }
}

pub type ScriptedContext = Scripted<Vec<ContextItem>>;
pub type ScriptedAnalyzer = Scripted<AnalysisReport>;
pub type ScriptedAnalytics = Scripted<Vec<AnalyticsNote>>;

#[async_trait]
impl ContextRetriever for Scripted<Vec<ContextItem>> {
    async fn retrieve_context(
        &self,
        _metadata: &ChangeMetadata,
        ctx: &InvocationContext,
    ) -> AgentResult<Vec<ContextItem>> {
        self.script.play(ctx).await
    }
}

#[async_trait]
impl CodeAnalyzer for Scripted<AnalysisReport> {
    async fn analyze(
        &self,
        _metadata: &ChangeMetadata,
        ctx: &InvocationContext,
    ) -> AgentResult<AnalysisReport> {
        self.script.play(ctx).await
    }
}

#[async_trait]
impl AnalyticsCollector for Scripted<Vec<AnalyticsNote>> {
    async fn collect(
        &self,
        _metadata: &ChangeMetadata,
        _findings: &[Finding],
        ctx: &InvocationContext,
    ) -> AgentResult<Vec<AnalyticsNote>> {
        self.script.play(ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;

    fn ctx() -> InvocationContext {
        InvocationContext::new(
            Instant::now() + Duration::from_secs(3600),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn test_last_step_repeats_after_script_runs_out() {
        let retriever = Scripted::context(vec![
            Step::err(AgentError::Unreachable {
                reason: "down".into(),
            }),
            Step::ok(vec![]),
        ]);
        let meta = sample_metadata("org/service", "1");
        assert!(retriever.retrieve_context(&meta, &ctx()).await.is_err());
        assert!(retriever.retrieve_context(&meta, &ctx()).await.is_ok());
        assert!(retriever.retrieve_context(&meta, &ctx()).await.is_ok());
        assert_eq!(retriever.calls(), 3);
    }

    #[tokio::test]
    async fn test_empty_script_rejects() {
        let analyzer = Scripted::analyzer(vec![]);
        let result = analyzer.analyze(&sample_metadata("o/r", "1"), &ctx()).await;
        assert!(matches!(result, Err(AgentError::Rejected { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_log_records_delay() {
        let log = InvocationLog::new();
        let analyzer = Scripted::analyzer(vec![
            Step::ok(AnalysisReport::default()).after(Duration::from_millis(300))
        ])
        .with_log(log.clone());
        analyzer
            .analyze(&sample_metadata("o/r", "1"), &ctx())
            .await
            .unwrap();
        let records = log.for_label("analyze_code");
        assert_eq!(records.len(), 1);
        let elapsed = records[0].finished.unwrap() - records[0].started;
        assert_eq!(elapsed, Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_repository_records_accepted_posts_only() {
        let repo = ScriptedRepository::new(sample_metadata("o/r", "1")).with_post_script(vec![
            Step::err(AgentError::Unreachable {
                reason: "503".into(),
            }),
            Step::ok("receipt-9".to_string()),
        ]);
        let review = ConsolidatedReview {
            correlation_id: "c".into(),
            repository: "o/r".into(),
            change_id: "1".into(),
            title: None,
            comments: vec![],
            summary: "s".into(),
            degraded_stages: vec![],
        };
        assert!(repo.post_comments("o/r", "1", &review, "tok", &ctx()).await.is_err());
        let receipt = repo.post_comments("o/r", "1", &review, "tok", &ctx()).await.unwrap();
        assert_eq!(receipt, "receipt-9");
        assert_eq!(repo.post_calls(), 2);
        assert_eq!(repo.accepted_posts().len(), 1);
        assert_eq!(repo.accepted_posts()[0].idempotency_token, "tok");
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_past_deadline_times_out_at_deadline() {
        let log = InvocationLog::new();
        let analyzer = Scripted::analyzer(vec![
            Step::ok(AnalysisReport::default()).after(Duration::from_secs(60))
        ])
        .with_log(log.clone());
        let start = Instant::now();
        let bounded =
            InvocationContext::new(start + Duration::from_secs(2), CancellationToken::new())
                .with_attempt(3);

        let result = analyzer.analyze(&sample_metadata("o/r", "1"), &bounded).await;

        assert!(matches!(result, Err(AgentError::Timeout { elapsed_ms: 2_000 })));
        assert_eq!(start.elapsed(), Duration::from_secs(2));
        let records = log.for_label("analyze_code");
        assert_eq!(records[0].attempt, 3);
        assert!(records[0].finished.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_cuts_delay_short() {
        let retriever = Scripted::context(vec![Step::ok(vec![]).after(Duration::from_secs(60))]);
        let cancel = CancellationToken::new();
        let call =
            InvocationContext::new(Instant::now() + Duration::from_secs(3600), cancel.clone());
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });
        let start = Instant::now();

        let result = retriever
            .retrieve_context(&sample_metadata("o/r", "1"), &call)
            .await;

        assert!(matches!(result, Err(AgentError::Unreachable { .. })));
        assert_eq!(start.elapsed(), Duration::from_secs(1));
    }
}
