#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use revo_core::agents::fakes::{
    sample_metadata, InvocationLog, InvocationRecord, Scripted, ScriptedAnalytics,
    ScriptedAnalyzer, ScriptedContext, ScriptedRepository, Step,
};
use revo_core::{
    AgentError, AnalysisReport, AnalyticsNote, ChangeMetadata, Collaborators, ContextItem,
    Finding, Locator, OrchestratorConfig, ReviewRequest, Severity, Supervisor,
};

pub const REPO: &str = "org/service";
pub const CHANGE: &str = "42";

/// Scripted collaborators sharing one invocation log.
pub struct Harness {
    pub log: InvocationLog,
    pub repo: Arc<ScriptedRepository>,
    pub context: Arc<ScriptedContext>,
    pub analyzer: Arc<ScriptedAnalyzer>,
    pub analytics: Arc<ScriptedAnalytics>,
}

pub struct Scripts {
    pub metadata: Vec<Step<ChangeMetadata>>,
    pub context: Vec<Step<Vec<ContextItem>>>,
    pub analyzer: Vec<Step<AnalysisReport>>,
    pub analytics: Vec<Step<Vec<AnalyticsNote>>>,
    pub posts: Vec<Step<String>>,
}

impl Default for Scripts {
    fn default() -> Self {
        Self {
            metadata: vec![Step::ok(sample_metadata(REPO, CHANGE))],
            context: vec![Step::ok(context_items())],
            analyzer: vec![Step::ok(report(2))],
            analytics: vec![Step::ok(vec![AnalyticsNote {
                metric: "churn".into(),
                value: 4.0,
                message: "file changed often this month".into(),
            }])],
            posts: vec![Step::ok("receipt-1".into())],
        }
    }
}

impl Harness {
    pub fn new(scripts: Scripts) -> Self {
        let log = InvocationLog::new();
        let repo = ScriptedRepository::new(sample_metadata(REPO, CHANGE))
            .with_metadata_script(scripts.metadata)
            .with_post_script(scripts.posts)
            .with_log(log.clone());
        Self {
            repo: Arc::new(repo),
            context: Arc::new(Scripted::context(scripts.context).with_log(log.clone())),
            analyzer: Arc::new(Scripted::analyzer(scripts.analyzer).with_log(log.clone())),
            analytics: Arc::new(Scripted::analytics(scripts.analytics).with_log(log.clone())),
            log,
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            repository: self.repo.clone(),
            context: Some(self.context.clone()),
            analyzer: self.analyzer.clone(),
            analytics: Some(self.analytics.clone()),
        }
    }

    pub fn supervisor(&self, config: OrchestratorConfig) -> Supervisor {
        Supervisor::new(config, self.collaborators()).expect("valid config")
    }

    pub fn only(&self, label: &str) -> InvocationRecord {
        let records = self.log.for_label(label);
        assert_eq!(records.len(), 1, "expected one invocation of {label}");
        records[0].clone()
    }
}

/// Fast backoff so retry scenarios stay short.
pub fn config() -> OrchestratorConfig {
    let mut cfg = OrchestratorConfig::default();
    cfg.stage_defaults.backoff_base_ms = 100;
    cfg.stage_defaults.backoff_ceiling_ms = 1_000;
    cfg.delivery.backoff_base_ms = 50;
    cfg
}

pub fn request(correlation_id: &str) -> ReviewRequest {
    ReviewRequest::new(REPO, CHANGE).with_correlation_id(correlation_id)
}

pub fn report(findings: u32) -> AnalysisReport {
    AnalysisReport {
        findings: (1..=findings)
            .map(|i| Finding {
                locator: Locator::new("src/cache.rs", i * 10),
                severity: Severity::Warning,
                message: format!("finding {i}"),
            })
            .collect(),
        summary: Some(format!("{findings} issue(s) found")),
    }
}

pub fn context_items() -> Vec<ContextItem> {
    vec![ContextItem {
        source: "mr!17".into(),
        excerpt: "cache eviction was reworked here before".into(),
        locator: Some(Locator::new("src/cache.rs", 10)),
    }]
}

pub fn unreachable() -> AgentError {
    AgentError::Unreachable {
        reason: "connection refused".into(),
    }
}

pub fn secs(n: u64) -> Duration {
    Duration::from_secs(n)
}
