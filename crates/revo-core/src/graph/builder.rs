//! Builds the per-request task graph.
//!
//! `build` is pure: it reads only the request and the builder's options, so the
//! same request always yields the same graph.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::error::{OrchestratorError, Result};
use crate::domain::request::ReviewRequest;
use crate::graph::stage::{Requirement, RetryPolicy, StageKind, StageSpec};
use crate::graph::task_graph::TaskGraph;

/// Analysis stages in their canonical chain order.
const ANALYSIS_ORDER: [StageKind; 3] = [
    StageKind::RetrieveContext,
    StageKind::AnalyzeCode,
    StageKind::CollectAnalytics,
];

/// How analysis stages are wired between the root and consolidate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GraphShape {
    /// Every analysis stage depends only on the metadata root.
    #[default]
    Parallel,
    /// Analysis stages form a chain: context, then code analysis, then analytics.
    Sequential,
}

impl std::str::FromStr for GraphShape {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "parallel" => Ok(GraphShape::Parallel),
            "sequential" => Ok(GraphShape::Sequential),
            other => Err(OrchestratorError::Config(format!(
                "unknown graph shape '{other}' (expected parallel or sequential)"
            ))),
        }
    }
}

/// Timeout and retry defaults applied to every stage unless overridden.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageDefaults {
    pub timeout_ms: u64,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_multiplier: u32,
    pub backoff_ceiling_ms: u64,
}

impl Default for StageDefaults {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            max_attempts: 3,
            backoff_base_ms: 500,
            backoff_multiplier: 2,
            backoff_ceiling_ms: 8_000,
        }
    }
}

impl StageDefaults {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            backoff_base: Duration::from_millis(self.backoff_base_ms),
            multiplier: self.backoff_multiplier.max(1),
            backoff_ceiling: Duration::from_millis(self.backoff_ceiling_ms),
        }
    }
}

/// Per-kind override of the stage defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageOverride {
    pub timeout_ms: Option<u64>,
    pub max_attempts: Option<u32>,
}

/// Which analysis stages a graph contains and how they behave.
///
/// Maps are keyed by stage name (`retrieve_context`, ...) so they read
/// naturally as TOML tables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphOptions {
    pub shape: GraphShape,
    pub analysis_stages: Vec<String>,
    pub requirements: BTreeMap<String, Requirement>,
    pub overrides: BTreeMap<String, StageOverride>,
}

impl Default for GraphOptions {
    fn default() -> Self {
        let requirements = BTreeMap::from([
            (StageKind::AnalyzeCode.name().to_string(), Requirement::Required),
            (StageKind::RetrieveContext.name().to_string(), Requirement::Optional),
            (StageKind::CollectAnalytics.name().to_string(), Requirement::Optional),
        ]);
        Self {
            shape: GraphShape::Parallel,
            analysis_stages: ANALYSIS_ORDER.iter().map(|k| k.name().to_string()).collect(),
            requirements,
            overrides: BTreeMap::new(),
        }
    }
}

impl GraphOptions {
    /// Included analysis kinds, de-duplicated, in canonical order.
    pub fn analysis_kinds(&self) -> Result<Vec<StageKind>> {
        let mut requested = Vec::with_capacity(self.analysis_stages.len());
        for name in &self.analysis_stages {
            let kind = parse_kind(name)?;
            if !kind.is_analysis() {
                return Err(OrchestratorError::Config(format!(
                    "'{name}' is not an analysis stage"
                )));
            }
            requested.push(kind);
        }
        let kinds: Vec<StageKind> = ANALYSIS_ORDER
            .iter()
            .copied()
            .filter(|k| requested.contains(k))
            .collect();
        if kinds.is_empty() {
            return Err(OrchestratorError::Config(
                "at least one analysis stage must be included".to_string(),
            ));
        }
        Ok(kinds)
    }

    /// Requirement of `kind`. The root and in-process stages are always required.
    pub fn requirement_of(&self, kind: StageKind) -> Requirement {
        if !kind.is_analysis() {
            return Requirement::Required;
        }
        self.requirements
            .get(kind.name())
            .copied()
            .unwrap_or(Requirement::Optional)
    }

    /// Check every stage name used as a key or list entry.
    pub fn validate(&self) -> Result<()> {
        self.analysis_kinds()?;
        for name in self.requirements.keys().chain(self.overrides.keys()) {
            parse_kind(name)?;
        }
        if let Some(name) = self
            .requirements
            .iter()
            .find(|(name, req)| {
                name.as_str() == StageKind::FetchMetadata.name() && **req == Requirement::Optional
            })
            .map(|(name, _)| name)
        {
            return Err(OrchestratorError::Config(format!(
                "'{name}' is the root stage and cannot be optional"
            )));
        }
        Ok(())
    }
}

fn parse_kind(name: &str) -> Result<StageKind> {
    StageKind::parse(name)
        .ok_or_else(|| OrchestratorError::Config(format!("unknown stage kind '{name}'")))
}

/// Produces a validated [`TaskGraph`] for a [`ReviewRequest`].
#[derive(Debug, Clone, Default)]
pub struct TaskGraphBuilder {
    options: GraphOptions,
    defaults: StageDefaults,
}

impl TaskGraphBuilder {
    pub fn new(options: GraphOptions, defaults: StageDefaults) -> Self {
        Self { options, defaults }
    }

    pub fn options(&self) -> &GraphOptions {
        &self.options
    }

    /// Build the graph for `request`.
    ///
    /// Fails with `InvalidRequest` for a malformed request and with
    /// `InvalidGraph` if the options produce a graph that breaks its
    /// structural invariants.
    pub fn build(&self, request: &ReviewRequest) -> Result<TaskGraph> {
        request.validate()?;
        let analysis = self
            .options
            .analysis_kinds()
            .map_err(|e| OrchestratorError::InvalidGraph {
                reason: e.to_string(),
            })?;

        let mut graph = TaskGraph::new();
        let root = self.spec_for(StageKind::FetchMetadata);
        let consolidate = self.spec_for(StageKind::Consolidate);
        let root_id = root.id.clone();
        let consolidate_id = consolidate.id.clone();

        graph.add_stage(root)?;
        let mut previous = root_id.clone();
        for kind in &analysis {
            let spec = self.spec_for(*kind);
            let id = spec.id.clone();
            graph.add_stage(spec)?;
            match self.options.shape {
                GraphShape::Parallel => graph.add_dependency(&root_id, &id)?,
                GraphShape::Sequential => {
                    graph.add_dependency(&previous, &id)?;
                    previous = id.clone();
                }
            }
        }

        graph.add_stage(consolidate)?;
        for kind in &analysis {
            graph.add_dependency(&kind.default_id(), &consolidate_id)?;
        }

        if request.post_comments() {
            let post = self.spec_for(StageKind::PostComments);
            let post_id = post.id.clone();
            graph.add_stage(post)?;
            graph.add_dependency(&consolidate_id, &post_id)?;
        }

        graph.validate()?;
        Ok(graph)
    }

    fn spec_for(&self, kind: StageKind) -> StageSpec {
        let mut timeout = Duration::from_millis(self.defaults.timeout_ms);
        let mut retry = self.defaults.retry_policy();
        if let Some(o) = self.options.overrides.get(kind.name()) {
            if let Some(ms) = o.timeout_ms {
                timeout = Duration::from_millis(ms);
            }
            if let Some(n) = o.max_attempts {
                retry.max_attempts = n.max(1);
            }
        }
        StageSpec::new(kind, self.options.requirement_of(kind))
            .with_timeout(timeout)
            .with_retry(retry)
    }
}
