//! Consolidation of terminal stage outputs into one review.
//!
//! Comments are grouped by source in a fixed priority (code analysis, then
//! context, then analytics) and keep production order inside a group. When
//! comments from two different stages point at the same location both are
//! kept; the later one is marked as supplementing the stage that covered the
//! location first. Same-location comments from one stage stay unlinked. Nothing here reads a
//! clock or depends on completion order, so equal inputs give equal bytes.

use std::collections::BTreeMap;

use crate::domain::error::{OrchestratorError, Result};
use crate::domain::payload::{Locator, Severity, StagePayload};
use crate::domain::review::{ConsolidatedReview, ReviewComment};
use crate::engine::state::{RequestState, ResultStatus, StageResult};
use crate::graph::stage::{Requirement, StageKind};

/// A comment before positions and supplement links are assigned.
struct Draft {
    source: StageKind,
    locator: Option<Locator>,
    severity: Option<Severity>,
    body: String,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Consolidator;

impl Consolidator {
    pub fn new() -> Self {
        Self
    }

    /// Merge the terminal results held by `state`.
    ///
    /// Fails with `IncompleteReview` if a stage feeding consolidation is not
    /// terminal or a required one failed, and with `EmptyReview` when no
    /// comment survives and no required stage produced a summary.
    pub fn consolidate(&self, state: &RequestState) -> Result<ConsolidatedReview> {
        let incomplete = state.incomplete();
        if !incomplete.is_empty() {
            return Err(OrchestratorError::IncompleteReview {
                missing: incomplete.iter().map(ToString::to_string).collect(),
                reason: "consolidation started before all stages were terminal".to_string(),
            });
        }

        let mut results = state.results();
        if let Some(failed) = results
            .iter()
            .find(|r| r.status == ResultStatus::Failed && r.requirement == Requirement::Required)
        {
            return Err(OrchestratorError::IncompleteReview {
                missing: vec![failed.stage.to_string()],
                reason: "required stage failed".to_string(),
            });
        }
        // Stable: topological order is kept within a rank.
        results.sort_by_key(|r| r.kind.consolidation_rank());

        let drafts: Vec<Draft> = results.iter().flat_map(drafts_from).collect();
        let comments = link_supplements(drafts);

        let required_summary = results
            .iter()
            .filter(|r| r.requirement == Requirement::Required)
            .filter_map(|r| r.payload.as_ref())
            .filter_map(StagePayload::as_analysis)
            .find_map(|report| report.summary.clone());

        let request = state.request();
        if comments.is_empty() && required_summary.is_none() {
            return Err(OrchestratorError::EmptyReview {
                correlation_id: request.correlation_id().to_string(),
            });
        }

        let degraded_stages = state.degraded_stages();
        let title = state.metadata().map(|m| m.title.clone());
        let summary = summarize(
            title.as_deref(),
            &comments,
            required_summary.as_deref(),
            &degraded_stages,
        );

        Ok(ConsolidatedReview {
            correlation_id: request.correlation_id().clone(),
            repository: request.repository().to_string(),
            change_id: request.change_id().to_string(),
            title,
            comments,
            summary,
            degraded_stages,
        })
    }
}

fn drafts_from(result: &StageResult) -> Vec<Draft> {
    let Some(payload) = &result.payload else {
        return Vec::new();
    };
    let source = result.kind;
    match payload {
        StagePayload::Analysis(report) => report
            .findings
            .iter()
            .map(|f| Draft {
                source,
                locator: Some(f.locator.clone()),
                severity: Some(f.severity),
                body: f.message.clone(),
            })
            .collect(),
        StagePayload::Context { items } => items
            .iter()
            .map(|item| Draft {
                source,
                locator: item.locator.clone(),
                severity: None,
                body: format!("[{}] {}", item.source, item.excerpt),
            })
            .collect(),
        StagePayload::Analytics { notes } => notes
            .iter()
            .map(|n| Draft {
                source,
                locator: None,
                severity: None,
                body: format!("{} = {}: {}", n.metric, n.value, n.message),
            })
            .collect(),
        StagePayload::Metadata(_) => Vec::new(),
    }
}

fn link_supplements(drafts: Vec<Draft>) -> Vec<ReviewComment> {
    // Sources covering each location, in order of first appearance.
    let mut covered: BTreeMap<Locator, Vec<StageKind>> = BTreeMap::new();
    drafts
        .into_iter()
        .enumerate()
        .map(|(i, d)| {
            let supplements = d.locator.as_ref().and_then(|loc| {
                let sources = covered.entry(loc.clone()).or_default();
                let earlier = sources.iter().copied().find(|kind| *kind != d.source);
                if !sources.contains(&d.source) {
                    sources.push(d.source);
                }
                earlier
            });
            ReviewComment {
                position: i + 1,
                source: d.source,
                locator: d.locator,
                severity: d.severity,
                body: d.body,
                supplements,
            }
        })
        .collect()
}

fn summarize(
    title: Option<&str>,
    comments: &[ReviewComment],
    analysis_summary: Option<&str>,
    degraded: &[String],
) -> String {
    let count = |kind: StageKind| comments.iter().filter(|c| c.source == kind).count();
    let mut lines = Vec::new();
    if let Some(title) = title {
        lines.push(format!("Review of \"{title}\"."));
    }
    lines.push(format!(
        "{} code finding(s), {} context note(s), {} analytics note(s).",
        count(StageKind::AnalyzeCode),
        count(StageKind::RetrieveContext),
        count(StageKind::CollectAnalytics),
    ));
    if let Some(s) = analysis_summary {
        lines.push(s.to_string());
    }
    if !degraded.is_empty() {
        lines.push(format!("Partial review; unavailable: {}.", degraded.join(", ")));
    }
    lines.join("\n")
}
