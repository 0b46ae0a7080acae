//! Capability-specific stage payloads.
//!
//! Each collaborator produces its own record shape; [`StagePayload`] is the
//! tagged union the engine carries between stages and hands to the
//! consolidator.

use serde::{Deserialize, Serialize};

/// Merge-request metadata fetched from the repository integration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeMetadata {
    pub repository: String,
    pub change_id: String,
    pub title: String,
    pub author: String,
    pub source_branch: String,
    pub target_branch: String,
    pub head_sha: String,
    /// Paths touched by the change.
    pub changed_files: Vec<String>,
}

/// A file/line position in the change.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Locator {
    pub path: String,
    pub line: u32,
}

impl Locator {
    pub fn new(path: impl Into<String>, line: u32) -> Self {
        Self {
            path: path.into(),
            line,
        }
    }
}

impl std::fmt::Display for Locator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.path, self.line)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
        };
        write!(f, "{s}")
    }
}

/// One finding from the code-analysis engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub locator: Locator,
    pub severity: Severity,
    pub message: String,
}

/// Output of the code-analysis engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisReport {
    pub findings: Vec<Finding>,
    /// Free-text overview, counted as a summary by the consolidator.
    pub summary: Option<String>,
}

/// A piece of historical context relevant to the change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextItem {
    /// Where the context came from, e.g. a past merge request or ticket.
    pub source: String,
    pub excerpt: String,
    /// Code location the context is about, if any.
    pub locator: Option<Locator>,
}

/// A metrics/analytics note about the change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsNote {
    pub metric: String,
    pub value: f64,
    pub message: String,
}

/// Typed output of a completed stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StagePayload {
    Metadata(ChangeMetadata),
    Context { items: Vec<ContextItem> },
    Analysis(AnalysisReport),
    Analytics { notes: Vec<AnalyticsNote> },
}

impl StagePayload {
    pub fn as_metadata(&self) -> Option<&ChangeMetadata> {
        match self {
            StagePayload::Metadata(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_analysis(&self) -> Option<&AnalysisReport> {
        match self {
            StagePayload::Analysis(r) => Some(r),
            _ => None,
        }
    }

    /// Number of items the payload carries (for logs).
    pub fn item_count(&self) -> usize {
        match self {
            StagePayload::Metadata(_) => 1,
            StagePayload::Context { items } => items.len(),
            StagePayload::Analysis(r) => r.findings.len(),
            StagePayload::Analytics { notes } => notes.len(),
        }
    }
}
