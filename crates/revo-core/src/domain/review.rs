//! The consolidated review artifact and its delivery acknowledgment.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::payload::{Locator, Severity};
use crate::domain::request::CorrelationId;
use crate::graph::stage::StageKind;

/// One comment in the consolidated review, attributed to its source stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewComment {
    /// 1-based position in the review.
    pub position: usize,
    pub source: StageKind,
    pub locator: Option<Locator>,
    pub severity: Option<Severity>,
    pub body: String,
    /// The stage whose earlier comment already covers this location, when it
    /// differs from `source`; this comment is kept and marked as supplementary.
    pub supplements: Option<StageKind>,
}

impl ReviewComment {
    pub fn is_supplementary(&self) -> bool {
        self.supplements.is_some()
    }
}

/// The single review produced per request. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsolidatedReview {
    pub correlation_id: CorrelationId,
    pub repository: String,
    pub change_id: String,
    pub title: Option<String>,
    pub comments: Vec<ReviewComment>,
    pub summary: String,
    /// Optional stages that were skipped; the review is partial for them.
    pub degraded_stages: Vec<String>,
}

impl ConsolidatedReview {
    /// Canonical JSON encoding; equal reviews encode to equal bytes.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        // Every field is a plain string, integer, enum or Vec; serialization
        // cannot fail for this type.
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// SHA-256 hex digest of [`canonical_bytes`](Self::canonical_bytes).
    pub fn digest(&self) -> String {
        use sha2::Digest as _;
        hex::encode(sha2::Sha256::digest(self.canonical_bytes()))
    }

    pub fn comments_from(&self, kind: StageKind) -> impl Iterator<Item = &ReviewComment> {
        self.comments.iter().filter(move |c| c.source == kind)
    }

    pub fn is_degraded(&self) -> bool {
        !self.degraded_stages.is_empty()
    }
}

/// Acknowledgment of the one externally visible post for a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub correlation_id: CorrelationId,
    /// Identifier returned by the posting collaborator.
    pub receipt_id: String,
    pub idempotency_token: String,
    /// Digest of the review that was actually posted.
    pub review_digest: String,
    pub posted_at: DateTime<Utc>,
    /// Posting attempts it took, including transient failures.
    pub attempts: u32,
}

/// What a synchronous review returns to the requester.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewOutcome {
    pub review: ConsolidatedReview,
    /// Present when the request asked for the review to be posted.
    pub ack: Option<Ack>,
}
