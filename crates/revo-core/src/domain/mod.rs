//! Domain vocabulary: requests, stage payloads, reviews, errors.

pub mod error;
pub mod payload;
pub mod request;
pub mod review;

pub use error::{OrchestratorError, Result};
pub use payload::{
    AnalysisReport, AnalyticsNote, ChangeMetadata, ContextItem, Finding, Locator, Severity,
    StagePayload,
};
pub use request::{CorrelationId, ReviewRequest};
pub use review::{Ack, ConsolidatedReview, ReviewComment, ReviewOutcome};
