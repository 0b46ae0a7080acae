//! Structured lifecycle events for review requests.
//!
//! - [`RequestSpan`] ties every event inside a request to its correlation id
//! - `emit_*` functions log the request, stage and delivery milestones
//!
//! Verbosity follows `RUST_LOG`; `revo --json` switches to JSON lines.

use tracing::{debug, info, warn};

/// RAII guard entering a span tagged with the request's correlation id.
///
/// ```ignore
/// let _span = RequestSpan::enter("corr-123", "org/service!42");
/// ```
pub struct RequestSpan {
    _span: tracing::span::EnteredSpan,
}

impl RequestSpan {
    pub fn enter(correlation_id: &str, target: &str) -> Self {
        Self {
            _span: Self::span(correlation_id, target).entered(),
        }
    }

    /// The un-entered span, for instrumenting futures.
    pub fn span(correlation_id: &str, target: &str) -> tracing::Span {
        tracing::info_span!("revo.request", correlation_id = %correlation_id, target = %target)
    }
}

pub fn emit_request_accepted(correlation_id: &str, target: &str, stages: usize) {
    info!(
        event = "request.accepted",
        correlation_id = %correlation_id,
        target = %target,
        stages = stages,
    );
}

pub fn emit_request_finished(correlation_id: &str, duration_ms: u64, outcome: &str) {
    info!(
        event = "request.finished",
        correlation_id = %correlation_id,
        duration_ms = duration_ms,
        outcome = %outcome,
    );
}

pub fn emit_stage_dispatched(correlation_id: &str, stage: &str, attempt: u32) {
    info!(event = "stage.dispatched", correlation_id = %correlation_id, stage = %stage, attempt = attempt);
}

pub fn emit_stage_finished(
    correlation_id: &str,
    stage: &str,
    attempt: u32,
    status: &str,
    duration_ms: u64,
) {
    info!(
        event = "stage.finished",
        correlation_id = %correlation_id,
        stage = %stage,
        attempt = attempt,
        status = %status,
        duration_ms = duration_ms,
    );
}

/// A failed attempt will be retried after `delay_ms`.
pub fn emit_retry_scheduled(
    correlation_id: &str,
    stage: &str,
    attempt: u32,
    delay_ms: u64,
    error: &dyn std::fmt::Display,
) {
    warn!(
        event = "stage.retry_scheduled",
        correlation_id = %correlation_id,
        stage = %stage,
        attempt = attempt,
        delay_ms = delay_ms,
        error = %error,
    );
}

pub fn emit_stage_degraded(correlation_id: &str, stage: &str, reason: &str) {
    warn!(event = "stage.degraded", correlation_id = %correlation_id, stage = %stage, reason = %reason);
}

pub fn emit_late_result_discarded(correlation_id: &str, stage: &str, attempt: u32) {
    debug!(
        event = "stage.late_result_discarded",
        correlation_id = %correlation_id,
        stage = %stage,
        attempt = attempt,
    );
}

pub fn emit_delivery_posted(correlation_id: &str, receipt_id: &str, attempts: u32) {
    info!(
        event = "delivery.posted",
        correlation_id = %correlation_id,
        receipt_id = %receipt_id,
        attempts = attempts,
    );
}

pub fn emit_delivery_deduplicated(correlation_id: &str, receipt_id: &str) {
    info!(event = "delivery.deduplicated", correlation_id = %correlation_id, receipt_id = %receipt_id);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_span_create() {
        let _span = RequestSpan::enter("corr-1", "org/service!1");
        emit_stage_dispatched("corr-1", "analyze_code", 1);
    }
}
