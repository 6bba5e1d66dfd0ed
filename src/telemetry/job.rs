//! Span helpers for audit application.

use tracing::Span;

/// Start a span covering the application of one lifecycle event.
///
/// `audit.outcome` is declared empty and filled by [`record_outcome`].
pub fn start_apply_span(event_type: &str, job_id: &str) -> Span {
    tracing::info_span!(
        "audit.apply",
        "audit.event_type" = event_type,
        "audit.job_id" = job_id,
        "audit.outcome" = tracing::field::Empty,
    )
}

/// Record how the application ended ("written", "unknown_job", "ignored", "error").
pub fn record_outcome(span: &Span, outcome: &str) {
    span.record("audit.outcome", outcome);
}
