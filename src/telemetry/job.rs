//! Job execution span helpers.

use tracing::Span;

/// Start a span covering one delivery of a job to a handler.
///
/// The `job.outcome` field is declared empty and is filled in by
/// [`record_outcome`].
pub fn start_job_span(namespace: &str, job_id: &str, group_id: &str, attempt: u32) -> Span {
    tracing::info_span!(
        "job.execute",
        "queue.namespace" = namespace,
        "job.id" = job_id,
        "job.group" = group_id,
        "job.attempt" = attempt,
        "job.outcome" = tracing::field::Empty,
    )
}

/// Record how the delivery ended and emit a matching event inside the span.
pub fn record_outcome(span: &Span, outcome: &str) {
    span.record("job.outcome", outcome);
    span.in_scope(|| {
        tracing::debug!(outcome, "job_outcome");
    });
}
