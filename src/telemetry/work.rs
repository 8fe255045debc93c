//! Work execution span helpers.

use tracing::Span;

use crate::model::WorkId;

/// Start a span for one work item's execution.
///
/// `work.outcome` is declared empty and filled by [`record_outcome`].
pub fn start_work_span(id: WorkId, kind: &'static str, dependency: Option<&'static str>) -> Span {
    tracing::info_span!(
        "work.execute",
        "work.id" = %id,
        "work.kind" = kind,
        "work.dependency" = dependency.unwrap_or("-"),
        "work.outcome" = tracing::field::Empty,
    )
}

/// Record how the item ended ("ok", "error", "panic", "aborted").
pub fn record_outcome(span: &Span, outcome: &str) {
    span.record("work.outcome", outcome);
}

/// Start a span for one scheduler fire.
pub fn start_job_span(job: &str) -> Span {
    tracing::info_span!("scheduler.fire", "job.name" = job)
}
