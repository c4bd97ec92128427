//! Dispatch span helpers.

use tracing::Span;

use crate::model::work::WorkItem;

/// Start a span covering one claimed batch.
pub fn start_batch_span(instance: &str) -> Span {
    tracing::info_span!(
        "work.batch",
        "dispatcher.instance" = instance,
        "batch.claimed" = tracing::field::Empty,
    )
}

/// Start a span for executing one work item.
///
/// `work.outcome` is filled in by [`record_outcome`].
pub fn start_dispatch_span(item: &WorkItem) -> Span {
    tracing::info_span!(
        "work.dispatch",
        "work.id" = item.id.0,
        "work.type" = %item.work_type,
        "work.attempt" = item.attempt_count,
        "work.outcome" = tracing::field::Empty,
    )
}

/// Record the outcome of an item on its span.
pub fn record_outcome(span: &Span, outcome: &str) {
    span.record("work.outcome", outcome);
}
