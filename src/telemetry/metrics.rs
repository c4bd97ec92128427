//! Metric instrument factories.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! Without an OTLP endpoint the global provider is a no-op.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("outbound")
}

/// Counter: work items enqueued.
/// Labels: `work_type`.
pub fn work_enqueued() -> Counter<u64> {
    meter()
        .u64_counter("outbound.work.enqueued")
        .with_description("Number of work items enqueued")
        .build()
}

/// Counter: work items handed to a dispatcher by `claim_batch`.
pub fn work_claimed() -> Counter<u64> {
    meter()
        .u64_counter("outbound.work.claimed")
        .with_description("Number of work items claimed")
        .build()
}

/// Counter: per-item dispatch outcomes.
/// Labels: `work_type`, `outcome` ("completed" | "rescheduled" |
/// "dead_lettered" | "cancelled").
pub fn work_outcomes() -> Counter<u64> {
    meter()
        .u64_counter("outbound.work.outcomes")
        .with_description("Work item dispatch outcomes")
        .build()
}

/// Counter: items whose type has no registered handler.
/// Labels: `work_type`.
pub fn work_unroutable() -> Counter<u64> {
    meter()
        .u64_counter("outbound.work.unroutable")
        .with_description("Work items with no registered handler")
        .build()
}

/// Histogram: claim-to-commit duration of one batch, in milliseconds.
/// Labels: `result` ("committed" | "rolled_back").
pub fn batch_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("outbound.batch.duration_ms")
        .with_description("Batch duration in milliseconds")
        .with_unit("ms")
        .build()
}

/// Counter: publish attempts per transport.
/// Labels: `transport`, `result` ("ok" | "error").
pub fn transport_publishes() -> Counter<u64> {
    meter()
        .u64_counter("outbound.transport.publishes")
        .with_description("Publish attempts per transport")
        .build()
}

/// Counter: transport availability flips.
/// Labels: `transport`, `state` ("available" | "unavailable").
pub fn transport_state_changes() -> Counter<u64> {
    meter()
        .u64_counter("outbound.transport.state_changes")
        .with_description("Transport availability transitions")
        .build()
}
