//! Metric instrument factories.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! Without an OTLP endpoint the global provider is a no-op, so recording is
//! always safe.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("sampleapp-bg")
}

/// Counter: enqueue attempts.
/// Labels: `kind` ("unscoped" | "scoped"), `result` ("ok" | "full" | "closed" | "cancelled").
pub fn work_enqueued() -> Counter<u64> {
    meter()
        .u64_counter("sampleapp.work.enqueued")
        .with_description("Number of work items offered to the task queue")
        .build()
}

/// Counter: executed work items.
/// Labels: `kind`, `result` ("ok" | "error" | "panic" | "aborted").
pub fn work_executed() -> Counter<u64> {
    meter()
        .u64_counter("sampleapp.work.executed")
        .with_description("Number of work items executed by the worker")
        .build()
}

/// Histogram: execution time of one work item.
/// Labels: `kind`.
pub fn work_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("sampleapp.work.duration_ms")
        .with_description("Work item execution time in milliseconds")
        .with_unit("ms")
        .build()
}

/// Counter: scheduler fires.
/// Labels: `job`.
pub fn scheduler_fired() -> Counter<u64> {
    meter()
        .u64_counter("sampleapp.scheduler.fired")
        .with_description("Number of scheduled job runs enqueued")
        .build()
}
