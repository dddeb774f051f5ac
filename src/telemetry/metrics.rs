//! Metric instrument factories for groupq.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"groupq"` meter and carry a
//! `namespace` label.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for groupq instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("groupq")
}

/// Counter: jobs written by producers.
pub fn jobs_enqueued() -> Counter<u64> {
    meter()
        .u64_counter("groupq.jobs.enqueued")
        .with_description("Number of jobs enqueued")
        .build()
}

/// Counter: successful reservations.
pub fn jobs_reserved() -> Counter<u64> {
    meter()
        .u64_counter("groupq.jobs.reserved")
        .with_description("Number of jobs leased to a worker")
        .build()
}

/// Counter: jobs acknowledged and deleted.
pub fn jobs_completed() -> Counter<u64> {
    meter()
        .u64_counter("groupq.jobs.completed")
        .with_description("Number of jobs completed")
        .build()
}

/// Counter: failed attempts that will be retried.
pub fn jobs_retried() -> Counter<u64> {
    meter()
        .u64_counter("groupq.jobs.retried")
        .with_description("Number of failed attempts scheduled for retry")
        .build()
}

/// Counter: jobs dropped after exhausting their attempts.
pub fn jobs_abandoned() -> Counter<u64> {
    meter()
        .u64_counter("groupq.jobs.abandoned")
        .with_description("Number of jobs abandoned after max attempts")
        .build()
}

/// Counter: expired leases returned to the ready state.
pub fn leases_reclaimed() -> Counter<u64> {
    meter()
        .u64_counter("groupq.leases.reclaimed")
        .with_description("Number of expired leases reclaimed")
        .build()
}

/// Histogram: handler run time in milliseconds.
/// Labels: `namespace`, `outcome` ("completed" | "failed").
pub fn job_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("groupq.job.duration_ms")
        .with_description("Handler run time in milliseconds")
        .with_unit("ms")
        .build()
}
