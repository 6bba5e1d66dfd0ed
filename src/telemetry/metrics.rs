//! Metric instrument factories for jobtrail.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"jobtrail"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("jobtrail")
}

/// Counter: lifecycle events accepted by the sink.
/// Labels: `event_type`.
pub fn events_recorded() -> Counter<u64> {
    meter()
        .u64_counter("jobtrail.events.recorded")
        .with_description("Lifecycle events accepted by the event sink")
        .build()
}

/// Counter: events dropped before reaching storage.
/// Labels: `reason` ("malformed" | "queue_closed").
pub fn events_dropped() -> Counter<u64> {
    meter()
        .u64_counter("jobtrail.events.dropped")
        .with_description("Lifecycle events dropped before persistence")
        .build()
}

/// Counter: audit applications.
/// Labels: `event_type`, `outcome` ("written" | "unknown_job" | "ignored" | "error").
pub fn audit_writes() -> Counter<u64> {
    meter()
        .u64_counter("jobtrail.audit.writes")
        .with_description("Lifecycle events applied to audit storage")
        .build()
}

/// Histogram: time spent applying one event, in milliseconds.
/// Labels: `event_type`.
pub fn apply_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("jobtrail.audit.apply_duration_ms")
        .with_description("Audit application duration in milliseconds")
        .with_unit("ms")
        .build()
}
