//! Metric instrument factories for orchestra-rs.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"orchestra-rs"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for orchestra-rs instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("orchestra-rs")
}

/// Counter: tasks admitted by the coordinator.
/// Labels: `task_type`, `queue`.
pub fn tasks_submitted() -> Counter<u64> {
    meter()
        .u64_counter("orchestra.tasks.submitted")
        .with_description("Number of tasks admitted")
        .build()
}

/// Counter: task record creations.
/// Labels: `result` ("created" | "duplicate").
pub fn tasks_created() -> Counter<u64> {
    meter()
        .u64_counter("orchestra.tasks.created")
        .with_description("Number of task record creation attempts")
        .build()
}

/// Counter: task status transitions.
/// Labels: `to`.
pub fn task_state_transitions() -> Counter<u64> {
    meter()
        .u64_counter("orchestra.tasks.state_transitions")
        .with_description("Number of task status transitions")
        .build()
}

/// Counter: queue-level operations (create, send, read, archive, delete).
/// Labels: `queue`, `operation`.
pub fn queue_operations() -> Counter<u64> {
    meter()
        .u64_counter("orchestra.queue.operations")
        .with_description("Number of queue operations")
        .build()
}

/// Counter: rate-limit gate decisions.
/// Labels: `key`, `decision` ("allow" | "deny").
pub fn rate_limit_checks() -> Counter<u64> {
    meter()
        .u64_counter("orchestra.rate_limit.checks")
        .with_description("Number of rate-limit gate checks")
        .build()
}

/// Counter: task update events published.
pub fn events_published() -> Counter<u64> {
    meter()
        .u64_counter("orchestra.events.published")
        .with_description("Number of task update events published")
        .build()
}

/// Histogram: task body execution duration in milliseconds.
/// Labels: `queue`.
pub fn task_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("orchestra.task.duration_ms")
        .with_description("Task body execution duration in milliseconds")
        .with_unit("ms")
        .build()
}
