//! Task execution span helpers.

use tracing::Span;

use crate::model::{QueueName, TaskId};

/// Start a span wrapping one delivery of a job to a worker.
pub fn start_task_span(worker: &str, queue: QueueName, task_id: TaskId, attempt: u32) -> Span {
    tracing::info_span!(
        "task.execute",
        "task.worker" = worker,
        "task.queue" = %queue,
        "task.id" = %task_id,
        "task.attempt" = attempt,
    )
}

/// Record a status transition as an event on the current span.
pub fn record_state_transition(to: &str) {
    tracing::info!(to, "state_transition");
}
