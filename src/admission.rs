//! Admission coordinator: the top-level entry point for new tasks.
//!
//! Validates idempotency, persists the record, submits the scheduling
//! job, and publishes the initial pending event. A duplicate idempotency
//! key returns the original task and never creates a second job.

use std::sync::Arc;

use opentelemetry::KeyValue;
use tracing::{info, warn};

use crate::db::Db;
use crate::db::tasks::CreateResult;
use crate::error::Result;
use crate::model::{Job, NewTask, QueueName, RetryPolicy, Task, TaskType};
use crate::notifier::Notifier;
use crate::rate_limit::EXTERNAL_API_KEY;
use crate::scheduler::Scheduler;
use crate::telemetry::metrics;

/// Payload marker identifying tasks that call the shared external API.
const API_CALL_MARKER: &str = "api_call";

/// Top-level admission entry point.
#[derive(Clone)]
pub struct AdmissionCoordinator {
    db: Arc<Db>,
    scheduler: Scheduler,
    notifier: Notifier,
}

impl AdmissionCoordinator {
    pub fn new(db: Arc<Db>) -> Self {
        Self {
            scheduler: Scheduler::new(Arc::clone(&db)),
            notifier: Notifier::new(Arc::clone(&db)),
            db,
        }
    }

    /// Admit a task: record it, queue its job, announce it.
    ///
    /// Idempotent under caller retries: a request whose idempotency key
    /// already has a task returns that task unchanged, with no new job.
    pub async fn submit(&self, new: NewTask) -> Result<Task> {
        if let Some(ref key) = new.idempotency_key {
            if let Some(existing) = self.db.get_task_by_idempotency_key(key).await? {
                info!(task_id = %existing.id, %key, "duplicate idempotency key, returning existing task");
                return Ok(existing);
            }
        }

        let task = match self.db.create_task(&new).await? {
            CreateResult::Created(task) => task,
            // Lost the creation race; the winner's record stands alone.
            CreateResult::Existing(task) => {
                info!(task_id = %task.id, "concurrent duplicate admission, returning winner");
                return Ok(task);
            }
        };

        let queue = QueueName::for_task(task.task_type, task.priority);
        let job = Job::new(task.id, RetryPolicy::default(), rate_limit_key(&task));
        if new.delay.is_zero() {
            self.scheduler.enqueue(queue, &job).await?;
        } else {
            self.scheduler.enqueue_delayed(queue, &job, new.delay).await?;
        }

        metrics::tasks_submitted().add(
            1,
            &[
                KeyValue::new("task_type", task.task_type.as_str()),
                KeyValue::new("queue", queue.as_str()),
            ],
        );
        info!(
            task_id = %task.id,
            %queue,
            delay_secs = new.delay.as_secs(),
            "task admitted"
        );

        if let Err(e) = self.notifier.publish(&task).await {
            warn!(task_id = %task.id, "pending event publish failed: {e}");
        }

        Ok(task)
    }
}

/// I/O-bound tasks that declare an external call share the API gate.
/// CPU-bound work never touches it.
fn rate_limit_key(task: &Task) -> Option<String> {
    let calls_api = task
        .payload
        .as_deref()
        .is_some_and(|p| p.contains(API_CALL_MARKER));
    (task.task_type == TaskType::IoBound && calls_api).then(|| EXTERNAL_API_KEY.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Priority, TaskId, TaskStatus};

    fn task_with(task_type: TaskType, payload: Option<&str>) -> Task {
        Task {
            id: TaskId(1),
            idempotency_key: None,
            task_type,
            priority: Priority::Medium,
            payload: payload.map(str::to_string),
            status: TaskStatus::Pending,
            retry_count: 0,
            error_message: None,
            created_at: chrono::Utc::now(),
            finished_at: None,
        }
    }

    #[test]
    fn io_tasks_declaring_api_calls_are_gated() {
        let task = task_with(TaskType::IoBound, Some("fetch api_call quota"));
        assert_eq!(rate_limit_key(&task).as_deref(), Some(EXTERNAL_API_KEY));
    }

    #[test]
    fn other_tasks_are_not_gated() {
        assert_eq!(rate_limit_key(&task_with(TaskType::IoBound, Some("plain"))), None);
        assert_eq!(rate_limit_key(&task_with(TaskType::IoBound, None)), None);
        assert_eq!(
            rate_limit_key(&task_with(TaskType::CpuBound, Some("api_call"))),
            None
        );
    }
}
