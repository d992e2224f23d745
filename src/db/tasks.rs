//! Task record store: idempotent creation, reads, guarded transitions.

use crate::error::{Error, Result};
use crate::model::{NewTask, Task, TaskId, TaskStatus};
use crate::telemetry::metrics;
use opentelemetry::KeyValue;

/// Result of creating a task record.
#[derive(Debug)]
pub enum CreateResult {
    /// New record inserted with status pending.
    Created(Task),
    /// A record with this idempotency key already existed.
    Existing(Task),
}

impl super::Db {
    /// Create a task record, unless one already exists for the same
    /// idempotency key.
    ///
    /// Concurrent creations with the same key race on the unique index:
    /// exactly one insert wins. `ON CONFLICT DO NOTHING` returns only
    /// after the conflicting insert has committed, so the loser's
    /// re-read always sees the winner; the race never surfaces as an
    /// error to callers.
    pub async fn create_task(&self, new: &NewTask) -> Result<CreateResult> {
        if let Some(ref key) = new.idempotency_key {
            let inserted: Option<TaskRow> = sqlx::query_as(
                "INSERT INTO tasks (idempotency_key, task_type, priority, payload)
                 VALUES ($1, $2, $3, $4)
                 ON CONFLICT (idempotency_key) DO NOTHING
                 RETURNING id, idempotency_key, task_type, priority, payload, status, retry_count, error_message, created_at, finished_at",
            )
            .bind(key)
            .bind(new.task_type.as_str())
            .bind(new.priority.as_str())
            .bind(&new.payload)
            .fetch_optional(&self.pool)
            .await?;

            match inserted {
                Some(row) => {
                    metrics::tasks_created().add(1, &[KeyValue::new("result", "created")]);
                    Ok(CreateResult::Created(row.try_into_task()?))
                }
                None => {
                    let existing = self
                        .get_task_by_idempotency_key(key)
                        .await?
                        .ok_or_else(|| {
                            Error::NotFound(format!("task for idempotency key {key:?}"))
                        })?;
                    metrics::tasks_created().add(1, &[KeyValue::new("result", "duplicate")]);
                    Ok(CreateResult::Existing(existing))
                }
            }
        } else {
            // No idempotency key — straight insert, no conflict possible.
            let row: TaskRow = sqlx::query_as(
                "INSERT INTO tasks (task_type, priority, payload)
                 VALUES ($1, $2, $3)
                 RETURNING id, idempotency_key, task_type, priority, payload, status, retry_count, error_message, created_at, finished_at",
            )
            .bind(new.task_type.as_str())
            .bind(new.priority.as_str())
            .bind(&new.payload)
            .fetch_one(&self.pool)
            .await?;

            metrics::tasks_created().add(1, &[KeyValue::new("result", "created")]);
            Ok(CreateResult::Created(row.try_into_task()?))
        }
    }

    /// Get a task by id.
    pub async fn get_task(&self, id: TaskId) -> Result<Task> {
        let row: Option<TaskRow> = sqlx::query_as(
            "SELECT id, idempotency_key, task_type, priority, payload, status, retry_count, error_message, created_at, finished_at
             FROM tasks WHERE id = $1",
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.ok_or_else(|| Error::NotFound(format!("task {id}")))?
            .try_into_task()
    }

    /// Get a task by idempotency key, if one exists.
    pub async fn get_task_by_idempotency_key(&self, key: &str) -> Result<Option<Task>> {
        let row: Option<TaskRow> = sqlx::query_as(
            "SELECT id, idempotency_key, task_type, priority, payload, status, retry_count, error_message, created_at, finished_at
             FROM tasks WHERE idempotency_key = $1",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        row.map(TaskRow::try_into_task).transpose()
    }

    /// List tasks, most recent id first.
    pub async fn list_tasks(&self, offset: i64, limit: i64) -> Result<Vec<Task>> {
        let rows: Vec<TaskRow> = sqlx::query_as(
            "SELECT id, idempotency_key, task_type, priority, payload, status, retry_count, error_message, created_at, finished_at
             FROM tasks ORDER BY id DESC OFFSET $1 LIMIT $2",
        )
        .bind(offset)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TaskRow::try_into_task).collect()
    }

    /// Mark an attempt as running and mirror its attempt number onto the
    /// record.
    ///
    /// Accepts pending (first attempt) or running (retry attempt) as the
    /// current status; anything else is an invalid transition.
    pub async fn mark_running(&self, id: TaskId, attempt: u32) -> Result<Task> {
        let row: Option<TaskRow> = sqlx::query_as(
            "UPDATE tasks SET status = 'running', retry_count = $2
             WHERE id = $1 AND status IN ('pending', 'running')
             RETURNING id, idempotency_key, task_type, priority, payload, status, retry_count, error_message, created_at, finished_at",
        )
        .bind(id.0)
        .bind(attempt as i32)
        .fetch_optional(&self.pool)
        .await?;

        self.transitioned(id, row, TaskStatus::Running).await
    }

    /// Terminal success: clear the error, stamp finished_at. One atomic
    /// update.
    pub async fn mark_completed(&self, id: TaskId) -> Result<Task> {
        let row: Option<TaskRow> = sqlx::query_as(
            "UPDATE tasks SET status = 'completed', error_message = NULL, finished_at = now()
             WHERE id = $1 AND status = 'running'
             RETURNING id, idempotency_key, task_type, priority, payload, status, retry_count, error_message, created_at, finished_at",
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;

        self.transitioned(id, row, TaskStatus::Completed).await
    }

    /// Terminal failure: record the cause and the attempts made. One
    /// atomic update.
    pub async fn mark_failed(&self, id: TaskId, error: &str, attempts: u32) -> Result<Task> {
        let row: Option<TaskRow> = sqlx::query_as(
            "UPDATE tasks SET status = 'failed', error_message = $2, retry_count = $3, finished_at = now()
             WHERE id = $1 AND status = 'running'
             RETURNING id, idempotency_key, task_type, priority, payload, status, retry_count, error_message, created_at, finished_at",
        )
        .bind(id.0)
        .bind(error)
        .bind(attempts as i32)
        .fetch_optional(&self.pool)
        .await?;

        self.transitioned(id, row, TaskStatus::Failed).await
    }

    /// Resolve a guarded update: a missed guard is reported as an
    /// invalid transition from the row's actual status (or NotFound if
    /// the row vanished).
    async fn transitioned(
        &self,
        id: TaskId,
        row: Option<TaskRow>,
        to: TaskStatus,
    ) -> Result<Task> {
        match row {
            Some(row) => {
                metrics::task_state_transitions().add(1, &[KeyValue::new("to", to.as_str())]);
                row.try_into_task()
            }
            None => {
                let current = self.get_task(id).await?;
                Err(Error::InvalidTransition {
                    from: current.status,
                    to,
                })
            }
        }
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct TaskRow {
    id: i64,
    idempotency_key: Option<String>,
    task_type: String,
    priority: String,
    payload: Option<String>,
    status: String,
    retry_count: i32,
    error_message: Option<String>,
    created_at: chrono::DateTime<chrono::Utc>,
    finished_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl TaskRow {
    fn try_into_task(self) -> Result<Task> {
        Ok(Task {
            id: TaskId(self.id),
            idempotency_key: self.idempotency_key,
            task_type: self.task_type.parse()?,
            priority: self.priority.parse()?,
            payload: self.payload,
            status: self.status.parse()?,
            retry_count: self.retry_count.max(0) as u32,
            error_message: self.error_message,
            created_at: self.created_at,
            finished_at: self.finished_at,
        })
    }
}
