//! Priority scheduler over named queues.
//!
//! Four queues: high/medium/low for the I/O-bound family and cpu_bound
//! with its own worker pool. A worker draining the I/O family checks the
//! queues in strict priority order on every pull, so high drains fully
//! before medium and medium before low. Delay is handled by the queue
//! backend, which persists due times: delayed jobs survive restarts and
//! become eligible only at-or-after their due time.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::db::Db;
use crate::db::queue::QueueMessage;
use crate::error::Result;
use crate::model::{Job, QueueName};

/// Handle to the scheduler queues. Cheap to clone.
#[derive(Clone)]
pub struct Scheduler {
    db: Arc<Db>,
}

impl Scheduler {
    pub fn new(db: Arc<Db>) -> Self {
        Self { db }
    }

    /// Create all queues (idempotent, run at startup).
    pub async fn ensure_queues(&self) -> Result<()> {
        for queue in QueueName::ALL {
            self.db.create_queue(queue).await?;
        }
        Ok(())
    }

    /// Make `job` immediately eligible on `queue`.
    pub async fn enqueue(&self, queue: QueueName, job: &Job) -> Result<i64> {
        self.enqueue_delayed(queue, job, Duration::ZERO).await
    }

    /// Make `job` eligible on `queue` once `delay` has elapsed.
    pub async fn enqueue_delayed(
        &self,
        queue: QueueName,
        job: &Job,
        delay: Duration,
    ) -> Result<i64> {
        let payload = serde_json::to_value(job)?;
        let delay_seconds = delay.as_secs().min(i32::MAX as u64) as i32;
        let msg_id = self.db.send_to_queue(queue, &payload, delay_seconds).await?;
        debug!(
            task_id = %job.task_id,
            %queue,
            attempt = job.attempt,
            delay_secs = delay_seconds,
            "job enqueued"
        );
        Ok(msg_id)
    }

    /// Pull the next eligible job from `queues`, checked in order. Pass
    /// the I/O family as [high, medium, low] for strict priority.
    /// Returns None when every queue is empty; the backend's visibility
    /// timeout guarantees no message is handed to two workers at once.
    pub async fn dequeue(
        &self,
        queues: &[QueueName],
        vt_seconds: i32,
    ) -> Result<Option<(QueueName, QueueMessage)>> {
        for &queue in queues {
            if let Some(msg) = self.db.read_from_queue(queue, vt_seconds).await? {
                return Ok(Some((queue, msg)));
            }
        }
        Ok(None)
    }

    /// Retire a message after a terminal outcome (kept for audit).
    pub async fn archive(&self, queue: QueueName, msg_id: i64) -> Result<()> {
        self.db.archive_message(queue, msg_id).await
    }

    /// Drop a message that was re-submitted or superseded.
    pub async fn discard(&self, queue: QueueName, msg_id: i64) -> Result<()> {
        self.db.delete_message(queue, msg_id).await
    }
}
