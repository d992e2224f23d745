//! Scheduler queue operations via pgmq's SQL functions.
//!
//! Delayed sends persist the due time in Postgres, so delayed jobs
//! survive process restarts. Reads take a visibility timeout: a message
//! handed to one worker stays invisible to every other worker until the
//! timeout lapses or the message is archived/deleted.

use crate::error::Result;
use crate::model::QueueName;
use crate::telemetry::metrics;
use opentelemetry::KeyValue;

/// A message read from a scheduler queue.
#[derive(Debug, Clone)]
pub struct QueueMessage {
    pub msg_id: i64,
    pub read_ct: i32,
    pub enqueued_at: chrono::DateTime<chrono::Utc>,
    pub vt: chrono::DateTime<chrono::Utc>,
    pub message: serde_json::Value,
}

impl super::Db {
    /// Create a queue (idempotent).
    pub async fn create_queue(&self, queue: QueueName) -> Result<()> {
        sqlx::query("SELECT pgmq.create($1)")
            .bind(queue.as_str())
            .execute(&self.pool)
            .await?;
        record_op(queue, "create");
        Ok(())
    }

    /// Send a message to a queue. Returns the message id.
    /// `delay_seconds` of 0 means immediately eligible.
    pub async fn send_to_queue(
        &self,
        queue: QueueName,
        payload: &serde_json::Value,
        delay_seconds: i32,
    ) -> Result<i64> {
        let row: (i64,) = sqlx::query_as("SELECT pgmq.send($1, $2, $3)")
            .bind(queue.as_str())
            .bind(payload)
            .bind(delay_seconds)
            .fetch_one(&self.pool)
            .await?;
        record_op(queue, "send");
        Ok(row.0)
    }

    /// Read the next eligible message, making it invisible to other
    /// readers for `vt_seconds`. Returns None if the queue has none.
    pub async fn read_from_queue(
        &self,
        queue: QueueName,
        vt_seconds: i32,
    ) -> Result<Option<QueueMessage>> {
        let row = sqlx::query_as::<
            _,
            (
                i64,
                i32,
                chrono::DateTime<chrono::Utc>,
                chrono::DateTime<chrono::Utc>,
                serde_json::Value,
            ),
        >("SELECT msg_id, read_ct, enqueued_at, vt, message FROM pgmq.read($1, $2, 1)")
        .bind(queue.as_str())
        .bind(vt_seconds)
        .fetch_optional(&self.pool)
        .await?;

        let msg = row.map(|(msg_id, read_ct, enqueued_at, vt, message)| QueueMessage {
            msg_id,
            read_ct,
            enqueued_at,
            vt,
            message,
        });

        record_op(queue, if msg.is_some() { "read" } else { "read_empty" });
        Ok(msg)
    }

    /// Archive a message (moves to the archive table, kept for audit).
    pub async fn archive_message(&self, queue: QueueName, msg_id: i64) -> Result<()> {
        sqlx::query("SELECT pgmq.archive($1, $2)")
            .bind(queue.as_str())
            .bind(msg_id)
            .execute(&self.pool)
            .await?;
        record_op(queue, "archive");
        Ok(())
    }

    /// Delete a message permanently.
    pub async fn delete_message(&self, queue: QueueName, msg_id: i64) -> Result<()> {
        sqlx::query("SELECT pgmq.delete($1, $2)")
            .bind(queue.as_str())
            .bind(msg_id)
            .execute(&self.pool)
            .await?;
        record_op(queue, "delete");
        Ok(())
    }
}

fn record_op(queue: QueueName, operation: &'static str) {
    metrics::queue_operations().add(
        1,
        &[
            KeyValue::new("queue", queue.as_str()),
            KeyValue::new("operation", operation),
        ],
    );
}
