//! Worker pool / executor: drives dequeued jobs through the task state
//! machine under rate limiting and retry policy.
//!
//! Each worker pulls from its assigned queue set (the I/O family in
//! strict priority order, or cpu_bound) and runs the supplied task body
//! to completion before pulling again. Every transition is persisted and
//! published. Rate-limited deliveries are deferred without consuming an
//! attempt; the deferral is unbounded, so a gated job can starve behind
//! a sustained flood on the same key.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use opentelemetry::KeyValue;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{Instrument, error, info, warn};

use crate::db::Db;
use crate::db::queue::QueueMessage;
use crate::error::{Error, Result};
use crate::model::{Job, QueueName, Task, TaskId};
use crate::notifier::Notifier;
use crate::rate_limit::RateLimiter;
use crate::scheduler::Scheduler;
use crate::telemetry::metrics;
use crate::telemetry::task::{record_state_transition, start_task_span};

/// Delay applied when the rate gate denies an attempt.
pub const RATE_LIMIT_RETRY_DELAY: Duration = Duration::from_secs(15);

/// The externally supplied task body.
///
/// The body signals a retryable failure by returning Err. It owns no
/// record mutation and knows nothing about scheduling, retries, or
/// persistence; the executor does all of that around it.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn execute(&self, task_id: TaskId, payload: &str) -> anyhow::Result<()>;
}

/// Invoked once per task whose retries are exhausted, after the failed
/// state has already been persisted and published by the executor.
#[async_trait]
pub trait FailureHandler: Send + Sync {
    async fn on_terminal_failure(&self, task_id: TaskId, error: &str);
}

/// Default failure handler: records the loss and nothing else.
pub struct LogFailureHandler;

#[async_trait]
impl FailureHandler for LogFailureHandler {
    async fn on_terminal_failure(&self, task_id: TaskId, error: &str) {
        error!(%task_id, error, "task failed permanently");
    }
}

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Poll interval when the assigned queues are empty.
    pub poll_interval: Duration,
    /// Visibility timeout (seconds) for dequeued messages. Must outlast
    /// the longest task body, or the backend redelivers mid-execution.
    pub visibility_timeout: i32,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            visibility_timeout: 120,
        }
    }
}

/// One worker: pulls jobs from its queue set and executes them to
/// completion, one at a time. Parallelism comes from running several
/// workers, not from one worker interleaving jobs.
pub struct Executor {
    name: String,
    queues: Vec<QueueName>,
    db: Arc<Db>,
    scheduler: Scheduler,
    notifier: Notifier,
    rate_limiter: RateLimiter,
    handler: Arc<dyn TaskHandler>,
    failure_handler: Arc<dyn FailureHandler>,
    config: ExecutorConfig,
}

impl Executor {
    pub fn new(
        name: impl Into<String>,
        queues: Vec<QueueName>,
        db: Arc<Db>,
        handler: Arc<dyn TaskHandler>,
        failure_handler: Arc<dyn FailureHandler>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            name: name.into(),
            queues,
            scheduler: Scheduler::new(Arc::clone(&db)),
            notifier: Notifier::new(Arc::clone(&db)),
            rate_limiter: RateLimiter::with_defaults(Arc::clone(&db)),
            db,
            handler,
            failure_handler,
            config,
        }
    }

    /// Run until shutdown. Drains eagerly while work is available and
    /// falls back to a bounded poll when the queues are empty.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(worker = %self.name, queues = ?self.queues, "worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.process_next().await {
                Ok(true) => {}
                Ok(false) => {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                }
                Err(e) => {
                    error!(worker = %self.name, "worker iteration failed: {e}");
                    tokio::time::sleep(self.config.poll_interval).await;
                }
            }
        }
        info!(worker = %self.name, "worker stopped");
    }

    /// Pull and execute at most one job. Ok(true) if a message was
    /// consumed.
    pub async fn process_next(&self) -> Result<bool> {
        let next = self
            .scheduler
            .dequeue(&self.queues, self.config.visibility_timeout)
            .await?;
        let Some((queue, msg)) = next else {
            return Ok(false);
        };
        self.process_message(queue, msg).await?;
        Ok(true)
    }

    async fn process_message(&self, queue: QueueName, msg: QueueMessage) -> Result<()> {
        let job: Job = match serde_json::from_value(msg.message.clone()) {
            Ok(job) => job,
            Err(e) => {
                warn!(%queue, msg_id = msg.msg_id, "unparseable job payload, archiving: {e}");
                return self.scheduler.archive(queue, msg.msg_id).await;
            }
        };

        let span = start_task_span(&self.name, queue, job.task_id, job.attempt);
        self.execute_job(queue, &msg, &job).instrument(span).await
    }

    async fn execute_job(&self, queue: QueueName, msg: &QueueMessage, job: &Job) -> Result<()> {
        // Rate gate: defer without consuming an attempt or touching the
        // task's status.
        if let Some(ref key) = job.rate_limit_key {
            if !self.rate_limiter.is_allowed(key).await? {
                info!(task_id = %job.task_id, %key, "rate limited, deferring");
                self.scheduler
                    .enqueue_delayed(queue, job, RATE_LIMIT_RETRY_DELAY)
                    .await?;
                return self.scheduler.discard(queue, msg.msg_id).await;
            }
        }

        let task = match self.db.mark_running(job.task_id, job.attempt).await {
            Ok(task) => task,
            // The record vanished or is already terminal (e.g. a crash
            // redelivery raced a terminal transition). Nothing to run.
            Err(Error::NotFound(_)) | Err(Error::InvalidTransition { .. }) => {
                warn!(task_id = %job.task_id, "task not runnable, archiving delivery");
                return self.scheduler.archive(queue, msg.msg_id).await;
            }
            Err(e) => return Err(e),
        };
        record_state_transition("running");
        self.publish(&task).await;

        let payload = task.payload.clone().unwrap_or_default();
        let started = Instant::now();
        let result = self.handler.execute(task.id, &payload).await;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

        match result {
            Ok(()) => {
                let task = self.db.mark_completed(job.task_id).await?;
                record_state_transition("completed");
                metrics::task_duration_ms()
                    .record(elapsed_ms, &[KeyValue::new("queue", queue.as_str())]);
                info!(task_id = %task.id, attempts = job.attempts_made(), "task completed");
                self.publish(&task).await;
                self.scheduler.archive(queue, msg.msg_id).await
            }
            Err(err) => {
                self.handle_failure(queue, msg, job, &err.to_string(), elapsed_ms)
                    .await
            }
        }
    }

    /// Retry with backoff while attempts remain; otherwise make the
    /// failure terminal.
    async fn handle_failure(
        &self,
        queue: QueueName,
        msg: &QueueMessage,
        job: &Job,
        error: &str,
        elapsed_ms: f64,
    ) -> Result<()> {
        if job.attempts_made() < job.retry_policy.max_attempts {
            let backoff = job.retry_policy.backoff_after(job.attempt);
            warn!(
                task_id = %job.task_id,
                attempt = job.attempt,
                backoff_secs = backoff.as_secs(),
                error,
                "attempt failed, retrying"
            );
            self.scheduler
                .enqueue_delayed(queue, &job.next_attempt(), backoff)
                .await?;
            self.scheduler.discard(queue, msg.msg_id).await
        } else {
            let task = self
                .db
                .mark_failed(job.task_id, error, job.attempts_made())
                .await?;
            record_state_transition("failed");
            metrics::task_duration_ms()
                .record(elapsed_ms, &[KeyValue::new("queue", queue.as_str())]);
            self.publish(&task).await;
            self.failure_handler
                .on_terminal_failure(job.task_id, error)
                .await;
            self.scheduler.archive(queue, msg.msg_id).await
        }
    }

    /// Best-effort publish; a notification failure never fails the
    /// persistence step that preceded it.
    async fn publish(&self, task: &Task) {
        if let Err(e) = self.notifier.publish(task).await {
            warn!(task_id = %task.id, "publish failed: {e}");
        }
    }
}

/// Spawns and tracks a set of workers.
#[derive(Default)]
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a worker onto the runtime.
    pub fn spawn(&mut self, executor: Executor, shutdown: watch::Receiver<bool>) {
        self.handles
            .push(tokio::spawn(async move { executor.run(shutdown).await }));
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Wait for every worker to observe shutdown and finish its current
    /// job.
    pub async fn join(self) {
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}
