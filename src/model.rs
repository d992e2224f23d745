//! Core data model.
//!
//! A task is the unit of work and its durable lifecycle record. A job is
//! the scheduling envelope that carries a task through the queues; the
//! task row stays the source of truth for what happened.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// Newtype for task ids. Assigned by the database, monotonically increasing.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct TaskId(pub i64);

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which worker family executes a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    #[default]
    IoBound,
    CpuBound,
}

impl TaskType {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskType::IoBound => "io_bound",
            TaskType::CpuBound => "cpu_bound",
        }
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for TaskType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "io_bound" => Ok(TaskType::IoBound),
            "cpu_bound" => Ok(TaskType::CpuBound),
            _ => Err(Error::Other(format!("unknown task type: {s}"))),
        }
    }
}

/// Queue preference within the I/O-bound family. Ignored for CPU-bound tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    #[default]
    Medium,
    Low,
}

impl Priority {
    pub fn as_str(self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Priority {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "high" => Ok(Priority::High),
            "medium" => Ok(Priority::Medium),
            "low" => Ok(Priority::Low),
            _ => Err(Error::Other(format!("unknown priority: {s}"))),
        }
    }
}

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Recorded and queued, waiting for a worker.
    Pending,
    /// A worker is executing an attempt.
    Running,
    /// Done successfully. Terminal.
    Completed,
    /// Retries exhausted. Terminal.
    Failed,
}

impl TaskStatus {
    /// Can transition from self to `to`?
    ///
    /// `Running -> Running` is allowed: each retry attempt re-enters the
    /// running state with an updated retry count.
    pub fn can_transition_to(self, to: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, to),
            (Pending, Running) | (Running, Running) | (Running, Completed) | (Running, Failed)
        )
    }

    /// Is this a terminal state?
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            _ => Err(Error::Other(format!("unknown status: {s}"))),
        }
    }
}

/// A task and its current lifecycle record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,

    /// Optional caller-supplied key. At most one task exists per key.
    pub idempotency_key: Option<String>,

    pub task_type: TaskType,
    pub priority: Priority,

    /// Opaque to the engine, passed through to the task body unmodified.
    pub payload: Option<String>,

    pub status: TaskStatus,

    /// Number of attempts made so far, mirrored from the job in flight.
    pub retry_count: u32,

    /// Terminal failure cause. Cleared on successful completion.
    pub error_message: Option<String>,

    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Queues
// ---------------------------------------------------------------------------

/// Named queues backing the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueName {
    High,
    Medium,
    Low,
    CpuBound,
}

impl QueueName {
    /// The I/O-bound family, in strict drain order.
    pub const IO: [QueueName; 3] = [QueueName::High, QueueName::Medium, QueueName::Low];

    /// Every queue the scheduler maintains.
    pub const ALL: [QueueName; 4] = [
        QueueName::High,
        QueueName::Medium,
        QueueName::Low,
        QueueName::CpuBound,
    ];

    /// Derive the target queue from a task's type and priority.
    pub fn for_task(task_type: TaskType, priority: Priority) -> Self {
        match task_type {
            TaskType::CpuBound => QueueName::CpuBound,
            TaskType::IoBound => match priority {
                Priority::High => QueueName::High,
                Priority::Medium => QueueName::Medium,
                Priority::Low => QueueName::Low,
            },
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            QueueName::High => "high",
            QueueName::Medium => "medium",
            QueueName::Low => "low",
            QueueName::CpuBound => "cpu_bound",
        }
    }
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

/// Retry policy carried by a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts before the task is marked failed.
    pub max_attempts: u32,

    /// Delay before each re-submission, indexed by the attempt that just
    /// failed and clamped to the last entry.
    pub backoff_secs: Vec<u64>,
}

impl RetryPolicy {
    /// Backoff to apply after attempt `attempt` (zero-based) failed.
    pub fn backoff_after(&self, attempt: u32) -> Duration {
        let last = self.backoff_secs.len().saturating_sub(1);
        let idx = (attempt as usize).min(last);
        Duration::from_secs(self.backoff_secs.get(idx).copied().unwrap_or(0))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_secs: vec![1, 2, 3],
        }
    }
}

/// The scheduling unit serialized into a queue message.
///
/// The job carries its own attempt counter; the scheduler and executor
/// pass it back and forth on each dequeue/re-submit, and the task row
/// only mirrors it at transition time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub task_id: TaskId,

    /// Zero-based attempt this delivery represents.
    pub attempt: u32,

    pub retry_policy: RetryPolicy,

    /// Shared gate key, set when the task is subject to rate limiting.
    pub rate_limit_key: Option<String>,
}

impl Job {
    pub fn new(task_id: TaskId, retry_policy: RetryPolicy, rate_limit_key: Option<String>) -> Self {
        Self {
            task_id,
            attempt: 0,
            retry_policy,
            rate_limit_key,
        }
    }

    /// The same job, re-submitted for its next attempt.
    pub fn next_attempt(&self) -> Job {
        Job {
            attempt: self.attempt + 1,
            ..self.clone()
        }
    }

    /// Attempts made once the current attempt finishes.
    pub fn attempts_made(&self) -> u32 {
        self.attempt + 1
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for submitting tasks. The admission coordinator's public input.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub(crate) task_type: TaskType,
    pub(crate) priority: Priority,
    pub(crate) payload: Option<String>,
    pub(crate) idempotency_key: Option<String>,
    pub(crate) delay: Duration,
}

impl NewTask {
    pub fn new(task_type: TaskType) -> Self {
        Self {
            task_type,
            priority: Priority::default(),
            payload: None,
            idempotency_key: None,
            delay: Duration::ZERO,
        }
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn payload(mut self, payload: impl Into<String>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    pub fn idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_transitions_follow_the_lifecycle() {
        use TaskStatus::*;

        assert!(Pending.can_transition_to(Running));
        assert!(Running.can_transition_to(Running));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Failed));

        // Terminal states accept nothing further.
        for terminal in [Completed, Failed] {
            for to in [Pending, Running, Completed, Failed] {
                assert!(!terminal.can_transition_to(to), "{terminal} -> {to}");
            }
        }

        assert!(!Pending.can_transition_to(Completed));
        assert!(!Pending.can_transition_to(Failed));
    }

    #[test]
    fn queue_derivation_ignores_priority_for_cpu_bound() {
        assert_eq!(
            QueueName::for_task(TaskType::IoBound, Priority::High),
            QueueName::High
        );
        assert_eq!(
            QueueName::for_task(TaskType::IoBound, Priority::Low),
            QueueName::Low
        );
        assert_eq!(
            QueueName::for_task(TaskType::CpuBound, Priority::High),
            QueueName::CpuBound
        );
    }

    #[test]
    fn backoff_is_indexed_by_attempt_and_clamped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_after(0), Duration::from_secs(1));
        assert_eq!(policy.backoff_after(1), Duration::from_secs(2));
        assert_eq!(policy.backoff_after(2), Duration::from_secs(3));
        // Past the end of the list, the last interval applies.
        assert_eq!(policy.backoff_after(9), Duration::from_secs(3));
    }

    #[test]
    fn job_round_trips_through_json() {
        let job = Job::new(
            TaskId(42),
            RetryPolicy::default(),
            Some("external_api".to_string()),
        );
        let json = serde_json::to_value(&job).unwrap();
        let back: Job = serde_json::from_value(json).unwrap();
        assert_eq!(back.task_id, TaskId(42));
        assert_eq!(back.attempt, 0);
        assert_eq!(back.retry_policy, job.retry_policy);
        assert_eq!(back.next_attempt().attempt, 1);
    }

    #[test]
    fn enums_serialize_snake_case() {
        assert_eq!(
            serde_json::to_string(&TaskType::CpuBound).unwrap(),
            "\"cpu_bound\""
        );
        assert_eq!(
            serde_json::to_string(&TaskStatus::Pending).unwrap(),
            "\"pending\""
        );
        assert_eq!(serde_json::to_string(&Priority::High).unwrap(), "\"high\"");
        assert_eq!("medium".parse::<Priority>().unwrap(), Priority::Medium);
        assert!("urgent".parse::<Priority>().is_err());
    }
}
