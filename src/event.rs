//! Task-update events published on every state transition.
//!
//! Delivery is best-effort: observers that are not connected when an
//! event fires miss it and recover current state via the read endpoints.

use serde::{Deserialize, Serialize};

use crate::model::Task;

/// Event tag carried by every task lifecycle update.
pub const TASK_UPDATE: &str = "task_update";

/// The envelope delivered to live-update observers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEvent {
    /// What happened. Currently always [`TASK_UPDATE`].
    pub event: String,

    /// Full task representation at the time of the event.
    pub data: Task,
}

impl TaskEvent {
    pub fn update(task: Task) -> Self {
        Self {
            event: TASK_UPDATE.to_string(),
            data: task,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Priority, TaskId, TaskStatus, TaskType};

    #[test]
    fn event_envelope_matches_the_wire_shape() {
        let task = Task {
            id: TaskId(7),
            idempotency_key: None,
            task_type: TaskType::IoBound,
            priority: Priority::Medium,
            payload: Some("hello".to_string()),
            status: TaskStatus::Pending,
            retry_count: 0,
            error_message: None,
            created_at: chrono::Utc::now(),
            finished_at: None,
        };

        let json = serde_json::to_value(TaskEvent::update(task)).unwrap();
        assert_eq!(json["event"], "task_update");
        assert_eq!(json["data"]["id"], 7);
        assert_eq!(json["data"]["status"], "pending");
        assert_eq!(json["data"]["task_type"], "io_bound");
    }
}
