//! Fan-out of task update events to connected observers.
//!
//! Observers join and leave dynamically; each gets a bounded sink. The
//! relay loop forwards every event to every observer without awaiting
//! any of them: a full sink loses that event for that observer only,
//! a closed sink removes the observer. A slow consumer never stalls
//! delivery to the rest.

use std::collections::HashMap;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::{Mutex, broadcast, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::event::TaskEvent;

/// Per-observer buffer. Slow consumers lose events beyond this depth.
const OBSERVER_BUFFER: usize = 64;

/// Identifier handed out when an observer joins.
pub type ObserverId = Uuid;

/// The set of currently-connected observers.
#[derive(Default)]
pub struct FanOut {
    observers: Mutex<HashMap<ObserverId, mpsc::Sender<String>>>,
}

impl FanOut {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an observer; returns its id and the event stream to
    /// drain.
    pub async fn join(&self) -> (ObserverId, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(OBSERVER_BUFFER);
        let id = Uuid::new_v4();
        self.observers.lock().await.insert(id, tx);
        debug!(observer = %id, "observer joined");
        (id, rx)
    }

    /// Remove an observer. Idempotent.
    pub async fn leave(&self, id: ObserverId) {
        if self.observers.lock().await.remove(&id).is_some() {
            debug!(observer = %id, "observer left");
        }
    }

    pub async fn observer_count(&self) -> usize {
        self.observers.lock().await.len()
    }

    /// Serialize `event` once and offer it to every observer, in publish
    /// order.
    pub async fn deliver(&self, event: &TaskEvent) {
        let json = match serde_json::to_string(event) {
            Ok(json) => json,
            Err(e) => {
                warn!("undeliverable event: {e}");
                return;
            }
        };

        let mut observers = self.observers.lock().await;
        observers.retain(|id, tx| match tx.try_send(json.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(observer = %id, "observer buffer full, dropping update");
                true
            }
            Err(TrySendError::Closed(_)) => false,
        });
    }

    /// Relay loop: forward every broadcast event to the observer set
    /// until shutdown or the channel closes.
    pub async fn run(
        &self,
        mut rx: broadcast::Receiver<TaskEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("fan-out shutting down");
                    return;
                }
                event = rx.recv() => match event {
                    Ok(event) => self.deliver(&event).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "fan-out lagged behind publisher");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Priority, Task, TaskId, TaskStatus, TaskType};

    fn sample_event(id: i64) -> TaskEvent {
        TaskEvent::update(Task {
            id: TaskId(id),
            idempotency_key: None,
            task_type: TaskType::IoBound,
            priority: Priority::Medium,
            payload: None,
            status: TaskStatus::Pending,
            retry_count: 0,
            error_message: None,
            created_at: chrono::Utc::now(),
            finished_at: None,
        })
    }

    #[tokio::test]
    async fn delivers_to_every_observer_in_order() {
        let fanout = FanOut::new();
        let (_a, mut rx_a) = fanout.join().await;
        let (_b, mut rx_b) = fanout.join().await;
        assert_eq!(fanout.observer_count().await, 2);

        fanout.deliver(&sample_event(1)).await;
        fanout.deliver(&sample_event(2)).await;

        for rx in [&mut rx_a, &mut rx_b] {
            let first = rx.recv().await.unwrap();
            let second = rx.recv().await.unwrap();
            assert!(first.contains("\"id\":1"));
            assert!(second.contains("\"id\":2"));
        }
    }

    #[tokio::test]
    async fn closed_observer_is_pruned_on_next_delivery() {
        let fanout = FanOut::new();
        let (_a, rx_a) = fanout.join().await;
        let (_b, _rx_b) = fanout.join().await;

        drop(rx_a);
        fanout.deliver(&sample_event(1)).await;
        assert_eq!(fanout.observer_count().await, 1);
    }

    #[tokio::test]
    async fn slow_observer_drops_events_but_stays_connected() {
        let fanout = FanOut::new();
        let (_a, mut rx_a) = fanout.join().await;

        // One more than the buffer without draining: the overflow event
        // is lost, the observer is not.
        for i in 0..(OBSERVER_BUFFER as i64 + 1) {
            fanout.deliver(&sample_event(i)).await;
        }
        assert_eq!(fanout.observer_count().await, 1);

        let mut received = 0;
        while rx_a.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, OBSERVER_BUFFER);
    }

    #[tokio::test]
    async fn leave_is_idempotent() {
        let fanout = FanOut::new();
        let (id, _rx) = fanout.join().await;
        fanout.leave(id).await;
        fanout.leave(id).await;
        assert_eq!(fanout.observer_count().await, 0);
    }

    #[tokio::test]
    async fn run_forwards_broadcast_events_until_shutdown() {
        let fanout = std::sync::Arc::new(FanOut::new());
        let (event_tx, event_rx) = broadcast::channel(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let (_id, mut rx) = fanout.join().await;

        let relay = {
            let fanout = std::sync::Arc::clone(&fanout);
            tokio::spawn(async move { fanout.run(event_rx, shutdown_rx).await })
        };

        event_tx.send(sample_event(9)).unwrap();
        let msg = rx.recv().await.unwrap();
        assert!(msg.contains("\"id\":9"));

        shutdown_tx.send(true).unwrap();
        relay.await.unwrap();
    }
}
