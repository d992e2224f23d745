//! Publishes task-state-changed events and relays them toward the
//! fan-out.
//!
//! Publishing uses Postgres NOTIFY on a shared channel; the relay holds
//! the LISTEN side and forwards decoded events into an in-process
//! broadcast channel the fan-out consumes. Delivery is best-effort end
//! to end: nothing is stored, and observers that are not connected when
//! an event fires simply miss it.

use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::PgListener;
use tokio::sync::{broadcast, watch};
use tracing::{info, warn};

use crate::db::Db;
use crate::error::Result;
use crate::event::TaskEvent;
use crate::model::Task;
use crate::telemetry::metrics;

/// NOTIFY channel carrying task update events.
pub const UPDATE_CHANNEL: &str = "task_updates";

/// Publisher handle. Cheap to clone.
#[derive(Clone)]
pub struct Notifier {
    db: Arc<Db>,
}

impl Notifier {
    pub fn new(db: Arc<Db>) -> Self {
        Self { db }
    }

    /// Publish the task's current state to the update channel.
    ///
    /// Publishing is independent of status persistence: callers log a
    /// failed publish and carry on rather than failing the operation
    /// that triggered it.
    pub async fn publish(&self, task: &Task) -> Result<()> {
        let payload = serde_json::to_string(&TaskEvent::update(task.clone()))?;
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(UPDATE_CHANNEL)
            .bind(&payload)
            .execute(self.db.pool())
            .await?;
        metrics::events_published().add(1, &[]);
        Ok(())
    }
}

/// Relay loop: LISTEN on the update channel and forward each decoded
/// event into `tx` for the fan-out.
///
/// On shutdown it stops receiving, drops the subscription, and returns;
/// an in-flight event is either forwarded whole or dropped. Listener
/// errors back off for a second and resume.
pub async fn run_update_relay(
    db: Arc<Db>,
    tx: broadcast::Sender<TaskEvent>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let mut listener = PgListener::connect_with(db.pool()).await?;
    listener.listen(UPDATE_CHANNEL).await?;
    info!(channel = UPDATE_CHANNEL, "update relay subscribed");

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                info!("update relay shutting down");
                return Ok(());
            }
            notification = listener.recv() => match notification {
                Ok(n) => match serde_json::from_str::<TaskEvent>(n.payload()) {
                    Ok(event) => {
                        // No receivers just means nobody is watching.
                        let _ = tx.send(event);
                    }
                    Err(e) => warn!("undecodable update event: {e}"),
                },
                Err(e) => {
                    warn!("update listener error: {e}, retrying");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }
}
