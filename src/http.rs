//! HTTP and WebSocket entry points.
//!
//! Thin surface over the admission coordinator and the record store:
//! task creation (202, idempotent via the Idempotency-Key header),
//! paginated listing, and a live-update socket fed by the fan-out.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::admission::AdmissionCoordinator;
use crate::db::Db;
use crate::error::Error;
use crate::fanout::FanOut;
use crate::model::{NewTask, Priority, Task, TaskType};

/// Shared state for the API handlers.
pub struct ApiContext {
    pub admission: AdmissionCoordinator,
    pub db: Arc<Db>,
    pub fanout: Arc<FanOut>,
}

/// Build the router with all entry points.
pub fn router(ctx: Arc<ApiContext>) -> Router {
    Router::new()
        .route("/v1/tasks", get(list_tasks).post(create_task))
        .route("/ws", get(ws_upgrade))
        .layer(CorsLayer::permissive())
        .with_state(ctx)
}

/// Creation request body. Defaults mirror the admission contract.
#[derive(Debug, Deserialize)]
pub struct CreateTaskRequest {
    pub payload: Option<String>,
    #[serde(default)]
    pub task_type: TaskType,
    #[serde(default)]
    pub priority: Priority,
    /// Delay in seconds before first eligibility.
    #[serde(default)]
    pub delay: u64,
}

async fn create_task(
    State(ctx): State<Arc<ApiContext>>,
    headers: HeaderMap,
    Json(req): Json<CreateTaskRequest>,
) -> Result<(StatusCode, Json<Task>), ApiError> {
    let mut new = NewTask::new(req.task_type)
        .priority(req.priority)
        .delay(Duration::from_secs(req.delay));
    if let Some(payload) = req.payload {
        new = new.payload(payload);
    }
    if let Some(key) = headers.get("idempotency-key").and_then(|v| v.to_str().ok()) {
        new = new.idempotency_key(key);
    }

    let task = ctx.admission.submit(new).await?;
    Ok((StatusCode::ACCEPTED, Json(task)))
}

#[derive(Debug, Deserialize)]
struct Page {
    #[serde(default)]
    skip: i64,
    #[serde(default = "default_limit")]
    limit: i64,
}

fn default_limit() -> i64 {
    100
}

async fn list_tasks(
    State(ctx): State<Arc<ApiContext>>,
    Query(page): Query<Page>,
) -> Result<Json<Vec<Task>>, ApiError> {
    let tasks = ctx
        .db
        .list_tasks(page.skip.max(0), page.limit.clamp(0, 1000))
        .await?;
    Ok(Json(tasks))
}

// ---------------------------------------------------------------------------
// Live updates
// ---------------------------------------------------------------------------

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    State(ctx): State<Arc<ApiContext>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws(socket, ctx))
}

/// Stream fan-out events to one observer until it disconnects.
async fn handle_ws(socket: WebSocket, ctx: Arc<ApiContext>) {
    let (mut sender, mut receiver) = socket.split();
    let (observer_id, mut events) = ctx.fanout.join().await;
    info!(observer = %observer_id, "live-update connection opened");

    // Forward fan-out events to this client.
    let send_task = tokio::spawn(async move {
        while let Some(msg) = events.recv().await {
            if sender.send(Message::Text(msg.into())).await.is_err() {
                break;
            }
        }
    });

    // Consume incoming frames (pings, close) but ignore content.
    let recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            if matches!(msg, Message::Close(_)) {
                break;
            }
        }
    });

    tokio::select! {
        _ = send_task => {}
        _ = recv_task => {}
    }

    ctx.fanout.leave(observer_id).await;
    info!(observer = %observer_id, "live-update connection closed");
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Maps crate errors onto HTTP responses.
struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0 {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::InvalidTransition { .. } => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        warn!("request failed: {}", self.0);
        (
            status,
            Json(serde_json::json!({ "detail": self.0.to_string() })),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_request_defaults_match_the_contract() {
        let req: CreateTaskRequest = serde_json::from_str("{}").unwrap();
        assert!(req.payload.is_none());
        assert_eq!(req.task_type, TaskType::IoBound);
        assert_eq!(req.priority, Priority::Medium);
        assert_eq!(req.delay, 0);

        let req: CreateTaskRequest = serde_json::from_str(
            r#"{"payload": "x", "task_type": "cpu_bound", "priority": "high", "delay": 30}"#,
        )
        .unwrap();
        assert_eq!(req.task_type, TaskType::CpuBound);
        assert_eq!(req.priority, Priority::High);
        assert_eq!(req.delay, 30);
    }
}
