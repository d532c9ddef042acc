//! Status and callback API.
//!
//! Running check containers reach the agent at `VULCAN_AGENT_ADDRESS` to
//! report their own progress; operators use it for health, stats and aborts.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::error::{Error, JobError};
use crate::queue::ReaderActivity;
use crate::report::{CheckState, CheckStatus};
use crate::runner::JobRunner;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct ApiState {
    pub runner: Arc<JobRunner>,
    pub activity: watch::Receiver<ReaderActivity>,
}

/// Body of a state callback sent by a running check.
#[derive(Debug, Deserialize)]
struct StateUpdate {
    status: CheckStatus,
    #[serde(default)]
    progress: Option<f32>,
}

/// Build the agent router.
pub fn api_routes(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/check/{id}", post(update_check))
        .route("/check/{id}/abort", post(abort_check))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "scan-agent"
    }))
}

async fn stats(State(state): State<ApiState>) -> impl IntoResponse {
    let stats = state.runner.stats().await;
    let idle = state.activity.borrow().last.elapsed().as_secs();
    Json(serde_json::json!({
        "running": stats.running,
        "capacity": stats.capacity,
        "seconds_since_last_message": idle,
    }))
}

async fn update_check(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(update): Json<StateUpdate>,
) -> Response {
    let check_state = CheckState {
        check_id: id.clone(),
        status: update.status,
        progress: update.progress,
        raw: None,
    };
    match state.runner.report_state(check_state).await {
        Ok(()) => Json(serde_json::json!({"status": "ok"})).into_response(),
        Err(Error::Job(JobError::NotRunning { .. })) => not_running(&id),
        Err(e) => {
            warn!(check_id = %id, error = %e, "Error forwarding check state");
            (
                StatusCode::BAD_GATEWAY,
                Json(serde_json::json!({"error": e.to_string()})),
            )
                .into_response()
        }
    }
}

async fn abort_check(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    match state.runner.abort(&id).await {
        Ok(()) => {
            info!(check_id = %id, "Abort requested");
            (
                StatusCode::ACCEPTED,
                Json(serde_json::json!({"status": "aborting"})),
            )
                .into_response()
        }
        Err(_) => not_running(&id),
    }
}

fn not_running(id: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({"error": format!("check {id} is not running")})),
    )
        .into_response()
}
