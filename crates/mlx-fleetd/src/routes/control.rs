//! Fleet-wide lifecycle control.
//!
//! `POST /start` and `POST /stop` execute the corresponding supervisor
//! action for every instance. Both are serialized by the supervisor's
//! internal lock, so concurrent invocations queue rather than interleave.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};
use tracing::info;

use crate::state::AppState;

/// `POST /start` — start every instance, in batches.
async fn start_fleet(State(state): State<Arc<AppState>>) -> Json<Value> {
    info!("fleet start requested");
    state.supervisor.start_all().await;
    Json(json!({"status": "started"}))
}

/// `POST /stop` — gracefully stop every instance in parallel.
async fn stop_fleet(State(state): State<Arc<AppState>>) -> Json<Value> {
    info!("fleet stop requested");
    state.supervisor.stop_all().await;
    Json(json!({"status": "stopped"}))
}

pub fn routes(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/start", post(start_fleet))
        .route("/stop", post(stop_fleet))
        .with_state(state)
}
