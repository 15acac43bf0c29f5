//! Observation surface: controller health, supervisor status, dispatcher
//! metrics.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use serde_json::{json, Value};

use mlx_fleet::LifecycleState;

use crate::state::AppState;

/// `GET /health` — liveness of the controller itself. Always 200 while the
/// process is up, regardless of fleet state.
async fn health() -> Json<Value> {
    Json(json!({"status": "healthy"}))
}

/// `GET /status` — full supervisor snapshot: per-instance lifecycle, pids,
/// scores, restart counts, plus fleet aggregates.
async fn status(State(state): State<Arc<AppState>>) -> Json<Value> {
    let snapshots = state.store.snapshots();

    let running: Vec<_> = snapshots
        .iter()
        .filter(|s| s.status == LifecycleState::Running)
        .collect();
    let failed = snapshots
        .iter()
        .filter(|s| s.status == LifecycleState::Failed)
        .count();
    let healthy = running
        .iter()
        .filter(|s| s.performance_score > state.config.performance.restart_score_floor)
        .count();

    let total_throughput: f64 = running
        .iter()
        .map(|s| s.metrics.throughput_tokens_per_sec)
        .sum();
    let average_response_time = if running.is_empty() {
        0.0
    } else {
        running
            .iter()
            .map(|s| s.metrics.average_response_time_ms)
            .sum::<f64>()
            / running.len() as f64
    };
    let target = state.config.performance.target_tps;

    Json(json!({
        "status": if running.is_empty() { "stopped" } else { "running" },
        "timestamp": Utc::now().to_rfc3339(),
        "instances": {
            "total": snapshots.len(),
            "running": running.len(),
            "healthy": healthy,
            "failed": failed,
        },
        "performance": {
            "total_throughput_tokens_per_sec": total_throughput,
            "average_response_time_ms": average_response_time,
            "target_throughput_tokens_per_sec": target,
            "throughput_efficiency": if total_throughput > 0.0 {
                total_throughput / target * 100.0
            } else {
                0.0
            },
            "peak_throughput_tokens_per_sec": state.dispatcher.peak_throughput(),
        },
        "individual_instances": snapshots,
    }))
}

/// `GET /metrics` — dispatcher counters and per-instance performance.
async fn metrics(State(state): State<Arc<AppState>>) -> Json<Value> {
    let mut value = serde_json::to_value(state.dispatcher.metrics_snapshot())
        .unwrap_or_else(|_| json!({}));
    if let Value::Object(map) = &mut value {
        map.insert("timestamp".to_string(), json!(Utc::now().to_rfc3339()));
    }
    Json(value)
}

pub fn routes(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/metrics", get(metrics))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use mlx_fleet::{FleetConfig, InstanceStore};
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    fn state_with(instances: usize) -> Arc<AppState> {
        let mut config = FleetConfig::default();
        config.mlx_servers.instances = instances;
        config.mlx_servers.base_port = 19400;
        let config = Arc::new(config);
        let store = Arc::new(InstanceStore::new(&config));
        AppState::with_store(config, store, CancellationToken::new())
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, Value) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_health_is_always_200() {
        let state = state_with(0);
        let app = crate::routes::configure(state);
        let (status, value) = get_json(app, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(value, json!({"status": "healthy"}));
    }

    #[tokio::test]
    async fn test_health_stays_200_with_failed_fleet() {
        let state = state_with(3);
        for inst in state.store.iter() {
            inst.mark_failed();
        }
        let app = crate::routes::configure(state);
        let (status, _) = get_json(app, "/health").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_status_reports_fleet_breakdown() {
        let state = state_with(4);
        state.store.get(0).unwrap().mark_starting();
        state.store.get(0).unwrap().mark_running();
        state.store.get(1).unwrap().mark_failed();

        let app = crate::routes::configure(state);
        let (status, value) = get_json(app, "/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(value["status"], "running");
        assert_eq!(value["instances"]["total"], 4);
        assert_eq!(value["instances"]["running"], 1);
        assert_eq!(value["instances"]["failed"], 1);
        assert_eq!(value["individual_instances"].as_array().unwrap().len(), 4);
        assert_eq!(value["individual_instances"][1]["status"], "failed");
        assert_eq!(value["individual_instances"][0]["port"], 19400);
    }

    #[tokio::test]
    async fn test_status_is_stopped_with_no_running_instances() {
        let state = state_with(2);
        let app = crate::routes::configure(state);
        let (_, value) = get_json(app, "/status").await;
        assert_eq!(value["status"], "stopped");
        assert_eq!(value["instances"]["running"], 0);
    }

    #[tokio::test]
    async fn test_consecutive_status_snapshots_agree_modulo_timestamp() {
        let state = state_with(3);
        state.store.get(2).unwrap().mark_starting();
        state.store.get(2).unwrap().mark_running();
        let app = crate::routes::configure(state);

        let (_, mut first) = get_json(app.clone(), "/status").await;
        let (_, mut second) = get_json(app, "/status").await;

        // With no intervening activity, only timestamps may differ.
        strip_timestamps(&mut first);
        strip_timestamps(&mut second);
        assert_eq!(first, second);
    }

    fn strip_timestamps(value: &mut Value) {
        if let Value::Object(map) = value {
            map.remove("timestamp");
            // Elapsed-time fields tick between calls.
            if let Some(Value::Array(instances)) = map.get_mut("individual_instances") {
                for inst in instances {
                    if let Some(Value::Object(metrics)) = inst.get_mut("metrics") {
                        metrics.remove("seconds_since_heartbeat");
                        metrics.remove("uptime_seconds");
                    }
                }
            }
        }
    }

    #[tokio::test]
    async fn test_metrics_shape() {
        let state = state_with(2);
        let app = crate::routes::configure(state);
        let (status, value) = get_json(app, "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(value["system"]["total_instances"], 2);
        assert_eq!(value["system"]["healthy_instances"], 0);
        assert_eq!(
            value["performance"]["target_throughput_tokens_per_sec"],
            1485.0
        );
        assert_eq!(value["instances"].as_array().unwrap().len(), 2);
        assert!(value["timestamp"].is_string());
    }
}
