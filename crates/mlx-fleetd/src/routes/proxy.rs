//! Client-facing completion endpoints.
//!
//! Each POST body is forwarded verbatim to one selected worker; the
//! worker's JSON reply comes back annotated with a `_performance` block.
//! Starvation (no eligible worker) maps to 503, everything else that fails
//! maps to 500 with a JSON error body.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};

use mlx_fleet::{CompletionRoute, DispatchError};

use crate::state::AppState;

/// `POST /v1/completions` — proxy a completion request.
async fn completions(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    proxy(state, CompletionRoute::Completions, body).await
}

/// `POST /v1/chat/completions` — proxy a chat-completion request.
async fn chat_completions(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    proxy(state, CompletionRoute::ChatCompletions, body).await
}

async fn proxy(state: Arc<AppState>, route: CompletionRoute, body: Bytes) -> Response {
    match state.dispatcher.dispatch(route, body.to_vec()).await {
        Ok(value) => (StatusCode::OK, Json(value)).into_response(),
        Err(e @ DispatchError::NoHealthyInstances) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({"error": e.to_string()})),
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({"error": format!("Internal server error: {}", e)})),
        )
            .into_response(),
    }
}

pub fn routes(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/completions", post(completions))
        .route("/v1/chat/completions", post(chat_completions))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use mlx_fleet::instance::Endpoint;
    use mlx_fleet::{FleetConfig, InstanceStore};
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn state_with_endpoints(endpoints: Vec<Endpoint>) -> Arc<AppState> {
        let mut config = FleetConfig::default();
        config.mlx_servers.instances = 0;
        config.load_balancer.max_retries = 0;
        let config = Arc::new(config);
        let store = Arc::new(InstanceStore::from_endpoints(endpoints, &config));
        AppState::with_store(config, store, CancellationToken::new())
    }

    async fn post_json(app: Router, uri: &str, body: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(uri)
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_completions_healthy_path() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"text": "ok"}],
                "usage": {"total_tokens": 5}
            })))
            .mount(&server)
            .await;

        let address = server.address();
        let state = state_with_endpoints(vec![Endpoint::new(
            address.ip().to_string(),
            address.port(),
        )]);
        state.store.get(0).unwrap().mark_starting();
        state.store.get(0).unwrap().mark_running();
        let app = crate::routes::configure(state.clone());

        let (status, value) =
            post_json(app, "/v1/completions", r#"{"prompt":"hi","max_tokens":1}"#).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(value["choices"][0]["text"], "ok");
        assert_eq!(value["_performance"]["instance_id"], 0);

        let inst = state.store.get(0).unwrap();
        assert_eq!(inst.totals().requests(), 1);
        assert_eq!(inst.totals().successes(), 1);
    }

    #[tokio::test]
    async fn test_starved_fleet_returns_503_with_exact_body() {
        let state = state_with_endpoints(vec![
            Endpoint::new("127.0.0.1", 19301),
            Endpoint::new("127.0.0.1", 19302),
        ]);
        for inst in state.store.iter() {
            inst.mark_failed();
        }
        let app = crate::routes::configure(state);

        let (status, value) = post_json(app, "/v1/completions", r#"{"prompt":"hi"}"#).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            value,
            serde_json::json!({"error": "No healthy MLX instances available"})
        );
    }

    #[tokio::test]
    async fn test_empty_pool_returns_503_for_every_request() {
        let state = state_with_endpoints(vec![]);
        let app = crate::routes::configure(state);

        for uri in ["/v1/completions", "/v1/chat/completions"] {
            let (status, value) = post_json(app.clone(), uri, r#"{"prompt":"hi"}"#).await;
            assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
            assert_eq!(value["error"], "No healthy MLX instances available");
        }
    }

    #[tokio::test]
    async fn test_upstream_failure_returns_500_error_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/completions"))
            .respond_with(
                ResponseTemplate::new(500).set_body_json(serde_json::json!({"error": "boom"})),
            )
            .mount(&server)
            .await;

        let address = server.address();
        let state = state_with_endpoints(vec![Endpoint::new(
            address.ip().to_string(),
            address.port(),
        )]);
        state.store.get(0).unwrap().mark_starting();
        state.store.get(0).unwrap().mark_running();
        let app = crate::routes::configure(state);

        let (status, value) = post_json(app, "/v1/completions", r#"{"prompt":"hi"}"#).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(value["error"]
            .as_str()
            .unwrap()
            .starts_with("Internal server error"));
    }
}
