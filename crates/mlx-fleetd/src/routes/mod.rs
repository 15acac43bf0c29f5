pub mod control;
pub mod proxy;
pub mod status;

use std::sync::Arc;

use axum::Router;
use tower_http::cors::CorsLayer;

use crate::state::AppState;

/// Assemble the controller's HTTP surface.
pub fn configure(state: Arc<AppState>) -> Router {
    Router::new()
        .merge(proxy::routes(state.clone()))
        .merge(status::routes(state.clone()))
        .merge(control::routes(state))
        .layer(CorsLayer::permissive())
}
