//! Route definitions and router construction.

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use tower_http::cors::{Any, CorsLayer};

use crate::handlers;
use crate::state::AppState;

/// Allow-all CORS: the bridge is expected to sit behind an authenticating
/// gateway, which owns the real origin policy.
fn build_cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
}

/// Create the bridge router with all endpoints mounted.
pub fn create_router(state: AppState) -> Router {
    let body_limit = state.settings.max_message_size;
    Router::new()
        .route("/", get(handlers::health::root_info))
        .route("/healthz", get(handlers::health::healthz))
        .route("/mcp", post(handlers::ingress::post_mcp))
        .route("/mcp/stream", get(handlers::streams::sse_stream))
        .route(
            "/mcp/streamable",
            get(handlers::streams::ndjson_stream).post(handlers::streams::ndjson_post),
        )
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(build_cors_layer())
        .with_state(state)
}
