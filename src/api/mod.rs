//! REST API module using Axum
//!
//! Operator and observer endpoints under `/api/v1`: pipeline status, manual
//! interval override, device history, reconciler teardown and the live
//! position stream.

pub mod envelope;
pub mod handlers;
mod routes;
mod stream;

pub use handlers::ApiState;

use axum::http::{header, Method, HeaderValue};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Restrictive by default (same-origin only); `server.cors_origins` opens
/// it to the listed origins.
fn build_cors_layer(origins: &[String]) -> CorsLayer {
    let base = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);

    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| o.trim().parse().ok())
        .collect();
    if allowed.is_empty() {
        return base;
    }
    tracing::info!(origins = ?origins, "CORS: allowing configured origins");
    base.allow_origin(allowed)
}

/// Create the complete application router.
pub fn create_app(state: ApiState, cors_origins: &[String]) -> Router {
    Router::new()
        .nest("/api/v1", routes::api_routes(state))
        .layer(TraceLayer::new_for_http())
        .layer(build_cors_layer(cors_origins))
}
