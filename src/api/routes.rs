//! API route definitions
//!
//! - GET    /status
//! - POST   /control/interval
//! - GET    /devices/:id/history
//! - DELETE /devices/:id/tracking
//! - GET    /stream (WebSocket)

use axum::{
    routing::{delete, get, post},
    Router,
};

use super::handlers::{self, ApiState};
use super::stream;

pub fn api_routes(state: ApiState) -> Router {
    Router::new()
        .route("/status", get(handlers::get_status))
        .route("/control/interval", post(handlers::post_interval_override))
        .route("/devices/:id/history", get(handlers::get_device_history))
        .route("/devices/:id/tracking", delete(handlers::delete_tracking))
        .route("/stream", get(stream::ws_stream_handler))
        .fallback(handlers::not_found)
        .with_state(state)
}
