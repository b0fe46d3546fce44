//! API route handlers
//!
//! - status: pipeline counters and transport state
//! - control/interval: operator override of the reporting interval
//! - devices/:id/history: merged location + cell history
//! - devices/:id/tracking: reconciler teardown

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::response::Response;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use super::envelope::{ApiErrorResponse, ApiResponse};
use crate::acquisition::{validate_device_id, ControlPublisher, Delivery, TransportStatus};
use crate::config::defaults::REASON_MANUAL_OVERRIDE;
use crate::history::{load_history, HistoryWindow};
use crate::pipeline::{PipelineStats, StatsSnapshot};
use crate::reconcile::ReconcilerHandle;
use crate::storage::{HistorySource, StationLookup};
use crate::types::ConfigMessage;

// ============================================================================
// API State
// ============================================================================

/// Shared state for API handlers
#[derive(Clone)]
pub struct ApiState {
    pub stats: Arc<PipelineStats>,
    pub reconciler: ReconcilerHandle,
    pub history: Arc<dyn HistorySource>,
    pub stations: Arc<dyn StationLookup>,
    /// `None` when ingestion is disabled (no broker credentials)
    pub publisher: Option<Arc<dyn ControlPublisher>>,
    pub transport: Option<Arc<TransportStatus>>,
    pub started_at: DateTime<Utc>,
}

// ============================================================================
// Status
// ============================================================================

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub ingest_enabled: bool,
    pub transport_connected: bool,
    pub broker_connections: u64,
    pub inbox_drops: u64,
    pub tracked_devices: Option<usize>,
    pub observers: usize,
    pub uptime_secs: i64,
    pub pipeline: StatsSnapshot,
}

/// GET /api/v1/status
pub async fn get_status(State(state): State<ApiState>) -> Response {
    let transport = state.transport.as_deref();
    let body = StatusResponse {
        ingest_enabled: state.publisher.is_some(),
        transport_connected: transport.is_some_and(TransportStatus::is_connected),
        broker_connections: transport.map_or(0, TransportStatus::connections),
        inbox_drops: transport.map_or(0, TransportStatus::inbox_drops),
        tracked_devices: state.reconciler.tracked_devices().await.ok(),
        observers: state.reconciler.observer_count(),
        uptime_secs: (Utc::now() - state.started_at).num_seconds(),
        pipeline: state.stats.snapshot(),
    };
    ApiResponse::ok(body)
}

// ============================================================================
// Manual interval override
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntervalOverride {
    pub interval: i64,
    #[serde(default)]
    pub device_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct OverrideResult {
    /// Device id, or `"all"` for a broadcast
    pub target: String,
    pub message: ConfigMessage,
}

/// POST /api/v1/control/interval
pub async fn post_interval_override(
    State(state): State<ApiState>,
    body: Result<Json<IntervalOverride>, JsonRejection>,
) -> Response {
    let Json(request) = match body {
        Ok(body) => body,
        Err(rejection) => return ApiErrorResponse::bad_request(rejection.body_text()),
    };

    let interval = match u32::try_from(request.interval) {
        Ok(secs) if secs > 0 => secs,
        _ => return ApiErrorResponse::bad_request("interval must be a positive integer"),
    };

    // Blank means broadcast; anything else must be usable as a topic level.
    let device_id = match request.device_id.as_deref().filter(|id| !id.trim().is_empty()) {
        Some(id) => match validate_device_id(id) {
            Ok(id) => Some(id),
            Err(e) => return ApiErrorResponse::bad_request(format!("device_id: {e}")),
        },
        None => None,
    };

    let Some(publisher) = state.publisher.as_ref() else {
        return ApiErrorResponse::service_unavailable("Ingestion is disabled: no broker configured");
    };

    let message = ConfigMessage::new(
        interval,
        REASON_MANUAL_OVERRIDE,
        state.stats.snapshot().queue_len,
        Utc::now(),
    );

    let result = match device_id {
        Some(id) => publisher.publish_config(id, &message).await,
        None => publisher.publish_broadcast(&message).await,
    };
    let target = device_id.unwrap_or("all").to_string();

    match result {
        Ok(Delivery::Sent) => {
            info!(target = %target, interval_secs = interval, "Manual interval override published");
            ApiResponse::ok(OverrideResult { target, message })
        }
        Ok(Delivery::Dropped) => {
            ApiErrorResponse::service_unavailable("MQTT transport disconnected, override not sent")
        }
        Err(e) => {
            warn!(target = %target, error = %e, "Manual interval override failed");
            ApiErrorResponse::internal(e.to_string())
        }
    }
}

// ============================================================================
// History
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct HistoryParams {
    pub start: Option<String>,
    pub end: Option<String>,
}

/// GET /api/v1/devices/:id/history?start=..&end=..
pub async fn get_device_history(
    State(state): State<ApiState>,
    Path(device_id): Path<String>,
    Query(params): Query<HistoryParams>,
) -> Response {
    let window = match HistoryWindow::parse(params.start.as_deref(), params.end.as_deref()) {
        Ok(window) => window,
        Err(e) => return ApiErrorResponse::bad_request(e.to_string()),
    };

    match load_history(
        state.history.as_ref(),
        state.stations.as_ref(),
        &device_id,
        window,
    )
    .await
    {
        Ok(report) => ApiResponse::ok(report),
        Err(e) => {
            warn!(device_id = %device_id, error = %e, "History query failed");
            ApiErrorResponse::internal(format!("Failed to load history: {e}"))
        }
    }
}

// ============================================================================
// Reconciler teardown
// ============================================================================

#[derive(Debug, Serialize)]
pub struct TeardownResult {
    pub device_id: String,
    pub torn_down: bool,
}

/// DELETE /api/v1/devices/:id/tracking
pub async fn delete_tracking(
    State(state): State<ApiState>,
    Path(device_id): Path<String>,
) -> Response {
    match state.reconciler.teardown(&device_id).await {
        Ok(true) => ApiResponse::ok(TeardownResult {
            device_id,
            torn_down: true,
        }),
        Ok(false) => ApiErrorResponse::not_found(format!("Device {device_id} is not being tracked")),
        Err(e) => ApiErrorResponse::service_unavailable(e.to_string()),
    }
}

/// Fallback for unknown API paths
pub async fn not_found() -> Response {
    ApiErrorResponse::not_found("No such endpoint")
}
