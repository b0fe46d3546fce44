//! API Regression Tests
//!
//! In-process tests that build the Axum app via `create_app()` over a
//! sled-backed store and exercise the /api/v1/* endpoints using
//! `tower::ServiceExt::oneshot()`. No binary spawn, no network port.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::{TimeZone, Utc};
use std::sync::Arc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use mobile_supervisor::api::{create_app, ApiState};
use mobile_supervisor::config::ReconcilerConfig;
use mobile_supervisor::pipeline::PipelineStats;
use mobile_supervisor::reconcile::ReconcilerHub;
use mobile_supervisor::storage::{SampleStore, SledStore};
use mobile_supervisor::types::{Station, TelemetryMessage};

fn create_test_state(store: Arc<SledStore>) -> (ApiState, CancellationToken) {
    let stats = Arc::new(PipelineStats::new(15));
    let (hub, reconciler) =
        ReconcilerHub::new(ReconcilerConfig::default(), store.clone(), stats.clone(), 16, 16);
    let cancel = CancellationToken::new();
    tokio::spawn(hub.run(cancel.clone()));

    let state = ApiState {
        stats,
        reconciler,
        history: store.clone(),
        stations: store,
        publisher: None,
        transport: None,
        started_at: Utc::now(),
    };
    (state, cancel)
}

async fn get_json(state: ApiState, uri: &str) -> (StatusCode, serde_json::Value) {
    let resp = create_app(state, &[])
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

fn message(value: serde_json::Value) -> TelemetryMessage {
    serde_json::from_value(value).unwrap()
}

/// Two fixes on 2024-03-01, one on 2024-03-02, one other device.
async fn seed(store: &SledStore) {
    store
        .upsert_stations(&[Station {
            cid: 301,
            lac: 12,
            mcc: 452,
            mnc: 2,
            lat: 21.02,
            lon: 105.84,
            address: Some("Hoan Kiem".to_string()),
            radio: Some("LTE".to_string()),
            range: Some(900.0),
        }])
        .unwrap();

    let received = Utc.with_ymd_and_hms(2024, 3, 3, 0, 0, 0).unwrap();
    let reports = [
        serde_json::json!({
            "deviceId": "phone-1",
            "timestamp": Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap().timestamp_millis(),
            "location": {"latitude": 21.03, "longitude": 105.85},
            "cellTowers": [
                {"cid": 301, "lac": 12, "mcc": 452, "mnc": 2, "isServing": true, "rssi": -67},
                {"cid": 302, "lac": 12, "mcc": 452, "mnc": 2, "isServing": false, "rssi": -90}
            ]
        }),
        serde_json::json!({
            "deviceId": "phone-1",
            "timestamp": Utc.with_ymd_and_hms(2024, 3, 1, 23, 30, 0).unwrap().timestamp_millis(),
            "location": {"latitude": 21.04, "longitude": 105.86}
        }),
        serde_json::json!({
            "deviceId": "phone-1",
            "timestamp": Utc.with_ymd_and_hms(2024, 3, 2, 8, 0, 0).unwrap().timestamp_millis(),
            "location": {"latitude": 21.05, "longitude": 105.87}
        }),
        serde_json::json!({
            "deviceId": "phone-2",
            "timestamp": Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap().timestamp_millis(),
            "location": {"latitude": 10.0, "longitude": 106.0}
        }),
    ];
    for report in reports {
        store.append(&message(report), received).await.unwrap();
    }
}

/// A date-only `end` covers the whole day, and other devices never leak in.
#[tokio::test]
async fn test_history_covers_whole_end_day() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(SledStore::open(dir.path().join("db")).unwrap());
    seed(&store).await;
    let (state, cancel) = create_test_state(store);

    let (status, body) = get_json(
        state,
        "/api/v1/devices/phone-1/history?start=2024-03-01&end=2024-03-01",
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let data = &body["data"];
    assert_eq!(data["device_id"], "phone-1");
    assert_eq!(data["total_records"], 2);
    assert_eq!(data["period"]["start"], "2024-03-01T00:00:00.000Z");
    assert_eq!(data["period"]["end"], "2024-03-01T23:59:59.999Z");

    let first = &data["data"][0];
    assert_eq!(first["timestamp"], "2024-03-01T09:00:00.000Z");
    assert_eq!(first["bts_cid"], 301);
    assert_eq!(first["signal_dbm"], -67);
    assert_eq!(first["is_serving"], true);
    assert_eq!(first["bts_address"], "Hoan Kiem");
    assert_eq!(first["neighbor_cells"].as_array().unwrap().len(), 1);

    // No cell shares the 23:30 timestamp
    let second = &data["data"][1];
    assert_eq!(second["timestamp"], "2024-03-01T23:30:00.000Z");
    assert!(second["bts_cid"].is_null());
    assert_eq!(second["is_serving"], false);
    assert!(second["neighbor_cells"].as_array().unwrap().is_empty());

    cancel.cancel();
}

#[tokio::test]
async fn test_history_rejects_bad_windows() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(SledStore::open(dir.path().join("db")).unwrap());
    let (state, cancel) = create_test_state(store);

    for uri in [
        "/api/v1/devices/phone-1/history",
        "/api/v1/devices/phone-1/history?start=2024-03-01",
        "/api/v1/devices/phone-1/history?start=yesterday&end=2024-03-01",
        "/api/v1/devices/phone-1/history?start=2024-03-05&end=2024-03-01",
    ] {
        let (status, body) = get_json(state.clone(), uri).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "GET {uri}");
        assert_eq!(body["error"]["code"], "BAD_REQUEST");
    }

    cancel.cancel();
}

#[tokio::test]
async fn test_history_for_unknown_device_is_empty() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(SledStore::open(dir.path().join("db")).unwrap());
    seed(&store).await;
    let (state, cancel) = create_test_state(store);

    let (status, body) = get_json(
        state,
        "/api/v1/devices/phone-9/history?start=2024-01-01&end=2024-12-31",
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["total_records"], 0);
    assert!(body["data"]["data"].as_array().unwrap().is_empty());

    cancel.cancel();
}

#[tokio::test]
async fn test_status_reports_service_meta() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(SledStore::open(dir.path().join("db")).unwrap());
    let (state, cancel) = create_test_state(store);

    let (status, body) = get_json(state, "/api/v1/status").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["meta"]["service"], "mobile-supervisor");
    assert_eq!(body["data"]["ingest_enabled"], false);
    assert_eq!(body["data"]["pipeline"]["persisted"], 0);

    cancel.cancel();
}
