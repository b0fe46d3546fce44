//! Pipeline Integration Tests
//!
//! Wires listener → work queue → drain worker → in-memory store, with the
//! reconciler hub attached and a recording control publisher standing in
//! for the broker. Raw payloads enter through the same inbox channel the
//! MQTT transport feeds.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use mobile_supervisor::acquisition::{ControlPublisher, Delivery, InboundMessage, PublishError};
use mobile_supervisor::config::{
    BackpressureConfig, IntervalTier, OverflowPolicy, ReconcilerConfig,
};
use mobile_supervisor::pipeline::{
    work_queue, BackpressureController, DrainWorker, IngestListener, PipelineStats, QueueItem,
    WorkQueueReceiver,
};
use mobile_supervisor::reconcile::{ReconcilerHandle, ReconcilerHub};
use mobile_supervisor::storage::{InMemoryStore, StationLookup};
use mobile_supervisor::types::{ConfigMessage, Station};

// ============================================================================
// Fixtures
// ============================================================================

const TELEMETRY_TOPIC: &str = "cell_info";

#[derive(Default)]
struct RecordingPublisher {
    sent: Mutex<Vec<(String, ConfigMessage)>>,
}

impl RecordingPublisher {
    fn intervals(&self) -> Vec<(String, u32)> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|(d, m)| (d.clone(), m.send_interval_sec))
            .collect()
    }
}

#[async_trait]
impl ControlPublisher for RecordingPublisher {
    async fn publish_config(
        &self,
        device_id: &str,
        message: &ConfigMessage,
    ) -> Result<Delivery, PublishError> {
        self.sent
            .lock()
            .unwrap()
            .push((device_id.to_string(), message.clone()));
        Ok(Delivery::Sent)
    }

    async fn publish_broadcast(&self, message: &ConfigMessage) -> Result<Delivery, PublishError> {
        self.publish_config("all", message).await
    }

    fn is_connected(&self) -> bool {
        true
    }
}

struct Harness {
    inbox: mpsc::Sender<InboundMessage>,
    queue_rx: Option<WorkQueueReceiver<QueueItem>>,
    store: Arc<InMemoryStore>,
    stats: Arc<PipelineStats>,
    publisher: Arc<RecordingPublisher>,
    reconciler: ReconcilerHandle,
    cancel: CancellationToken,
}

impl Harness {
    /// Listener and hub running; the drain worker is started separately so
    /// tests can let the queue build up first.
    fn start(capacity: usize, policy: OverflowPolicy) -> Self {
        Self::start_with_tiers(
            capacity,
            policy,
            vec![
                IntervalTier { above: 6, interval_secs: 120 },
                IntervalTier { above: 3, interval_secs: 60 },
            ],
        )
    }

    fn start_with_tiers(capacity: usize, policy: OverflowPolicy, tiers: Vec<IntervalTier>) -> Self {
        let store = Arc::new(InMemoryStore::new());
        let stats = Arc::new(PipelineStats::new(15));
        let publisher = Arc::new(RecordingPublisher::default());
        let cancel = CancellationToken::new();

        let (hub, reconciler) = ReconcilerHub::new(
            ReconcilerConfig::default(),
            store.clone() as Arc<dyn StationLookup>,
            stats.clone(),
            64,
            64,
        );
        tokio::spawn(hub.run(cancel.clone()));

        let backpressure = BackpressureController::new(&BackpressureConfig {
            baseline_interval_secs: 15,
            tiers,
        });
        let (queue_tx, queue_rx) = work_queue(capacity, policy);
        let listener = IngestListener::new(queue_tx, backpressure, publisher.clone(), stats.clone())
            .with_reconciler(reconciler.clone())
            .with_topic_filter(TELEMETRY_TOPIC);

        let (inbox, inbox_rx) = mpsc::channel(64);
        tokio::spawn(listener.run(inbox_rx, cancel.clone()));

        Self {
            inbox,
            queue_rx: Some(queue_rx),
            store,
            stats,
            publisher,
            reconciler,
            cancel,
        }
    }

    fn start_drain(&mut self) {
        let queue_rx = self.queue_rx.take().unwrap();
        let drain = DrainWorker::new(queue_rx, self.store.clone(), self.stats.clone());
        tokio::spawn(drain.run(self.cancel.clone()));
    }

    async fn send(&self, payload: String) {
        self.inbox
            .send(InboundMessage {
                topic: TELEMETRY_TOPIC.to_string(),
                payload: payload.into_bytes(),
            })
            .await
            .unwrap();
    }
}

fn report(device: &str, ts_ms: i64, lat: f64, lon: f64) -> String {
    serde_json::json!({
        "deviceId": device,
        "timestamp": ts_ms,
        "location": {"latitude": lat, "longitude": lon, "accuracy": 8.0},
        "cellTowers": [
            {"cid": 101, "lac": 7, "mcc": 452, "mnc": 4, "isServing": true, "rssi": -71},
            {"cid": 102, "lac": 7, "mcc": 452, "mnc": 4, "isServing": false, "rssi": -95}
        ]
    })
    .to_string()
}

async fn wait_until<F: Fn() -> bool>(what: &str, condition: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_reports_are_persisted_in_arrival_order() {
    // Tiers out of reach: five reports never change the advertised interval.
    let mut h = Harness::start_with_tiers(
        100,
        OverflowPolicy::DropOldest,
        vec![IntervalTier { above: 50, interval_secs: 60 }],
    );
    h.start_drain();

    for i in 0..3 {
        h.send(report("phone-a", 1_709_280_000_000 + i * 1_000, 21.0, 105.8)).await;
    }
    h.send("not json".to_string()).await;
    h.send(report("phone-b", 1_709_280_000_500, 10.7, 106.6)).await;

    wait_until("four persisted reports", || h.stats.snapshot().persisted == 4).await;

    let snap = h.stats.snapshot();
    assert_eq!(snap.received, 5);
    assert_eq!(snap.malformed, 1);
    assert_eq!(snap.enqueued, 4);
    assert_eq!(snap.persist_failures, 0);

    let locations = h.store.locations();
    let order: Vec<(&str, i64)> = locations
        .iter()
        .map(|l| (l.device_id.as_str(), l.recorded_at.timestamp_millis()))
        .collect();
    assert_eq!(
        order,
        vec![
            ("phone-a", 1_709_280_000_000),
            ("phone-a", 1_709_280_001_000),
            ("phone-a", 1_709_280_002_000),
            ("phone-b", 1_709_280_000_500),
        ]
    );
    // Two cells per report, stamped with the report time
    assert_eq!(h.store.cells().len(), 8);
    assert!(h.publisher.intervals().is_empty());

    h.cancel.cancel();
}

#[tokio::test]
async fn test_reports_on_other_topics_are_ignored() {
    let mut h = Harness::start(100, OverflowPolicy::DropOldest);
    h.start_drain();

    h.inbox
        .send(InboundMessage {
            topic: "device/phone-a/config".to_string(),
            payload: report("phone-a", 1_709_280_000_000, 21.0, 105.8).into_bytes(),
        })
        .await
        .unwrap();
    h.send(report("phone-b", 1_709_280_000_500, 10.7, 106.6)).await;

    wait_until("one persisted report", || h.stats.snapshot().persisted == 1).await;
    let devices: Vec<String> = h.store.locations().into_iter().map(|l| l.device_id).collect();
    assert_eq!(devices, vec!["phone-b"]);
    assert_eq!(h.stats.snapshot().received, 1);

    h.cancel.cancel();
}

#[tokio::test]
async fn test_backlog_slows_devices_then_everything_drains() {
    let mut h = Harness::start(100, OverflowPolicy::DropOldest);

    for i in 0..8 {
        h.send(report(&format!("dev-{i}"), 1_709_280_000_000 + i, 1.0, 1.0)).await;
    }
    wait_until("eight enqueued reports", || h.stats.snapshot().enqueued == 8).await;

    // Queue length 4 crosses >3, length 7 crosses >6; only the triggering
    // device of each change is notified.
    assert_eq!(
        h.publisher.intervals(),
        vec![("dev-3".to_string(), 60), ("dev-6".to_string(), 120)]
    );
    assert_eq!(h.stats.snapshot().advertised_interval_secs, 120);

    h.start_drain();
    wait_until("drained backlog", || h.stats.snapshot().persisted == 8).await;

    let devices: Vec<String> = h.store.locations().into_iter().map(|l| l.device_id).collect();
    let expected: Vec<String> = (0..8).map(|i| format!("dev-{i}")).collect();
    assert_eq!(devices, expected);

    // Next report sees an empty queue and restores the baseline interval.
    h.send(report("dev-late", 1_709_280_100_000, 1.0, 1.0)).await;
    wait_until("baseline restored", || h.publisher.intervals().len() == 3).await;
    assert_eq!(h.publisher.intervals()[2], ("dev-late".to_string(), 15));

    h.cancel.cancel();
}

#[tokio::test]
async fn test_drop_oldest_keeps_newest_when_full() {
    let mut h = Harness::start(3, OverflowPolicy::DropOldest);

    for i in 0..5 {
        h.send(report(&format!("dev-{i}"), 1_709_280_000_000 + i, 1.0, 1.0)).await;
    }
    wait_until("five enqueued reports", || h.stats.snapshot().enqueued == 5).await;
    assert_eq!(h.stats.snapshot().overflow_drops, 2);

    h.start_drain();
    wait_until("drained queue", || h.stats.snapshot().persisted == 3).await;
    let devices: Vec<String> = h.store.locations().into_iter().map(|l| l.device_id).collect();
    assert_eq!(devices, vec!["dev-2", "dev-3", "dev-4"]);

    h.cancel.cancel();
}

#[tokio::test]
async fn test_block_producer_loses_nothing() {
    let mut h = Harness::start(2, OverflowPolicy::BlockProducer);

    for i in 0..5 {
        h.send(report(&format!("dev-{i}"), 1_709_280_000_000 + i, 1.0, 1.0)).await;
    }
    // Listener is parked on the third push until the drain frees a slot.
    wait_until("two enqueued reports", || h.stats.snapshot().enqueued == 2).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.stats.snapshot().enqueued, 2);

    h.start_drain();
    wait_until("all persisted", || h.stats.snapshot().persisted == 5).await;
    assert_eq!(h.stats.snapshot().overflow_drops, 0);
    assert_eq!(h.store.locations().len(), 5);

    h.cancel.cancel();
}

#[tokio::test]
async fn test_first_fix_reaches_observers_with_station_context() {
    let mut h = Harness::start(100, OverflowPolicy::DropOldest);
    h.store
        .insert_station(Station {
            cid: 101,
            lac: 7,
            mcc: 452,
            mnc: 4,
            lat: 21.01,
            lon: 105.81,
            address: Some("Tower 101".to_string()),
            radio: Some("LTE".to_string()),
            range: None,
        })
        .unwrap();
    h.start_drain();

    let mut updates = h.reconciler.subscribe();
    h.send(report("phone-a", 1_709_280_000_000, 21.0, 105.8)).await;

    let update = tokio::time::timeout(Duration::from_secs(5), updates.recv())
        .await
        .expect("no update emitted")
        .unwrap();
    assert_eq!(update.device_id, "phone-a");
    assert!((update.lat - 21.0).abs() < 1e-9);
    assert!((update.lon - 105.8).abs() < 1e-9);

    let context = update.cell_context.expect("cell context attached");
    let serving = context.serving.expect("serving cell");
    assert_eq!(serving.cell.cid, Some(101));
    assert_eq!(
        serving.station.and_then(|s| s.address).as_deref(),
        Some("Tower 101")
    );
    assert_eq!(context.neighbors.len(), 1);
    assert!(context.neighbors[0].station.is_none());

    wait_until("emission counted", || h.stats.snapshot().emitted == 1).await;
    h.cancel.cancel();
}

#[tokio::test]
async fn test_teardown_forgets_device() {
    let mut h = Harness::start(100, OverflowPolicy::DropOldest);
    h.start_drain();

    let mut updates = h.reconciler.subscribe();
    h.send(report("phone-a", 1_709_280_000_000, 21.0, 105.8)).await;
    tokio::time::timeout(Duration::from_secs(5), updates.recv())
        .await
        .expect("no update emitted")
        .unwrap();

    assert_eq!(h.reconciler.tracked_devices().await.unwrap(), 1);
    assert!(h.reconciler.teardown("phone-a").await.unwrap());
    assert!(!h.reconciler.teardown("phone-a").await.unwrap());
    assert_eq!(h.reconciler.tracked_devices().await.unwrap(), 0);

    h.cancel.cancel();
}
