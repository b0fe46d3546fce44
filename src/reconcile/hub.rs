//! Reconciler hub - owns every device's reconciler and its debounce timer
//!
//! One actor task processes all fixes, so each device's state has exactly
//! one writer. Per device it keeps a single pending fix: a fix arriving
//! inside the throttle window replaces the pending one and re-arms the
//! timer, so a burst collapses into one trailing emission carrying the
//! latest data.
//!
//! Timers are spawned tasks that post `Flush` back to the actor. Each
//! carries the device's generation at arming time; a flush whose generation
//! is stale (re-armed, processed early or torn down) is ignored.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::reconciler::{FixOutcome, PositionReconciler, RawFix};
use crate::config::ReconcilerConfig;
use crate::pipeline::PipelineStats;
use crate::storage::StationLookup;
use crate::types::{CellContext, CellObservation, CellSnapshot, EmittedUpdate};

// ============================================================================
// Commands
// ============================================================================

#[derive(Debug)]
enum HubCommand {
    Fix(RawFix),
    Flush {
        device_id: String,
        generation: u64,
    },
    Teardown {
        device_id: String,
        response_tx: oneshot::Sender<bool>,
    },
    TrackedDevices {
        response_tx: oneshot::Sender<usize>,
    },
}

/// Why a fix could not be handed to the hub
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouteError {
    #[error("reconciler inbox full")]
    Full,
    #[error("reconciler hub stopped")]
    Closed,
}

// ============================================================================
// Handle
// ============================================================================

/// Cloneable handle to the hub actor
#[derive(Clone)]
pub struct ReconcilerHandle {
    tx: mpsc::Sender<HubCommand>,
    updates: broadcast::Sender<EmittedUpdate>,
}

impl ReconcilerHandle {
    /// Hand a fix to the hub without waiting.
    pub fn try_route(&self, fix: RawFix) -> Result<(), RouteError> {
        self.tx.try_send(HubCommand::Fix(fix)).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => RouteError::Full,
            mpsc::error::TrySendError::Closed(_) => RouteError::Closed,
        })
    }

    /// Drop a device's reconciler, cancelling any pending emission.
    /// Returns whether the device was being tracked.
    pub async fn teardown(&self, device_id: &str) -> Result<bool, RouteError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(HubCommand::Teardown {
                device_id: device_id.to_string(),
                response_tx,
            })
            .await
            .map_err(|_| RouteError::Closed)?;
        response_rx.await.map_err(|_| RouteError::Closed)
    }

    pub async fn tracked_devices(&self) -> Result<usize, RouteError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(HubCommand::TrackedDevices { response_tx })
            .await
            .map_err(|_| RouteError::Closed)?;
        response_rx.await.map_err(|_| RouteError::Closed)
    }

    /// New observer of emitted updates. Lagging observers skip ahead.
    pub fn subscribe(&self) -> broadcast::Receiver<EmittedUpdate> {
        self.updates.subscribe()
    }

    pub fn observer_count(&self) -> usize {
        self.updates.receiver_count()
    }
}

// ============================================================================
// Hub
// ============================================================================

struct DeviceSlot {
    reconciler: PositionReconciler,
    pending: Option<RawFix>,
    last_emit: Option<Instant>,
    timer: Option<JoinHandle<()>>,
    generation: u64,
}

impl DeviceSlot {
    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

pub struct ReconcilerHub {
    config: ReconcilerConfig,
    rx: mpsc::Receiver<HubCommand>,
    self_tx: mpsc::WeakSender<HubCommand>,
    updates: broadcast::Sender<EmittedUpdate>,
    stations: Arc<dyn StationLookup>,
    stats: Arc<PipelineStats>,
    devices: HashMap<String, DeviceSlot>,
}

impl ReconcilerHub {
    pub fn new(
        config: ReconcilerConfig,
        stations: Arc<dyn StationLookup>,
        stats: Arc<PipelineStats>,
        inbox_capacity: usize,
        observer_capacity: usize,
    ) -> (Self, ReconcilerHandle) {
        let (tx, rx) = mpsc::channel(inbox_capacity.max(1));
        let (updates, _) = broadcast::channel(observer_capacity.max(1));

        let hub = Self {
            config,
            rx,
            self_tx: tx.downgrade(),
            updates: updates.clone(),
            stations,
            stats,
            devices: HashMap::new(),
        };
        (hub, ReconcilerHandle { tx, updates })
    }

    /// Run until cancelled or every handle is dropped.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(
            throttle_ms = self.config.throttle_ms,
            window = self.config.buffer_size,
            "Reconciler hub started"
        );

        loop {
            let cmd = tokio::select! {
                _ = cancel.cancelled() => break,
                cmd = self.rx.recv() => match cmd {
                    Some(cmd) => cmd,
                    None => break,
                },
            };

            match cmd {
                HubCommand::Fix(fix) => self.on_fix(fix).await,
                HubCommand::Flush {
                    device_id,
                    generation,
                } => {
                    let current = self
                        .devices
                        .get(&device_id)
                        .is_some_and(|slot| slot.generation == generation);
                    if current {
                        self.process(&device_id).await;
                    }
                }
                HubCommand::Teardown {
                    device_id,
                    response_tx,
                } => {
                    let existed = match self.devices.remove(&device_id) {
                        Some(mut slot) => {
                            slot.cancel_timer();
                            info!(device_id = %device_id, "Reconciler torn down");
                            true
                        }
                        None => false,
                    };
                    let _ = response_tx.send(existed);
                }
                HubCommand::TrackedDevices { response_tx } => {
                    let _ = response_tx.send(self.devices.len());
                }
            }
        }

        for slot in self.devices.values_mut() {
            slot.cancel_timer();
        }
        info!(devices = self.devices.len(), "Reconciler hub stopped");
    }

    async fn on_fix(&mut self, fix: RawFix) {
        let throttle = Duration::from_millis(self.config.throttle_ms);
        let device_id = fix.device_id.clone();
        let config = &self.config;
        let slot = self
            .devices
            .entry(device_id.clone())
            .or_insert_with(|| DeviceSlot {
                reconciler: PositionReconciler::new(config.clone()),
                pending: None,
                last_emit: None,
                timer: None,
                generation: 0,
            });

        slot.pending = Some(fix);
        slot.cancel_timer();
        slot.generation = slot.generation.wrapping_add(1);

        let wait = slot.last_emit.map_or(Duration::ZERO, |at| {
            throttle.saturating_sub(Instant::now().saturating_duration_since(at))
        });
        if wait.is_zero() {
            self.process(&device_id).await;
            return;
        }

        let generation = slot.generation;
        let self_tx = self.self_tx.clone();
        slot.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            if let Some(tx) = self_tx.upgrade() {
                let _ = tx
                    .send(HubCommand::Flush {
                        device_id,
                        generation,
                    })
                    .await;
            }
        }));
    }

    /// Apply the device's pending fix and emit on acceptance.
    async fn process(&mut self, device_id: &str) {
        let Some(fix) = self
            .devices
            .get_mut(device_id)
            .and_then(|slot| slot.pending.take())
        else {
            return;
        };

        let context = resolve_context(self.stations.as_ref(), &fix.cells).await;

        let Some(slot) = self.devices.get_mut(device_id) else {
            return;
        };
        slot.timer = None;
        if let Some(context) = context {
            slot.reconciler.merge_context(context);
        }

        let Some(location) = fix.location else {
            return;
        };
        let now = Instant::now();
        match slot.reconciler.apply(&location, now) {
            FixOutcome::Accepted { position, moved_m } => {
                slot.last_emit = Some(now);
                let update = EmittedUpdate {
                    device_id: device_id.to_string(),
                    lat: position.lat,
                    lon: position.lon,
                    cell_context: slot.reconciler.context().cloned(),
                    timestamp: Utc::now(),
                };
                self.stats.record_emitted();
                debug!(device_id = %device_id, moved_m = ?moved_m, "Position accepted");
                if self.updates.send(update).is_err() {
                    debug!("No observers connected");
                }
            }
            FixOutcome::LowAccuracy { accuracy_m } => {
                debug!(device_id = %device_id, accuracy_m, "Fix ignored: low accuracy");
            }
            FixOutcome::Jitter { moved_m } => {
                debug!(device_id = %device_id, moved_m, "Fix rejected: jitter");
            }
            FixOutcome::SpeedSpike { moved_m, speed_kph } => {
                debug!(device_id = %device_id, moved_m, speed_kph, "Fix rejected: speed spike");
            }
        }
    }
}

/// Split observed cells into serving/neighbors and attach station records.
///
/// Lookup failures are logged and treated as misses.
async fn resolve_context(
    stations: &dyn StationLookup,
    cells: &[CellObservation],
) -> Option<CellContext> {
    if cells.is_empty() {
        return None;
    }

    let mut context = CellContext::default();
    for cell in cells {
        let station = match cell.identity() {
            Some(identity) => match stations.lookup(&identity).await {
                Ok(station) => station,
                Err(e) => {
                    warn!(cell = %identity, error = %e, "Station lookup failed");
                    None
                }
            },
            None => None,
        };
        let snapshot = CellSnapshot {
            cell: cell.clone(),
            station,
        };
        if cell.is_serving && context.serving.is_none() {
            context.serving = Some(snapshot);
        } else {
            context.neighbors.push(snapshot);
        }
    }
    Some(context)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStore;
    use crate::types::{Location, Station};

    const M_PER_DEG: f64 = 6_371_000.0 * std::f64::consts::PI / 180.0;

    fn fix_north(device: &str, m: f64) -> RawFix {
        RawFix {
            device_id: device.to_string(),
            location: Some(Location {
                latitude: m / M_PER_DEG,
                longitude: 0.0,
                accuracy: Some(5.0),
            }),
            cells: vec![],
        }
    }

    fn spawn_hub(store: Arc<InMemoryStore>) -> (ReconcilerHandle, CancellationToken) {
        let config = ReconcilerConfig {
            buffer_size: 1,
            ..ReconcilerConfig::default()
        };
        let (hub, handle) = ReconcilerHub::new(
            config,
            store,
            Arc::new(PipelineStats::new(15)),
            64,
            64,
        );
        let cancel = CancellationToken::new();
        tokio::spawn(hub.run(cancel.clone()));
        (handle, cancel)
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_fix_emits_immediately() {
        let (handle, _cancel) = spawn_hub(Arc::new(InMemoryStore::new()));
        let mut rx = handle.subscribe();
        let start = Instant::now();

        handle.try_route(fix_north("d1", 0.0)).unwrap();
        let update = rx.recv().await.unwrap();

        assert_eq!(update.device_id, "d1");
        assert_eq!(update.lat, 0.0);
        assert!(update.cell_context.is_none());
        assert_eq!(Instant::now(), start);
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_collapses_to_latest() {
        let (handle, _cancel) = spawn_hub(Arc::new(InMemoryStore::new()));
        let mut rx = handle.subscribe();
        let start = Instant::now();

        handle.try_route(fix_north("d1", 0.0)).unwrap();
        rx.recv().await.unwrap();

        for m in [5.0, 10.0, 30.0] {
            tokio::time::sleep(Duration::from_millis(100)).await;
            handle.try_route(fix_north("d1", m)).unwrap();
        }

        let update = rx.recv().await.unwrap();
        assert!((update.lat - 30.0 / M_PER_DEG).abs() < 1e-12);
        let waited = Instant::now() - start;
        assert!(waited >= Duration::from_millis(1000) && waited < Duration::from_millis(1100));

        let more = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await;
        assert!(more.is_err(), "burst must produce a single trailing emission");
    }

    #[tokio::test(start_paused = true)]
    async fn test_devices_are_independent() {
        let (handle, _cancel) = spawn_hub(Arc::new(InMemoryStore::new()));
        let mut rx = handle.subscribe();

        handle.try_route(fix_north("a", 0.0)).unwrap();
        handle.try_route(fix_north("b", 0.0)).unwrap();

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.device_id, "a");
        assert_eq!(second.device_id, "b");
        assert_eq!(handle.tracked_devices().await.unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_discards_pending() {
        let (handle, _cancel) = spawn_hub(Arc::new(InMemoryStore::new()));
        let mut rx = handle.subscribe();

        handle.try_route(fix_north("d1", 0.0)).unwrap();
        rx.recv().await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.try_route(fix_north("d1", 30.0)).unwrap();

        assert!(handle.teardown("d1").await.unwrap());
        assert!(!handle.teardown("d1").await.unwrap());

        let more = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await;
        assert!(more.is_err(), "torn-down device must not emit");
        assert_eq!(handle.tracked_devices().await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_emission_carries_station_context() {
        let store = Arc::new(InMemoryStore::new());
        store
            .insert_station(Station {
                cid: 11,
                lac: 2,
                mcc: 452,
                mnc: 4,
                lat: 21.0,
                lon: 105.8,
                address: Some("Ba Dinh".into()),
                radio: None,
                range: None,
            })
            .unwrap();
        let (handle, _cancel) = spawn_hub(store);
        let mut rx = handle.subscribe();

        let mut fix = fix_north("d1", 0.0);
        fix.cells = serde_json::from_value(serde_json::json!([
            {"cid": 11, "lac": 2, "mcc": 452, "mnc": 4, "isServing": true, "rssi": -71},
            {"cid": 12, "lac": 2, "mcc": 452, "mnc": 4, "rssi": -90}
        ]))
        .unwrap();
        handle.try_route(fix).unwrap();

        let update = rx.recv().await.unwrap();
        let ctx = update.cell_context.unwrap();
        let serving = ctx.serving.unwrap();
        assert_eq!(serving.cell.cid, Some(11));
        assert_eq!(serving.station.unwrap().address.as_deref(), Some("Ba Dinh"));
        assert_eq!(ctx.neighbors.len(), 1);
        assert!(ctx.neighbors[0].station.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_hub() {
        let store = Arc::new(InMemoryStore::new());
        let (hub, handle) = ReconcilerHub::new(
            ReconcilerConfig::default(),
            store,
            Arc::new(PipelineStats::new(15)),
            8,
            8,
        );
        let cancel = CancellationToken::new();
        let task = tokio::spawn(hub.run(cancel.clone()));
        cancel.cancel();
        task.await.unwrap();
        assert_eq!(handle.try_route(fix_north("d", 0.0)), Err(RouteError::Closed));
    }
}
