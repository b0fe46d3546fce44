//! Storage traits: pluggable backends for the pipeline's external collaborators
//!
//! The pipeline only needs three things from storage:
//! - `SampleStore`: append one validated telemetry report
//! - `StationLookup`: resolve a cell identity to its station record
//! - `HistorySource`: read back samples for the history merge
//!
//! Backends:
//! - `InMemoryStore`: for tests and ingestion-less deployments
//! - [`SledStore`](super::SledStore): embedded durable store

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::RwLock;

use crate::types::{CellIdentity, CellSample, LocationSample, Station, TelemetryMessage};

/// Durable append of validated telemetry.
///
/// Implementations must be thread-safe (Send + Sync) for shared access
/// across async tasks. Failures may be transient; callers log and move on.
#[async_trait]
pub trait SampleStore: Send + Sync {
    /// Persist the location and cell rows carried by one report.
    async fn append(
        &self,
        message: &TelemetryMessage,
        received_at: DateTime<Utc>,
    ) -> Result<(), StorageError>;

    /// Backend name for logging
    fn backend_name(&self) -> &'static str;
}

/// Static station metadata keyed by cell identity. A miss is `Ok(None)`.
#[async_trait]
pub trait StationLookup: Send + Sync {
    async fn lookup(&self, identity: &CellIdentity) -> Result<Option<Station>, StorageError>;
}

/// Time-bounded reads for one device, oldest first, both bounds inclusive.
#[async_trait]
pub trait HistorySource: Send + Sync {
    async fn locations_between(
        &self,
        device_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<LocationSample>, StorageError>;

    async fn cells_between(
        &self,
        device_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<CellSample>, StorageError>;
}

/// Storage errors
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sled::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// In-memory store for tests and minimal deployments
///
/// Thread-safe via `RwLock`. Not durable; data is lost on restart.
#[derive(Default)]
pub struct InMemoryStore {
    locations: RwLock<Vec<LocationSample>>,
    cells: RwLock<Vec<CellSample>>,
    stations: RwLock<HashMap<CellIdentity, Station>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a station record.
    pub fn insert_station(&self, station: Station) -> Result<(), StorageError> {
        let mut stations = self
            .stations
            .write()
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;
        stations.insert(station.identity(), station);
        Ok(())
    }

    /// Insert a pre-built location row directly, bypassing `append`.
    pub fn insert_location(&self, sample: LocationSample) -> Result<(), StorageError> {
        self.locations
            .write()
            .map_err(|e| StorageError::Unavailable(e.to_string()))?
            .push(sample);
        Ok(())
    }

    /// All stored location rows in append order.
    pub fn locations(&self) -> Vec<LocationSample> {
        self.locations
            .read()
            .map(|rows| rows.clone())
            .unwrap_or_default()
    }

    /// All stored cell rows in append order.
    pub fn cells(&self) -> Vec<CellSample> {
        self.cells.read().map(|rows| rows.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl SampleStore for InMemoryStore {
    async fn append(
        &self,
        message: &TelemetryMessage,
        received_at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let (location, cells) = message.to_samples(received_at);
        if let Some(location) = location {
            self.insert_location(location)?;
        }
        let mut store = self
            .cells
            .write()
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;
        store.extend(cells);
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "InMemory"
    }
}

#[async_trait]
impl StationLookup for InMemoryStore {
    async fn lookup(&self, identity: &CellIdentity) -> Result<Option<Station>, StorageError> {
        let stations = self
            .stations
            .read()
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;
        Ok(stations.get(identity).cloned())
    }
}

#[async_trait]
impl HistorySource for InMemoryStore {
    async fn locations_between(
        &self,
        device_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<LocationSample>, StorageError> {
        let store = self
            .locations
            .read()
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;
        let mut rows: Vec<_> = store
            .iter()
            .filter(|s| s.device_id == device_id && s.recorded_at >= start && s.recorded_at <= end)
            .cloned()
            .collect();
        rows.sort_by_key(|s| s.recorded_at);
        Ok(rows)
    }

    async fn cells_between(
        &self,
        device_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<CellSample>, StorageError> {
        let store = self
            .cells
            .read()
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;
        let mut rows: Vec<_> = store
            .iter()
            .filter(|s| s.device_id == device_id && s.recorded_at >= start && s.recorded_at <= end)
            .cloned()
            .collect();
        rows.sort_by_key(|s| s.recorded_at);
        Ok(rows)
    }
}
