//! Telemetry Sample Storage
//!
//! Persists location and cell rows to Sled DB, one tree each, plus a station
//! tree for tower metadata.
//!
//! Sample keys are `device_id ++ 0x00 ++ ts_ms (order-preserving BE) ++ seq`,
//! so a per-device time window is a single contiguous range scan. The
//! trailing sequence number keeps rows recorded in the same millisecond apart.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::Transactional;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

use super::persistence::{HistorySource, SampleStore, StationLookup, StorageError};
use crate::types::{CellIdentity, CellSample, LocationSample, Station, TelemetryMessage};

const LOCATIONS_TREE: &str = "location_history";
const CELLS_TREE: &str = "cell_tower_history";
const STATIONS_TREE: &str = "bts_stations";

/// Sled-backed sample and station store
#[derive(Clone)]
pub struct SledStore {
    db: Arc<sled::Db>,
    locations: sled::Tree,
    cells: sled::Tree,
    stations: sled::Tree,
}

impl SledStore {
    /// Open or create the store at the specified path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let db = sled::open(path)?;
        let locations = db.open_tree(LOCATIONS_TREE)?;
        let cells = db.open_tree(CELLS_TREE)?;
        let stations = db.open_tree(STATIONS_TREE)?;
        Ok(Self {
            db: Arc::new(db),
            locations,
            cells,
            stations,
        })
    }

    /// Insert or replace station records. Returns how many were written.
    pub fn upsert_stations(&self, stations: &[Station]) -> Result<usize, StorageError> {
        let mut batch = sled::Batch::default();
        for station in stations {
            let value = serde_json::to_vec(station)?;
            batch.insert(station_key(&station.identity()).to_vec(), value);
        }
        self.stations.apply_batch(batch)?;
        self.stations.flush()?;
        Ok(stations.len())
    }

    /// Number of stored (locations, cells, stations)
    pub fn counts(&self) -> (usize, usize, usize) {
        (self.locations.len(), self.cells.len(), self.stations.len())
    }

    /// Flush pending writes to disk
    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }

    fn sample_key(&self, device_id: &str, at: DateTime<Utc>) -> Result<Vec<u8>, StorageError> {
        let seq = self.db.generate_id()?;
        let mut key = device_prefix(device_id);
        key.extend_from_slice(&encode_ts(at.timestamp_millis()));
        key.extend_from_slice(&seq.to_be_bytes());
        Ok(key)
    }

    /// Write one report's rows in a single transaction across both sample
    /// trees, so a failure leaves neither the location nor its cells behind.
    fn write_samples(
        &self,
        location: Option<&LocationSample>,
        cells: &[CellSample],
    ) -> Result<usize, StorageError> {
        let location_row = match location {
            Some(l) => Some((
                self.sample_key(&l.device_id, l.recorded_at)?,
                serde_json::to_vec(l)?,
            )),
            None => None,
        };
        let cell_rows = cells
            .iter()
            .map(|c| Ok((self.sample_key(&c.device_id, c.recorded_at)?, serde_json::to_vec(c)?)))
            .collect::<Result<Vec<_>, StorageError>>()?;

        (&self.locations, &self.cells)
            .transaction(|(locations, cells)| {
                if let Some((key, value)) = &location_row {
                    locations.insert(key.as_slice(), value.as_slice())?;
                }
                for (key, value) in &cell_rows {
                    cells.insert(key.as_slice(), value.as_slice())?;
                }
                Ok::<(), ConflictableTransactionError<()>>(())
            })
            .map_err(|e| match e {
                TransactionError::Storage(e) => StorageError::Database(e),
                TransactionError::Abort(()) => {
                    StorageError::Unavailable("sample transaction aborted".into())
                }
            })?;

        Ok(cell_rows.len())
    }

    fn scan<T: DeserializeOwned>(
        tree: &sled::Tree,
        device_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<T>, StorageError> {
        let prefix = device_prefix(device_id);

        let mut lower = prefix.clone();
        lower.extend_from_slice(&encode_ts(start.timestamp_millis()));
        let mut upper = prefix;
        upper.extend_from_slice(&encode_ts(end.timestamp_millis()));
        upper.extend_from_slice(&u64::MAX.to_be_bytes());

        let mut rows = Vec::new();
        for item in tree.range(lower..=upper) {
            let (key, value) = item?;
            match serde_json::from_slice::<T>(&value) {
                Ok(row) => rows.push(row),
                Err(e) => warn!(key = ?key, error = %e, "Skipping corrupted sample row"),
            }
        }
        Ok(rows)
    }
}

#[async_trait]
impl SampleStore for SledStore {
    async fn append(
        &self,
        message: &TelemetryMessage,
        received_at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let (location, cells) = message.to_samples(received_at);

        // Sled calls block on disk I/O; keep them off the runtime threads.
        let store = self.clone();
        let written =
            tokio::task::spawn_blocking(move || store.write_samples(location.as_ref(), &cells))
                .await
                .map_err(|e| StorageError::Unavailable(format!("sample writer task failed: {e}")))??;

        debug!(
            device_id = %message.device_id,
            cells = written,
            "Telemetry sample persisted"
        );
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "Sled"
    }
}

#[async_trait]
impl StationLookup for SledStore {
    async fn lookup(&self, identity: &CellIdentity) -> Result<Option<Station>, StorageError> {
        match self.stations.get(station_key(identity))? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl HistorySource for SledStore {
    async fn locations_between(
        &self,
        device_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<LocationSample>, StorageError> {
        Self::scan(&self.locations, device_id, start, end)
    }

    async fn cells_between(
        &self,
        device_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<CellSample>, StorageError> {
        Self::scan(&self.cells, device_id, start, end)
    }
}

fn device_prefix(device_id: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(device_id.len() + 17);
    key.extend_from_slice(device_id.as_bytes());
    key.push(0);
    key
}

/// Flip the sign bit so negative timestamps sort before positive ones.
fn encode_ts(ms: i64) -> [u8; 8] {
    ((ms as u64) ^ (1 << 63)).to_be_bytes()
}

fn station_key(id: &CellIdentity) -> [u8; 32] {
    let mut key = [0u8; 32];
    key[0..8].copy_from_slice(&id.mcc.to_be_bytes());
    key[8..16].copy_from_slice(&id.mnc.to_be_bytes());
    key[16..24].copy_from_slice(&id.lac.to_be_bytes());
    key[24..32].copy_from_slice(&id.cid.to_be_bytes());
    key
}
