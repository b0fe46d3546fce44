//! Reconciled position events pushed to observers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{CellObservation, Station};

/// A latitude/longitude pair in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatLon {
    pub lat: f64,
    pub lon: f64,
}

impl LatLon {
    pub const fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }
}

/// A cell observation with its station record, when one is known.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellSnapshot {
    #[serde(flatten)]
    pub cell: CellObservation,
    pub station: Option<Station>,
}

/// Last-known radio context of a device.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CellContext {
    pub serving: Option<CellSnapshot>,
    pub neighbors: Vec<CellSnapshot>,
}

impl CellContext {
    pub fn is_empty(&self) -> bool {
        self.serving.is_none() && self.neighbors.is_empty()
    }
}

/// One de-jittered position event: `{deviceId, lat, lon, cellContext, timestamp}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmittedUpdate {
    pub device_id: String,
    pub lat: f64,
    pub lon: f64,
    pub cell_context: Option<CellContext>,
    pub timestamp: DateTime<Utc>,
}
