//! Exact-timestamp join of location and cell history.

use chrono::{DateTime, SecondsFormat, Utc};
use std::collections::HashMap;
use tracing::warn;

use crate::storage::StationLookup;
use crate::types::{CellSample, LocationSample, MergedRecord};

/// Pair each location sample with the cell samples recorded at exactly the
/// same instant.
///
/// Cells without a matching location are dropped. Within a match the first
/// cell flagged serving supplies the `bts_*` fields and its station record;
/// every other cell, including any further serving-flagged one, is listed
/// as a neighbor. A station miss or lookup
/// failure leaves the station fields `null`.
pub async fn merge_history(
    locations: &[LocationSample],
    cells: &[CellSample],
    stations: &dyn StationLookup,
) -> Vec<MergedRecord> {
    let mut by_time: HashMap<DateTime<Utc>, Vec<&CellSample>> = HashMap::new();
    for cell in cells {
        by_time.entry(cell.recorded_at).or_default().push(cell);
    }

    let mut merged = Vec::with_capacity(locations.len());
    for location in locations {
        let batch = by_time
            .get(&location.recorded_at)
            .map(Vec::as_slice)
            .unwrap_or_default();
        let serving_idx = batch.iter().position(|c| c.is_serving);
        let serving = serving_idx.map(|i| batch[i]);

        let station = match serving.and_then(CellSample::identity) {
            Some(identity) => match stations.lookup(&identity).await {
                Ok(station) => station,
                Err(e) => {
                    warn!(cell = %identity, error = %e, "Station lookup failed during history merge");
                    None
                }
            },
            None => None,
        };

        merged.push(MergedRecord {
            timestamp: location
                .recorded_at
                .to_rfc3339_opts(SecondsFormat::Millis, true),
            latitude: location.latitude,
            longitude: location.longitude,
            address: location.address.clone(),
            bts_cid: serving.and_then(|c| c.cid),
            bts_lac: serving.and_then(|c| c.lac),
            bts_mcc: serving.and_then(|c| c.mcc),
            bts_mnc: serving.and_then(|c| c.mnc),
            signal_dbm: serving.and_then(|c| c.rssi),
            is_serving: serving.is_some(),
            bts_address: station.as_ref().and_then(|s| s.address.clone()),
            bts_lat: station.as_ref().map(|s| s.lat),
            bts_lon: station.as_ref().map(|s| s.lon),
            neighbor_cells: batch
                .iter()
                .enumerate()
                .filter(|(i, _)| Some(*i) != serving_idx)
                .map(|(_, c)| (*c).clone())
                .collect(),
        });
    }
    merged
}
