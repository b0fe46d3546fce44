//! Location history rows joined with the cells observed at the same instant.

use serde::{Deserialize, Serialize};

use super::CellSample;

/// One merged history row. Serving-cell and station fields are `null` when no
/// cell sample shares the location's exact timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergedRecord {
    /// RFC 3339
    pub timestamp: String,
    pub latitude: f64,
    pub longitude: f64,
    pub address: Option<String>,

    pub bts_cid: Option<i64>,
    pub bts_lac: Option<i64>,
    pub bts_mcc: Option<i64>,
    pub bts_mnc: Option<i64>,
    pub signal_dbm: Option<i32>,
    pub is_serving: bool,

    pub bts_address: Option<String>,
    pub bts_lat: Option<f64>,
    pub bts_lon: Option<f64>,

    pub neighbor_cells: Vec<CellSample>,
}
