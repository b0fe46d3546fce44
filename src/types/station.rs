//! Static cell tower metadata.

use serde::{Deserialize, Serialize};

use super::CellIdentity;

/// A base station record, keyed by its cell identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Station {
    pub cid: i64,
    pub lac: i64,
    pub mcc: i64,
    pub mnc: i64,
    pub lat: f64,
    pub lon: f64,
    #[serde(default)]
    pub address: Option<String>,
    /// Radio technology (GSM, UMTS, LTE, NR)
    #[serde(default)]
    pub radio: Option<String>,
    /// Approximate coverage radius (meters)
    #[serde(default)]
    pub range: Option<f64>,
}

impl Station {
    pub fn identity(&self) -> CellIdentity {
        CellIdentity {
            cid: self.cid,
            lac: self.lac,
            mcc: self.mcc,
            mnc: self.mnc,
        }
    }
}
