//! Device telemetry as it arrives on the wire, and the samples persisted from it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One device-originated report: a position fix and/or the cells it can see.
///
/// Fields the pipeline does not interpret are preserved in `raw`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryMessage {
    /// Empty when absent on the wire; rejected by validation.
    #[serde(default)]
    pub device_id: String,

    /// Absent when missing or unreadable.
    #[serde(
        default,
        deserialize_with = "lenient::location",
        skip_serializing_if = "Option::is_none"
    )]
    pub location: Option<Location>,

    /// Unreadable entries are skipped; `null` is an empty list.
    #[serde(
        default,
        deserialize_with = "lenient::cells",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub cell_towers: Vec<CellObservation>,

    /// Device-side report time: epoch ms (integer or float) or RFC 3339.
    #[serde(
        default,
        serialize_with = "chrono::serde::ts_milliseconds_option::serialize",
        deserialize_with = "lenient::timestamp",
        skip_serializing_if = "Option::is_none"
    )]
    pub timestamp: Option<DateTime<Utc>>,

    #[serde(flatten)]
    pub raw: serde_json::Map<String, serde_json::Value>,
}

impl TelemetryMessage {
    /// Time the report describes: the device timestamp when present, else `received_at`.
    pub fn recorded_at(&self, received_at: DateTime<Utc>) -> DateTime<Utc> {
        self.timestamp.unwrap_or(received_at)
    }

    /// Split the report into the rows the sample store appends.
    ///
    /// Cell observations without their own `recordedAt` inherit the report
    /// time, so a fix and the cells seen with it share one timestamp.
    pub fn to_samples(&self, received_at: DateTime<Utc>) -> (Option<LocationSample>, Vec<CellSample>) {
        let recorded_at = self.recorded_at(received_at);

        let location = self.location.as_ref().map(|loc| LocationSample {
            device_id: self.device_id.clone(),
            recorded_at,
            latitude: loc.latitude,
            longitude: loc.longitude,
            accuracy: loc.accuracy,
            address: None,
        });

        let cells = self
            .cell_towers
            .iter()
            .map(|cell| CellSample {
                device_id: self.device_id.clone(),
                recorded_at: cell.recorded_at.unwrap_or(recorded_at),
                cid: cell.cid,
                lac: cell.lac,
                mcc: cell.mcc,
                mnc: cell.mnc,
                rssi: cell.rssi,
                is_serving: cell.is_serving,
            })
            .collect();

        (location, cells)
    }
}

/// A GPS fix as reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    #[serde(alias = "lat", deserialize_with = "lenient::number")]
    pub latitude: f64,

    #[serde(alias = "lon", alias = "lng", deserialize_with = "lenient::number")]
    pub longitude: f64,

    /// Declared horizontal accuracy (meters)
    #[serde(
        default,
        alias = "accuracyMeters",
        deserialize_with = "lenient::opt_number",
        skip_serializing_if = "Option::is_none"
    )]
    pub accuracy: Option<f64>,
}

impl Location {
    /// Finite and inside ±90° / ±180°.
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }
}

/// One cell the device observed. At most one per report is flagged serving.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CellObservation {
    #[serde(default, deserialize_with = "lenient::opt_integer")]
    pub cid: Option<i64>,
    #[serde(default, deserialize_with = "lenient::opt_integer")]
    pub lac: Option<i64>,
    #[serde(default, deserialize_with = "lenient::opt_integer")]
    pub mcc: Option<i64>,
    #[serde(default, deserialize_with = "lenient::opt_integer")]
    pub mnc: Option<i64>,

    /// Signal strength (dBm); fractional readings are rounded.
    #[serde(
        default,
        deserialize_with = "lenient::rssi",
        skip_serializing_if = "Option::is_none"
    )]
    pub rssi: Option<i32>,

    #[serde(default, alias = "is_serving")]
    pub is_serving: bool,

    #[serde(
        default,
        serialize_with = "chrono::serde::ts_milliseconds_option::serialize",
        deserialize_with = "lenient::timestamp",
        skip_serializing_if = "Option::is_none"
    )]
    pub recorded_at: Option<DateTime<Utc>>,
}

impl CellObservation {
    /// Station lookup key; `None` unless all four parts are present and non-zero.
    pub fn identity(&self) -> Option<CellIdentity> {
        CellIdentity::from_parts(self.cid, self.lac, self.mcc, self.mnc)
    }
}

/// `(cid, lac, mcc, mnc)`: the key into station records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CellIdentity {
    pub cid: i64,
    pub lac: i64,
    pub mcc: i64,
    pub mnc: i64,
}

impl CellIdentity {
    pub fn from_parts(
        cid: Option<i64>,
        lac: Option<i64>,
        mcc: Option<i64>,
        mnc: Option<i64>,
    ) -> Option<Self> {
        match (cid, lac, mcc, mnc) {
            (Some(cid), Some(lac), Some(mcc), Some(mnc))
                if cid != 0 && lac != 0 && mcc != 0 && mnc != 0 =>
            {
                Some(Self { cid, lac, mcc, mnc })
            }
            _ => None,
        }
    }
}

impl fmt::Display for CellIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}-{}", self.mcc, self.mnc, self.lac, self.cid)
    }
}

/// Persisted location row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationSample {
    pub device_id: String,
    pub recorded_at: DateTime<Utc>,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub accuracy: Option<f64>,
    #[serde(default)]
    pub address: Option<String>,
}

/// Persisted cell observation row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellSample {
    pub device_id: String,
    pub recorded_at: DateTime<Utc>,
    pub cid: Option<i64>,
    pub lac: Option<i64>,
    pub mcc: Option<i64>,
    pub mnc: Option<i64>,
    pub rssi: Option<i32>,
    pub is_serving: bool,
}

impl CellSample {
    pub fn identity(&self) -> Option<CellIdentity> {
        CellIdentity::from_parts(self.cid, self.lac, self.mcc, self.mnc)
    }
}

/// Field readers that accept what devices actually send.
///
/// A report is only malformed when it is not a JSON object or has no
/// `deviceId`. Optional fields that cannot be read become `None` instead
/// of failing the whole report.
mod lenient {
    use super::{CellObservation, Location};
    use chrono::{DateTime, TimeZone, Utc};
    use serde::de::Error;
    use serde::{Deserialize, Deserializer};
    use serde_json::Value;

    fn as_f64(value: &Value) -> Option<f64> {
        let parsed = match value {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        };
        parsed.filter(|v| v.is_finite())
    }

    fn as_i64(value: &Value) -> Option<i64> {
        if let Value::Number(n) = value {
            if let Some(v) = n.as_i64() {
                return Some(v);
            }
        }
        as_f64(value)
            .filter(|v| v.fract() == 0.0 && v.abs() < i64::MAX as f64)
            .map(|v| v as i64)
    }

    /// Required coordinate: a number or a numeric string.
    pub fn number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        let value = Value::deserialize(deserializer)?;
        as_f64(&value).ok_or_else(|| D::Error::custom(format!("expected a number, got {value}")))
    }

    pub fn opt_number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<f64>, D::Error> {
        Ok(Option::<Value>::deserialize(deserializer)?.as_ref().and_then(as_f64))
    }

    pub fn opt_integer<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<i64>, D::Error> {
        Ok(Option::<Value>::deserialize(deserializer)?.as_ref().and_then(as_i64))
    }

    pub fn rssi<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<i32>, D::Error> {
        Ok(Option::<Value>::deserialize(deserializer)?
            .as_ref()
            .and_then(as_f64)
            .map(|v| v.round().clamp(f64::from(i32::MIN), f64::from(i32::MAX)) as i32))
    }

    /// Epoch milliseconds (integer, float or numeric string) or RFC 3339.
    pub fn timestamp<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
        let Some(value) = Option::<Value>::deserialize(deserializer)? else {
            return Ok(None);
        };
        if let Value::String(s) = &value {
            if let Ok(at) = DateTime::parse_from_rfc3339(s.trim()) {
                return Ok(Some(at.with_timezone(&Utc)));
            }
        }
        let millis = match &value {
            Value::Number(n) => n.as_i64().or_else(|| as_f64(&value).map(|v| v.trunc() as i64)),
            _ => as_f64(&value).map(|v| v.trunc() as i64),
        };
        Ok(millis.and_then(|ms| Utc.timestamp_millis_opt(ms).single()))
    }

    pub fn location<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Location>, D::Error> {
        Ok(Option::<Value>::deserialize(deserializer)?
            .and_then(|value| serde_json::from_value(value).ok()))
    }

    pub fn cells<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<CellObservation>, D::Error> {
        Ok(match Option::<Value>::deserialize(deserializer)? {
            Some(Value::Array(items)) => items
                .into_iter()
                .filter_map(|item| serde_json::from_value(item).ok())
                .collect(),
            _ => Vec::new(),
        })
    }
}
