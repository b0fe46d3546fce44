//! Control-plane messages sent back to devices.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Interval directive published on a device's control topic.
///
/// Wire shape: `{type:"config", sendIntervalSec, reason, queueLength, timestamp}`
/// with `timestamp` in epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigMessage {
    #[serde(rename = "type")]
    pub kind: String,
    pub send_interval_sec: u32,
    pub reason: String,
    pub queue_length: usize,
    pub timestamp: i64,
}

impl ConfigMessage {
    pub const KIND: &'static str = "config";

    pub fn new(
        send_interval_sec: u32,
        reason: impl Into<String>,
        queue_length: usize,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            kind: Self::KIND.to_string(),
            send_interval_sec,
            reason: reason.into(),
            queue_length,
            timestamp: at.timestamp_millis(),
        }
    }
}
