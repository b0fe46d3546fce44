//! History query window parsing and the history report.

use chrono::{DateTime, NaiveDate, NaiveTime, SecondsFormat, TimeZone, Utc};
use serde::Serialize;
use thiserror::Error;

use super::merge::merge_history;
use crate::storage::{HistorySource, StationLookup, StorageError};
use crate::types::MergedRecord;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HistoryQueryError {
    #[error("Missing start or end parameter")]
    MissingBound,

    #[error("Invalid date: {0}")]
    InvalidDate(String),

    #[error("start must not be after end")]
    StartAfterEnd,
}

/// Inclusive query window. `end` always covers the rest of its day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl HistoryWindow {
    /// Parse `start`/`end` given as `YYYY-MM-DD` or RFC 3339.
    ///
    /// Ordering is checked before `end` is pushed to 23:59:59.999 (UTC), so
    /// a same-day range with `start` later in the day than `end` is rejected.
    pub fn parse(start: Option<&str>, end: Option<&str>) -> Result<Self, HistoryQueryError> {
        let (Some(start), Some(end)) = (
            start.filter(|s| !s.trim().is_empty()),
            end.filter(|s| !s.trim().is_empty()),
        ) else {
            return Err(HistoryQueryError::MissingBound);
        };

        let start = parse_instant(start)?;
        let end = parse_instant(end)?;
        if start > end {
            return Err(HistoryQueryError::StartAfterEnd);
        }

        Ok(Self {
            start,
            end: end_of_day(end),
        })
    }
}

fn parse_instant(value: &str) -> Result<DateTime<Utc>, HistoryQueryError> {
    let value = value.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Ok(ts.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map(|date| Utc.from_utc_datetime(&date.and_time(NaiveTime::MIN)))
        .map_err(|_| HistoryQueryError::InvalidDate(value.to_string()))
}

fn end_of_day(at: DateTime<Utc>) -> DateTime<Utc> {
    let last_ms = NaiveTime::from_hms_milli_opt(23, 59, 59, 999).unwrap_or(NaiveTime::MIN);
    Utc.from_utc_datetime(&at.date_naive().and_time(last_ms))
}

#[derive(Debug, Clone, Serialize)]
pub struct Period {
    pub start: String,
    pub end: String,
}

/// Response body of the history endpoint
#[derive(Debug, Clone, Serialize)]
pub struct HistoryReport {
    pub device_id: String,
    pub period: Period,
    pub total_records: usize,
    pub data: Vec<MergedRecord>,
}

/// Read both sample series for the window and merge them.
pub async fn load_history(
    source: &dyn HistorySource,
    stations: &dyn StationLookup,
    device_id: &str,
    window: HistoryWindow,
) -> Result<HistoryReport, StorageError> {
    let locations = source
        .locations_between(device_id, window.start, window.end)
        .await?;
    let cells = source
        .cells_between(device_id, window.start, window.end)
        .await?;
    let data = merge_history(&locations, &cells, stations).await;

    Ok(HistoryReport {
        device_id: device_id.to_string(),
        period: Period {
            start: window.start.to_rfc3339_opts(SecondsFormat::Millis, true),
            end: window.end.to_rfc3339_opts(SecondsFormat::Millis, true),
        },
        total_records: data.len(),
        data,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{InMemoryStore, SampleStore};
    use crate::types::TelemetryMessage;

    #[test]
    fn test_date_only_bounds() {
        let w = HistoryWindow::parse(Some("2024-03-01"), Some("2024-03-02")).unwrap();
        assert_eq!(w.start.to_rfc3339(), "2024-03-01T00:00:00+00:00");
        assert_eq!(
            w.end.to_rfc3339_opts(SecondsFormat::Millis, true),
            "2024-03-02T23:59:59.999Z"
        );
    }

    #[test]
    fn test_rfc3339_bounds() {
        let w = HistoryWindow::parse(Some("2024-03-01T08:30:00Z"), Some("2024-03-01T20:00:00+07:00"))
            .unwrap();
        assert_eq!(w.start.to_rfc3339(), "2024-03-01T08:30:00+00:00");
        // 20:00+07 is 13:00Z, extended to the end of that UTC day
        assert_eq!(
            w.end.to_rfc3339_opts(SecondsFormat::Millis, true),
            "2024-03-01T23:59:59.999Z"
        );
    }

    #[test]
    fn test_rejections() {
        assert_eq!(
            HistoryWindow::parse(None, Some("2024-03-01")),
            Err(HistoryQueryError::MissingBound)
        );
        assert_eq!(
            HistoryWindow::parse(Some(""), Some("2024-03-01")),
            Err(HistoryQueryError::MissingBound)
        );
        assert!(matches!(
            HistoryWindow::parse(Some("yesterday"), Some("2024-03-01")),
            Err(HistoryQueryError::InvalidDate(_))
        ));
        assert_eq!(
            HistoryWindow::parse(Some("2024-03-02"), Some("2024-03-01")),
            Err(HistoryQueryError::StartAfterEnd)
        );
    }

    #[tokio::test]
    async fn test_load_history_end_to_end() {
        let store = InMemoryStore::new();
        let msg: TelemetryMessage = serde_json::from_value(serde_json::json!({
            "deviceId": "d1",
            "timestamp": 1_709_280_000_000_i64,
            "location": {"latitude": 21.0, "longitude": 105.8},
            "cellTowers": [{"cid": 1, "lac": 2, "mcc": 452, "mnc": 4, "isServing": true}]
        }))
        .unwrap();
        store.append(&msg, Utc::now()).await.unwrap();

        let window = HistoryWindow::parse(Some("2024-03-01"), Some("2024-03-01")).unwrap();
        let report = load_history(&store, &store, "d1", window).await.unwrap();
        assert_eq!(report.total_records, 1);
        assert_eq!(report.data[0].bts_cid, Some(1));
        assert_eq!(report.period.end, "2024-03-01T23:59:59.999Z");

        let other = load_history(&store, &store, "d2", window).await.unwrap();
        assert_eq!(other.total_records, 0);
    }
}
