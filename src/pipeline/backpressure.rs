//! Adaptive reporting-interval controller
//!
//! Maps the work queue depth to a device reporting interval and reports a
//! [`ConfigMessage`] only when that interval changes. The advertised interval
//! is process-wide; the device whose report triggered the transition is the
//! one notified.
//!
//! | queue length | interval |
//! |---|---|
//! | > 500 | 120 s |
//! | > 200 | 60 s |
//! | otherwise | baseline (15 s) |

use chrono::{DateTime, Utc};

use crate::config::defaults::REASON_SERVER_LOAD;
use crate::config::{BackpressureConfig, IntervalTier};
use crate::types::ConfigMessage;

#[derive(Debug, Clone)]
pub struct BackpressureController {
    baseline: u32,
    /// Highest threshold first
    tiers: Vec<IntervalTier>,
    advertised: u32,
}

impl BackpressureController {
    pub fn new(config: &BackpressureConfig) -> Self {
        let mut tiers = config.tiers.clone();
        tiers.sort_by(|a, b| b.above.cmp(&a.above));
        Self {
            baseline: config.baseline_interval_secs,
            tiers,
            advertised: config.baseline_interval_secs,
        }
    }

    /// Interval for a queue length: first tier whose threshold is exceeded, else baseline.
    pub fn interval_for(&self, queue_len: usize) -> u32 {
        self.tiers
            .iter()
            .find(|tier| queue_len > tier.above)
            .map_or(self.baseline, |tier| tier.interval_secs)
    }

    pub fn advertised_interval(&self) -> u32 {
        self.advertised
    }

    /// Re-evaluate after an enqueue. Returns the message to publish when the
    /// advertised interval changed, `None` otherwise.
    pub fn evaluate(&mut self, queue_len: usize, now: DateTime<Utc>) -> Option<ConfigMessage> {
        let interval = self.interval_for(queue_len);
        if interval == self.advertised {
            return None;
        }
        self.advertised = interval;
        Some(ConfigMessage::new(
            interval,
            REASON_SERVER_LOAD,
            queue_len,
            now,
        ))
    }
}
