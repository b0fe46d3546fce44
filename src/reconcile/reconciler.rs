//! Per-device position reconciliation
//!
//! Turns a noisy stream of raw fixes into accepted positions:
//!
//! 1. accuracy gate: fixes declaring worse than `max_accuracy_m` are ignored
//! 2. sliding window of the last `buffer_size` fixes, averaged
//! 3. movement gate: averaged candidate must be `min_move_m` from the last
//!    accepted position
//! 4. speed gate: implied speed since the last acceptance must not exceed
//!    `max_speed_kph`
//!
//! Cell context is tracked alongside and is never gated.
//!
//! This type is synchronous and clock-free; callers pass `now`. Throttling
//! and scheduling live in [`super::hub`].

use std::collections::VecDeque;
use tokio::time::Instant;

use super::geo::{centroid, haversine_m};
use crate::config::ReconcilerConfig;
use crate::types::{CellContext, CellObservation, LatLon, Location, TelemetryMessage};

/// Reconciler input: the parts of a report the reconciler looks at.
#[derive(Debug, Clone, PartialEq)]
pub struct RawFix {
    pub device_id: String,
    pub location: Option<Location>,
    pub cells: Vec<CellObservation>,
}

impl RawFix {
    /// `None` when the report carries neither a location nor any cells.
    pub fn from_message(message: &TelemetryMessage) -> Option<Self> {
        if message.location.is_none() && message.cell_towers.is_empty() {
            return None;
        }
        Some(Self {
            device_id: message.device_id.clone(),
            location: message.location,
            cells: message.cell_towers.clone(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No fix seen yet
    Idle,
    /// Window not yet full
    Buffering,
    /// Window full
    Steady,
}

/// Decision for one fix
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FixOutcome {
    /// New last-valid position. `moved_m` is `None` for the first acceptance.
    Accepted { position: LatLon, moved_m: Option<f64> },
    /// Declared accuracy too poor; window untouched
    LowAccuracy { accuracy_m: f64 },
    /// Candidate within `min_move_m` of the last accepted position
    Jitter { moved_m: f64 },
    /// Implied speed above `max_speed_kph`
    SpeedSpike { moved_m: f64, speed_kph: f64 },
}

impl FixOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, FixOutcome::Accepted { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Accepted {
    position: LatLon,
    at: Instant,
}

#[derive(Debug, Clone)]
pub struct PositionReconciler {
    config: ReconcilerConfig,
    window: VecDeque<LatLon>,
    last_valid: Option<Accepted>,
    context: CellContext,
}

impl PositionReconciler {
    pub fn new(config: ReconcilerConfig) -> Self {
        let window = VecDeque::with_capacity(config.buffer_size + 1);
        Self {
            config,
            window,
            last_valid: None,
            context: CellContext::default(),
        }
    }

    pub fn phase(&self) -> Phase {
        if self.window.is_empty() {
            Phase::Idle
        } else if self.window.len() < self.config.buffer_size {
            Phase::Buffering
        } else {
            Phase::Steady
        }
    }

    pub fn last_valid(&self) -> Option<LatLon> {
        self.last_valid.map(|a| a.position)
    }

    /// Last-known cell context, `None` until any cell has been seen.
    pub fn context(&self) -> Option<&CellContext> {
        (!self.context.is_empty()).then_some(&self.context)
    }

    /// Run one fix through the gates.
    pub fn apply(&mut self, fix: &Location, now: Instant) -> FixOutcome {
        if let Some(accuracy_m) = fix.accuracy {
            if accuracy_m > self.config.max_accuracy_m {
                return FixOutcome::LowAccuracy { accuracy_m };
            }
        }

        let raw = LatLon::new(fix.latitude, fix.longitude);
        self.window.push_back(raw);
        while self.window.len() > self.config.buffer_size {
            self.window.pop_front();
        }
        let candidate = centroid(&self.window).unwrap_or(raw);

        let moved_m = match self.last_valid {
            None => None,
            Some(last) => {
                let moved_m =
                    haversine_m(last.position, candidate, self.config.earth_radius_km);
                if moved_m < self.config.min_move_m {
                    return FixOutcome::Jitter { moved_m };
                }
                let elapsed = now.saturating_duration_since(last.at).as_secs_f64();
                if elapsed > 0.0 {
                    let speed_kph = moved_m / elapsed * 3.6;
                    if speed_kph > self.config.max_speed_kph {
                        return FixOutcome::SpeedSpike { moved_m, speed_kph };
                    }
                }
                Some(moved_m)
            }
        };

        self.last_valid = Some(Accepted {
            position: candidate,
            at: now,
        });
        FixOutcome::Accepted {
            position: candidate,
            moved_m,
        }
    }

    /// Fold freshly observed cells into the last-known context.
    ///
    /// A serving cell replaces the previous serving cell; a non-empty
    /// neighbor list replaces the previous list. Absent parts are kept.
    pub fn merge_context(&mut self, update: CellContext) {
        if update.serving.is_some() {
            self.context.serving = update.serving;
        }
        if !update.neighbors.is_empty() {
            self.context.neighbors = update.neighbors;
        }
    }
}
