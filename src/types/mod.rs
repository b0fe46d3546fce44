//! Wire and domain types shared across the pipeline.

mod control;
mod history;
mod position;
mod station;
mod telemetry;

pub use control::ConfigMessage;
pub use history::MergedRecord;
pub use position::{CellContext, CellSnapshot, EmittedUpdate, LatLon};
pub use station::Station;
pub use telemetry::{
    CellIdentity, CellObservation, CellSample, Location, LocationSample, TelemetryMessage,
};
