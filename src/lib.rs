//! Mobile Supervisor: cell/location telemetry ingestion and reconciliation
//!
//! Devices publish telemetry over MQTT; the supervisor persists every report,
//! slows devices down when its work queue backs up, and turns the noisy
//! position stream into smoothed, rate-limited updates for live observers.
//!
//! ## Architecture
//!
//! - **Acquisition**: MQTT transport, wire decoding, control-plane publisher
//! - **Pipeline**: ingest listener, bounded work queue, drain worker, backpressure
//! - **Reconcile**: per-device position gates and debounced emission
//! - **History**: location/cell merge for replay queries
//! - **Storage**: sled-backed sample store and station lookup
//! - **API**: operator endpoints and the observer WebSocket

pub mod acquisition;
pub mod api;
pub mod config;
pub mod history;
pub mod pipeline;
pub mod reconcile;
pub mod storage;
pub mod types;

// Re-export configuration
pub use config::SupervisorConfig;

// Re-export commonly used types
pub use types::{
    CellContext, CellIdentity, CellObservation, ConfigMessage, EmittedUpdate, LatLon, Location,
    MergedRecord, Station, TelemetryMessage,
};

// Re-export pipeline components
pub use pipeline::{BackpressureController, DrainWorker, IngestListener, PipelineStats};
pub use reconcile::{ReconcilerHandle, ReconcilerHub};

// Re-export storage
pub use storage::{InMemoryStore, SledStore, StorageError};
