//! Ingestion Pipeline
//!
//! ```text
//! MQTT transport ──inbox──▶ IngestListener ──▶ WorkQueue ──▶ DrainWorker ──▶ SampleStore
//!                                 │
//!                                 ├──▶ BackpressureController ──▶ ControlPublisher
//!                                 └──▶ ReconcilerHub ──▶ observers
//! ```
//!
//! The listener, drain worker and reconciler hub each run as their own task.
//! The queue's receiver is owned by the one drain worker, which keeps writes
//! to the sample store strictly sequential and in arrival order.

mod backpressure;
mod drain;
mod ingest;
pub mod queue;
mod stats;

pub use backpressure::BackpressureController;
pub use drain::DrainWorker;
pub use ingest::IngestListener;
pub use queue::{work_queue, PushOutcome, QueueItem, WorkQueueReceiver, WorkQueueSender};
pub use stats::{PipelineStats, StatsSnapshot};
