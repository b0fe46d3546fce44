//! Telemetry Storage
//!
//! The pipeline touches storage through three narrow traits so the backend
//! can be swapped without touching ingestion or reconciliation:
//! sled on disk for the service, in-memory for tests.

mod persistence;
mod sled_store;

pub use persistence::{HistorySource, InMemoryStore, SampleStore, StationLookup, StorageError};
pub use sled_store::SledStore;
