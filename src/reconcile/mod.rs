//! Position reconciliation
//!
//! Raw fixes from the ingest path are smoothed, gated and throttled per
//! device before being pushed to observers as [`EmittedUpdate`]s.
//!
//! [`EmittedUpdate`]: crate::types::EmittedUpdate

pub mod geo;
mod hub;
mod reconciler;

pub use hub::{ReconcilerHandle, ReconcilerHub, RouteError};
pub use reconciler::{FixOutcome, Phase, PositionReconciler, RawFix};
