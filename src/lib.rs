//! Live hit telemetry ingestion and session scoring for physical sensor
//! targets.
//!
//! Two telemetry paths feed one pipeline: a fast lossy push channel and an
//! adaptively scheduled pull loop. The [`SessionController`] orchestrates
//! start/stop command batches across independent devices, ends each target
//! as its goal is met, and folds the accumulated events into an immutable
//! [`summary::SessionSummary`] at session end.
//!
//! Hosts implement [`telemetry::TelemetryProvider`] and
//! [`telemetry::DeviceCommander`] against their backend and consume the
//! engine through [`SessionController`] plus its broadcast event stream.

pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod models;
pub mod pipeline;
pub mod polling;
pub mod push;
pub mod session;
pub mod summary;
pub mod telemetry;
mod utils;

pub use config::EngineConfig;
pub use error::EngineError;
pub use events::EngineEvent;
pub use session::{SessionController, StartOutcome, StartRequest, StopOutcome};
