//! hydrotier - tiered storage and synchronization engine for sensor telemetry
//!
//! Readings from flow, pressure and temperature sensors land in an in-memory
//! hot tier, are buffered into a SQLite warm tier and replicated to a
//! JSON-lines cold archive. Scheduled jobs keep the tiers in sync, roll up
//! aggregates, audit data quality, scan for anomalies and run the forecasting
//! model lifecycle.

pub mod aggregate;
pub mod anomaly;
pub mod config;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod normalize;
pub mod observability;
pub mod orchestrator;
pub mod scoring;
pub mod sync;
pub mod tiered_storage;
pub mod types;
pub mod utils;

// Re-export main types for convenience
pub use config::EngineConfig;
pub use engine::Engine;
pub use error::{EngineError, EngineResult};
pub use orchestrator::ShutdownCoordinator;
pub use types::{Anomaly, Model, ModelStatus, Prediction, RangeQuery, Reading, Resolution, Series};
