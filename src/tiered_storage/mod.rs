//! Tiered storage
//!
//! Three tiers behind one trait:
//! - Hot: in-memory moka caches holding the last hours of raw readings, latest
//!   reading per node, realtime statistics and range-result cache
//! - Warm: SQLite (WAL, pooled) holding raw readings, rollups, job audit,
//!   anomalies, models and predictions
//! - Cold: append-only JSON-lines archive, one table per source schema
//!
//! Ingest goes through the [`WriteBuffer`] to the warm tier; reads are planned
//! by the [`TierRouter`] and never fall through to a hotter tier.

mod cold_storage;
mod hot_storage;
mod metrics;
mod router;
mod traits;
mod warm_storage;
mod write_buffer;

pub use cold_storage::{ColdArchiveStorage, TableScan};
pub use hot_storage::{HotMemoryStorage, RealtimeStats, RunningStat};
pub use metrics::{calculate_percentile, AccessStats, AlertSeverity, TierAlert, TierMetrics, TierMonitor, TierThresholds};
pub use router::TierRouter;
pub use traits::{JobRecorder, StorageTier, TierMetricsSnapshot, TierRead, WriteMode, WriteOutcome};
pub use warm_storage::WarmSqliteStorage;
pub use write_buffer::{FlushReport, WriteBuffer};
