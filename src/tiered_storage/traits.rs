//! StorageTier trait - Common interface for all storage tiers
//!
//! Hot, Warm and Cold adapters all expose the same range/batch contract so the
//! router and the write buffer can treat them uniformly (and tests can swap in
//! slow or failing fakes).

use async_trait::async_trait;
use std::time::Duration;

use crate::error::EngineResult;
use crate::types::{RangeQuery, Reading, SeriesPoint, SyncJob, TierKind};

/// How a batch write treats rows whose (node_id, timestamp) already exists
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Keep the existing row; the new one is counted as skipped
    SkipExisting,
    /// Overwrite the existing row (re-sync with `force`)
    Overwrite,
}

/// Result of a batch write
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteOutcome {
    pub written: u64,
    pub skipped: u64,
}

impl WriteOutcome {
    pub fn merge(&mut self, other: WriteOutcome) {
        self.written += other.written;
        self.skipped += other.skipped;
    }
}

/// Points returned by one tier for one range
#[derive(Debug, Clone, Default)]
pub struct TierRead {
    pub points: Vec<SeriesPoint>,
    /// The tier does not vouch for the start of the range; merge with a colder tier
    pub partial: bool,
}

impl TierRead {
    pub fn complete(points: Vec<SeriesPoint>) -> Self {
        Self {
            points,
            partial: false,
        }
    }
}

/// Common trait for all storage tiers
#[async_trait]
pub trait StorageTier: Send + Sync {
    /// Points for `query.node_id` in `[start, end)` at the requested resolution,
    /// sorted by timestamp
    async fn read_range(&self, query: &RangeQuery) -> EngineResult<TierRead>;

    /// Store a batch of readings; the batch is committed whole or not at all
    async fn write_batch(&self, readings: &[Reading], mode: WriteMode) -> EngineResult<WriteOutcome>;

    /// Most recent reading held for a node
    async fn latest(&self, node_id: &str) -> EngineResult<Option<Reading>>;

    /// Number of readings held by this tier
    async fn count(&self) -> EngineResult<u64>;

    /// Tier-specific access metrics
    async fn get_metrics(&self) -> EngineResult<TierMetricsSnapshot>;

    /// Tier-specific maintenance (trimming, compaction, statistics)
    async fn maintenance(&self) -> EngineResult<()>;

    fn tier(&self) -> TierKind;

    /// Target p95 access time for this tier
    fn target_access_time(&self) -> Duration;
}

/// Sink for job audit rows. Implemented by the warm tier; the write buffer uses
/// it to escalate repeated flush failures.
#[async_trait]
pub trait JobRecorder: Send + Sync {
    async fn record_job(&self, job: &SyncJob) -> EngineResult<()>;
}

/// Snapshot of tier-specific metrics
#[derive(Debug, Clone, Default)]
pub struct TierMetricsSnapshot {
    /// Total number of records in this tier
    pub record_count: u64,

    /// Total number of access requests
    pub access_count: u64,

    /// Number of requests that returned data
    pub hit_count: u64,

    /// Number of requests that returned nothing
    pub miss_count: u64,

    /// Average access time in microseconds
    pub avg_access_time_us: u64,

    /// P95 access time in microseconds
    pub p95_access_time_us: u64,

    /// P99 access time in microseconds
    pub p99_access_time_us: u64,

    /// Eviction count (hot tier only)
    pub eviction_count: u64,
}

impl TierMetricsSnapshot {
    /// Calculate hit rate as a percentage
    pub fn hit_rate(&self) -> f64 {
        if self.access_count == 0 {
            0.0
        } else {
            (self.hit_count as f64 / self.access_count as f64) * 100.0
        }
    }

    /// Check if this tier is meeting its performance targets
    pub fn is_within_target(&self, target: Duration) -> bool {
        self.p95_access_time_us <= target.as_micros() as u64
    }
}
