//! Shared data model for readings, rollups, jobs, anomalies and models.

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::error::{EngineError, EngineResult};

/// Readings more than this far ahead of wall-clock are rejected at ingest
pub const MAX_FUTURE_SKEW_SECS: i64 = 300;

/// Convert a timestamp to epoch milliseconds (storage representation)
pub fn to_ms(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

/// Convert epoch milliseconds back to a UTC timestamp
pub fn from_ms(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Storage tier identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TierKind {
    Hot,
    Warm,
    Cold,
}

impl TierKind {
    /// Tiers colder than (and including) this one, hottest first
    pub fn fallthrough_chain(self) -> &'static [TierKind] {
        match self {
            TierKind::Hot => &[TierKind::Hot, TierKind::Warm, TierKind::Cold],
            TierKind::Warm => &[TierKind::Warm, TierKind::Cold],
            TierKind::Cold => &[TierKind::Cold],
        }
    }
}

impl fmt::Display for TierKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TierKind::Hot => write!(f, "hot"),
            TierKind::Warm => write!(f, "warm"),
            TierKind::Cold => write!(f, "cold"),
        }
    }
}

/// Measured quantities carried by a reading
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Flow,
    Pressure,
    Temperature,
    Volume,
}

impl Metric {
    pub const ALL: [Metric; 4] = [
        Metric::Flow,
        Metric::Pressure,
        Metric::Temperature,
        Metric::Volume,
    ];

    /// Column name in the warm `readings` table
    pub fn column(self) -> &'static str {
        match self {
            Metric::Flow => "flow",
            Metric::Pressure => "pressure",
            Metric::Temperature => "temperature",
            Metric::Volume => "volume",
        }
    }

    pub fn as_str(self) -> &'static str {
        self.column()
    }

    pub fn parse(s: &str) -> Option<Metric> {
        match s {
            "flow" => Some(Metric::Flow),
            "pressure" => Some(Metric::Pressure),
            "temperature" => Some(Metric::Temperature),
            "volume" => Some(Metric::Volume),
            _ => None,
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a reading entered the system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    #[default]
    Live,
    ColdSync,
    Backfill,
    Cache,
}

impl Provenance {
    pub fn as_str(self) -> &'static str {
        match self {
            Provenance::Live => "live",
            Provenance::ColdSync => "cold_sync",
            Provenance::Backfill => "backfill",
            Provenance::Cache => "cache",
        }
    }

    pub fn parse(s: &str) -> Provenance {
        match s {
            "cold_sync" => Provenance::ColdSync,
            "backfill" => Provenance::Backfill,
            "cache" => Provenance::Cache,
            _ => Provenance::Live,
        }
    }
}

/// A single sensor reading, unique per (node_id, timestamp)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub node_id: String,
    pub timestamp: DateTime<Utc>,
    pub flow: Option<f64>,
    pub pressure: Option<f64>,
    pub temperature: Option<f64>,
    pub volume: Option<f64>,
    pub quality_score: f64,
    #[serde(default)]
    pub is_interpolated: bool,
    #[serde(default)]
    pub provenance: Provenance,
    /// Wall-clock time the engine accepted the reading
    pub received_at: DateTime<Utc>,
}

impl Reading {
    pub fn new(node_id: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            node_id: node_id.into(),
            timestamp,
            flow: None,
            pressure: None,
            temperature: None,
            volume: None,
            quality_score: 1.0,
            is_interpolated: false,
            provenance: Provenance::Live,
            received_at: Utc::now(),
        }
    }

    pub fn with_flow(mut self, flow: f64) -> Self {
        self.flow = Some(flow);
        self
    }

    pub fn with_pressure(mut self, pressure: f64) -> Self {
        self.pressure = Some(pressure);
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_volume(mut self, volume: f64) -> Self {
        self.volume = Some(volume);
        self
    }

    pub fn with_quality(mut self, quality_score: f64) -> Self {
        self.quality_score = quality_score;
        self
    }

    pub fn with_provenance(mut self, provenance: Provenance) -> Self {
        self.provenance = provenance;
        self
    }

    pub fn value(&self, metric: Metric) -> Option<f64> {
        match metric {
            Metric::Flow => self.flow,
            Metric::Pressure => self.pressure,
            Metric::Temperature => self.temperature,
            Metric::Volume => self.volume,
        }
    }

    pub fn key(&self) -> (String, i64) {
        (self.node_id.clone(), to_ms(self.timestamp))
    }

    /// Reject malformed input before it reaches any tier
    pub fn validate(&self, now: DateTime<Utc>) -> EngineResult<()> {
        if self.node_id.trim().is_empty() {
            return Err(EngineError::DataIntegrity("empty node_id".into()));
        }
        if !(0.0..=1.0).contains(&self.quality_score) || self.quality_score.is_nan() {
            return Err(EngineError::DataIntegrity(format!(
                "quality_score {} outside [0, 1] for node {}",
                self.quality_score, self.node_id
            )));
        }
        if Metric::ALL.iter().all(|m| self.value(*m).is_none()) {
            return Err(EngineError::DataIntegrity(format!(
                "reading for node {} carries no metric values",
                self.node_id
            )));
        }
        for metric in Metric::ALL {
            if let Some(v) = self.value(metric) {
                if !v.is_finite() {
                    return Err(EngineError::DataIntegrity(format!(
                        "{} is not finite for node {}",
                        metric, self.node_id
                    )));
                }
            }
        }
        if self.flow.map_or(false, |v| v < 0.0) || self.volume.map_or(false, |v| v < 0.0) {
            return Err(EngineError::DataIntegrity(format!(
                "negative flow or volume for node {}",
                self.node_id
            )));
        }
        if self.timestamp > now + ChronoDuration::seconds(MAX_FUTURE_SKEW_SECS) {
            return Err(EngineError::DataIntegrity(format!(
                "timestamp {} is in the future for node {}",
                self.timestamp, self.node_id
            )));
        }
        Ok(())
    }
}

/// Network node (meter, pump station, reservoir...)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub node_id: String,
    pub display_name: String,
    pub node_type: String,
    pub location: Option<String>,
    pub active: bool,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Node {
    /// Placeholder used when a node is first seen in data without a catalog entry
    pub fn discovered(node_id: &str) -> Self {
        Self {
            node_id: node_id.to_string(),
            display_name: node_id.to_string(),
            node_type: "unknown".to_string(),
            location: None,
            active: true,
            metadata: HashMap::new(),
        }
    }

    /// Expected reporting cadence, if the node overrides the global default
    pub fn cadence_secs(&self) -> Option<i64> {
        self.metadata.get("cadence_secs").and_then(|v| v.as_i64())
    }
}

/// Time resolution for range queries and rollups
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resolution {
    Raw,
    Hourly,
    Daily,
}

impl Resolution {
    pub fn as_str(self) -> &'static str {
        match self {
            Resolution::Raw => "raw",
            Resolution::Hourly => "hourly",
            Resolution::Daily => "daily",
        }
    }

    pub fn parse(s: &str) -> Option<Resolution> {
        match s {
            "raw" => Some(Resolution::Raw),
            "hourly" => Some(Resolution::Hourly),
            "daily" => Some(Resolution::Daily),
            _ => None,
        }
    }

    pub fn bucket_width(self) -> Option<ChronoDuration> {
        match self {
            Resolution::Raw => None,
            Resolution::Hourly => Some(ChronoDuration::hours(1)),
            Resolution::Daily => Some(ChronoDuration::days(1)),
        }
    }

    /// Start of the bucket containing `ts` (identity for raw)
    pub fn bucket_start(self, ts: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Resolution::Raw => ts,
            Resolution::Hourly => ts
                .with_minute(0)
                .and_then(|t| t.with_second(0))
                .and_then(|t| t.with_nanosecond(0))
                .unwrap_or(ts),
            Resolution::Daily => ts
                .date_naive()
                .and_hms_opt(0, 0, 0)
                .map(|d| d.and_utc())
                .unwrap_or(ts),
        }
    }
}

/// Per-metric rollup of readings for one node and bucket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Aggregate {
    pub node_id: String,
    pub resolution: Resolution,
    pub bucket_start: DateTime<Utc>,
    pub metric: Metric,
    pub avg: f64,
    pub min: f64,
    pub max: f64,
    pub stddev: f64,
    pub count: u32,
    pub finalized: bool,
    pub computed_at: DateTime<Utc>,
}

/// One point of a returned series (raw reading or bucket average)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesPoint {
    pub timestamp: DateTime<Utc>,
    pub flow: Option<f64>,
    pub pressure: Option<f64>,
    pub temperature: Option<f64>,
    pub volume: Option<f64>,
    pub quality_score: f64,
    pub received_at: Option<DateTime<Utc>>,
    pub sample_count: u32,
}

impl SeriesPoint {
    pub fn value(&self, metric: Metric) -> Option<f64> {
        match metric {
            Metric::Flow => self.flow,
            Metric::Pressure => self.pressure,
            Metric::Temperature => self.temperature,
            Metric::Volume => self.volume,
        }
    }
}

impl From<&Reading> for SeriesPoint {
    fn from(r: &Reading) -> Self {
        Self {
            timestamp: r.timestamp,
            flow: r.flow,
            pressure: r.pressure,
            temperature: r.temperature,
            volume: r.volume,
            quality_score: r.quality_score,
            received_at: Some(r.received_at),
            sample_count: 1,
        }
    }
}

/// Range query against a tier
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RangeQuery {
    pub node_id: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub resolution: Resolution,
}

impl RangeQuery {
    pub fn new(
        node_id: impl Into<String>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        resolution: Resolution,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            start,
            end,
            resolution,
        }
    }

    pub fn is_empty_range(&self) -> bool {
        self.start >= self.end
    }
}

/// Result of a range read
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Series {
    pub node_id: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub resolution: Resolution,
    pub points: Vec<SeriesPoint>,
    /// Tiers that contributed points, hottest first
    pub sources: Vec<TierKind>,
    /// Some segment could not be served; the points are the best available
    pub degraded: bool,
}

impl Series {
    pub fn empty(query: &RangeQuery) -> Self {
        Self {
            node_id: query.node_id.clone(),
            start: query.start,
            end: query.end,
            resolution: query.resolution,
            points: Vec::new(),
            sources: Vec::new(),
            degraded: false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn values(&self, metric: Metric) -> Vec<f64> {
        self.points.iter().filter_map(|p| p.value(metric)).collect()
    }
}

/// Kind of synchronization / maintenance job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    RecentSync,
    HistoricalBackfill,
    AggregateRefresh,
    DataQualityAudit,
    RetentionCleanup,
    AnomalyScan,
    CacheRefresh,
    ColdArchive,
    ModelCycle,
    BufferFlush,
    Admin,
}

impl JobKind {
    pub fn as_str(self) -> &'static str {
        match self {
            JobKind::RecentSync => "recent_sync",
            JobKind::HistoricalBackfill => "historical_backfill",
            JobKind::AggregateRefresh => "aggregate_refresh",
            JobKind::DataQualityAudit => "data_quality_audit",
            JobKind::RetentionCleanup => "retention_cleanup",
            JobKind::AnomalyScan => "anomaly_scan",
            JobKind::CacheRefresh => "cache_refresh",
            JobKind::ColdArchive => "cold_archive",
            JobKind::ModelCycle => "model_cycle",
            JobKind::BufferFlush => "buffer_flush",
            JobKind::Admin => "admin",
        }
    }

    pub fn parse(s: &str) -> Option<JobKind> {
        let kind = match s {
            "recent_sync" => JobKind::RecentSync,
            "historical_backfill" => JobKind::HistoricalBackfill,
            "aggregate_refresh" => JobKind::AggregateRefresh,
            "data_quality_audit" => JobKind::DataQualityAudit,
            "retention_cleanup" => JobKind::RetentionCleanup,
            "anomaly_scan" => JobKind::AnomalyScan,
            "cache_refresh" => JobKind::CacheRefresh,
            "cold_archive" => JobKind::ColdArchive,
            "model_cycle" => JobKind::ModelCycle,
            "buffer_flush" => JobKind::BufferFlush,
            "admin" => JobKind::Admin,
            _ => return None,
        };
        Some(kind)
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> JobStatus {
        match s {
            "running" => JobStatus::Running,
            "completed" => JobStatus::Completed,
            _ => JobStatus::Failed,
        }
    }
}

/// One execution of a job; append-only audit row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncJob {
    pub run_id: String,
    pub job_name: String,
    pub kind: JobKind,
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub records_processed: u64,
    pub records_failed: u64,
    pub error_message: Option<String>,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    HighFlow,
    LowFlow,
    HighPressure,
    LowPressure,
}

impl AnomalyKind {
    pub fn for_metric(metric: Metric, high: bool) -> Option<AnomalyKind> {
        match (metric, high) {
            (Metric::Flow, true) => Some(AnomalyKind::HighFlow),
            (Metric::Flow, false) => Some(AnomalyKind::LowFlow),
            (Metric::Pressure, true) => Some(AnomalyKind::HighPressure),
            (Metric::Pressure, false) => Some(AnomalyKind::LowPressure),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AnomalyKind::HighFlow => "high_flow",
            AnomalyKind::LowFlow => "low_flow",
            AnomalyKind::HighPressure => "high_pressure",
            AnomalyKind::LowPressure => "low_pressure",
        }
    }

    pub fn parse(s: &str) -> Option<AnomalyKind> {
        match s {
            "high_flow" => Some(AnomalyKind::HighFlow),
            "low_flow" => Some(AnomalyKind::LowFlow),
            "high_pressure" => Some(AnomalyKind::HighPressure),
            "low_pressure" => Some(AnomalyKind::LowPressure),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn from_z_score(z: f64) -> Severity {
        let z = z.abs();
        if z >= 6.0 {
            Severity::Critical
        } else if z >= 4.5 {
            Severity::High
        } else {
            Severity::Medium
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Severity {
        match s {
            "critical" => Severity::Critical,
            "high" => Severity::High,
            "low" => Severity::Low,
            _ => Severity::Medium,
        }
    }

    /// Numeric rank used for `>=` filtering in SQL
    pub fn rank(self) -> i64 {
        match self {
            Severity::Low => 0,
            Severity::Medium => 1,
            Severity::High => 2,
            Severity::Critical => 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anomaly {
    pub id: Option<i64>,
    pub node_id: String,
    pub timestamp: DateTime<Utc>,
    pub kind: AnomalyKind,
    pub severity: Severity,
    pub observed_value: f64,
    pub expected_value: f64,
    pub deviation_pct: f64,
    pub detected_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Filters for anomaly listing
#[derive(Debug, Clone, Default)]
pub struct AnomalyQuery {
    pub node_ids: Vec<String>,
    pub kinds: Vec<AnomalyKind>,
    pub min_severity: Option<Severity>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub unresolved_only: bool,
    pub limit: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelStatus {
    Created,
    Training,
    Validating,
    Shadow,
    Active,
    Retired,
}

impl ModelStatus {
    /// `created -> training -> validating -> {shadow | created} -> active <-> retired`
    pub fn can_transition_to(self, next: ModelStatus) -> bool {
        use ModelStatus::*;
        matches!(
            (self, next),
            (Created, Training)
                | (Training, Validating)
                | (Training, Created)
                | (Validating, Shadow)
                | (Validating, Created)
                | (Validating, Active)
                | (Shadow, Active)
                | (Shadow, Retired)
                | (Active, Retired)
                | (Retired, Active)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ModelStatus::Created => "created",
            ModelStatus::Training => "training",
            ModelStatus::Validating => "validating",
            ModelStatus::Shadow => "shadow",
            ModelStatus::Active => "active",
            ModelStatus::Retired => "retired",
        }
    }

    pub fn parse(s: &str) -> Option<ModelStatus> {
        let status = match s {
            "created" => ModelStatus::Created,
            "training" => ModelStatus::Training,
            "validating" => ModelStatus::Validating,
            "shadow" => ModelStatus::Shadow,
            "active" => ModelStatus::Active,
            "retired" => ModelStatus::Retired,
            _ => return None,
        };
        Some(status)
    }
}

impl fmt::Display for ModelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Training and validation metrics persisted with a model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ModelMetrics {
    pub target_metric: Option<Metric>,
    pub validation_mae: Option<f64>,
    pub training_samples: u64,
    pub holdout_samples: u64,
    /// Baseline mean of the target metric in the training data
    pub feature_mean: Option<f64>,
    /// Baseline standard deviation of the target metric in the training data
    pub feature_std: Option<f64>,
    pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Model {
    pub model_id: String,
    pub model_type: String,
    pub version: i64,
    pub status: ModelStatus,
    pub metrics: ModelMetrics,
    pub storage_path: Option<String>,
    pub created_at: DateTime<Utc>,
    pub shadow_at: Option<DateTime<Utc>>,
    pub activated_at: Option<DateTime<Utc>>,
    pub retired_at: Option<DateTime<Utc>>,
}

/// Forecast issued by a model; upserted on (model_id, node_id, target_time)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub model_id: String,
    pub node_id: String,
    pub issued_at: DateTime<Utc>,
    pub target_time: DateTime<Utc>,
    pub predicted_value: f64,
    pub lower_bound: f64,
    pub upper_bound: f64,
    pub confidence: f64,
    pub actual_value: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityIssueKind {
    Gap,
    LowCoverage,
    OutOfRange,
}

impl QualityIssueKind {
    pub fn as_str(self) -> &'static str {
        match self {
            QualityIssueKind::Gap => "gap",
            QualityIssueKind::LowCoverage => "low_coverage",
            QualityIssueKind::OutOfRange => "out_of_range",
        }
    }

    pub fn parse(s: &str) -> QualityIssueKind {
        match s {
            "gap" => QualityIssueKind::Gap,
            "low_coverage" => QualityIssueKind::LowCoverage,
            _ => QualityIssueKind::OutOfRange,
        }
    }
}

/// Finding emitted by the data-quality audit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityReport {
    pub run_id: String,
    pub node_id: String,
    pub kind: QualityIssueKind,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub expected_count: Option<i64>,
    pub actual_count: Option<i64>,
    pub detail: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 10, h, m, 17).unwrap()
    }

    #[test]
    fn test_bucket_start() {
        let t = ts(13, 42);
        assert_eq!(
            Resolution::Hourly.bucket_start(t),
            Utc.with_ymd_and_hms(2024, 3, 10, 13, 0, 0).unwrap()
        );
        assert_eq!(
            Resolution::Daily.bucket_start(t),
            Utc.with_ymd_and_hms(2024, 3, 10, 0, 0, 0).unwrap()
        );
        assert_eq!(Resolution::Raw.bucket_start(t), t);
    }

    #[test]
    fn test_reading_validation() {
        let now = ts(14, 0);
        let ok = Reading::new("N1", ts(13, 0)).with_flow(12.5);
        assert!(ok.validate(now).is_ok());

        let empty = Reading::new("N1", ts(13, 0));
        assert!(matches!(empty.validate(now), Err(EngineError::DataIntegrity(_))));

        let bad_quality = Reading::new("N1", ts(13, 0)).with_flow(1.0).with_quality(1.5);
        assert!(bad_quality.validate(now).is_err());

        let nan = Reading::new("N1", ts(13, 0)).with_pressure(f64::NAN);
        assert!(nan.validate(now).is_err());

        let future = Reading::new("N1", ts(15, 0)).with_flow(1.0);
        assert!(future.validate(now).is_err());

        let no_node = Reading::new("  ", ts(13, 0)).with_flow(1.0);
        assert!(no_node.validate(now).is_err());
    }

    #[test]
    fn test_model_state_machine() {
        use ModelStatus::*;
        assert!(Created.can_transition_to(Training));
        assert!(Validating.can_transition_to(Created));
        assert!(Shadow.can_transition_to(Active));
        assert!(Active.can_transition_to(Retired));
        assert!(Retired.can_transition_to(Active));
        assert!(!Created.can_transition_to(Active));
        assert!(!Active.can_transition_to(Shadow));
    }

    #[test]
    fn test_fallthrough_never_goes_hotter() {
        assert_eq!(TierKind::Warm.fallthrough_chain(), &[TierKind::Warm, TierKind::Cold]);
        assert_eq!(TierKind::Cold.fallthrough_chain(), &[TierKind::Cold]);
    }

    #[test]
    fn test_ms_roundtrip_is_lossless_at_millis() {
        let t = Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(from_ms(to_ms(t)), t);
    }
}
