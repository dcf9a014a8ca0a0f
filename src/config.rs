//! Engine configuration
//!
//! Every option has a documented default so the engine runs with no config
//! file at all. Values are loaded from TOML, then overridden from the
//! environment, then validated.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::error::{EngineError, EngineResult};
use crate::types::Metric;

/// Top-level configuration for the whole engine
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct EngineConfig {
    pub hot: HotConfig,
    pub warm: WarmConfig,
    pub cold: ColdConfig,
    pub buffer: BufferConfig,
    pub router: RouterConfig,
    pub anomaly: AnomalyConfig,
    pub lifecycle: LifecycleConfig,
    pub retention: RetentionPolicy,
    pub scheduler: SchedulerConfig,
    pub sync: SyncConfig,
    pub log_level: LogLevel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogLevel(pub String);

impl Default for LogLevel {
    fn default() -> Self {
        LogLevel("info".to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HotConfig {
    /// Maximum number of nodes tracked in the hot tier
    pub max_nodes: u64,
    /// How far back the hot tier keeps raw readings
    pub retention_hours: u64,
    /// Capacity of the read-through range-result cache
    pub query_cache_capacity: u64,
    pub query_cache_ttl_secs: u64,
}

impl Default for HotConfig {
    fn default() -> Self {
        Self {
            max_nodes: 50_000,
            retention_hours: 24,
            query_cache_capacity: 10_000,
            query_cache_ttl_secs: 600,
        }
    }
}

impl HotConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_hours * 3600)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WarmConfig {
    /// SQLite database path
    pub database_path: String,
    pub pool_size: u32,
    /// Horizon the warm tier is expected to hold (routing boundary)
    pub retention_days: u64,
    pub busy_timeout_ms: u64,
}

impl Default for WarmConfig {
    fn default() -> Self {
        Self {
            database_path: "./warm_storage.db".to_string(),
            pool_size: 10,
            retention_days: 90,
            busy_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ColdConfig {
    pub base_path: String,
    /// Table written by the engine itself (canonical reading shape)
    pub canonical_table: String,
    /// Additional heterogeneous source tables
    pub sources: Vec<SourceSchema>,
}

impl Default for ColdConfig {
    fn default() -> Self {
        Self {
            base_path: "./cold_archive".to_string(),
            canonical_table: "readings".to_string(),
            sources: Vec::new(),
        }
    }
}

/// How a source table encodes its timestamp column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimestampFormat {
    Rfc3339,
    EpochSeconds,
    EpochMillis,
}

/// Column mapping from a cold-tier source table to the canonical reading
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceSchema {
    pub name: String,
    pub node_column: String,
    pub timestamp_column: String,
    pub timestamp_format: TimestampFormat,
    /// Metric name (`flow`, `pressure`, ...) -> column name in this source
    #[serde(default)]
    pub metric_columns: HashMap<String, String>,
    pub quality_column: Option<String>,
    /// Used when the source cannot attest quality
    #[serde(default = "default_unattested_quality")]
    pub default_quality: f64,
    pub interpolated_column: Option<String>,
}

/// Conservative mid value for sources that carry no quality information
pub fn default_unattested_quality() -> f64 {
    0.5
}

impl SourceSchema {
    /// Resolved metric column mapping; unknown metric names are ignored
    pub fn metric_mapping(&self) -> Vec<(Metric, &str)> {
        let mut mapping: Vec<(Metric, &str)> = self
            .metric_columns
            .iter()
            .filter_map(|(name, column)| Metric::parse(name).map(|m| (m, column.as_str())))
            .collect();
        mapping.sort_by_key(|(m, _)| m.as_str());
        mapping
    }

    /// Schema of the table the engine writes itself
    pub fn canonical(name: &str) -> Self {
        let metric_columns = Metric::ALL
            .iter()
            .map(|m| (m.as_str().to_string(), m.column().to_string()))
            .collect();
        Self {
            name: name.to_string(),
            node_column: "node_id".to_string(),
            timestamp_column: "timestamp".to_string(),
            timestamp_format: TimestampFormat::Rfc3339,
            metric_columns,
            quality_column: Some("quality_score".to_string()),
            default_quality: default_unattested_quality(),
            interpolated_column: Some("is_interpolated".to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Flush when this many readings are pending
    pub batch_size: usize,
    /// Flush at least this often while anything is pending
    pub max_flush_interval_secs: u64,
    /// Consecutive failures before a flush failure is escalated
    pub max_consecutive_failures: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            max_flush_interval_secs: 5,
            max_consecutive_failures: 5,
            backoff_base_ms: 200,
            backoff_max_ms: 30_000,
        }
    }
}

impl BufferConfig {
    pub fn max_flush_interval(&self) -> Duration {
        Duration::from_secs(self.max_flush_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    pub hot_timeout_ms: u64,
    pub warm_timeout_ms: u64,
    pub cold_timeout_ms: u64,
    /// Populate the hot tier with warm/cold read results
    pub populate_hot_on_read: bool,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            hot_timeout_ms: 250,
            warm_timeout_ms: 5_000,
            cold_timeout_ms: 15_000,
            populate_hot_on_read: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnomalyConfig {
    pub sigma_threshold: f64,
    /// Rolling window length K
    pub window_size: usize,
    /// No flagging until this many samples exist
    pub min_samples: usize,
    /// Low-side anomalies require the rolling mean to exceed this magnitude
    pub min_low_mean: f64,
    /// Std-dev floor as a fraction of |mean|
    pub min_stddev_ratio: f64,
    /// Trailing window for the batch re-scan
    pub batch_window_days: u64,
    pub metrics: Vec<Metric>,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            sigma_threshold: 3.0,
            window_size: 48,
            min_samples: 48,
            min_low_mean: 0.5,
            min_stddev_ratio: 0.01,
            batch_window_days: 7,
            metrics: vec![Metric::Flow, Metric::Pressure],
        }
    }
}

/// Historical sampling band for training data
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SamplingBand {
    /// Band covers `[now - span_days, now)`
    pub span_days: u64,
    pub rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    pub retrain_threshold_days: u64,
    pub degradation_factor: f64,
    /// Candidate may be at most this much worse than the active model
    pub validation_tolerance: f64,
    pub monitoring_window_hours: u64,
    pub min_shadow_samples: u64,
    pub drift_sigma: f64,
    pub drift_window_hours: u64,
    pub degradation_window_days: u64,
    pub min_degradation_samples: u64,
    pub min_training_samples: usize,
    pub horizon_hours: u32,
    pub bands: Vec<SamplingBand>,
    pub artifact_dir: String,
    pub sampling_seed: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            retrain_threshold_days: 30,
            degradation_factor: 1.2,
            validation_tolerance: 0.10,
            monitoring_window_hours: 24,
            min_shadow_samples: 100,
            drift_sigma: 2.0,
            drift_window_hours: 24,
            degradation_window_days: 7,
            min_degradation_samples: 24,
            min_training_samples: 48,
            horizon_hours: 24,
            bands: vec![
                SamplingBand { span_days: 30, rate: 1.0 },
                SamplingBand { span_days: 180, rate: 0.5 },
                SamplingBand { span_days: 730, rate: 0.1 },
            ],
            artifact_dir: "./models".to_string(),
            sampling_seed: 0x5eed,
        }
    }
}

/// Retention windows per record kind (configurable at runtime by operators)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionPolicy {
    pub sync_job_days: u64,
    pub resolved_anomaly_days: u64,
    pub anomaly_auto_resolve_hours: u64,
    pub quality_report_days: u64,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            sync_job_days: 30,
            resolved_anomaly_days: 90,
            anomaly_auto_resolve_hours: 72,
            quality_report_days: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub tick_ms: u64,
    pub job_timeout_secs: u64,
    pub per_entity_concurrency: usize,
    pub stale_job_after_secs: u64,
    pub recent_sync_interval_secs: u64,
    pub cache_refresh_interval_secs: u64,
    pub anomaly_scan_interval_secs: u64,
    pub cold_archive_interval_secs: u64,
    pub model_cycle_interval_secs: u64,
    /// 6-field cron expressions (seconds first)
    pub aggregate_refresh_cron: String,
    pub data_quality_cron: String,
    pub retention_cron: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_ms: 1_000,
            job_timeout_secs: 3_600,
            per_entity_concurrency: 8,
            stale_job_after_secs: 6 * 3_600,
            recent_sync_interval_secs: 300,
            cache_refresh_interval_secs: 600,
            anomaly_scan_interval_secs: 3_600,
            cold_archive_interval_secs: 3_600,
            model_cycle_interval_secs: 3_600,
            aggregate_refresh_cron: "0 5 * * * *".to_string(),
            data_quality_cron: "0 30 2 * * *".to_string(),
            retention_cron: "0 0 3 * * Sun".to_string(),
        }
    }
}

/// Plausible value ranges used by the data-quality audit
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValueRanges {
    pub flow: (f64, f64),
    pub pressure: (f64, f64),
    pub temperature: (f64, f64),
    pub min_quality: f64,
}

impl Default for ValueRanges {
    fn default() -> Self {
        Self {
            flow: (0.0, f64::MAX),
            pressure: (0.0, 250.0),
            temperature: (-40.0, 80.0),
            min_quality: 0.2,
        }
    }
}

impl ValueRanges {
    pub fn range_for(&self, metric: Metric) -> Option<(f64, f64)> {
        match metric {
            Metric::Flow => Some(self.flow),
            Metric::Pressure => Some(self.pressure),
            Metric::Temperature => Some(self.temperature),
            Metric::Volume => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Buckets are final only after their end plus this grace period
    pub aggregate_grace_minutes: i64,
    pub hourly_lookback_hours: i64,
    pub daily_lookback_days: i64,
    /// Default reporting cadence of a node
    pub expected_cadence_secs: i64,
    pub audit_window_hours: i64,
    pub min_coverage_ratio: f64,
    /// First RecentSync run looks back this far
    pub recent_initial_lookback_hours: i64,
    /// Warm rows younger than this are not archived yet
    pub archive_lag_minutes: i64,
    pub cache_refresh_window_hours: i64,
    pub ranges: ValueRanges,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            aggregate_grace_minutes: 15,
            hourly_lookback_hours: 48,
            daily_lookback_days: 7,
            expected_cadence_secs: 300,
            audit_window_hours: 24,
            min_coverage_ratio: 0.8,
            recent_initial_lookback_hours: 24,
            archive_lag_minutes: 60,
            cache_refresh_window_hours: 1,
            ranges: ValueRanges::default(),
        }
    }
}

impl EngineConfig {
    /// Load from `path` if it exists, otherwise start from defaults;
    /// environment overrides and validation apply in both cases
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) if p.exists() => Self::from_toml_file(p)?,
            _ => Self::default(),
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: EngineConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    pub fn to_toml_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Override selected options from `HYDROTIER_*` environment variables
    pub fn apply_env_overrides(&mut self) {
        fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
            std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
        }

        if let Ok(path) = std::env::var("HYDROTIER_WARM_DB") {
            self.warm.database_path = path;
        }
        if let Ok(path) = std::env::var("HYDROTIER_COLD_PATH") {
            self.cold.base_path = path;
        }
        if let Some(v) = env_parse("HYDROTIER_BATCH_SIZE") {
            self.buffer.batch_size = v;
        }
        if let Some(v) = env_parse("HYDROTIER_MAX_FLUSH_INTERVAL_SECS") {
            self.buffer.max_flush_interval_secs = v;
        }
        if let Some(v) = env_parse("HYDROTIER_RETRAIN_THRESHOLD_DAYS") {
            self.lifecycle.retrain_threshold_days = v;
        }
        if let Some(v) = env_parse("HYDROTIER_DEGRADATION_FACTOR") {
            self.lifecycle.degradation_factor = v;
        }
        if let Some(v) = env_parse("HYDROTIER_SIGMA_THRESHOLD") {
            self.anomaly.sigma_threshold = v;
        }
        if let Some(v) = env_parse("HYDROTIER_MIN_SAMPLES") {
            self.anomaly.min_samples = v;
        }
        if let Ok(level) = std::env::var("HYDROTIER_LOG_LEVEL") {
            self.log_level = LogLevel(level);
        }
    }

    pub fn validate(&self) -> EngineResult<()> {
        let fail = |msg: String| Err(EngineError::Configuration(msg));

        if self.buffer.batch_size == 0 {
            return fail("buffer.batch_size must be > 0".into());
        }
        if self.buffer.max_flush_interval_secs == 0 {
            return fail("buffer.max_flush_interval_secs must be > 0".into());
        }
        if self.buffer.max_consecutive_failures == 0 {
            return fail("buffer.max_consecutive_failures must be > 0".into());
        }
        if self.warm.pool_size == 0 {
            return fail("warm.pool_size must be > 0".into());
        }
        if self.hot.retention_hours == 0 || self.warm.retention_days * 24 <= self.hot.retention_hours {
            return fail("warm.retention_days must cover more than hot.retention_hours".into());
        }
        if !(self.anomaly.sigma_threshold > 0.0) {
            return fail("anomaly.sigma_threshold must be > 0".into());
        }
        if self.anomaly.window_size < 2 || self.anomaly.min_samples > self.anomaly.window_size {
            return fail("anomaly.min_samples must be <= window_size and window_size >= 2".into());
        }
        if self.lifecycle.degradation_factor < 1.0 {
            return fail("lifecycle.degradation_factor must be >= 1.0".into());
        }
        if self.lifecycle.validation_tolerance < 0.0 {
            return fail("lifecycle.validation_tolerance must be >= 0".into());
        }
        if self.lifecycle.bands.is_empty() {
            return fail("lifecycle.bands must not be empty".into());
        }
        for band in &self.lifecycle.bands {
            if !(0.0..=1.0).contains(&band.rate) || band.span_days == 0 {
                return fail(format!("invalid sampling band {:?}", band));
            }
        }
        if self.scheduler.per_entity_concurrency == 0 {
            return fail("scheduler.per_entity_concurrency must be > 0".into());
        }
        for (name, expr) in [
            ("aggregate_refresh_cron", &self.scheduler.aggregate_refresh_cron),
            ("data_quality_cron", &self.scheduler.data_quality_cron),
            ("retention_cron", &self.scheduler.retention_cron),
        ] {
            if let Err(e) = crate::sync::JobSchedule::parse_cron(expr) {
                return fail(format!("scheduler.{}: {}", name, e));
            }
        }
        let mut names = std::collections::HashSet::new();
        names.insert(self.cold.canonical_table.as_str());
        for source in &self.cold.sources {
            if !names.insert(source.name.as_str()) {
                return fail(format!("duplicate cold source table '{}'", source.name));
            }
            if source.metric_mapping().is_empty() {
                return fail(format!("cold source '{}' maps no known metric", source.name));
            }
            if !(0.0..=1.0).contains(&source.default_quality) {
                return fail(format!("cold source '{}' default_quality outside [0, 1]", source.name));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.buffer.batch_size, 500);
        assert_eq!(config.anomaly.sigma_threshold, 3.0);
        assert_eq!(config.lifecycle.degradation_factor, 1.2);
        assert_eq!(config.retention.sync_job_days, 30);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: EngineConfig = toml::from_str(
            r#"
            log_level = "debug"

            [buffer]
            batch_size = 64

            [anomaly]
            sigma_threshold = 2.5
            "#,
        )
        .unwrap();

        assert_eq!(config.buffer.batch_size, 64);
        assert_eq!(config.buffer.max_flush_interval_secs, 5);
        assert_eq!(config.anomaly.sigma_threshold, 2.5);
        assert_eq!(config.anomaly.window_size, 48);
        assert_eq!(config.log_level.0, "debug");
    }

    #[test]
    fn test_source_schema_from_toml() {
        let config: EngineConfig = toml::from_str(
            r#"
            [[cold.sources]]
            name = "legacy_scada"
            node_column = "meter"
            timestamp_column = "ts"
            timestamp_format = "epoch_seconds"
            metric_columns = { flow = "q", pressure = "p" }
            "#,
        )
        .unwrap();

        let source = &config.cold.sources[0];
        assert!(source.metric_mapping().contains(&(Metric::Flow, "q")));
        assert_eq!(source.default_quality, 0.5);
        assert!(source.quality_column.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_values_are_configuration_errors() {
        let mut config = EngineConfig::default();
        config.buffer.batch_size = 0;
        assert!(matches!(config.validate(), Err(EngineError::Configuration(_))));

        let mut config = EngineConfig::default();
        config.scheduler.retention_cron = "not a cron".into();
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.anomaly.min_samples = 100;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let path = std::env::temp_dir().join(format!("hydrotier_missing_{}.toml", rand::random::<u64>()));
        let config = EngineConfig::load(Some(&path)).unwrap();
        assert_eq!(config.warm.pool_size, 10);
    }
}
