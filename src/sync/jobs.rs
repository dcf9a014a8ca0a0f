//! ETL and maintenance jobs
//!
//! Every job is idempotent over its window: readings are keyed by
//! (node_id, timestamp) and inserted with skip-on-conflict unless a forced
//! re-sync asks for overwrite, aggregates are recomputed whole, and cleanup
//! only deletes by age. Per-node work fans out over a bounded pool; a failing
//! node is counted and logged without aborting the rest of the batch.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::stream::{self, StreamExt};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::scheduler::{JobContext, JobHandler, JobReport};
use crate::aggregate::{is_bucket_closed, rollup_readings};
use crate::anomaly::AnomalyScanner;
use crate::config::{EngineConfig, RetentionPolicy};
use crate::error::{EngineError, EngineResult};
use crate::lifecycle::ModelLifecycleManager;
use crate::tiered_storage::{
    ColdArchiveStorage, HotMemoryStorage, StorageTier, WarmSqliteStorage, WriteMode,
};
use crate::types::{
    JobKind, Metric, Node, Provenance, QualityIssueKind, QualityReport, Reading, Resolution,
};
use crate::utils::retry_transient;

pub const RECENT_SYNC_WATERMARK: &str = "recent_sync";
pub const COLD_ARCHIVE_WATERMARK: &str = "cold_archive";

/// Stores and settings shared by every job
#[derive(Clone)]
pub struct SyncStores {
    pub hot: Arc<HotMemoryStorage>,
    pub warm: Arc<WarmSqliteStorage>,
    pub cold: Arc<ColdArchiveStorage>,
    pub config: Arc<EngineConfig>,
    /// Operators can change retention at runtime
    pub retention: Arc<RwLock<RetentionPolicy>>,
}

impl SyncStores {
    pub fn new(
        hot: Arc<HotMemoryStorage>,
        warm: Arc<WarmSqliteStorage>,
        cold: Arc<ColdArchiveStorage>,
        config: Arc<EngineConfig>,
    ) -> Self {
        let retention = Arc::new(RwLock::new(config.retention.clone()));
        Self {
            hot,
            warm,
            cold,
            config,
            retention,
        }
    }

    fn concurrency(&self) -> usize {
        self.config.scheduler.per_entity_concurrency.max(1)
    }
}

/// Run `work` for every node on a bounded pool and fold the results.
/// Nodes not yet started when the job is cancelled are reported as failed.
async fn for_each_node<F, Fut>(
    ctx: &JobContext,
    nodes: Vec<String>,
    concurrency: usize,
    work: F,
) -> JobReport
where
    F: Fn(String) -> Fut,
    Fut: Future<Output = EngineResult<JobReport>>,
{
    let results: Vec<(String, EngineResult<JobReport>)> = stream::iter(nodes)
        .map(|node| {
            let cancelled = ctx.is_cancelled();
            let fut = work(node.clone());
            async move {
                if cancelled {
                    return (node, Err(EngineError::transient("job", "cancelled")));
                }
                (node, fut.await)
            }
        })
        .buffer_unordered(concurrency)
        .collect()
        .await;

    let mut report = JobReport::default();
    let mut failed_nodes = Vec::new();
    for (node, result) in results {
        match result {
            Ok(r) => report.merge_counts(r),
            Err(e) => {
                warn!("{}: node {} failed: {}", ctx.job_name, node, e);
                report.records_failed += 1;
                failed_nodes.push(node);
            }
        }
    }
    if !failed_nodes.is_empty() {
        failed_nodes.sort();
        report = report.with_meta("failed_nodes", failed_nodes);
    }
    report
}

impl JobReport {
    /// Add counters and numeric metadata of a per-node report
    fn merge_counts(&mut self, other: JobReport) {
        self.records_processed += other.records_processed;
        self.records_failed += other.records_failed;
        for (key, value) in other.metadata {
            let add = value.as_u64().unwrap_or(0);
            let entry = self.metadata.entry(key).or_insert(Value::from(0u64));
            *entry = Value::from(entry.as_u64().unwrap_or(0) + add);
        }
    }
}

fn param_time(ctx: &JobContext, key: &str) -> Result<Option<DateTime<Utc>>> {
    match ctx.param_str(key) {
        Some(raw) => {
            let ts = DateTime::parse_from_rfc3339(raw)
                .with_context(|| format!("parameter '{}' is not an RFC 3339 timestamp", key))?;
            Ok(Some(ts.with_timezone(&Utc)))
        }
        None => Ok(None),
    }
}

// ----------------------------------------------------------------------
// Cold -> warm import (RecentSync, HistoricalBackfill)
// ----------------------------------------------------------------------

/// Normalize `[from, to)` of the given cold tables and insert into warm.
/// Missing keys are inserted; present keys are skipped unless `force`.
async fn import_window(
    stores: &SyncStores,
    ctx: &JobContext,
    tables: &[String],
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    provenance: Provenance,
    force: bool,
) -> Result<JobReport> {
    // Catalog first so readings never reference an unknown node
    let catalog = stores.cold.read_nodes().await?;
    for node in &catalog {
        stores.warm.upsert_node(node).await?;
    }

    let mut by_node: BTreeMap<String, BTreeMap<i64, Reading>> = BTreeMap::new();
    let mut rejected = 0;
    for table in tables {
        ctx.check_cancelled()?;
        let scan = retry_transient("cold scan", || stores.cold.scan_table(table, from, to, None))
            .await
            .with_context(|| format!("scanning cold table {}", table))?;
        rejected += scan.rejected;
        for mut reading in scan.readings {
            reading.provenance = provenance;
            // Tables are listed canonical first; the first table to supply a key keeps it
            by_node
                .entry(reading.node_id.clone())
                .or_default()
                .entry(reading.timestamp.timestamp_millis())
                .or_insert(reading);
        }
    }
    ctx.check_cancelled()?;

    let known: BTreeSet<&str> = catalog.iter().map(|n| n.node_id.as_str()).collect();
    for node_id in by_node.keys().filter(|n| !known.contains(n.as_str())) {
        stores.warm.insert_node_if_absent(&Node::discovered(node_id)).await?;
    }

    let mode = if force {
        WriteMode::Overwrite
    } else {
        WriteMode::SkipExisting
    };
    let nodes: Vec<String> = by_node.keys().cloned().collect();
    let by_node = &by_node;

    let mut report = for_each_node(ctx, nodes, stores.concurrency(), |node_id| async move {
        let readings: Vec<Reading> = by_node
            .get(&node_id)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default();
        let outcome = retry_transient("warm write", || stores.warm.write_batch(&readings, mode)).await?;

        if outcome.written > 0 {
            if let Some(latest) = stores.warm.latest(&node_id).await? {
                stores.hot.update_latest(&latest).await;
            }
            stores.hot.release_coverage(&node_id, &readings).await;
            stores.hot.invalidate_node_ranges(&node_id);
        }
        Ok(JobReport::new(outcome.written, 0).with_meta("skipped_existing", outcome.skipped))
    })
    .await;

    report.records_failed += rejected;
    Ok(report
        .with_meta("rejected_rows", rejected)
        .with_meta("nodes", by_node.len() as u64)
        .with_meta("window_start", from.to_rfc3339())
        .with_meta("window_end", to.to_rfc3339()))
}

/// Pulls cold rows newer than the watermark into warm and refreshes hot
/// latest values for the affected nodes
pub struct RecentSyncJob {
    stores: SyncStores,
}

impl RecentSyncJob {
    pub fn new(stores: SyncStores) -> Self {
        Self { stores }
    }
}

#[async_trait]
impl JobHandler for RecentSyncJob {
    fn kind(&self) -> JobKind {
        JobKind::RecentSync
    }

    async fn run(&self, ctx: &JobContext) -> Result<JobReport> {
        let now = Utc::now();
        let from = match self.stores.warm.get_watermark(RECENT_SYNC_WATERMARK).await? {
            Some(mark) => mark,
            None => now - ChronoDuration::hours(self.stores.config.sync.recent_initial_lookback_hours),
        };
        let force = ctx.param_bool("force");
        let tables = self.stores.cold.tables();

        let report = import_window(&self.stores, ctx, &tables, from, now, Provenance::ColdSync, force).await?;

        // Only move past a window once every node landed
        if report.metadata.get("failed_nodes").is_none() {
            self.stores.warm.set_watermark(RECENT_SYNC_WATERMARK, now).await?;
        } else {
            warn!("Recent sync left the watermark at {} after node failures", from);
        }
        Ok(report)
    }
}

/// Same pipeline as the recent sync over an explicit past window.
///
/// Parameters: `start`, `end` (RFC 3339), optional `tables` (array of cold
/// table names, default all) and `force`.
pub struct HistoricalBackfillJob {
    stores: SyncStores,
}

impl HistoricalBackfillJob {
    pub fn new(stores: SyncStores) -> Self {
        Self { stores }
    }
}

#[async_trait]
impl JobHandler for HistoricalBackfillJob {
    fn kind(&self) -> JobKind {
        JobKind::HistoricalBackfill
    }

    async fn run(&self, ctx: &JobContext) -> Result<JobReport> {
        let start = param_time(ctx, "start")?.context("backfill requires a 'start' parameter")?;
        let end = param_time(ctx, "end")?.unwrap_or_else(Utc::now);
        if start >= end {
            anyhow::bail!("backfill window is empty: {} >= {}", start, end);
        }

        let known = self.stores.cold.tables();
        let tables: Vec<String> = match ctx.params.get("tables").and_then(Value::as_array) {
            Some(requested) => {
                let mut tables = Vec::new();
                for name in requested.iter().filter_map(Value::as_str) {
                    if !known.iter().any(|t| t == name) {
                        anyhow::bail!("unknown cold table '{}'", name);
                    }
                    tables.push(name.to_string());
                }
                // Keep the canonical-first precedence regardless of request order
                known.into_iter().filter(|t| tables.contains(t)).collect()
            }
            None => known,
        };

        info!(
            "Backfilling {} table(s) over [{}, {})",
            tables.len(),
            start,
            end
        );
        import_window(
            &self.stores,
            ctx,
            &tables,
            start,
            end,
            Provenance::Backfill,
            ctx.param_bool("force"),
        )
        .await
    }
}

// ----------------------------------------------------------------------
// Aggregates
// ----------------------------------------------------------------------

/// Recomputes hourly and daily rollups for closed buckets.
/// `force_refresh` rewrites buckets already finalized.
pub struct AggregateRefreshJob {
    stores: SyncStores,
}

impl AggregateRefreshJob {
    pub fn new(stores: SyncStores) -> Self {
        Self { stores }
    }
}

#[async_trait]
impl JobHandler for AggregateRefreshJob {
    fn kind(&self) -> JobKind {
        JobKind::AggregateRefresh
    }

    async fn run(&self, ctx: &JobContext) -> Result<JobReport> {
        let now = Utc::now();
        let sync = &self.stores.config.sync;
        let grace = ChronoDuration::minutes(sync.aggregate_grace_minutes);
        let force = ctx.param_bool("force_refresh");

        let windows = [
            (
                Resolution::Hourly,
                Resolution::Hourly.bucket_start(now - ChronoDuration::hours(sync.hourly_lookback_hours)),
            ),
            (
                Resolution::Daily,
                Resolution::Daily.bucket_start(now - ChronoDuration::days(sync.daily_lookback_days)),
            ),
        ];
        let earliest = windows.iter().map(|(_, from)| *from).min().unwrap_or(now);
        let nodes = self.stores.warm.nodes_with_readings_since(earliest).await?;
        let warm = &self.stores.warm;
        let windows = &windows;

        let report = for_each_node(ctx, nodes, self.stores.concurrency(), |node_id| async move {
            let readings = warm.readings_between(&node_id, earliest, now).await?;
            let mut aggregates = Vec::new();
            for (resolution, from) in windows {
                aggregates.extend(
                    rollup_readings(&node_id, &readings, *resolution, now)
                        .into_iter()
                        .filter(|a| a.bucket_start >= *from)
                        .filter(|a| is_bucket_closed(a.bucket_start, *resolution, now, grace)),
                );
            }
            let computed = aggregates.len() as u64;
            let changed = warm.upsert_aggregates(&aggregates, force).await?;
            Ok(JobReport::new(computed, 0).with_meta("rows_changed", changed))
        })
        .await;

        Ok(report.with_meta("force_refresh", force))
    }
}

// ----------------------------------------------------------------------
// Data quality
// ----------------------------------------------------------------------

fn audit_node(
    run_id: &str,
    node_id: &str,
    readings: &[Reading],
    window: (DateTime<Utc>, DateTime<Utc>),
    cadence_secs: i64,
    stores: &SyncStores,
) -> Vec<QualityReport> {
    let (start, end) = window;
    let sync = &stores.config.sync;
    let now = Utc::now();
    let report = |kind, detail: String, expected, actual, ws, we| QualityReport {
        run_id: run_id.to_string(),
        node_id: node_id.to_string(),
        kind,
        window_start: ws,
        window_end: we,
        expected_count: expected,
        actual_count: actual,
        detail,
        created_at: now,
    };

    let mut findings = Vec::new();
    let cadence = cadence_secs.max(1);
    let expected = (end - start).num_seconds() / cadence;
    let actual = readings.len() as i64;
    if expected > 0 && (actual as f64) < expected as f64 * sync.min_coverage_ratio {
        findings.push(report(
            QualityIssueKind::LowCoverage,
            format!(
                "{} of {} expected readings ({:.0}% coverage)",
                actual,
                expected,
                actual as f64 / expected as f64 * 100.0
            ),
            Some(expected),
            Some(actual),
            start,
            end,
        ));
    }

    let max_gap = ChronoDuration::seconds(cadence * 2);
    for pair in readings.windows(2) {
        let gap = pair[1].timestamp - pair[0].timestamp;
        if gap > max_gap {
            findings.push(report(
                QualityIssueKind::Gap,
                format!("no readings for {}s", gap.num_seconds()),
                Some(gap.num_seconds() / cadence - 1),
                Some(0),
                pair[0].timestamp,
                pair[1].timestamp,
            ));
        }
    }

    let ranges = &sync.ranges;
    for metric in [Metric::Flow, Metric::Pressure, Metric::Temperature] {
        let Some((lo, hi)) = ranges.range_for(metric) else {
            continue;
        };
        let bad: Vec<&Reading> = readings
            .iter()
            .filter(|r| r.value(metric).map_or(false, |v| v < lo || v > hi))
            .collect();
        if let (Some(first), Some(last)) = (bad.first(), bad.last()) {
            findings.push(report(
                QualityIssueKind::OutOfRange,
                format!("{} {} value(s) outside [{}, {}]", bad.len(), metric, lo, hi),
                None,
                Some(bad.len() as i64),
                first.timestamp,
                last.timestamp,
            ));
        }
    }
    let low_quality: Vec<&Reading> = readings
        .iter()
        .filter(|r| r.quality_score < ranges.min_quality)
        .collect();
    if let (Some(first), Some(last)) = (low_quality.first(), low_quality.last()) {
        findings.push(report(
            QualityIssueKind::OutOfRange,
            format!(
                "{} reading(s) with quality below {}",
                low_quality.len(),
                ranges.min_quality
            ),
            None,
            Some(low_quality.len() as i64),
            first.timestamp,
            last.timestamp,
        ));
    }
    findings
}

/// Scans the trailing window for gaps, low coverage and out-of-range values.
/// Writes report rows only.
pub struct DataQualityAuditJob {
    stores: SyncStores,
}

impl DataQualityAuditJob {
    pub fn new(stores: SyncStores) -> Self {
        Self { stores }
    }
}

#[async_trait]
impl JobHandler for DataQualityAuditJob {
    fn kind(&self) -> JobKind {
        JobKind::DataQualityAudit
    }

    async fn run(&self, ctx: &JobContext) -> Result<JobReport> {
        let end = Utc::now();
        let start = end - ChronoDuration::hours(self.stores.config.sync.audit_window_hours);

        let mut cadences: BTreeMap<String, i64> = BTreeMap::new();
        let default_cadence = self.stores.config.sync.expected_cadence_secs;
        for node in self.stores.warm.list_nodes(true).await? {
            let cadence = node.cadence_secs().unwrap_or(default_cadence);
            cadences.insert(node.node_id, cadence);
        }
        for node_id in self.stores.warm.nodes_with_readings_since(start).await? {
            cadences.entry(node_id).or_insert(default_cadence);
        }

        let stores = &self.stores;
        let cadences = &cadences;
        let run_id = ctx.run_id.as_str();
        let nodes: Vec<String> = cadences.keys().cloned().collect();

        let report = for_each_node(ctx, nodes, stores.concurrency(), |node_id| async move {
            let readings = stores.warm.readings_between(&node_id, start, end).await?;
            let cadence = cadences.get(&node_id).copied().unwrap_or(default_cadence);
            let findings = audit_node(run_id, &node_id, &readings, (start, end), cadence, stores);
            let written = stores.warm.insert_quality_reports(&findings).await?;
            debug!("Audit of {}: {} finding(s)", node_id, written);
            Ok(JobReport::new(readings.len() as u64, 0).with_meta("findings", written))
        })
        .await;

        Ok(report)
    }
}

// ----------------------------------------------------------------------
// Retention
// ----------------------------------------------------------------------

/// Deletes old job logs, resolved anomalies and quality reports; expires open
/// anomalies. Never touches readings or aggregates.
pub struct RetentionCleanupJob {
    stores: SyncStores,
}

impl RetentionCleanupJob {
    pub fn new(stores: SyncStores) -> Self {
        Self { stores }
    }
}

#[async_trait]
impl JobHandler for RetentionCleanupJob {
    fn kind(&self) -> JobKind {
        JobKind::RetentionCleanup
    }

    async fn run(&self, _ctx: &JobContext) -> Result<JobReport> {
        let now = Utc::now();
        let policy = self.stores.retention.read().await.clone();
        let warm = &self.stores.warm;

        let expired = warm
            .auto_resolve_anomalies(
                now - ChronoDuration::hours(policy.anomaly_auto_resolve_hours as i64),
                now,
            )
            .await?;
        let jobs = warm
            .delete_jobs_before(now - ChronoDuration::days(policy.sync_job_days as i64))
            .await?;
        let anomalies = warm
            .delete_resolved_anomalies_before(
                now - ChronoDuration::days(policy.resolved_anomaly_days as i64),
            )
            .await?;
        let reports = warm
            .delete_quality_reports_before(now - ChronoDuration::days(policy.quality_report_days as i64))
            .await?;

        info!(
            "Retention cleanup: {} job logs, {} anomalies, {} quality reports deleted; {} anomalies expired",
            jobs, anomalies, reports, expired
        );
        Ok(JobReport::new(jobs + anomalies + reports, 0)
            .with_meta("sync_jobs_deleted", jobs)
            .with_meta("anomalies_deleted", anomalies)
            .with_meta("quality_reports_deleted", reports)
            .with_meta("anomalies_expired", expired))
    }
}

// ----------------------------------------------------------------------
// Anomaly scan, cache refresh, archive, model cycle
// ----------------------------------------------------------------------

/// Batch anomaly pass over the trailing window of every recently active node
pub struct AnomalyScanJob {
    stores: SyncStores,
    scanner: Arc<AnomalyScanner>,
}

impl AnomalyScanJob {
    pub fn new(stores: SyncStores, scanner: Arc<AnomalyScanner>) -> Self {
        Self { stores, scanner }
    }
}

#[async_trait]
impl JobHandler for AnomalyScanJob {
    fn kind(&self) -> JobKind {
        JobKind::AnomalyScan
    }

    async fn run(&self, ctx: &JobContext) -> Result<JobReport> {
        let end = Utc::now();
        let start = end - ChronoDuration::days(self.scanner.config().batch_window_days as i64);
        let nodes = self.stores.warm.nodes_with_readings_since(start).await?;
        let warm = &self.stores.warm;
        let scanner = &self.scanner;

        let report = for_each_node(ctx, nodes, self.stores.concurrency(), |node_id| async move {
            let readings = warm.readings_between(&node_id, start, end).await?;
            let found = scanner.scan_window(&node_id, &readings).await?;
            Ok(JobReport::new(readings.len() as u64, 0).with_meta("anomalies_recorded", found.len() as u64))
        })
        .await;
        Ok(report)
    }
}

/// Reloads the hot window and latest values from warm for recently active nodes
pub struct CacheRefreshJob {
    stores: SyncStores,
}

impl CacheRefreshJob {
    pub fn new(stores: SyncStores) -> Self {
        Self { stores }
    }
}

#[async_trait]
impl JobHandler for CacheRefreshJob {
    fn kind(&self) -> JobKind {
        JobKind::CacheRefresh
    }

    async fn run(&self, ctx: &JobContext) -> Result<JobReport> {
        let now = Utc::now();
        let active_since = now - ChronoDuration::hours(self.stores.config.sync.cache_refresh_window_hours);
        let window_start = now - ChronoDuration::hours(self.stores.config.hot.retention_hours as i64);
        let nodes = self.stores.warm.nodes_with_readings_since(active_since).await?;
        let warm = &self.stores.warm;
        let hot = &self.stores.hot;

        let report = for_each_node(ctx, nodes, self.stores.concurrency(), |node_id| async move {
            let readings = warm.readings_between(&node_id, window_start, now).await?;
            let loaded = hot.load_window(&node_id, window_start, &readings).await;
            Ok(JobReport::new(loaded, 0))
        })
        .await;
        Ok(report)
    }
}

/// Replicates live warm readings into the cold canonical table. Rows that came
/// from cold are never written back.
pub struct ColdArchiveJob {
    stores: SyncStores,
}

impl ColdArchiveJob {
    pub fn new(stores: SyncStores) -> Self {
        Self { stores }
    }
}

#[async_trait]
impl JobHandler for ColdArchiveJob {
    fn kind(&self) -> JobKind {
        JobKind::ColdArchive
    }

    async fn run(&self, ctx: &JobContext) -> Result<JobReport> {
        let now = Utc::now();
        let to = now - ChronoDuration::minutes(self.stores.config.sync.archive_lag_minutes);
        let from = match self.stores.warm.get_watermark(COLD_ARCHIVE_WATERMARK).await? {
            Some(mark) => mark,
            None => now - ChronoDuration::days(self.stores.config.warm.retention_days as i64),
        };
        if from >= to {
            return Ok(JobReport::default().with_meta("window", "empty"));
        }

        let readings = self.stores.warm.live_readings_received_between(from, to).await?;
        ctx.check_cancelled()?;

        let cold = &self.stores.cold;
        let outcome = retry_transient("cold append", || cold.write_batch(&readings, WriteMode::SkipExisting))
            .await
            .context("appending to cold archive")?;
        self.stores.warm.set_watermark(COLD_ARCHIVE_WATERMARK, to).await?;

        Ok(JobReport::new(outcome.written, 0)
            .with_meta("skipped_existing", outcome.skipped)
            .with_meta("window_end", to.to_rfc3339()))
    }
}

/// One lifecycle pass over every registered model type
pub struct ModelCycleJob {
    manager: Arc<ModelLifecycleManager>,
}

impl ModelCycleJob {
    pub fn new(manager: Arc<ModelLifecycleManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl JobHandler for ModelCycleJob {
    fn kind(&self) -> JobKind {
        JobKind::ModelCycle
    }

    async fn run(&self, ctx: &JobContext) -> Result<JobReport> {
        let cycle = self.manager.run_cycle(&ctx.cancel).await;
        Ok(JobReport::new(cycle.model_types, cycle.failures)
            .with_meta("trained", cycle.trained)
            .with_meta("promoted", cycle.promoted)
            .with_meta("retired", cycle.retired)
            .with_meta("predictions", cycle.predictions))
    }
}
