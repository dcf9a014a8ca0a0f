//! Warm SQLite Storage
//!
//! Operational store for ~90 days of raw readings and rollups. Also owns the
//! engine's bookkeeping tables: nodes, sync jobs, anomalies, models,
//! predictions, quality reports, watermarks and settings.
//! Target access time: <10ms

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{de::DeserializeOwned, Serialize};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Pool, QueryBuilder, Row, Sqlite};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::metrics::AccessStats;
use super::traits::{JobRecorder, StorageTier, TierMetricsSnapshot, TierRead, WriteMode, WriteOutcome};
use crate::aggregate::{points_from_aggregates, rollup_points, uncovered_spans};
use crate::anomaly::AnomalySink;
use crate::config::WarmConfig;
use crate::error::{EngineError, EngineResult};
use crate::types::{
    from_ms, to_ms, Aggregate, Anomaly, AnomalyKind, AnomalyQuery, JobKind, JobStatus, Metric,
    Model, ModelMetrics, ModelStatus, Node, Prediction, Provenance, QualityIssueKind,
    QualityReport, RangeQuery, Reading, Resolution, SeriesPoint, Severity, SyncJob, TierKind,
};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS nodes (
        node_id TEXT PRIMARY KEY,
        display_name TEXT NOT NULL,
        node_type TEXT NOT NULL,
        location TEXT,
        active INTEGER NOT NULL DEFAULT 1,
        metadata TEXT NOT NULL DEFAULT '{}',
        updated_ms INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS readings (
        node_id TEXT NOT NULL,
        ts_ms INTEGER NOT NULL,
        flow REAL,
        pressure REAL,
        temperature REAL,
        volume REAL,
        quality_score REAL NOT NULL,
        is_interpolated INTEGER NOT NULL DEFAULT 0,
        provenance TEXT NOT NULL,
        received_ms INTEGER NOT NULL,
        PRIMARY KEY (node_id, ts_ms)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS aggregates (
        node_id TEXT NOT NULL,
        resolution TEXT NOT NULL,
        bucket_ms INTEGER NOT NULL,
        metric TEXT NOT NULL,
        avg REAL NOT NULL,
        min REAL NOT NULL,
        max REAL NOT NULL,
        stddev REAL NOT NULL,
        count INTEGER NOT NULL,
        finalized INTEGER NOT NULL DEFAULT 0,
        computed_ms INTEGER NOT NULL,
        PRIMARY KEY (node_id, resolution, bucket_ms, metric)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS sync_jobs (
        run_id TEXT PRIMARY KEY,
        job_name TEXT NOT NULL,
        kind TEXT NOT NULL,
        status TEXT NOT NULL,
        started_ms INTEGER NOT NULL,
        completed_ms INTEGER,
        records_processed INTEGER NOT NULL DEFAULT 0,
        records_failed INTEGER NOT NULL DEFAULT 0,
        error_message TEXT,
        metadata TEXT NOT NULL DEFAULT '{}'
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS anomalies (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        node_id TEXT NOT NULL,
        ts_ms INTEGER NOT NULL,
        kind TEXT NOT NULL,
        severity TEXT NOT NULL,
        severity_rank INTEGER NOT NULL,
        observed_value REAL NOT NULL,
        expected_value REAL NOT NULL,
        deviation_pct REAL NOT NULL,
        detected_ms INTEGER NOT NULL,
        resolved_ms INTEGER,
        UNIQUE (node_id, ts_ms, kind)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS models (
        model_id TEXT PRIMARY KEY,
        model_type TEXT NOT NULL,
        version INTEGER NOT NULL,
        status TEXT NOT NULL,
        metrics TEXT NOT NULL DEFAULT '{}',
        storage_path TEXT,
        created_ms INTEGER NOT NULL,
        shadow_ms INTEGER,
        activated_ms INTEGER,
        retired_ms INTEGER,
        UNIQUE (model_type, version)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS predictions (
        model_id TEXT NOT NULL,
        node_id TEXT NOT NULL,
        target_ms INTEGER NOT NULL,
        issued_ms INTEGER NOT NULL,
        predicted_value REAL NOT NULL,
        lower_bound REAL NOT NULL,
        upper_bound REAL NOT NULL,
        confidence REAL NOT NULL,
        actual_value REAL,
        PRIMARY KEY (model_id, node_id, target_ms)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS quality_reports (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        run_id TEXT NOT NULL,
        node_id TEXT NOT NULL,
        kind TEXT NOT NULL,
        window_start_ms INTEGER NOT NULL,
        window_end_ms INTEGER NOT NULL,
        expected_count INTEGER,
        actual_count INTEGER,
        detail TEXT NOT NULL,
        created_ms INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS watermarks (
        name TEXT PRIMARY KEY,
        value_ms INTEGER NOT NULL,
        updated_ms INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS settings (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL,
        updated_ms INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_readings_ts ON readings(ts_ms)",
    "CREATE INDEX IF NOT EXISTS idx_readings_received ON readings(received_ms)",
    "CREATE INDEX IF NOT EXISTS idx_sync_jobs_name_status ON sync_jobs(job_name, status)",
    "CREATE INDEX IF NOT EXISTS idx_sync_jobs_started ON sync_jobs(started_ms)",
    "CREATE INDEX IF NOT EXISTS idx_anomalies_node_ts ON anomalies(node_id, ts_ms)",
    "CREATE INDEX IF NOT EXISTS idx_predictions_node_target ON predictions(node_id, target_ms)",
    // At most one active model per type, whatever the callers do
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_models_one_active ON models(model_type) WHERE status = 'active'",
];

const READING_COLUMNS: &str = "node_id, ts_ms, flow, pressure, temperature, volume, quality_score, is_interpolated, provenance, received_ms";

/// Warm storage tier using SQLite
pub struct WarmSqliteStorage {
    pool: Pool<Sqlite>,
    stats: Arc<RwLock<AccessStats>>,
    db_path: String,
}

fn corrupt(what: &str, raw: &str) -> EngineError {
    EngineError::DataIntegrity(format!("unrecognized {} '{}' in warm store", what, raw))
}

fn opt_ms(ms: Option<i64>) -> Option<DateTime<Utc>> {
    ms.map(from_ms)
}

impl WarmSqliteStorage {
    /// Open (creating if needed) the database at `db_path`
    pub async fn new(db_path: &str, pool_size: u32, busy_timeout: Duration) -> EngineResult<Self> {
        info!(
            "Initializing WarmSqliteStorage at: {} with pool size: {}",
            db_path, pool_size
        );

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(busy_timeout);

        let pool = SqlitePoolOptions::new()
            .max_connections(pool_size)
            .acquire_timeout(Duration::from_secs(5))
            .connect_with(options)
            .await?;

        let storage = Self {
            pool,
            stats: Arc::new(RwLock::new(AccessStats::default())),
            db_path: db_path.to_string(),
        };

        storage.initialize_schema().await?;
        Ok(storage)
    }

    pub async fn from_config(config: &WarmConfig) -> EngineResult<Self> {
        Self::new(
            &config.database_path,
            config.pool_size,
            Duration::from_millis(config.busy_timeout_ms),
        )
        .await
    }

    async fn initialize_schema(&self) -> EngineResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        info!("Warm storage schema initialized with indexes");
        Ok(())
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub fn db_path(&self) -> &str {
        &self.db_path
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn record_access(&self, started: Instant, hit: bool) {
        let duration_us = started.elapsed().as_micros() as u64;
        self.stats.write().await.record_access(duration_us, hit);
    }

    // ------------------------------------------------------------------
    // Row mapping
    // ------------------------------------------------------------------

    fn row_to_reading(row: &SqliteRow) -> EngineResult<Reading> {
        let is_interpolated: i64 = row.try_get("is_interpolated")?;
        let provenance: String = row.try_get("provenance")?;
        Ok(Reading {
            node_id: row.try_get("node_id")?,
            timestamp: from_ms(row.try_get("ts_ms")?),
            flow: row.try_get("flow")?,
            pressure: row.try_get("pressure")?,
            temperature: row.try_get("temperature")?,
            volume: row.try_get("volume")?,
            quality_score: row.try_get("quality_score")?,
            is_interpolated: is_interpolated != 0,
            provenance: Provenance::parse(&provenance),
            received_at: from_ms(row.try_get("received_ms")?),
        })
    }

    fn row_to_node(row: &SqliteRow) -> EngineResult<Node> {
        let active: i64 = row.try_get("active")?;
        let metadata: String = row.try_get("metadata")?;
        Ok(Node {
            node_id: row.try_get("node_id")?,
            display_name: row.try_get("display_name")?,
            node_type: row.try_get("node_type")?,
            location: row.try_get("location")?,
            active: active != 0,
            metadata: serde_json::from_str(&metadata)?,
        })
    }

    fn row_to_aggregate(row: &SqliteRow) -> EngineResult<Aggregate> {
        let resolution: String = row.try_get("resolution")?;
        let metric: String = row.try_get("metric")?;
        let count: i64 = row.try_get("count")?;
        let finalized: i64 = row.try_get("finalized")?;
        Ok(Aggregate {
            node_id: row.try_get("node_id")?,
            resolution: Resolution::parse(&resolution).ok_or_else(|| corrupt("resolution", &resolution))?,
            bucket_start: from_ms(row.try_get("bucket_ms")?),
            metric: Metric::parse(&metric).ok_or_else(|| corrupt("metric", &metric))?,
            avg: row.try_get("avg")?,
            min: row.try_get("min")?,
            max: row.try_get("max")?,
            stddev: row.try_get("stddev")?,
            count: count.max(0) as u32,
            finalized: finalized != 0,
            computed_at: from_ms(row.try_get("computed_ms")?),
        })
    }

    fn row_to_job(row: &SqliteRow) -> EngineResult<SyncJob> {
        let kind: String = row.try_get("kind")?;
        let status: String = row.try_get("status")?;
        let metadata: String = row.try_get("metadata")?;
        let processed: i64 = row.try_get("records_processed")?;
        let failed: i64 = row.try_get("records_failed")?;
        Ok(SyncJob {
            run_id: row.try_get("run_id")?,
            job_name: row.try_get("job_name")?,
            kind: JobKind::parse(&kind).ok_or_else(|| corrupt("job kind", &kind))?,
            status: JobStatus::parse(&status),
            started_at: from_ms(row.try_get("started_ms")?),
            completed_at: opt_ms(row.try_get("completed_ms")?),
            records_processed: processed.max(0) as u64,
            records_failed: failed.max(0) as u64,
            error_message: row.try_get("error_message")?,
            metadata: serde_json::from_str(&metadata)?,
        })
    }

    fn row_to_anomaly(row: &SqliteRow) -> EngineResult<Anomaly> {
        let kind: String = row.try_get("kind")?;
        let severity: String = row.try_get("severity")?;
        Ok(Anomaly {
            id: Some(row.try_get("id")?),
            node_id: row.try_get("node_id")?,
            timestamp: from_ms(row.try_get("ts_ms")?),
            kind: AnomalyKind::parse(&kind).ok_or_else(|| corrupt("anomaly kind", &kind))?,
            severity: Severity::parse(&severity),
            observed_value: row.try_get("observed_value")?,
            expected_value: row.try_get("expected_value")?,
            deviation_pct: row.try_get("deviation_pct")?,
            detected_at: from_ms(row.try_get("detected_ms")?),
            resolved_at: opt_ms(row.try_get("resolved_ms")?),
        })
    }

    fn row_to_model(row: &SqliteRow) -> EngineResult<Model> {
        let status: String = row.try_get("status")?;
        let metrics: String = row.try_get("metrics")?;
        Ok(Model {
            model_id: row.try_get("model_id")?,
            model_type: row.try_get("model_type")?,
            version: row.try_get("version")?,
            status: ModelStatus::parse(&status).ok_or_else(|| corrupt("model status", &status))?,
            metrics: serde_json::from_str::<ModelMetrics>(&metrics)?,
            storage_path: row.try_get("storage_path")?,
            created_at: from_ms(row.try_get("created_ms")?),
            shadow_at: opt_ms(row.try_get("shadow_ms")?),
            activated_at: opt_ms(row.try_get("activated_ms")?),
            retired_at: opt_ms(row.try_get("retired_ms")?),
        })
    }

    fn row_to_prediction(row: &SqliteRow) -> EngineResult<Prediction> {
        Ok(Prediction {
            model_id: row.try_get("model_id")?,
            node_id: row.try_get("node_id")?,
            issued_at: from_ms(row.try_get("issued_ms")?),
            target_time: from_ms(row.try_get("target_ms")?),
            predicted_value: row.try_get("predicted_value")?,
            lower_bound: row.try_get("lower_bound")?,
            upper_bound: row.try_get("upper_bound")?,
            confidence: row.try_get("confidence")?,
            actual_value: row.try_get("actual_value")?,
        })
    }

    fn row_to_report(row: &SqliteRow) -> EngineResult<QualityReport> {
        let kind: String = row.try_get("kind")?;
        Ok(QualityReport {
            run_id: row.try_get("run_id")?,
            node_id: row.try_get("node_id")?,
            kind: QualityIssueKind::parse(&kind),
            window_start: from_ms(row.try_get("window_start_ms")?),
            window_end: from_ms(row.try_get("window_end_ms")?),
            expected_count: row.try_get("expected_count")?,
            actual_count: row.try_get("actual_count")?,
            detail: row.try_get("detail")?,
            created_at: from_ms(row.try_get("created_ms")?),
        })
    }

    // ------------------------------------------------------------------
    // Readings
    // ------------------------------------------------------------------

    /// Raw readings for one node in `[start, end)`, oldest first
    pub async fn readings_between(
        &self,
        node_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> EngineResult<Vec<Reading>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM readings WHERE node_id = ? AND ts_ms >= ? AND ts_ms < ? ORDER BY ts_ms ASC",
            READING_COLUMNS
        ))
        .bind(node_id)
        .bind(to_ms(start))
        .bind(to_ms(end))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_reading).collect()
    }

    /// Live readings accepted in `[from, to)`, in receive order (cold archive feed)
    pub async fn live_readings_received_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> EngineResult<Vec<Reading>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM readings WHERE provenance = 'live' AND received_ms >= ? AND received_ms < ? \
             ORDER BY received_ms ASC, node_id ASC, ts_ms ASC",
            READING_COLUMNS
        ))
        .bind(to_ms(from))
        .bind(to_ms(to))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_reading).collect()
    }

    /// Nodes with at least one reading at or after `since`
    pub async fn nodes_with_readings_since(&self, since: DateTime<Utc>) -> EngineResult<Vec<String>> {
        let rows = sqlx::query("SELECT DISTINCT node_id FROM readings WHERE ts_ms >= ? ORDER BY node_id")
            .bind(to_ms(since))
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|r| r.try_get::<String, _>("node_id").map_err(EngineError::from))
            .collect()
    }

    pub async fn count_readings_between(
        &self,
        node_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> EngineResult<u64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM readings WHERE node_id = ? AND ts_ms >= ? AND ts_ms < ?")
            .bind(node_id)
            .bind(to_ms(start))
            .bind(to_ms(end))
            .fetch_one(&self.pool)
            .await?;
        let n: i64 = row.try_get("n")?;
        Ok(n.max(0) as u64)
    }

    /// Mean and sample count of a metric across all nodes since `since`
    pub async fn metric_mean_since(
        &self,
        metric: Metric,
        since: DateTime<Utc>,
    ) -> EngineResult<(Option<f64>, u64)> {
        let col = metric.column();
        let row = sqlx::query(&format!(
            "SELECT AVG({col}) AS mean, COUNT({col}) AS n FROM readings WHERE ts_ms >= ?"
        ))
        .bind(to_ms(since))
        .fetch_one(&self.pool)
        .await?;
        let mean: Option<f64> = row.try_get("mean")?;
        let n: i64 = row.try_get("n")?;
        Ok((mean, n.max(0) as u64))
    }

    // ------------------------------------------------------------------
    // Nodes
    // ------------------------------------------------------------------

    /// Insert or update a node; last writer wins on every field
    pub async fn upsert_node(&self, node: &Node) -> EngineResult<()> {
        sqlx::query(
            r#"
            INSERT INTO nodes (node_id, display_name, node_type, location, active, metadata, updated_ms)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(node_id) DO UPDATE SET
                display_name = excluded.display_name,
                node_type = excluded.node_type,
                location = excluded.location,
                active = excluded.active,
                metadata = excluded.metadata,
                updated_ms = excluded.updated_ms
            "#,
        )
        .bind(&node.node_id)
        .bind(&node.display_name)
        .bind(&node.node_type)
        .bind(&node.location)
        .bind(node.active as i64)
        .bind(serde_json::to_string(&node.metadata)?)
        .bind(to_ms(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Register a node seen in data without overwriting catalog details
    pub async fn insert_node_if_absent(&self, node: &Node) -> EngineResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO nodes (node_id, display_name, node_type, location, active, metadata, updated_ms)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(node_id) DO NOTHING
            "#,
        )
        .bind(&node.node_id)
        .bind(&node.display_name)
        .bind(&node.node_type)
        .bind(&node.location)
        .bind(node.active as i64)
        .bind(serde_json::to_string(&node.metadata)?)
        .bind(to_ms(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn get_node(&self, node_id: &str) -> EngineResult<Option<Node>> {
        let row = sqlx::query("SELECT * FROM nodes WHERE node_id = ?")
            .bind(node_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_node).transpose()
    }

    pub async fn list_nodes(&self, active_only: bool) -> EngineResult<Vec<Node>> {
        let sql = if active_only {
            "SELECT * FROM nodes WHERE active = 1 ORDER BY node_id"
        } else {
            "SELECT * FROM nodes ORDER BY node_id"
        };
        let rows = sqlx::query(sql).fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_node).collect()
    }

    // ------------------------------------------------------------------
    // Aggregates
    // ------------------------------------------------------------------

    /// Write recomputed rollups; finalized rows are left alone unless `force`.
    /// Returns the number of rows inserted or changed.
    pub async fn upsert_aggregates(&self, aggregates: &[Aggregate], force: bool) -> EngineResult<u64> {
        let mut tx = self.pool.begin().await?;
        let mut changed = 0;
        for agg in aggregates {
            let result = sqlx::query(
                r#"
                INSERT INTO aggregates
                    (node_id, resolution, bucket_ms, metric, avg, min, max, stddev, count, finalized, computed_ms)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(node_id, resolution, bucket_ms, metric) DO UPDATE SET
                    avg = excluded.avg,
                    min = excluded.min,
                    max = excluded.max,
                    stddev = excluded.stddev,
                    count = excluded.count,
                    finalized = excluded.finalized,
                    computed_ms = excluded.computed_ms
                WHERE aggregates.finalized = 0 OR ?
                "#,
            )
            .bind(&agg.node_id)
            .bind(agg.resolution.as_str())
            .bind(to_ms(agg.bucket_start))
            .bind(agg.metric.as_str())
            .bind(agg.avg)
            .bind(agg.min)
            .bind(agg.max)
            .bind(agg.stddev)
            .bind(agg.count as i64)
            .bind(agg.finalized as i64)
            .bind(to_ms(agg.computed_at))
            .bind(force as i64)
            .execute(&mut *tx)
            .await?;
            changed += result.rows_affected();
        }
        tx.commit().await?;
        Ok(changed)
    }

    pub async fn read_aggregates(
        &self,
        node_id: &str,
        resolution: Resolution,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> EngineResult<Vec<Aggregate>> {
        let rows = sqlx::query(
            "SELECT * FROM aggregates WHERE node_id = ? AND resolution = ? AND bucket_ms >= ? AND bucket_ms < ? \
             ORDER BY bucket_ms ASC, metric ASC",
        )
        .bind(node_id)
        .bind(resolution.as_str())
        .bind(to_ms(resolution.bucket_start(start)))
        .bind(to_ms(end))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_aggregate).collect()
    }

    pub async fn count_aggregates(&self) -> EngineResult<u64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM aggregates")
            .fetch_one(&self.pool)
            .await?;
        let n: i64 = row.try_get("n")?;
        Ok(n.max(0) as u64)
    }

    // ------------------------------------------------------------------
    // Sync jobs
    // ------------------------------------------------------------------

    /// Insert a `running` row unless another run of the same job is running.
    /// The check and the insert are a single statement.
    pub async fn try_start_job(&self, job: &SyncJob) -> EngineResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO sync_jobs (run_id, job_name, kind, status, started_ms, metadata)
            SELECT ?, ?, ?, 'running', ?, ?
            WHERE NOT EXISTS (
                SELECT 1 FROM sync_jobs WHERE job_name = ? AND status = 'running'
            )
            "#,
        )
        .bind(&job.run_id)
        .bind(&job.job_name)
        .bind(job.kind.as_str())
        .bind(to_ms(job.started_at))
        .bind(job.metadata.to_string())
        .bind(&job.job_name)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Record the terminal state of a run started with `try_start_job`
    pub async fn finish_job(&self, job: &SyncJob) -> EngineResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE sync_jobs SET
                status = ?, completed_ms = ?, records_processed = ?, records_failed = ?,
                error_message = ?, metadata = ?
            WHERE run_id = ?
            "#,
        )
        .bind(job.status.as_str())
        .bind(job.completed_at.map(to_ms))
        .bind(job.records_processed as i64)
        .bind(job.records_failed as i64)
        .bind(&job.error_message)
        .bind(job.metadata.to_string())
        .bind(&job.run_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(EngineError::NotFound(format!("sync job run {}", job.run_id)));
        }
        Ok(())
    }

    pub async fn list_jobs(&self, job_name: Option<&str>, limit: u32) -> EngineResult<Vec<SyncJob>> {
        let rows = match job_name {
            Some(name) => {
                sqlx::query("SELECT * FROM sync_jobs WHERE job_name = ? ORDER BY started_ms DESC, rowid DESC LIMIT ?")
                    .bind(name)
                    .bind(limit as i64)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query("SELECT * FROM sync_jobs ORDER BY started_ms DESC, rowid DESC LIMIT ?")
                    .bind(limit as i64)
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter().map(Self::row_to_job).collect()
    }

    pub async fn last_job(&self, job_name: &str) -> EngineResult<Option<SyncJob>> {
        Ok(self.list_jobs(Some(job_name), 1).await?.into_iter().next())
    }

    pub async fn is_job_running(&self, job_name: &str) -> EngineResult<bool> {
        let row = sqlx::query("SELECT 1 FROM sync_jobs WHERE job_name = ? AND status = 'running' LIMIT 1")
            .bind(job_name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    /// Mark runs left `running` by a crashed process as failed
    pub async fn fail_stale_jobs(&self, started_before: DateTime<Utc>) -> EngineResult<u64> {
        let result = sqlx::query(
            "UPDATE sync_jobs SET status = 'failed', completed_ms = ?, \
             error_message = 'abandoned: process stopped while running' \
             WHERE status = 'running' AND started_ms < ?",
        )
        .bind(to_ms(Utc::now()))
        .bind(to_ms(started_before))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn delete_jobs_before(&self, cutoff: DateTime<Utc>) -> EngineResult<u64> {
        let result = sqlx::query("DELETE FROM sync_jobs WHERE started_ms < ? AND status != 'running'")
            .bind(to_ms(cutoff))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    // ------------------------------------------------------------------
    // Anomalies
    // ------------------------------------------------------------------

    /// Insert an anomaly; returns false when (node, timestamp, kind) already exists
    pub async fn insert_anomaly(&self, anomaly: &Anomaly) -> EngineResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO anomalies
                (node_id, ts_ms, kind, severity, severity_rank, observed_value, expected_value,
                 deviation_pct, detected_ms, resolved_ms)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(node_id, ts_ms, kind) DO NOTHING
            "#,
        )
        .bind(&anomaly.node_id)
        .bind(to_ms(anomaly.timestamp))
        .bind(anomaly.kind.as_str())
        .bind(anomaly.severity.as_str())
        .bind(anomaly.severity.rank())
        .bind(anomaly.observed_value)
        .bind(anomaly.expected_value)
        .bind(anomaly.deviation_pct)
        .bind(to_ms(anomaly.detected_at))
        .bind(anomaly.resolved_at.map(to_ms))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn query_anomalies(&self, filter: &AnomalyQuery) -> EngineResult<Vec<Anomaly>> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT * FROM anomalies WHERE 1 = 1");

        if !filter.node_ids.is_empty() {
            qb.push(" AND node_id IN (");
            let mut ids = qb.separated(", ");
            for id in &filter.node_ids {
                ids.push_bind(id.clone());
            }
            ids.push_unseparated(")");
        }
        if !filter.kinds.is_empty() {
            qb.push(" AND kind IN (");
            let mut kinds = qb.separated(", ");
            for kind in &filter.kinds {
                kinds.push_bind(kind.as_str());
            }
            kinds.push_unseparated(")");
        }
        if let Some(min) = filter.min_severity {
            qb.push(" AND severity_rank >= ").push_bind(min.rank());
        }
        if let Some(since) = filter.since {
            qb.push(" AND ts_ms >= ").push_bind(to_ms(since));
        }
        if let Some(until) = filter.until {
            qb.push(" AND ts_ms < ").push_bind(to_ms(until));
        }
        if filter.unresolved_only {
            qb.push(" AND resolved_ms IS NULL");
        }
        qb.push(" ORDER BY ts_ms DESC, id DESC");
        if let Some(limit) = filter.limit {
            qb.push(" LIMIT ").push_bind(limit as i64);
        }

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_anomaly).collect()
    }

    pub async fn resolve_anomaly(&self, id: i64, at: DateTime<Utc>) -> EngineResult<bool> {
        let result = sqlx::query("UPDATE anomalies SET resolved_ms = ? WHERE id = ? AND resolved_ms IS NULL")
            .bind(to_ms(at))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Expire open anomalies detected before `cutoff`
    pub async fn auto_resolve_anomalies(&self, cutoff: DateTime<Utc>, now: DateTime<Utc>) -> EngineResult<u64> {
        let result = sqlx::query("UPDATE anomalies SET resolved_ms = ? WHERE resolved_ms IS NULL AND detected_ms < ?")
            .bind(to_ms(now))
            .bind(to_ms(cutoff))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn delete_resolved_anomalies_before(&self, cutoff: DateTime<Utc>) -> EngineResult<u64> {
        let result = sqlx::query("DELETE FROM anomalies WHERE resolved_ms IS NOT NULL AND resolved_ms < ?")
            .bind(to_ms(cutoff))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    // ------------------------------------------------------------------
    // Models
    // ------------------------------------------------------------------

    pub async fn insert_model(&self, model: &Model) -> EngineResult<()> {
        sqlx::query(
            r#"
            INSERT INTO models
                (model_id, model_type, version, status, metrics, storage_path,
                 created_ms, shadow_ms, activated_ms, retired_ms)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&model.model_id)
        .bind(&model.model_type)
        .bind(model.version)
        .bind(model.status.as_str())
        .bind(serde_json::to_string(&model.metrics)?)
        .bind(&model.storage_path)
        .bind(to_ms(model.created_at))
        .bind(model.shadow_at.map(to_ms))
        .bind(model.activated_at.map(to_ms))
        .bind(model.retired_at.map(to_ms))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_model(&self, model_id: &str) -> EngineResult<Option<Model>> {
        let row = sqlx::query("SELECT * FROM models WHERE model_id = ?")
            .bind(model_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_model).transpose()
    }

    pub async fn list_models(&self, model_type: Option<&str>) -> EngineResult<Vec<Model>> {
        let rows = match model_type {
            Some(t) => {
                sqlx::query("SELECT * FROM models WHERE model_type = ? ORDER BY version DESC")
                    .bind(t)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query("SELECT * FROM models ORDER BY model_type ASC, version DESC")
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter().map(Self::row_to_model).collect()
    }

    pub async fn models_with_status(&self, model_type: &str, status: ModelStatus) -> EngineResult<Vec<Model>> {
        let rows = sqlx::query("SELECT * FROM models WHERE model_type = ? AND status = ? ORDER BY version DESC")
            .bind(model_type)
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_model).collect()
    }

    pub async fn active_model(&self, model_type: &str) -> EngineResult<Option<Model>> {
        Ok(self
            .models_with_status(model_type, ModelStatus::Active)
            .await?
            .into_iter()
            .next())
    }

    pub async fn count_active_models(&self, model_type: &str) -> EngineResult<u64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM models WHERE model_type = ? AND status = 'active'")
            .bind(model_type)
            .fetch_one(&self.pool)
            .await?;
        let n: i64 = row.try_get("n")?;
        Ok(n.max(0) as u64)
    }

    pub async fn next_model_version(&self, model_type: &str) -> EngineResult<i64> {
        let row = sqlx::query("SELECT COALESCE(MAX(version), 0) + 1 AS v FROM models WHERE model_type = ?")
            .bind(model_type)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("v")?)
    }

    /// Conditional state-machine step. Activation goes through `promote_model`.
    pub async fn transition_model(
        &self,
        model_id: &str,
        from: ModelStatus,
        to: ModelStatus,
        metrics: Option<&ModelMetrics>,
        storage_path: Option<&str>,
    ) -> EngineResult<()> {
        if to == ModelStatus::Active || !from.can_transition_to(to) {
            return Err(EngineError::InvalidTransition(format!(
                "model {}: {} -> {}",
                model_id, from, to
            )));
        }

        let now = to_ms(Utc::now());
        let metrics_json = metrics.map(serde_json::to_string).transpose()?;
        let result = sqlx::query(
            r#"
            UPDATE models SET
                status = ?,
                metrics = COALESCE(?, metrics),
                storage_path = COALESCE(?, storage_path),
                shadow_ms = CASE WHEN ? = 'shadow' THEN ? ELSE shadow_ms END,
                retired_ms = CASE WHEN ? = 'retired' THEN ? ELSE retired_ms END
            WHERE model_id = ? AND status = ?
            "#,
        )
        .bind(to.as_str())
        .bind(metrics_json)
        .bind(storage_path)
        .bind(to.as_str())
        .bind(now)
        .bind(to.as_str())
        .bind(now)
        .bind(model_id)
        .bind(from.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(EngineError::ConcurrencyConflict(format!(
                "model {} is no longer {}",
                model_id, from
            )));
        }
        Ok(())
    }

    /// Atomically retire the current active model of the type and activate
    /// `model_id`. `expected_active` is the active model the caller compared
    /// against; if another promotion got there first the transaction is rolled
    /// back with `ConcurrencyConflict`. Returns the demoted model id.
    pub async fn promote_model(
        &self,
        model_id: &str,
        model_type: &str,
        expected_active: Option<&str>,
        now: DateTime<Utc>,
    ) -> EngineResult<Option<String>> {
        let now_ms = to_ms(now);
        let mut tx = self.pool.begin().await?;

        // Write first so the transaction takes the write lock before reading
        let demoted: Vec<String> = sqlx::query(
            "UPDATE models SET status = 'retired', retired_ms = ? \
             WHERE model_type = ? AND status = 'active' AND model_id != ? RETURNING model_id",
        )
        .bind(now_ms)
        .bind(model_type)
        .bind(model_id)
        .fetch_all(&mut *tx)
        .await?
        .iter()
        .map(|row| row.try_get::<String, _>("model_id"))
        .collect::<Result<_, _>>()?;

        let expected: Vec<String> = expected_active.map(|s| s.to_string()).into_iter().collect();
        if demoted != expected {
            tx.rollback().await?;
            return Err(EngineError::ConcurrencyConflict(format!(
                "active {} model changed (expected {:?}, found {:?})",
                model_type, expected_active, demoted
            )));
        }

        let promoted = sqlx::query(
            "UPDATE models SET status = 'active', activated_ms = ?, retired_ms = NULL \
             WHERE model_id = ? AND model_type = ? AND status IN ('validating', 'shadow', 'retired')",
        )
        .bind(now_ms)
        .bind(model_id)
        .bind(model_type)
        .execute(&mut *tx)
        .await?;

        if promoted.rows_affected() != 1 {
            tx.rollback().await?;
            return Err(EngineError::ConcurrencyConflict(format!(
                "model {} is not promotable",
                model_id
            )));
        }

        tx.commit().await?;
        info!(
            "Promoted model {} ({}) replacing {:?}",
            model_id, model_type, expected_active
        );
        Ok(demoted.into_iter().next())
    }

    // ------------------------------------------------------------------
    // Predictions
    // ------------------------------------------------------------------

    /// Upsert predictions on (model_id, node_id, target_time)
    pub async fn upsert_predictions(&self, predictions: &[Prediction]) -> EngineResult<u64> {
        let mut tx = self.pool.begin().await?;
        let mut written = 0;
        for p in predictions {
            let result = sqlx::query(
                r#"
                INSERT INTO predictions
                    (model_id, node_id, target_ms, issued_ms, predicted_value, lower_bound,
                     upper_bound, confidence, actual_value)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(model_id, node_id, target_ms) DO UPDATE SET
                    issued_ms = excluded.issued_ms,
                    predicted_value = excluded.predicted_value,
                    lower_bound = excluded.lower_bound,
                    upper_bound = excluded.upper_bound,
                    confidence = excluded.confidence,
                    actual_value = COALESCE(excluded.actual_value, predictions.actual_value)
                "#,
            )
            .bind(&p.model_id)
            .bind(&p.node_id)
            .bind(to_ms(p.target_time))
            .bind(to_ms(p.issued_at))
            .bind(p.predicted_value)
            .bind(p.lower_bound)
            .bind(p.upper_bound)
            .bind(p.confidence)
            .bind(p.actual_value)
            .execute(&mut *tx)
            .await?;
            written += result.rows_affected();
        }
        tx.commit().await?;
        Ok(written)
    }

    /// Fill `actual_value` for matured predictions from the nearest reading
    /// within `tolerance` of the target time
    pub async fn fill_prediction_actuals(
        &self,
        model_id: &str,
        metric: Metric,
        tolerance: ChronoDuration,
        now: DateTime<Utc>,
    ) -> EngineResult<u64> {
        let col = metric.column();
        let tol = tolerance.num_milliseconds();
        let sql = format!(
            r#"
            UPDATE predictions SET actual_value = (
                SELECT r.{col} FROM readings r
                WHERE r.node_id = predictions.node_id AND r.{col} IS NOT NULL
                  AND r.ts_ms BETWEEN predictions.target_ms - ?1 AND predictions.target_ms + ?1
                ORDER BY ABS(r.ts_ms - predictions.target_ms) ASC
                LIMIT 1
            )
            WHERE model_id = ?2 AND actual_value IS NULL AND target_ms <= ?3
              AND EXISTS (
                SELECT 1 FROM readings r
                WHERE r.node_id = predictions.node_id AND r.{col} IS NOT NULL
                  AND r.ts_ms BETWEEN predictions.target_ms - ?1 AND predictions.target_ms + ?1
              )
            "#
        );
        let result = sqlx::query(&sql)
            .bind(tol)
            .bind(model_id)
            .bind(to_ms(now))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Mean absolute error and sample count over matured predictions targeting
    /// `since` or later
    pub async fn live_error(&self, model_id: &str, since: DateTime<Utc>) -> EngineResult<(Option<f64>, u64)> {
        let row = sqlx::query(
            "SELECT AVG(ABS(predicted_value - actual_value)) AS mae, COUNT(*) AS n FROM predictions \
             WHERE model_id = ? AND actual_value IS NOT NULL AND target_ms >= ?",
        )
        .bind(model_id)
        .bind(to_ms(since))
        .fetch_one(&self.pool)
        .await?;
        let mae: Option<f64> = row.try_get("mae")?;
        let n: i64 = row.try_get("n")?;
        Ok((mae, n.max(0) as u64))
    }

    /// Predictions from active models for a node with target in `[from, until]`
    pub async fn active_predictions(
        &self,
        node_id: &str,
        from: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> EngineResult<Vec<Prediction>> {
        let rows = sqlx::query(
            r#"
            SELECT p.* FROM predictions p
            JOIN models m ON m.model_id = p.model_id
            WHERE m.status = 'active' AND p.node_id = ? AND p.target_ms >= ? AND p.target_ms <= ?
            ORDER BY p.target_ms ASC, p.model_id ASC
            "#,
        )
        .bind(node_id)
        .bind(to_ms(from))
        .bind(to_ms(until))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_prediction).collect()
    }

    pub async fn predictions_for_model(&self, model_id: &str) -> EngineResult<Vec<Prediction>> {
        let rows = sqlx::query("SELECT * FROM predictions WHERE model_id = ? ORDER BY target_ms ASC, node_id ASC")
            .bind(model_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_prediction).collect()
    }

    // ------------------------------------------------------------------
    // Quality reports, watermarks, settings
    // ------------------------------------------------------------------

    pub async fn insert_quality_reports(&self, reports: &[QualityReport]) -> EngineResult<u64> {
        let mut tx = self.pool.begin().await?;
        for r in reports {
            sqlx::query(
                r#"
                INSERT INTO quality_reports
                    (run_id, node_id, kind, window_start_ms, window_end_ms, expected_count,
                     actual_count, detail, created_ms)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&r.run_id)
            .bind(&r.node_id)
            .bind(r.kind.as_str())
            .bind(to_ms(r.window_start))
            .bind(to_ms(r.window_end))
            .bind(r.expected_count)
            .bind(r.actual_count)
            .bind(&r.detail)
            .bind(to_ms(r.created_at))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(reports.len() as u64)
    }

    pub async fn list_quality_reports(&self, run_id: &str) -> EngineResult<Vec<QualityReport>> {
        let rows = sqlx::query("SELECT * FROM quality_reports WHERE run_id = ? ORDER BY node_id, id")
            .bind(run_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_report).collect()
    }

    pub async fn delete_quality_reports_before(&self, cutoff: DateTime<Utc>) -> EngineResult<u64> {
        let result = sqlx::query("DELETE FROM quality_reports WHERE created_ms < ?")
            .bind(to_ms(cutoff))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn get_watermark(&self, name: &str) -> EngineResult<Option<DateTime<Utc>>> {
        let row = sqlx::query("SELECT value_ms FROM watermarks WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(match row {
            Some(r) => Some(from_ms(r.try_get("value_ms")?)),
            None => None,
        })
    }

    pub async fn set_watermark(&self, name: &str, value: DateTime<Utc>) -> EngineResult<()> {
        sqlx::query(
            "INSERT INTO watermarks (name, value_ms, updated_ms) VALUES (?, ?, ?) \
             ON CONFLICT(name) DO UPDATE SET value_ms = excluded.value_ms, updated_ms = excluded.updated_ms",
        )
        .bind(name)
        .bind(to_ms(value))
        .bind(to_ms(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_setting<T: DeserializeOwned>(&self, key: &str) -> EngineResult<Option<T>> {
        let row = sqlx::query("SELECT value FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(r) => {
                let raw: String = r.try_get("value")?;
                Ok(Some(serde_json::from_str(&raw)?))
            }
            None => Ok(None),
        }
    }

    pub async fn put_setting<T: Serialize>(&self, key: &str, value: &T) -> EngineResult<()> {
        sqlx::query(
            "INSERT INTO settings (key, value, updated_ms) VALUES (?, ?, ?) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_ms = excluded.updated_ms",
        )
        .bind(key)
        .bind(serde_json::to_string(value)?)
        .bind(to_ms(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl StorageTier for WarmSqliteStorage {
    async fn read_range(&self, query: &RangeQuery) -> EngineResult<TierRead> {
        let started = Instant::now();

        let points: Vec<SeriesPoint> = match query.resolution.bucket_width() {
            None => self
                .readings_between(&query.node_id, query.start, query.end)
                .await?
                .iter()
                .map(SeriesPoint::from)
                .collect(),
            Some(_) => {
                // Stored rollups where present, raw rollups for every other bucket
                let aggregates = self
                    .read_aggregates(&query.node_id, query.resolution, query.start, query.end)
                    .await?;
                let covered: BTreeSet<DateTime<Utc>> = aggregates.iter().map(|a| a.bucket_start).collect();
                let mut buckets: BTreeMap<DateTime<Utc>, SeriesPoint> = points_from_aggregates(&aggregates)
                    .into_iter()
                    .map(|p| (p.timestamp, p))
                    .collect();
                for (span_start, span_end) in uncovered_spans(&covered, query.start, query.end, query.resolution) {
                    let raw: Vec<SeriesPoint> = self
                        .readings_between(&query.node_id, span_start, span_end)
                        .await?
                        .iter()
                        .map(SeriesPoint::from)
                        .collect();
                    for point in rollup_points(&raw, query.resolution) {
                        buckets.entry(point.timestamp).or_insert(point);
                    }
                }
                buckets.into_values().collect()
            }
        };

        self.record_access(started, !points.is_empty()).await;
        debug!(
            "Warm read for {} returned {} points in {}µs",
            query.node_id,
            points.len(),
            started.elapsed().as_micros()
        );
        Ok(TierRead::complete(points))
    }

    async fn write_batch(&self, readings: &[Reading], mode: WriteMode) -> EngineResult<WriteOutcome> {
        if readings.is_empty() {
            return Ok(WriteOutcome::default());
        }

        let conflict = match mode {
            WriteMode::SkipExisting => "ON CONFLICT(node_id, ts_ms) DO NOTHING",
            WriteMode::Overwrite => {
                "ON CONFLICT(node_id, ts_ms) DO UPDATE SET \
                 flow = excluded.flow, pressure = excluded.pressure, \
                 temperature = excluded.temperature, volume = excluded.volume, \
                 quality_score = excluded.quality_score, is_interpolated = excluded.is_interpolated, \
                 provenance = excluded.provenance, received_ms = excluded.received_ms"
            }
        };
        let sql = format!(
            "INSERT INTO readings ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?) {}",
            READING_COLUMNS, conflict
        );

        let mut outcome = WriteOutcome::default();
        let mut tx = self.pool.begin().await?;
        for r in readings {
            let result = sqlx::query(&sql)
                .bind(&r.node_id)
                .bind(to_ms(r.timestamp))
                .bind(r.flow)
                .bind(r.pressure)
                .bind(r.temperature)
                .bind(r.volume)
                .bind(r.quality_score)
                .bind(r.is_interpolated as i64)
                .bind(r.provenance.as_str())
                .bind(to_ms(r.received_at))
                .execute(&mut *tx)
                .await?;
            if result.rows_affected() > 0 {
                outcome.written += 1;
            } else {
                outcome.skipped += 1;
            }
        }
        tx.commit().await?;

        debug!(
            "Warm batch committed: {} written, {} skipped",
            outcome.written, outcome.skipped
        );
        Ok(outcome)
    }

    async fn latest(&self, node_id: &str) -> EngineResult<Option<Reading>> {
        let started = Instant::now();
        let row = sqlx::query(&format!(
            "SELECT {} FROM readings WHERE node_id = ? ORDER BY ts_ms DESC LIMIT 1",
            READING_COLUMNS
        ))
        .bind(node_id)
        .fetch_optional(&self.pool)
        .await?;
        let result = row.as_ref().map(Self::row_to_reading).transpose()?;
        self.record_access(started, result.is_some()).await;
        Ok(result)
    }

    async fn count(&self) -> EngineResult<u64> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM readings")
            .fetch_one(&self.pool)
            .await?;
        let count: i64 = row.try_get("count")?;
        Ok(count.max(0) as u64)
    }

    async fn get_metrics(&self) -> EngineResult<TierMetricsSnapshot> {
        let record_count = self.count().await?;
        Ok(self.stats.read().await.snapshot(record_count))
    }

    async fn maintenance(&self) -> EngineResult<()> {
        // Update statistics for the query planner, then fold the WAL back
        sqlx::query("ANALYZE").execute(&self.pool).await?;
        if let Err(e) = sqlx::query("PRAGMA wal_checkpoint(PASSIVE)")
            .execute(&self.pool)
            .await
        {
            warn!("WAL checkpoint failed: {}", e);
        }
        info!("Warm storage maintenance completed");
        Ok(())
    }

    fn tier(&self) -> TierKind {
        TierKind::Warm
    }

    fn target_access_time(&self) -> Duration {
        Duration::from_millis(10)
    }
}

#[async_trait]
impl JobRecorder for WarmSqliteStorage {
    async fn record_job(&self, job: &SyncJob) -> EngineResult<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_jobs
                (run_id, job_name, kind, status, started_ms, completed_ms, records_processed,
                 records_failed, error_message, metadata)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(run_id) DO UPDATE SET
                status = excluded.status,
                completed_ms = excluded.completed_ms,
                records_processed = excluded.records_processed,
                records_failed = excluded.records_failed,
                error_message = excluded.error_message,
                metadata = excluded.metadata
            "#,
        )
        .bind(&job.run_id)
        .bind(&job.job_name)
        .bind(job.kind.as_str())
        .bind(job.status.as_str())
        .bind(to_ms(job.started_at))
        .bind(job.completed_at.map(to_ms))
        .bind(job.records_processed as i64)
        .bind(job.records_failed as i64)
        .bind(&job.error_message)
        .bind(job.metadata.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl AnomalySink for WarmSqliteStorage {
    async fn record_anomaly(&self, anomaly: &Anomaly) -> EngineResult<bool> {
        self.insert_anomaly(anomaly).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_storage() -> WarmSqliteStorage {
        let db_path = std::env::temp_dir().join(format!("warm_test_{}.db", rand::random::<u64>()));
        WarmSqliteStorage::new(db_path.to_str().unwrap(), 5, Duration::from_secs(5))
            .await
            .unwrap()
    }

    fn reading(node: &str, ts: DateTime<Utc>, flow: f64) -> Reading {
        Reading::new(node, ts).with_flow(flow).with_pressure(50.0)
    }

    fn model(id: &str, model_type: &str, version: i64, status: ModelStatus) -> Model {
        Model {
            model_id: id.to_string(),
            model_type: model_type.to_string(),
            version,
            status,
            metrics: ModelMetrics::default(),
            storage_path: None,
            created_at: Utc::now(),
            shadow_at: None,
            activated_at: None,
            retired_at: None,
        }
    }

    #[tokio::test]
    async fn test_write_batch_skips_existing_keys() {
        let storage = test_storage().await;
        let t0 = Utc::now() - ChronoDuration::hours(2);
        let batch: Vec<Reading> = (0..5)
            .map(|i| reading("N1", t0 + ChronoDuration::minutes(i * 5), i as f64))
            .collect();

        let first = storage.write_batch(&batch, WriteMode::SkipExisting).await.unwrap();
        assert_eq!(first, WriteOutcome { written: 5, skipped: 0 });

        let second = storage.write_batch(&batch, WriteMode::SkipExisting).await.unwrap();
        assert_eq!(second, WriteOutcome { written: 0, skipped: 5 });
        assert_eq!(storage.count().await.unwrap(), 5);

        let mut changed = batch[0].clone();
        changed.flow = Some(99.0);
        storage.write_batch(&[changed], WriteMode::Overwrite).await.unwrap();
        let rows = storage.readings_between("N1", t0, t0 + ChronoDuration::minutes(1)).await.unwrap();
        assert_eq!(rows[0].flow, Some(99.0));
    }

    #[tokio::test]
    async fn test_read_range_is_half_open_and_sorted() {
        let storage = test_storage().await;
        let t0 = Utc::now() - ChronoDuration::hours(3);
        let batch: Vec<Reading> = (0..6)
            .rev()
            .map(|i| reading("N1", t0 + ChronoDuration::minutes(i * 10), 1.0))
            .collect();
        storage.write_batch(&batch, WriteMode::SkipExisting).await.unwrap();

        let q = RangeQuery::new("N1", t0, t0 + ChronoDuration::minutes(30), Resolution::Raw);
        let read = storage.read_range(&q).await.unwrap();
        assert_eq!(read.points.len(), 3);
        assert!(read.points.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
        assert!(!read.partial);
    }

    #[tokio::test]
    async fn test_finalized_aggregates_untouched_without_force() {
        let storage = test_storage().await;
        let bucket = Resolution::Hourly.bucket_start(Utc::now() - ChronoDuration::hours(5));
        let agg = Aggregate {
            node_id: "N1".into(),
            resolution: Resolution::Hourly,
            bucket_start: bucket,
            metric: Metric::Flow,
            avg: 1.0,
            min: 1.0,
            max: 1.0,
            stddev: 0.0,
            count: 1,
            finalized: true,
            computed_at: Utc::now(),
        };
        assert_eq!(storage.upsert_aggregates(&[agg.clone()], false).await.unwrap(), 1);

        let mut changed = agg.clone();
        changed.avg = 5.0;
        assert_eq!(storage.upsert_aggregates(&[changed.clone()], false).await.unwrap(), 0);
        assert_eq!(storage.upsert_aggregates(&[changed], true).await.unwrap(), 1);

        let rows = storage
            .read_aggregates("N1", Resolution::Hourly, bucket, bucket + ChronoDuration::hours(1))
            .await
            .unwrap();
        assert_eq!(rows[0].avg, 5.0);
    }

    #[tokio::test]
    async fn test_job_lock_surrogate() {
        let storage = test_storage().await;
        let job = |run: &str| SyncJob {
            run_id: run.to_string(),
            job_name: "recent_sync".into(),
            kind: JobKind::RecentSync,
            status: JobStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            records_processed: 0,
            records_failed: 0,
            error_message: None,
            metadata: serde_json::json!({}),
        };

        assert!(storage.try_start_job(&job("a")).await.unwrap());
        assert!(!storage.try_start_job(&job("b")).await.unwrap());

        let mut done = job("a");
        done.status = JobStatus::Completed;
        done.completed_at = Some(Utc::now());
        storage.finish_job(&done).await.unwrap();
        assert!(storage.try_start_job(&job("c")).await.unwrap());

        let stale = storage.fail_stale_jobs(Utc::now() + ChronoDuration::seconds(1)).await.unwrap();
        assert_eq!(stale, 1);
        assert!(!storage.is_job_running("recent_sync").await.unwrap());
    }

    #[tokio::test]
    async fn test_anomaly_dedup_and_filters() {
        let storage = test_storage().await;
        let ts = Utc::now() - ChronoDuration::hours(1);
        let anomaly = Anomaly {
            id: None,
            node_id: "N1".into(),
            timestamp: ts,
            kind: AnomalyKind::HighFlow,
            severity: Severity::High,
            observed_value: 50.0,
            expected_value: 10.0,
            deviation_pct: 400.0,
            detected_at: Utc::now(),
            resolved_at: None,
        };
        assert!(storage.insert_anomaly(&anomaly).await.unwrap());
        assert!(!storage.insert_anomaly(&anomaly).await.unwrap());

        let all = storage.query_anomalies(&AnomalyQuery::default()).await.unwrap();
        assert_eq!(all.len(), 1);

        let critical = storage
            .query_anomalies(&AnomalyQuery {
                min_severity: Some(Severity::Critical),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(critical.is_empty());

        let id = all[0].id.unwrap();
        assert!(storage.resolve_anomaly(id, Utc::now()).await.unwrap());
        let open = storage
            .query_anomalies(&AnomalyQuery {
                unresolved_only: true,
                node_ids: vec!["N1".into()],
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(open.is_empty());
    }

    #[tokio::test]
    async fn test_promote_demotes_previous_active() {
        let storage = test_storage().await;
        storage.insert_model(&model("m1", "flow_forecast", 1, ModelStatus::Active)).await.unwrap();
        storage.insert_model(&model("m2", "flow_forecast", 2, ModelStatus::Shadow)).await.unwrap();

        let demoted = storage
            .promote_model("m2", "flow_forecast", Some("m1"), Utc::now())
            .await
            .unwrap();
        assert_eq!(demoted.as_deref(), Some("m1"));
        assert_eq!(storage.count_active_models("flow_forecast").await.unwrap(), 1);
        assert_eq!(
            storage.get_model("m1").await.unwrap().unwrap().status,
            ModelStatus::Retired
        );

        // Stale expectation is rejected and leaves state untouched
        storage.insert_model(&model("m3", "flow_forecast", 3, ModelStatus::Shadow)).await.unwrap();
        let err = storage
            .promote_model("m3", "flow_forecast", Some("m1"), Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ConcurrencyConflict(_)));
        assert_eq!(
            storage.active_model("flow_forecast").await.unwrap().unwrap().model_id,
            "m2"
        );
    }

    #[tokio::test]
    async fn test_transition_rejects_illegal_moves() {
        let storage = test_storage().await;
        storage.insert_model(&model("m1", "t", 1, ModelStatus::Created)).await.unwrap();
        let err = storage
            .transition_model("m1", ModelStatus::Created, ModelStatus::Shadow, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition(_)));

        storage
            .transition_model("m1", ModelStatus::Created, ModelStatus::Training, None, None)
            .await
            .unwrap();
        let err = storage
            .transition_model("m1", ModelStatus::Created, ModelStatus::Training, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ConcurrencyConflict(_)));
    }

    #[tokio::test]
    async fn test_fill_actuals_and_live_error() {
        let storage = test_storage().await;
        let target = Resolution::Hourly.bucket_start(Utc::now() - ChronoDuration::hours(3));
        storage
            .write_batch(&[reading("N1", target + ChronoDuration::minutes(2), 12.0)], WriteMode::SkipExisting)
            .await
            .unwrap();

        let p = Prediction {
            model_id: "m1".into(),
            node_id: "N1".into(),
            issued_at: target - ChronoDuration::hours(1),
            target_time: target,
            predicted_value: 10.0,
            lower_bound: 8.0,
            upper_bound: 12.0,
            confidence: 0.9,
            actual_value: None,
        };
        storage.upsert_predictions(&[p.clone(), p]).await.unwrap();
        let filled = storage
            .fill_prediction_actuals("m1", Metric::Flow, ChronoDuration::minutes(30), Utc::now())
            .await
            .unwrap();
        assert_eq!(filled, 1);

        let (mae, n) = storage.live_error("m1", target - ChronoDuration::hours(1)).await.unwrap();
        assert_eq!(n, 1);
        assert_eq!(mae, Some(2.0));
    }

    #[tokio::test]
    async fn test_watermarks_and_settings() {
        let storage = test_storage().await;
        assert!(storage.get_watermark("recent_sync").await.unwrap().is_none());
        let ts = from_ms(to_ms(Utc::now()));
        storage.set_watermark("recent_sync", ts).await.unwrap();
        assert_eq!(storage.get_watermark("recent_sync").await.unwrap(), Some(ts));

        storage.put_setting("k", &vec![1, 2, 3]).await.unwrap();
        let v: Option<Vec<i32>> = storage.get_setting("k").await.unwrap();
        assert_eq!(v, Some(vec![1, 2, 3]));
    }
}
