//! Cold Archive Storage
//!
//! Day-partitioned JSON-lines archive holding the full multi-year history.
//! Layout: `<base>/<table>/<YYYY-MM-DD>.jsonl`, plus a `nodes.jsonl` catalog.
//! The engine writes the canonical table; any number of external source
//! tables with their own column layouts are read through `SourceSchema`.
//! Target access time: <100ms

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::metrics::AccessStats;
use super::traits::{StorageTier, TierMetricsSnapshot, TierRead, WriteMode, WriteOutcome};
use crate::aggregate::rollup_points;
use crate::config::{ColdConfig, SourceSchema};
use crate::error::{EngineError, EngineResult};
use crate::normalize::{canonical_row, normalize_row, parse_timestamp};
use crate::types::{to_ms, Node, Provenance, RangeQuery, Reading, SeriesPoint, TierKind};

const NODES_FILE: &str = "nodes.jsonl";

/// Readings normalized from one table scan
#[derive(Debug, Default)]
pub struct TableScan {
    pub readings: Vec<Reading>,
    /// Rows that could not be parsed or normalized
    pub rejected: u64,
}

/// Cold storage tier over JSON-lines day partitions
pub struct ColdArchiveStorage {
    base_path: PathBuf,
    canonical_table: String,
    schemas: HashMap<String, SourceSchema>,
    write_lock: Mutex<()>,
    stats: Arc<RwLock<AccessStats>>,
}

impl ColdArchiveStorage {
    pub async fn new(
        base_path: impl AsRef<Path>,
        canonical_table: &str,
        sources: Vec<SourceSchema>,
    ) -> EngineResult<Self> {
        let base_path = base_path.as_ref().to_path_buf();
        info!("Initializing ColdArchiveStorage at: {}", base_path.display());

        tokio::fs::create_dir_all(base_path.join(canonical_table)).await?;

        let mut schemas: HashMap<String, SourceSchema> = sources
            .into_iter()
            .map(|s| (s.name.clone(), s))
            .collect();
        schemas.insert(canonical_table.to_string(), SourceSchema::canonical(canonical_table));

        Ok(Self {
            base_path,
            canonical_table: canonical_table.to_string(),
            schemas,
            write_lock: Mutex::new(()),
            stats: Arc::new(RwLock::new(AccessStats::default())),
        })
    }

    pub async fn from_config(config: &ColdConfig) -> EngineResult<Self> {
        Self::new(&config.base_path, &config.canonical_table, config.sources.clone()).await
    }

    pub fn canonical_table(&self) -> &str {
        &self.canonical_table
    }

    /// Registered table names, canonical first
    pub fn tables(&self) -> Vec<String> {
        let mut others: Vec<String> = self
            .schemas
            .keys()
            .filter(|t| **t != self.canonical_table)
            .cloned()
            .collect();
        others.sort();
        std::iter::once(self.canonical_table.clone()).chain(others).collect()
    }

    pub fn schema(&self, table: &str) -> Option<&SourceSchema> {
        self.schemas.get(table)
    }

    fn table_dir(&self, table: &str) -> PathBuf {
        self.base_path.join(table)
    }

    fn day_file(&self, table: &str, day: NaiveDate) -> PathBuf {
        self.table_dir(table).join(format!("{}.jsonl", day.format("%Y-%m-%d")))
    }

    /// Day partitions of a table overlapping `[start, end)`, oldest first
    async fn partitions(
        &self,
        table: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> EngineResult<Vec<(NaiveDate, PathBuf)>> {
        let dir = self.table_dir(table);
        if tokio::fs::metadata(&dir).await.is_err() {
            return Ok(Vec::new());
        }

        let first = start.date_naive();
        let last = (end - ChronoDuration::milliseconds(1)).date_naive();
        let mut days = Vec::new();
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) != Some("jsonl") {
                continue;
            }
            let day = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok());
            if let Some(day) = day {
                if day >= first && day <= last {
                    days.push((day, path));
                }
            }
        }
        days.sort_by_key(|(day, _)| *day);
        Ok(days)
    }

    async fn read_rows(path: &Path) -> EngineResult<(Vec<Value>, u64)> {
        let content = match tokio::fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
            Err(e) => return Err(e.into()),
        };
        let mut rows = Vec::new();
        let mut rejected = 0;
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str::<Value>(line) {
                Ok(v) => rows.push(v),
                Err(_) => rejected += 1,
            }
        }
        Ok((rows, rejected))
    }

    /// Normalized readings of one table in `[start, end)`, optionally for one
    /// node. Duplicate keys resolve to the last line written.
    pub async fn scan_table(
        &self,
        table: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        node_id: Option<&str>,
    ) -> EngineResult<TableScan> {
        let schema = self
            .schemas
            .get(table)
            .ok_or_else(|| EngineError::NotFound(format!("cold table '{}'", table)))?;

        let received = Utc::now();
        let mut by_key: BTreeMap<(String, i64), Reading> = BTreeMap::new();
        let mut rejected = 0;

        for (_, path) in self.partitions(table, start, end).await? {
            let (rows, bad_lines) = Self::read_rows(&path).await?;
            rejected += bad_lines;
            for row in rows {
                match normalize_row(schema, &row, Provenance::ColdSync, received) {
                    Ok(r) => {
                        if r.timestamp < start || r.timestamp >= end {
                            continue;
                        }
                        if node_id.map_or(false, |n| n != r.node_id) {
                            continue;
                        }
                        by_key.insert(r.key(), r);
                    }
                    Err(e) => {
                        rejected += 1;
                        debug!("Rejected row in cold table {}: {}", table, e);
                    }
                }
            }
        }

        if rejected > 0 {
            warn!("Cold table {}: {} rows rejected during scan", table, rejected);
        }
        Ok(TableScan {
            readings: by_key.into_values().collect(),
            rejected,
        })
    }

    /// Readings for one node across every registered table; the canonical
    /// table wins where tables overlap
    async fn scan_node(
        &self,
        node_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> EngineResult<Vec<Reading>> {
        let mut merged: BTreeMap<i64, Reading> = BTreeMap::new();
        for table in self.tables().into_iter().rev() {
            for r in self.scan_table(&table, start, end, Some(node_id)).await?.readings {
                merged.insert(to_ms(r.timestamp), r);
            }
        }
        Ok(merged.into_values().collect())
    }

    /// Append raw rows to a registered table, partitioned by their timestamp
    pub async fn append_rows(&self, table: &str, rows: &[Value]) -> EngineResult<u64> {
        let schema = self
            .schemas
            .get(table)
            .ok_or_else(|| EngineError::NotFound(format!("cold table '{}'", table)))?;

        let mut by_day: BTreeMap<NaiveDate, Vec<String>> = BTreeMap::new();
        for row in rows {
            let cell = row.get(&schema.timestamp_column).ok_or_else(|| {
                EngineError::DataIntegrity(format!("row without '{}'", schema.timestamp_column))
            })?;
            let ts = parse_timestamp(cell, schema.timestamp_format)?;
            by_day
                .entry(ts.date_naive())
                .or_default()
                .push(serde_json::to_string(row)?);
        }

        let _guard = self.write_lock.lock().await;
        tokio::fs::create_dir_all(self.table_dir(table)).await?;
        let mut written = 0;
        for (day, lines) in by_day {
            self.append_lines(&self.day_file(table, day), &lines).await?;
            written += lines.len() as u64;
        }
        Ok(written)
    }

    async fn append_lines(&self, path: &Path, lines: &[String]) -> EngineResult<()> {
        let mut payload = lines.join("\n");
        payload.push('\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        file.write_all(payload.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    /// Upsert nodes into the catalog (last writer wins per node)
    pub async fn write_nodes(&self, nodes: &[Node]) -> EngineResult<()> {
        let _guard = self.write_lock.lock().await;
        let mut catalog: BTreeMap<String, Node> = self
            .read_nodes()
            .await?
            .into_iter()
            .map(|n| (n.node_id.clone(), n))
            .collect();
        for node in nodes {
            catalog.insert(node.node_id.clone(), node.clone());
        }
        let lines = catalog
            .values()
            .map(serde_json::to_string)
            .collect::<Result<Vec<_>, _>>()?;
        let mut payload = lines.join("\n");
        payload.push('\n');
        tokio::fs::write(self.base_path.join(NODES_FILE), payload).await?;
        Ok(())
    }

    pub async fn read_nodes(&self) -> EngineResult<Vec<Node>> {
        let (rows, rejected) = Self::read_rows(&self.base_path.join(NODES_FILE)).await?;
        if rejected > 0 {
            warn!("Node catalog: {} malformed lines skipped", rejected);
        }
        Ok(rows
            .into_iter()
            .filter_map(|v| serde_json::from_value::<Node>(v).ok())
            .collect())
    }

    async fn record_access(&self, started: Instant, hit: bool) {
        let duration_us = started.elapsed().as_micros() as u64;
        self.stats.write().await.record_access(duration_us, hit);
    }

    async fn canonical_files(&self) -> EngineResult<Vec<PathBuf>> {
        let mut files: Vec<PathBuf> = self
            .partitions(
                &self.canonical_table,
                DateTime::<Utc>::MIN_UTC,
                DateTime::<Utc>::MAX_UTC,
            )
            .await?
            .into_iter()
            .map(|(_, p)| p)
            .collect();
        files.sort();
        Ok(files)
    }
}

#[async_trait]
impl StorageTier for ColdArchiveStorage {
    async fn read_range(&self, query: &RangeQuery) -> EngineResult<TierRead> {
        let started = Instant::now();
        let raw: Vec<SeriesPoint> = self
            .scan_node(&query.node_id, query.start, query.end)
            .await?
            .iter()
            .map(SeriesPoint::from)
            .collect();
        let points = rollup_points(&raw, query.resolution);

        self.record_access(started, !points.is_empty()).await;
        debug!(
            "Cold read for {} returned {} points in {}µs",
            query.node_id,
            points.len(),
            started.elapsed().as_micros()
        );
        Ok(TierRead::complete(points))
    }

    async fn write_batch(&self, readings: &[Reading], mode: WriteMode) -> EngineResult<WriteOutcome> {
        let mut by_day: BTreeMap<NaiveDate, Vec<&Reading>> = BTreeMap::new();
        for r in readings {
            by_day.entry(r.timestamp.date_naive()).or_default().push(r);
        }

        let schema = SourceSchema::canonical(&self.canonical_table);
        let _guard = self.write_lock.lock().await;
        tokio::fs::create_dir_all(self.table_dir(&self.canonical_table)).await?;

        let mut outcome = WriteOutcome::default();
        for (day, day_readings) in by_day {
            let path = self.day_file(&self.canonical_table, day);
            let mut existing: HashSet<(String, i64)> = HashSet::new();
            if mode == WriteMode::SkipExisting {
                let (rows, _) = Self::read_rows(&path).await?;
                existing = rows
                    .iter()
                    .filter_map(|row| normalize_row(&schema, row, Provenance::ColdSync, Utc::now()).ok())
                    .map(|r| r.key())
                    .collect();
            }

            let mut lines = Vec::new();
            for r in day_readings {
                if existing.insert(r.key()) || mode == WriteMode::Overwrite {
                    lines.push(serde_json::to_string(&canonical_row(r))?);
                    outcome.written += 1;
                } else {
                    outcome.skipped += 1;
                }
            }
            if !lines.is_empty() {
                self.append_lines(&path, &lines).await?;
            }
        }

        debug!(
            "Cold batch appended: {} written, {} skipped",
            outcome.written, outcome.skipped
        );
        Ok(outcome)
    }

    async fn latest(&self, node_id: &str) -> EngineResult<Option<Reading>> {
        let started = Instant::now();
        let mut newest: Option<Reading> = None;

        for table in self.tables() {
            let parts = self
                .partitions(&table, DateTime::<Utc>::MIN_UTC, DateTime::<Utc>::MAX_UTC)
                .await?;
            // Newest partition holding the node is enough for this table
            for (day, _) in parts.into_iter().rev() {
                let day_start = day.and_hms_opt(0, 0, 0).map(|d| d.and_utc());
                let Some(day_start) = day_start else { continue };
                let scan = self
                    .scan_table(&table, day_start, day_start + ChronoDuration::days(1), Some(node_id))
                    .await?;
                if let Some(last) = scan.readings.into_iter().max_by_key(|r| r.timestamp) {
                    if newest.as_ref().map_or(true, |n| last.timestamp > n.timestamp) {
                        newest = Some(last);
                    }
                    break;
                }
            }
        }

        self.record_access(started, newest.is_some()).await;
        Ok(newest)
    }

    async fn count(&self) -> EngineResult<u64> {
        let mut total = 0;
        for path in self.canonical_files().await? {
            let (rows, _) = Self::read_rows(&path).await?;
            total += rows.len() as u64;
        }
        Ok(total)
    }

    async fn get_metrics(&self) -> EngineResult<TierMetricsSnapshot> {
        let record_count = self.count().await?;
        Ok(self.stats.read().await.snapshot(record_count))
    }

    async fn maintenance(&self) -> EngineResult<()> {
        // Compact canonical partitions: drop superseded duplicate lines
        info!("Cold storage maintenance: compacting partitions");
        let schema = SourceSchema::canonical(&self.canonical_table);
        let _guard = self.write_lock.lock().await;

        let mut compacted = 0u64;
        for path in self.canonical_files().await? {
            let (rows, rejected) = Self::read_rows(&path).await?;
            let mut by_key: BTreeMap<(String, i64), Value> = BTreeMap::new();
            for row in rows.iter() {
                if let Ok(r) = normalize_row(&schema, row, Provenance::ColdSync, Utc::now()) {
                    by_key.insert(r.key(), row.clone());
                }
            }
            if by_key.len() == rows.len() && rejected == 0 {
                continue;
            }

            let lines = by_key
                .values()
                .map(serde_json::to_string)
                .collect::<Result<Vec<_>, _>>()?;
            let tmp = path.with_extension("jsonl.tmp");
            let mut payload = lines.join("\n");
            payload.push('\n');
            tokio::fs::write(&tmp, payload).await?;
            tokio::fs::rename(&tmp, &path).await?;
            compacted += (rows.len() - by_key.len()) as u64 + rejected;
        }

        self.stats.write().await.record_evictions(compacted);
        info!("Cold storage maintenance completed ({} lines dropped)", compacted);
        Ok(())
    }

    fn tier(&self) -> TierKind {
        TierKind::Cold
    }

    fn target_access_time(&self) -> Duration {
        Duration::from_millis(100)
    }
}
