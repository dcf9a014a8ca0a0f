//! Hot Memory Storage
//!
//! In-memory tier holding the most recent readings per node, the latest-value
//! snapshot, a read-through cache of range results served by colder tiers and
//! rolling real-time counters.
//! Target access time: <1ms

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Timelike, Utc};
use moka::future::Cache;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::debug;

use super::metrics::AccessStats;
use super::traits::{StorageTier, TierMetricsSnapshot, TierRead, WriteMode, WriteOutcome};
use crate::aggregate::rollup_points;
use crate::config::HotConfig;
use crate::error::EngineResult;
use crate::types::{to_ms, RangeQuery, Reading, SeriesPoint, TierKind};

/// Sorted recent readings for one node
#[derive(Debug, Default)]
struct NodeWindow {
    points: BTreeMap<i64, Reading>,
    /// Every write for this node since this instant is held
    coverage_start: Option<DateTime<Utc>>,
}

impl NodeWindow {
    /// Drop points older than `cutoff`; returns how many were removed
    fn trim(&mut self, cutoff: DateTime<Utc>) -> u64 {
        let keep = self.points.split_off(&to_ms(cutoff));
        let removed = self.points.len() as u64;
        self.points = keep;
        if let Some(start) = self.coverage_start {
            if start < cutoff {
                self.coverage_start = Some(cutoff);
            }
        }
        removed
    }
}

/// Running min/max/mean over the current hour
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq)]
pub struct RunningStat {
    pub count: u64,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    pub last: f64,
}

impl RunningStat {
    fn push(&mut self, value: f64) {
        if self.count == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.count += 1;
        self.mean += (value - self.mean) / self.count as f64;
        self.last = value;
    }
}

/// Rolling counters for one node, reset at each hour boundary
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RealtimeStats {
    pub node_id: String,
    pub hour_start: DateTime<Utc>,
    pub readings: u64,
    pub last_timestamp: DateTime<Utc>,
    pub flow: RunningStat,
    pub pressure: RunningStat,
}

impl RealtimeStats {
    fn new(node_id: &str, hour_start: DateTime<Utc>) -> Self {
        Self {
            node_id: node_id.to_string(),
            hour_start,
            readings: 0,
            last_timestamp: hour_start,
            flow: RunningStat::default(),
            pressure: RunningStat::default(),
        }
    }
}

/// Hot storage tier built on moka caches
pub struct HotMemoryStorage {
    latest: Cache<String, Arc<Reading>>,
    windows: Cache<String, Arc<RwLock<NodeWindow>>>,
    range_cache: Cache<RangeQuery, Arc<Vec<SeriesPoint>>>,
    realtime: Cache<String, Arc<RwLock<RealtimeStats>>>,
    stats: Arc<RwLock<AccessStats>>,
    retention: ChronoDuration,
}

impl HotMemoryStorage {
    pub fn new(config: &HotConfig) -> Self {
        tracing::info!(
            "Initializing HotMemoryStorage: max_nodes={}, retention={}h",
            config.max_nodes,
            config.retention_hours
        );

        Self {
            latest: Cache::builder().max_capacity(config.max_nodes).build(),
            windows: Cache::builder().max_capacity(config.max_nodes).build(),
            range_cache: Cache::builder()
                .max_capacity(config.query_cache_capacity)
                .time_to_live(Duration::from_secs(config.query_cache_ttl_secs))
                .support_invalidation_closures()
                .build(),
            realtime: Cache::builder().max_capacity(config.max_nodes).build(),
            stats: Arc::new(RwLock::new(AccessStats::default())),
            retention: ChronoDuration::hours(config.retention_hours as i64),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(&HotConfig::default())
    }

    /// Run pending cache maintenance tasks
    pub async fn sync_cache(&self) {
        self.latest.run_pending_tasks().await;
        self.windows.run_pending_tasks().await;
        self.range_cache.run_pending_tasks().await;
        self.realtime.run_pending_tasks().await;
    }

    async fn record_access(&self, started: Instant, hit: bool) {
        let duration_us = started.elapsed().as_micros() as u64;
        self.stats.write().await.record_access(duration_us, hit);
    }

    async fn window(&self, node_id: &str) -> Arc<RwLock<NodeWindow>> {
        self.windows
            .get_with(node_id.to_string(), async {
                Arc::new(RwLock::new(NodeWindow::default()))
            })
            .await
    }

    async fn bump_latest(&self, reading: &Reading) {
        let newer = match self.latest.get(reading.node_id.as_str()).await {
            Some(current) => reading.timestamp >= current.timestamp,
            None => true,
        };
        if newer {
            self.latest
                .insert(reading.node_id.clone(), Arc::new(reading.clone()))
                .await;
        }
    }

    /// Update the latest-value snapshot if `reading` is newer than what is held
    pub async fn update_latest(&self, reading: &Reading) {
        self.bump_latest(reading).await;
    }

    /// Load a contiguous window from a colder tier. The caller guarantees
    /// `readings` holds every persisted reading for the node since `from`.
    pub async fn load_window(&self, node_id: &str, from: DateTime<Utc>, readings: &[Reading]) -> u64 {
        let cutoff = Utc::now() - self.retention;
        let from = from.max(cutoff);
        let window = self.window(node_id).await;
        let mut loaded = 0;
        {
            let mut w = window.write().await;
            for reading in readings.iter().filter(|r| r.node_id == node_id && r.timestamp >= from) {
                if let std::collections::btree_map::Entry::Vacant(slot) =
                    w.points.entry(to_ms(reading.timestamp))
                {
                    slot.insert(reading.clone());
                    loaded += 1;
                }
            }
            w.coverage_start = Some(match w.coverage_start {
                Some(existing) => existing.min(from),
                None => from,
            });
        }
        if let Some(newest) = readings.iter().filter(|r| r.node_id == node_id).max_by_key(|r| r.timestamp) {
            self.bump_latest(newest).await;
        }
        debug!("Loaded {} readings into hot window for {}", loaded, node_id);
        loaded
    }

    /// Earliest instant from which the hot tier holds every write for the node
    pub async fn coverage_start(&self, node_id: &str) -> Option<DateTime<Utc>> {
        match self.windows.get(node_id).await {
            Some(window) => window.read().await.coverage_start,
            None => None,
        }
    }

    /// Withdraw the coverage claim for a node when rows reached a colder tier
    /// without passing through hot. Later range reads are merged with warm
    /// until the window is reloaded. Returns whether the claim was dropped.
    pub async fn release_coverage(&self, node_id: &str, readings: &[Reading]) -> bool {
        let newest = match readings.iter().filter(|r| r.node_id == node_id).map(|r| r.timestamp).max() {
            Some(ts) => ts,
            None => return false,
        };
        let window = match self.windows.get(node_id).await {
            Some(window) => window,
            None => return false,
        };
        let mut w = window.write().await;
        match w.coverage_start {
            Some(start) if newest >= start => {
                w.coverage_start = None;
                debug!("Hot coverage for {} released by rows up to {}", node_id, newest);
                true
            }
            _ => false,
        }
    }

    /// Range result previously served by a colder tier
    pub async fn cached_range(&self, query: &RangeQuery) -> Option<Vec<SeriesPoint>> {
        let started = Instant::now();
        let hit = self.range_cache.get(query).await;
        self.record_access(started, hit.is_some()).await;
        hit.map(|points| points.as_ref().clone())
    }

    pub async fn cache_range(&self, query: RangeQuery, points: Vec<SeriesPoint>) {
        self.range_cache.insert(query, Arc::new(points)).await;
    }

    /// Drop cached range results for a node (after a re-sync changed its history)
    pub fn invalidate_node_ranges(&self, node_id: &str) {
        let node = node_id.to_string();
        if let Err(e) = self
            .range_cache
            .invalidate_entries_if(move |key, _| key.node_id == node)
        {
            debug!("Range cache invalidation for {} not registered: {}", node_id, e);
        }
    }

    /// Update the rolling per-hour counters with a live reading
    pub async fn record_realtime(&self, reading: &Reading) {
        let hour_start = reading
            .timestamp
            .with_minute(0)
            .and_then(|t| t.with_second(0))
            .and_then(|t| t.with_nanosecond(0))
            .unwrap_or(reading.timestamp);

        let entry = self
            .realtime
            .get_with(reading.node_id.clone(), async {
                Arc::new(RwLock::new(RealtimeStats::new(&reading.node_id, hour_start)))
            })
            .await;

        let mut stats = entry.write().await;
        if hour_start > stats.hour_start {
            *stats = RealtimeStats::new(&reading.node_id, hour_start);
        } else if hour_start < stats.hour_start {
            // Late reading from an hour already rolled over
            return;
        }
        stats.readings += 1;
        stats.last_timestamp = stats.last_timestamp.max(reading.timestamp);
        if let Some(v) = reading.flow {
            stats.flow.push(v);
        }
        if let Some(v) = reading.pressure {
            stats.pressure.push(v);
        }
    }

    pub async fn realtime(&self, node_id: &str) -> Option<RealtimeStats> {
        match self.realtime.get(node_id).await {
            Some(entry) => Some(entry.read().await.clone()),
            None => None,
        }
    }

    async fn trim_all(&self) -> u64 {
        let cutoff = Utc::now() - self.retention;
        let windows: Vec<Arc<RwLock<NodeWindow>>> = self.windows.iter().map(|(_, w)| w).collect();
        let mut removed = 0;
        for window in windows {
            removed += window.write().await.trim(cutoff);
        }
        removed
    }
}

#[async_trait]
impl StorageTier for HotMemoryStorage {
    async fn read_range(&self, query: &RangeQuery) -> EngineResult<TierRead> {
        let started = Instant::now();

        let window = match self.windows.get(query.node_id.as_str()).await {
            Some(window) => window,
            None => {
                self.record_access(started, false).await;
                return Ok(TierRead::default());
            }
        };

        let (raw, partial) = {
            let w = window.read().await;
            let raw: Vec<SeriesPoint> = w
                .points
                .range(to_ms(query.start)..to_ms(query.end))
                .map(|(_, r)| SeriesPoint::from(r))
                .collect();
            let partial = w.coverage_start.map_or(true, |c| c > query.start);
            (raw, partial)
        };

        self.record_access(started, !raw.is_empty()).await;

        Ok(TierRead {
            points: rollup_points(&raw, query.resolution),
            partial,
        })
    }

    async fn write_batch(&self, readings: &[Reading], mode: WriteMode) -> EngineResult<WriteOutcome> {
        let cutoff = Utc::now() - self.retention;
        let mut outcome = WriteOutcome::default();

        for reading in readings {
            if reading.timestamp < cutoff {
                outcome.skipped += 1;
                continue;
            }
            let window = self.window(&reading.node_id).await;
            {
                let mut w = window.write().await;
                if w.coverage_start.is_none() {
                    w.coverage_start = Some(reading.timestamp);
                }
                let key = to_ms(reading.timestamp);
                if mode == WriteMode::SkipExisting && w.points.contains_key(&key) {
                    outcome.skipped += 1;
                } else {
                    w.points.insert(key, reading.clone());
                    outcome.written += 1;
                }
            }
            self.bump_latest(reading).await;
        }

        Ok(outcome)
    }

    async fn latest(&self, node_id: &str) -> EngineResult<Option<Reading>> {
        let started = Instant::now();
        let result = self.latest.get(node_id).await;
        self.record_access(started, result.is_some()).await;
        Ok(result.map(|r| r.as_ref().clone()))
    }

    async fn count(&self) -> EngineResult<u64> {
        let windows: Vec<Arc<RwLock<NodeWindow>>> = self.windows.iter().map(|(_, w)| w).collect();
        let mut total = 0;
        for window in windows {
            total += window.read().await.points.len() as u64;
        }
        Ok(total)
    }

    async fn get_metrics(&self) -> EngineResult<TierMetricsSnapshot> {
        let record_count = self.count().await?;
        Ok(self.stats.read().await.snapshot(record_count))
    }

    async fn maintenance(&self) -> EngineResult<()> {
        let removed = self.trim_all().await;
        self.stats.write().await.record_evictions(removed);
        self.sync_cache().await;
        debug!("Hot storage maintenance completed, trimmed {} readings", removed);
        Ok(())
    }

    fn tier(&self) -> TierKind {
        TierKind::Hot
    }

    fn target_access_time(&self) -> Duration {
        Duration::from_micros(1000)
    }
}
