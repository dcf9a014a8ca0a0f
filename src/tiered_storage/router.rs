//! Tier router
//!
//! Façade over the three tiers. Writes go to the hot tier (best effort) and the
//! write buffer; reads are planned by data age and fall through towards colder
//! tiers only, with warm/cold results cached back into the hot tier.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, instrument, warn};

use super::hot_storage::{HotMemoryStorage, RealtimeStats};
use super::metrics::{TierAlert, TierMetrics, TierMonitor};
use super::traits::{StorageTier, TierRead, WriteMode};
use super::write_buffer::WriteBuffer;
use crate::aggregate::merge_points;
use crate::anomaly::AnomalyScanner;
use crate::config::{EngineConfig, RouterConfig};
use crate::error::{EngineError, EngineResult};
use crate::observability::EngineMetrics;
use crate::types::{RangeQuery, Reading, Series, SeriesPoint, TierKind};

/// Points answered for one planned segment
#[derive(Debug, Default)]
struct SegmentRead {
    points: Vec<SeriesPoint>,
    sources: Vec<TierKind>,
    degraded: bool,
}

pub struct TierRouter {
    hot: Arc<HotMemoryStorage>,
    warm: Arc<dyn StorageTier>,
    cold: Arc<dyn StorageTier>,
    buffer: Arc<WriteBuffer>,
    scanner: Option<Arc<AnomalyScanner>>,
    monitor: TierMonitor,
    config: RouterConfig,
    hot_horizon: ChronoDuration,
    warm_horizon: ChronoDuration,
    metrics: Option<Arc<EngineMetrics>>,
}

impl TierRouter {
    pub fn new(
        hot: Arc<HotMemoryStorage>,
        warm: Arc<dyn StorageTier>,
        cold: Arc<dyn StorageTier>,
        buffer: Arc<WriteBuffer>,
        config: RouterConfig,
    ) -> Self {
        Self {
            hot,
            warm,
            cold,
            buffer,
            scanner: None,
            monitor: TierMonitor::new(),
            config,
            hot_horizon: ChronoDuration::hours(24),
            warm_horizon: ChronoDuration::days(90),
            metrics: None,
        }
    }

    /// Router with horizons and timeouts taken from the engine config
    pub fn from_config(
        hot: Arc<HotMemoryStorage>,
        warm: Arc<dyn StorageTier>,
        cold: Arc<dyn StorageTier>,
        buffer: Arc<WriteBuffer>,
        config: &EngineConfig,
    ) -> Self {
        Self::new(hot, warm, cold, buffer, config.router.clone()).with_horizons(
            ChronoDuration::hours(config.hot.retention_hours as i64),
            ChronoDuration::days(config.warm.retention_days as i64),
        )
    }

    pub fn with_horizons(mut self, hot: ChronoDuration, warm: ChronoDuration) -> Self {
        self.hot_horizon = hot;
        self.warm_horizon = warm.max(hot);
        self
    }

    pub fn with_scanner(mut self, scanner: Arc<AnomalyScanner>) -> Self {
        self.scanner = Some(scanner);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<EngineMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn hot(&self) -> &Arc<HotMemoryStorage> {
        &self.hot
    }

    pub fn warm(&self) -> &Arc<dyn StorageTier> {
        &self.warm
    }

    pub fn cold(&self) -> &Arc<dyn StorageTier> {
        &self.cold
    }

    pub fn buffer(&self) -> &Arc<WriteBuffer> {
        &self.buffer
    }

    pub fn scanner(&self) -> Option<&Arc<AnomalyScanner>> {
        self.scanner.as_ref()
    }

    fn budget(&self, tier: TierKind) -> Duration {
        Duration::from_millis(match tier {
            TierKind::Hot => self.config.hot_timeout_ms,
            TierKind::Warm => self.config.warm_timeout_ms,
            TierKind::Cold => self.config.cold_timeout_ms,
        })
    }

    fn store(&self, tier: TierKind) -> &dyn StorageTier {
        match tier {
            TierKind::Hot => self.hot.as_ref(),
            TierKind::Warm => self.warm.as_ref(),
            TierKind::Cold => self.cold.as_ref(),
        }
    }

    /// Ingest one reading. Rejected readings return `DataIntegrity`; anything
    /// accepted is queued for the warm tier even if the hot write fails.
    #[instrument(skip(self, reading), fields(node = %reading.node_id))]
    pub async fn write(&self, mut reading: Reading) -> EngineResult<()> {
        let now = Utc::now();
        if let Err(e) = reading.validate(now) {
            if let Some(m) = &self.metrics {
                m.readings_rejected.inc();
            }
            warn!("Rejected reading: {}", e);
            return Err(e);
        }
        reading.received_at = now;

        let budget = self.budget(TierKind::Hot);
        match timeout(
            budget,
            self.hot
                .write_batch(std::slice::from_ref(&reading), WriteMode::SkipExisting),
        )
        .await
        {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!("Hot write failed for {}: {}", reading.node_id, e),
            Err(_) => warn!("Hot write for {} timed out after {:?}", reading.node_id, budget),
        }
        self.hot.record_realtime(&reading).await;

        let scan_copy = self.scanner.as_ref().map(|_| reading.clone());
        self.buffer.enqueue(reading).await;
        if let Some(m) = &self.metrics {
            m.readings_ingested.inc();
        }

        if let (Some(scanner), Some(reading)) = (&self.scanner, scan_copy) {
            if let Err(e) = scanner.observe(&reading).await {
                warn!("Inline anomaly check failed for {}: {}", reading.node_id, e);
            }
        }
        Ok(())
    }

    /// Split a range at the tier age boundaries, aligned to buckets.
    /// Segments come back oldest first.
    fn plan(&self, query: &RangeQuery, now: DateTime<Utc>) -> Vec<(TierKind, RangeQuery)> {
        let hot_boundary = query.resolution.bucket_start(now - self.hot_horizon);
        let warm_boundary = query.resolution.bucket_start(now - self.warm_horizon);

        let bounds = [
            (TierKind::Cold, query.start, query.end.min(warm_boundary)),
            (
                TierKind::Warm,
                query.start.max(warm_boundary),
                query.end.min(hot_boundary),
            ),
            (TierKind::Hot, query.start.max(hot_boundary), query.end),
        ];

        bounds
            .into_iter()
            .filter(|(_, start, end)| start < end)
            .map(|(tier, start, end)| {
                (
                    tier,
                    RangeQuery::new(query.node_id.clone(), start, end, query.resolution),
                )
            })
            .collect()
    }

    async fn read_tier(&self, tier: TierKind, query: &RangeQuery) -> EngineResult<TierRead> {
        let budget = self.budget(tier);
        match timeout(budget, self.store(tier).read_range(query)).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::timeout(format!("{} tier", tier), budget)),
        }
    }

    fn count_fallthrough(&self, tier: TierKind) {
        if let Some(m) = &self.metrics {
            m.tier_fallthroughs
                .with_label_values(&[&tier.to_string()])
                .inc();
        }
    }

    /// Serve one segment from its starting tier, falling through colder
    async fn read_segment(&self, start_tier: TierKind, query: &RangeQuery) -> EngineResult<SegmentRead> {
        if start_tier != TierKind::Hot {
            if let Some(points) = self.hot.cached_range(query).await {
                return Ok(SegmentRead {
                    points,
                    sources: vec![TierKind::Hot],
                    degraded: false,
                });
            }
        }

        let mut carried: Vec<SeriesPoint> = Vec::new();
        let mut sources = Vec::new();
        let mut last_error: Option<EngineError> = None;

        for tier in start_tier.fallthrough_chain() {
            match self.read_tier(*tier, query).await {
                Ok(read) if read.partial => {
                    // Hot data that does not reach back to the range start
                    if !read.points.is_empty() {
                        sources.push(*tier);
                        carried = merge_points(read.points, carried);
                    }
                    self.count_fallthrough(*tier);
                }
                Ok(read) if read.points.is_empty() => {
                    debug!("{} tier empty for {} {:?}", tier, query.node_id, query.resolution);
                    self.count_fallthrough(*tier);
                }
                Ok(read) => {
                    sources.push(*tier);
                    let points = merge_points(carried, read.points);

                    if *tier != TierKind::Hot
                        && start_tier != TierKind::Hot
                        && self.config.populate_hot_on_read
                    {
                        // Fire and forget; the read never waits on the cache
                        let hot = self.hot.clone();
                        let key = query.clone();
                        let cached = points.clone();
                        tokio::spawn(async move {
                            hot.cache_range(key, cached).await;
                        });
                    }

                    return Ok(SegmentRead {
                        points,
                        sources,
                        degraded: false,
                    });
                }
                Err(e) => {
                    warn!("{} tier read failed for {}: {}", tier, query.node_id, e);
                    self.count_fallthrough(*tier);
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) if carried.is_empty() => Err(e),
            failed => Ok(SegmentRead {
                points: carried,
                sources,
                degraded: failed.is_some(),
            }),
        }
    }

    /// Range read with per-segment fall-through. Segments that fail on every
    /// tier degrade the series; only a read with no segment answered errors.
    #[instrument(skip(self), fields(node = %query.node_id))]
    pub async fn read_range(&self, query: &RangeQuery) -> EngineResult<Series> {
        let now = Utc::now();
        if query.is_empty_range() || query.start > now {
            return Ok(Series::empty(query));
        }

        let segments = self.plan(query, now);
        let results = join_all(
            segments
                .iter()
                .map(|(tier, segment)| self.read_segment(*tier, segment)),
        )
        .await;

        let mut series = Series::empty(query);
        let mut answered = 0;
        let mut last_error = None;
        for result in results {
            match result {
                Ok(segment) => {
                    answered += 1;
                    series.points.extend(segment.points);
                    for tier in segment.sources {
                        if !series.sources.contains(&tier) {
                            series.sources.push(tier);
                        }
                    }
                    series.degraded |= segment.degraded;
                }
                Err(e) => {
                    series.degraded = true;
                    last_error = Some(e);
                }
            }
        }

        series.sources.sort_by_key(|tier| match tier {
            TierKind::Hot => 0,
            TierKind::Warm => 1,
            TierKind::Cold => 2,
        });

        if answered == 0 {
            if let Some(e) = last_error {
                return Err(EngineError::transient(
                    "tier router",
                    format!("all tiers exhausted for {}: {}", query.node_id, e),
                ));
            }
        }
        if series.degraded {
            if let Some(m) = &self.metrics {
                m.degraded_reads.inc();
            }
        }
        Ok(series)
    }

    /// Latest reading per node: hot tier, then warm for nodes hot doesn't hold
    pub async fn read_latest(&self, node_ids: &[String]) -> EngineResult<HashMap<String, Reading>> {
        let mut latest = HashMap::new();
        let mut missing = Vec::new();

        for node_id in node_ids {
            match timeout(self.budget(TierKind::Hot), self.hot.latest(node_id)).await {
                Ok(Ok(Some(reading))) => {
                    latest.insert(node_id.clone(), reading);
                }
                _ => missing.push(node_id),
            }
        }

        for node_id in missing {
            match timeout(self.budget(TierKind::Warm), self.warm.latest(node_id)).await {
                Ok(Ok(Some(reading))) => {
                    self.hot.update_latest(&reading).await;
                    latest.insert(node_id.clone(), reading);
                }
                Ok(Ok(None)) => {}
                Ok(Err(e)) => warn!("Warm latest lookup failed for {}: {}", node_id, e),
                Err(_) => warn!("Warm latest lookup timed out for {}", node_id),
            }
        }

        Ok(latest)
    }

    pub async fn realtime_stats(&self, node_id: &str) -> Option<RealtimeStats> {
        self.hot.realtime(node_id).await
    }

    /// Collect metrics from all tiers
    pub async fn collect_metrics(&self) -> TierMetrics {
        let mut metrics = TierMetrics::default();
        for tier in [TierKind::Hot, TierKind::Warm, TierKind::Cold] {
            let snapshot = match timeout(self.budget(tier), self.store(tier).get_metrics()).await {
                Ok(Ok(snapshot)) => Some(snapshot),
                Ok(Err(e)) => {
                    warn!("Could not collect {} tier metrics: {}", tier, e);
                    None
                }
                Err(_) => None,
            };
            match tier {
                TierKind::Hot => metrics.hot = snapshot,
                TierKind::Warm => metrics.warm = snapshot,
                TierKind::Cold => metrics.cold = snapshot,
            }
        }
        metrics
    }

    /// Trim the hot tier, then check every tier against its thresholds
    pub async fn run_maintenance(&self) -> EngineResult<TierMetrics> {
        self.hot.maintenance().await?;
        let metrics = self.collect_metrics().await;
        self.monitor.check_metrics(&metrics).await;
        self.monitor.log_metrics_summary(&metrics);
        Ok(metrics)
    }

    pub async fn alerts(&self) -> Vec<TierAlert> {
        self.monitor.get_alerts().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BufferConfig;
    use crate::tiered_storage::traits::{TierMetricsSnapshot, WriteOutcome};
    use crate::types::Resolution;
    use async_trait::async_trait;

    struct EmptyTier(TierKind);

    #[async_trait]
    impl StorageTier for EmptyTier {
        async fn read_range(&self, _query: &RangeQuery) -> EngineResult<TierRead> {
            Ok(TierRead::default())
        }
        async fn write_batch(&self, readings: &[Reading], _mode: WriteMode) -> EngineResult<WriteOutcome> {
            Ok(WriteOutcome {
                written: readings.len() as u64,
                skipped: 0,
            })
        }
        async fn latest(&self, _node_id: &str) -> EngineResult<Option<Reading>> {
            Ok(None)
        }
        async fn count(&self) -> EngineResult<u64> {
            Ok(0)
        }
        async fn get_metrics(&self) -> EngineResult<TierMetricsSnapshot> {
            Ok(TierMetricsSnapshot::default())
        }
        async fn maintenance(&self) -> EngineResult<()> {
            Ok(())
        }
        fn tier(&self) -> TierKind {
            self.0
        }
        fn target_access_time(&self) -> Duration {
            Duration::from_millis(1)
        }
    }

    fn router() -> TierRouter {
        let warm: Arc<dyn StorageTier> = Arc::new(EmptyTier(TierKind::Warm));
        let cold: Arc<dyn StorageTier> = Arc::new(EmptyTier(TierKind::Cold));
        let buffer = Arc::new(WriteBuffer::new(warm.clone(), BufferConfig::default()));
        TierRouter::new(
            Arc::new(HotMemoryStorage::with_defaults()),
            warm,
            cold,
            buffer,
            RouterConfig::default(),
        )
    }

    #[test]
    fn test_plan_splits_at_age_boundaries() {
        let r = router();
        let now = Utc::now();
        let q = RangeQuery::new(
            "N1",
            now - ChronoDuration::days(120),
            now,
            Resolution::Raw,
        );
        let plan = r.plan(&q, now);
        let tiers: Vec<TierKind> = plan.iter().map(|(t, _)| *t).collect();
        assert_eq!(tiers, vec![TierKind::Cold, TierKind::Warm, TierKind::Hot]);
        assert_eq!(plan[0].1.end, plan[1].1.start);
        assert_eq!(plan[1].1.end, plan[2].1.start);
        assert_eq!(plan[2].1.start, now - ChronoDuration::hours(24));
    }

    #[test]
    fn test_plan_recent_range_is_hot_only() {
        let r = router();
        let now = Utc::now();
        let q = RangeQuery::new("N1", now - ChronoDuration::hours(2), now, Resolution::Raw);
        let plan = r.plan(&q, now);
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].0, TierKind::Hot);
    }

    #[tokio::test]
    async fn test_empty_and_future_ranges() {
        let r = router();
        let now = Utc::now();
        let empty = RangeQuery::new("N1", now, now, Resolution::Raw);
        let series = r.read_range(&empty).await.unwrap();
        assert!(series.is_empty());
        assert!(!series.degraded);

        let future = RangeQuery::new(
            "N1",
            now + ChronoDuration::hours(1),
            now + ChronoDuration::hours(2),
            Resolution::Raw,
        );
        assert!(r.read_range(&future).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_write_rejects_invalid_reading() {
        let r = router();
        let bad = Reading::new("N1", Utc::now()).with_quality(1.5).with_flow(1.0);
        assert!(matches!(
            r.write(bad).await,
            Err(EngineError::DataIntegrity(_))
        ));
        assert_eq!(r.buffer().pending_len().await, 0);

        r.write(Reading::new("N1", Utc::now()).with_flow(2.0)).await.unwrap();
        assert_eq!(r.buffer().pending_len().await, 1);
        let latest = r.read_latest(&["N1".to_string()]).await.unwrap();
        assert_eq!(latest["N1"].flow, Some(2.0));
    }
}
