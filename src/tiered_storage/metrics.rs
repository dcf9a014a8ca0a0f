//! Metrics and Monitoring for Tiered Storage
//!
//! Per-tier access statistics plus a monitor that raises alerts when a tier
//! drifts outside its latency or hit-rate envelope.

use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

use super::traits::TierMetricsSnapshot;
use crate::types::TierKind;

const ACCESS_SAMPLE_WINDOW: usize = 1000;
const MAX_ALERTS: usize = 100;

/// Rolling access statistics kept by every tier
#[derive(Debug, Default)]
pub struct AccessStats {
    access_count: u64,
    hit_count: u64,
    miss_count: u64,
    eviction_count: u64,
    /// Recent access times for percentile calculation
    access_times_us: VecDeque<u64>,
}

impl AccessStats {
    pub fn record_access(&mut self, duration_us: u64, hit: bool) {
        self.access_count += 1;
        if hit {
            self.hit_count += 1;
        } else {
            self.miss_count += 1;
        }

        self.access_times_us.push_back(duration_us);
        if self.access_times_us.len() > ACCESS_SAMPLE_WINDOW {
            self.access_times_us.pop_front();
        }
    }

    pub fn record_evictions(&mut self, n: u64) {
        self.eviction_count += n;
    }

    /// Build a snapshot; `record_count` is supplied by the tier
    pub fn snapshot(&self, record_count: u64) -> TierMetricsSnapshot {
        let mut sorted: Vec<u64> = self.access_times_us.iter().copied().collect();
        sorted.sort_unstable();

        let avg_access_time_us = if sorted.is_empty() {
            0
        } else {
            sorted.iter().sum::<u64>() / sorted.len() as u64
        };

        TierMetricsSnapshot {
            record_count,
            access_count: self.access_count,
            hit_count: self.hit_count,
            miss_count: self.miss_count,
            avg_access_time_us,
            p95_access_time_us: calculate_percentile(&sorted, 95.0),
            p99_access_time_us: calculate_percentile(&sorted, 99.0),
            eviction_count: self.eviction_count,
        }
    }
}

/// Percentile from sorted access times
pub fn calculate_percentile(sorted_times: &[u64], percentile: f64) -> u64 {
    if sorted_times.is_empty() {
        return 0;
    }
    let index = ((sorted_times.len() as f64 - 1.0) * percentile / 100.0) as usize;
    sorted_times[index]
}

/// Thresholds for tier performance monitoring
#[derive(Debug, Clone)]
pub struct TierThresholds {
    /// Maximum acceptable P95 access time in microseconds
    pub max_p95_us: u64,

    /// Maximum acceptable P99 access time in microseconds
    pub max_p99_us: u64,

    /// Minimum acceptable hit rate (0.0 to 1.0)
    pub min_hit_rate: f64,

    /// Hit rate is not judged below this many accesses
    pub min_accesses: u64,
}

impl TierThresholds {
    pub fn for_tier(tier: TierKind) -> Self {
        match tier {
            TierKind::Hot => Self {
                max_p95_us: 1_000,
                max_p99_us: 2_000,
                min_hit_rate: 0.50,
                min_accesses: 20,
            },
            TierKind::Warm => Self {
                max_p95_us: 10_000,
                max_p99_us: 20_000,
                min_hit_rate: 0.80,
                min_accesses: 20,
            },
            TierKind::Cold => Self {
                max_p95_us: 100_000,
                max_p99_us: 200_000,
                min_hit_rate: 0.50,
                min_accesses: 20,
            },
        }
    }
}

/// Alert generated when thresholds are exceeded
#[derive(Debug, Clone)]
pub struct TierAlert {
    pub tier: TierKind,
    pub severity: AlertSeverity,
    pub message: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

/// Aggregated metrics across all tiers
#[derive(Debug, Clone, Default)]
pub struct TierMetrics {
    pub hot: Option<TierMetricsSnapshot>,
    pub warm: Option<TierMetricsSnapshot>,
    pub cold: Option<TierMetricsSnapshot>,
}

impl TierMetrics {
    pub fn get(&self, tier: TierKind) -> Option<&TierMetricsSnapshot> {
        match tier {
            TierKind::Hot => self.hot.as_ref(),
            TierKind::Warm => self.warm.as_ref(),
            TierKind::Cold => self.cold.as_ref(),
        }
    }
}

/// Keeps the last alerts raised against each tier's envelope
pub struct TierMonitor {
    alerts: Arc<RwLock<Vec<TierAlert>>>,
}

impl TierMonitor {
    pub fn new() -> Self {
        Self {
            alerts: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Compare every collected snapshot with its tier's thresholds
    pub async fn check_metrics(&self, metrics: &TierMetrics) {
        for tier in [TierKind::Hot, TierKind::Warm, TierKind::Cold] {
            if let Some(snapshot) = metrics.get(tier) {
                self.check_tier_metrics(tier, snapshot, &TierThresholds::for_tier(tier))
                    .await;
            }
        }
    }

    async fn check_tier_metrics(
        &self,
        tier: TierKind,
        metrics: &TierMetricsSnapshot,
        thresholds: &TierThresholds,
    ) {
        let now = chrono::Utc::now().timestamp();
        let mut raised = Vec::new();

        if metrics.p95_access_time_us > thresholds.max_p95_us {
            raised.push((
                AlertSeverity::Warning,
                format!(
                    "P95 access time {}µs exceeds threshold {}µs",
                    metrics.p95_access_time_us, thresholds.max_p95_us
                ),
            ));
        }

        if metrics.p99_access_time_us > thresholds.max_p99_us {
            raised.push((
                AlertSeverity::Critical,
                format!(
                    "P99 access time {}µs exceeds threshold {}µs",
                    metrics.p99_access_time_us, thresholds.max_p99_us
                ),
            ));
        }

        let hit_rate = metrics.hit_rate() / 100.0;
        if metrics.access_count >= thresholds.min_accesses && hit_rate < thresholds.min_hit_rate {
            raised.push((
                AlertSeverity::Warning,
                format!(
                    "Hit rate {:.2}% is below threshold {:.2}%",
                    hit_rate * 100.0,
                    thresholds.min_hit_rate * 100.0
                ),
            ));
        }

        if raised.is_empty() {
            return;
        }

        let mut alerts = self.alerts.write().await;
        for (severity, message) in raised {
            warn!("{} tier: {}", tier, message);
            alerts.push(TierAlert {
                tier,
                severity,
                message,
                timestamp: now,
            });
        }

        if alerts.len() > MAX_ALERTS {
            let excess = alerts.len() - MAX_ALERTS;
            alerts.drain(0..excess);
        }
    }

    pub async fn get_alerts(&self) -> Vec<TierAlert> {
        self.alerts.read().await.clone()
    }

    pub fn log_metrics_summary(&self, metrics: &TierMetrics) {
        for tier in [TierKind::Hot, TierKind::Warm, TierKind::Cold] {
            if let Some(m) = metrics.get(tier) {
                info!(
                    "{} tier: {} records, {:.1}% hits, p95 {}µs, p99 {}µs, {} evictions",
                    tier,
                    m.record_count,
                    m.hit_rate(),
                    m.p95_access_time_us,
                    m.p99_access_time_us,
                    m.eviction_count
                );
            }
        }
    }
}

impl Default for TierMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_monitor_alerts_on_threshold_violation() {
        let monitor = TierMonitor::new();

        let bad_metrics = TierMetricsSnapshot {
            record_count: 100,
            access_count: 100,
            hit_count: 30,
            miss_count: 70,
            avg_access_time_us: 2000,
            p95_access_time_us: 3000,
            p99_access_time_us: 5000,
            eviction_count: 10,
        };

        let metrics = TierMetrics {
            hot: Some(bad_metrics),
            warm: None,
            cold: None,
        };

        monitor.check_metrics(&metrics).await;

        let alerts = monitor.get_alerts().await;
        assert_eq!(alerts.len(), 3, "P95, P99 and hit rate should all alert");
        assert!(alerts.iter().all(|a| a.tier == TierKind::Hot));
        assert!(alerts.iter().any(|a| a.severity == AlertSeverity::Critical));
    }

    #[tokio::test]
    async fn test_hit_rate_not_judged_on_few_accesses() {
        let monitor = TierMonitor::new();
        let metrics = TierMetrics {
            warm: Some(TierMetricsSnapshot {
                access_count: 3,
                miss_count: 3,
                ..Default::default()
            }),
            ..Default::default()
        };

        monitor.check_metrics(&metrics).await;
        assert!(monitor.get_alerts().await.is_empty());
    }

    #[test]
    fn test_access_stats_percentiles() {
        let mut stats = AccessStats::default();
        for i in 1..=100 {
            stats.record_access(i, i % 2 == 0);
        }
        let snap = stats.snapshot(7);
        assert_eq!(snap.record_count, 7);
        assert_eq!(snap.access_count, 100);
        assert_eq!(snap.hit_count, 50);
        assert_eq!(snap.p95_access_time_us, 95);
        assert_eq!(snap.p99_access_time_us, 99);
        assert_eq!(snap.hit_rate(), 50.0);
    }
}
