//! Statistical anomaly detection
//!
//! Inline mode keeps a rolling window per (node, metric) and tests each new
//! value against the window it is about to join. Batch mode re-tests a stored
//! window against that window's own statistics, which catches what a rolling
//! state reset (restart, eviction) let through. Both modes go through the same
//! sigma rule and record via an [`AnomalySink`] that deduplicates on
//! (node, timestamp, kind).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::AnomalyConfig;
use crate::error::EngineResult;
use crate::observability::EngineMetrics;
use crate::types::{Anomaly, AnomalyKind, Metric, Reading, Severity};

/// Destination for detected anomalies
#[async_trait]
pub trait AnomalySink: Send + Sync {
    /// Returns false when an anomaly with the same (node, timestamp, kind)
    /// was already recorded
    async fn record_anomaly(&self, anomaly: &Anomaly) -> EngineResult<bool>;
}

/// Mean and population standard deviation of a sample
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowStats {
    pub mean: f64,
    pub stddev: f64,
    pub count: usize,
}

impl WindowStats {
    pub fn from_values<'a>(values: impl IntoIterator<Item = &'a f64>) -> Option<Self> {
        let values: Vec<f64> = values.into_iter().copied().collect();
        if values.is_empty() {
            return None;
        }
        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        Some(Self {
            mean,
            stddev: variance.sqrt(),
            count: values.len(),
        })
    }
}

/// z-score of `value` against `stats` if it breaks the sigma rule
pub fn evaluate(value: f64, stats: &WindowStats, config: &AnomalyConfig) -> Option<f64> {
    if stats.count < config.min_samples {
        return None;
    }
    let std_floor = stats
        .stddev
        .max(stats.mean.abs() * config.min_stddev_ratio)
        .max(1e-9);
    let z = (value - stats.mean) / std_floor;
    if z.abs() <= config.sigma_threshold {
        return None;
    }
    // An idle node reading zero is not "low"
    if z < 0.0 && stats.mean.abs() <= config.min_low_mean {
        return None;
    }
    Some(z)
}

fn build_anomaly(
    node_id: &str,
    timestamp: DateTime<Utc>,
    metric: Metric,
    value: f64,
    stats: &WindowStats,
    z: f64,
) -> Option<Anomaly> {
    let kind = AnomalyKind::for_metric(metric, z > 0.0)?;
    let deviation_pct = if stats.mean.abs() > 1e-9 {
        (value - stats.mean) / stats.mean.abs() * 100.0
    } else {
        100.0 * z.signum()
    };
    Some(Anomaly {
        id: None,
        node_id: node_id.to_string(),
        timestamp,
        kind,
        severity: Severity::from_z_score(z),
        observed_value: value,
        expected_value: stats.mean,
        deviation_pct,
        detected_at: Utc::now(),
        resolved_at: None,
    })
}

pub struct AnomalyScanner {
    config: AnomalyConfig,
    windows: Mutex<HashMap<(String, Metric), VecDeque<f64>>>,
    sink: Arc<dyn AnomalySink>,
    metrics: Option<Arc<EngineMetrics>>,
}

impl AnomalyScanner {
    pub fn new(config: AnomalyConfig, sink: Arc<dyn AnomalySink>) -> Self {
        Self {
            config,
            windows: Mutex::new(HashMap::new()),
            sink,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<EngineMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &AnomalyConfig {
        &self.config
    }

    async fn record(&self, candidates: Vec<Anomaly>) -> EngineResult<Vec<Anomaly>> {
        let mut recorded = Vec::new();
        for anomaly in candidates {
            if self.sink.record_anomaly(&anomaly).await? {
                if let Some(m) = &self.metrics {
                    m.anomalies_detected
                        .with_label_values(&[anomaly.kind.as_str()])
                        .inc();
                }
                info!(
                    "Anomaly {} on {} at {}: observed {:.3}, expected {:.3} ({:?})",
                    anomaly.kind.as_str(),
                    anomaly.node_id,
                    anomaly.timestamp,
                    anomaly.observed_value,
                    anomaly.expected_value,
                    anomaly.severity
                );
                recorded.push(anomaly);
            }
        }
        Ok(recorded)
    }

    /// Inline check of a freshly written reading. Returns anomalies newly
    /// recorded for it.
    pub async fn observe(&self, reading: &Reading) -> EngineResult<Vec<Anomaly>> {
        let candidates = {
            let mut windows = self.windows.lock().await;
            let mut found = Vec::new();
            for metric in &self.config.metrics {
                let Some(value) = reading.value(*metric) else {
                    continue;
                };
                let window = windows
                    .entry((reading.node_id.clone(), *metric))
                    .or_insert_with(|| VecDeque::with_capacity(self.config.window_size + 1));

                if let Some(stats) = WindowStats::from_values(window.iter()) {
                    if let Some(z) = evaluate(value, &stats, &self.config) {
                        found.extend(build_anomaly(
                            &reading.node_id,
                            reading.timestamp,
                            *metric,
                            value,
                            &stats,
                            z,
                        ));
                    }
                }

                window.push_back(value);
                while window.len() > self.config.window_size {
                    window.pop_front();
                }
            }
            found
        };

        if candidates.is_empty() {
            return Ok(Vec::new());
        }
        self.record(candidates).await
    }

    /// Batch check of a stored window for one node against the window's own
    /// statistics
    pub async fn scan_window(&self, node_id: &str, readings: &[Reading]) -> EngineResult<Vec<Anomaly>> {
        let own: Vec<&Reading> = readings.iter().filter(|r| r.node_id == node_id).collect();
        let mut candidates = Vec::new();
        for metric in &self.config.metrics {
            let values: Vec<f64> = own.iter().filter_map(|r| r.value(*metric)).collect();
            let Some(stats) = WindowStats::from_values(values.iter()) else {
                continue;
            };
            for reading in own.iter().copied() {
                let Some(value) = reading.value(*metric) else {
                    continue;
                };
                if let Some(z) = evaluate(value, &stats, &self.config) {
                    candidates.extend(build_anomaly(
                        node_id,
                        reading.timestamp,
                        *metric,
                        value,
                        &stats,
                        z,
                    ));
                }
            }
        }

        debug!(
            "Batch scan of {} ({} readings): {} candidates",
            node_id,
            readings.len(),
            candidates.len()
        );
        self.record(candidates).await
    }

    /// Samples currently held in the rolling window
    pub async fn rolling_len(&self, node_id: &str, metric: Metric) -> usize {
        self.windows
            .lock()
            .await
            .get(&(node_id.to_string(), metric))
            .map_or(0, |w| w.len())
    }

    /// Drop all rolling state
    pub async fn reset(&self) {
        self.windows.lock().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> AnomalyConfig {
        AnomalyConfig {
            min_samples: 10,
            window_size: 10,
            ..AnomalyConfig::default()
        }
    }

    #[test]
    fn test_min_sample_guard() {
        let stats = WindowStats {
            mean: 10.0,
            stddev: 1.0,
            count: 9,
        };
        assert!(evaluate(100.0, &stats, &cfg()).is_none());
        let stats = WindowStats { count: 10, ..stats };
        assert!(evaluate(100.0, &stats, &cfg()).is_some());
    }

    #[test]
    fn test_idle_node_not_flagged_low() {
        let stats = WindowStats {
            mean: 0.1,
            stddev: 0.01,
            count: 48,
        };
        assert!(evaluate(0.0, &stats, &cfg()).is_none());

        let busy = WindowStats {
            mean: 20.0,
            stddev: 1.0,
            count: 48,
        };
        let z = evaluate(0.0, &busy, &cfg()).unwrap();
        assert!(z < -3.0);
    }

    #[test]
    fn test_flat_signal_uses_stddev_floor() {
        let stats = WindowStats::from_values([10.0; 20].iter()).unwrap();
        assert_eq!(stats.stddev, 0.0);
        // 0.05 away is within 3 * (10 * 0.01)
        assert!(evaluate(10.05, &stats, &cfg()).is_none());
        let z = evaluate(50.0, &stats, &cfg()).unwrap();
        assert!(z.is_finite());
        assert_eq!(Severity::from_z_score(z), Severity::Critical);
    }

    #[test]
    fn test_deviation_pct() {
        let stats = WindowStats {
            mean: 10.0,
            stddev: 1.0,
            count: 48,
        };
        let a = build_anomaly("N1", Utc::now(), Metric::Flow, 50.0, &stats, 40.0).unwrap();
        assert_eq!(a.kind, AnomalyKind::HighFlow);
        assert_eq!(a.deviation_pct, 400.0);
        assert!(build_anomaly("N1", Utc::now(), Metric::Temperature, 50.0, &stats, 40.0).is_none());
    }
}
