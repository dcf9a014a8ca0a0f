//! Forecasting models and their trainers
//!
//! A trainer turns sampled readings into a boxed [`Forecaster`] and knows how
//! to reload one from its serialized artifact. Training is CPU-bound and runs
//! on the blocking pool, so trainers are synchronous.

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{EngineError, EngineResult};
use crate::types::{Metric, Reading};

/// One forecast value with its interval
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Forecast {
    pub value: f64,
    pub lower: f64,
    pub upper: f64,
    pub confidence: f64,
}

pub trait Forecaster: Send + Sync {
    /// Forecast for one node at `target`; `None` if the model knows nothing
    /// usable for that node
    fn predict(&self, node_id: &str, target: DateTime<Utc>) -> Option<Forecast>;

    /// Serialized artifact
    fn to_bytes(&self) -> EngineResult<Vec<u8>>;
}

pub trait ModelTrainer: Send + Sync {
    fn model_type(&self) -> &str;

    fn target_metric(&self) -> Metric;

    /// Fewest training readings worth fitting on
    fn min_samples(&self) -> usize;

    fn train(&self, samples: &[Reading]) -> EngineResult<Box<dyn Forecaster>>;

    fn load(&self, artifact: &[u8]) -> EngineResult<Box<dyn Forecaster>>;
}

/// Running mean/variance for one profile slot (Welford)
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SlotStats {
    pub count: u64,
    pub mean: f64,
    m2: f64,
}

impl SlotStats {
    fn push(&mut self, value: f64) {
        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (value - self.mean);
    }

    pub fn stddev(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            (self.m2 / self.count as f64).sqrt()
        }
    }
}

/// Hour-of-day profile per node with a network-wide fallback
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeasonalProfile {
    pub metric: Metric,
    nodes: HashMap<String, Vec<SlotStats>>,
    global: Vec<SlotStats>,
}

/// Profile slots need this many samples before the node-level value is used
const MIN_SLOT_SAMPLES: u64 = 3;

impl SeasonalProfile {
    pub fn fit(metric: Metric, samples: &[Reading]) -> Self {
        let mut nodes: HashMap<String, Vec<SlotStats>> = HashMap::new();
        let mut global = vec![SlotStats::default(); 24];
        for r in samples {
            let Some(value) = r.value(metric) else {
                continue;
            };
            let hour = r.timestamp.hour() as usize;
            nodes
                .entry(r.node_id.clone())
                .or_insert_with(|| vec![SlotStats::default(); 24])[hour]
                .push(value);
            global[hour].push(value);
        }
        Self {
            metric,
            nodes,
            global,
        }
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    fn slot(&self, node_id: &str, hour: usize) -> Option<&SlotStats> {
        self.nodes
            .get(node_id)
            .map(|slots| &slots[hour])
            .filter(|s| s.count >= MIN_SLOT_SAMPLES)
            .or_else(|| Some(&self.global[hour]).filter(|s| s.count > 0))
    }
}

impl Forecaster for SeasonalProfile {
    fn predict(&self, node_id: &str, target: DateTime<Utc>) -> Option<Forecast> {
        let stats = self.slot(node_id, target.hour() as usize)?;
        let spread = 1.96 * stats.stddev();
        Some(Forecast {
            value: stats.mean,
            lower: stats.mean - spread,
            upper: stats.mean + spread,
            confidence: (stats.count as f64 / (stats.count as f64 + 10.0)).min(0.99),
        })
    }

    fn to_bytes(&self) -> EngineResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Default trainer: seasonal hour-of-day profile of one metric
pub struct SeasonalProfileTrainer {
    model_type: String,
    metric: Metric,
    min_samples: usize,
}

impl SeasonalProfileTrainer {
    pub fn new(model_type: impl Into<String>, metric: Metric, min_samples: usize) -> Self {
        Self {
            model_type: model_type.into(),
            metric,
            min_samples,
        }
    }
}

impl ModelTrainer for SeasonalProfileTrainer {
    fn model_type(&self) -> &str {
        &self.model_type
    }

    fn target_metric(&self) -> Metric {
        self.metric
    }

    fn min_samples(&self) -> usize {
        self.min_samples
    }

    fn train(&self, samples: &[Reading]) -> EngineResult<Box<dyn Forecaster>> {
        let usable = samples.iter().filter(|r| r.value(self.metric).is_some()).count();
        if usable < self.min_samples {
            return Err(EngineError::ModelValidation(format!(
                "{}: {} usable samples, need {}",
                self.model_type, usable, self.min_samples
            )));
        }
        Ok(Box::new(SeasonalProfile::fit(self.metric, samples)))
    }

    fn load(&self, artifact: &[u8]) -> EngineResult<Box<dyn Forecaster>> {
        let profile: SeasonalProfile = serde_json::from_slice(artifact)?;
        if profile.metric != self.metric {
            return Err(EngineError::DataIntegrity(format!(
                "artifact forecasts {} but {} targets {}",
                profile.metric, self.model_type, self.metric
            )));
        }
        Ok(Box::new(profile))
    }
}
