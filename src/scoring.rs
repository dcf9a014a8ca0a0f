//! Injected KPI strategies
//!
//! Domain scores (efficiency, water loss and the like) are not computed by the
//! engine itself. Operators register a [`KpiStrategy`] under a name and the
//! engine feeds it the series it asks for.
//!
//! Contract: a strategy receives one node's [`Series`] for the requested window
//! and resolution, points ordered oldest first, possibly empty and possibly
//! `degraded`. It returns a [`KpiValue`] or an error; it must not perform I/O.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{EngineError, EngineResult};
use crate::types::Series;

/// Result of one KPI evaluation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KpiValue {
    pub name: String,
    pub node_id: String,
    pub value: f64,
    pub unit: Option<String>,
    /// Named intermediate terms the strategy wants to expose
    pub components: BTreeMap<String, f64>,
    /// The input series was served from a degraded tier set
    pub degraded: bool,
}

impl KpiValue {
    pub fn new(name: impl Into<String>, node_id: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            node_id: node_id.into(),
            value,
            unit: None,
            components: BTreeMap::new(),
            degraded: false,
        }
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    pub fn with_component(mut self, key: impl Into<String>, value: f64) -> Self {
        self.components.insert(key.into(), value);
        self
    }
}

/// Trait for KPI strategies
pub trait KpiStrategy: Send + Sync {
    fn name(&self) -> &str;

    /// Compute the KPI from one node's series
    fn evaluate(&self, series: &Series) -> EngineResult<KpiValue>;
}

type KpiFn = dyn Fn(&Series) -> EngineResult<f64> + Send + Sync;

/// Strategy backed by a closure returning the bare value
pub struct FnKpi {
    name: String,
    unit: Option<String>,
    func: Box<KpiFn>,
}

impl FnKpi {
    pub fn new<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&Series) -> EngineResult<f64> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            unit: None,
            func: Box::new(func),
        }
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }
}

impl KpiStrategy for FnKpi {
    fn name(&self) -> &str {
        &self.name
    }

    fn evaluate(&self, series: &Series) -> EngineResult<KpiValue> {
        let value = (self.func)(series)?;
        if !value.is_finite() {
            return Err(EngineError::DataIntegrity(format!(
                "KPI {} produced a non-finite value for {}",
                self.name, series.node_id
            )));
        }
        let mut kpi = KpiValue::new(&self.name, &series.node_id, value);
        kpi.unit = self.unit.clone();
        kpi.degraded = series.degraded;
        Ok(kpi)
    }
}

/// Named strategies, replaceable at runtime
#[derive(Default)]
pub struct KpiRegistry {
    strategies: RwLock<HashMap<String, Arc<dyn KpiStrategy>>>,
}

impl KpiRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace the strategy under its name
    pub async fn register(&self, strategy: Arc<dyn KpiStrategy>) {
        let name = strategy.name().to_string();
        debug!("Registering KPI strategy {}", name);
        self.strategies.write().await.insert(name, strategy);
    }

    pub async fn unregister(&self, name: &str) -> bool {
        self.strategies.write().await.remove(name).is_some()
    }

    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.strategies.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn get(&self, name: &str) -> Option<Arc<dyn KpiStrategy>> {
        self.strategies.read().await.get(name).cloned()
    }

    pub async fn evaluate(&self, name: &str, series: &Series) -> EngineResult<KpiValue> {
        let strategy = self
            .get(name)
            .await
            .ok_or_else(|| EngineError::NotFound(format!("KPI strategy '{}'", name)))?;
        let mut kpi = strategy.evaluate(series)?;
        kpi.degraded |= series.degraded;
        Ok(kpi)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Metric, Reading, Resolution, SeriesPoint};
    use chrono::{Duration, TimeZone, Utc};

    fn series(flows: &[f64]) -> Series {
        let start = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        Series {
            node_id: "N1".into(),
            start,
            end: start + Duration::hours(flows.len() as i64),
            resolution: Resolution::Raw,
            points: flows
                .iter()
                .enumerate()
                .map(|(i, f)| SeriesPoint::from(&Reading::new("N1", start + Duration::hours(i as i64)).with_flow(*f)))
                .collect(),
            sources: Vec::new(),
            degraded: false,
        }
    }

    fn total_flow() -> Arc<dyn KpiStrategy> {
        Arc::new(FnKpi::new("total_flow", |s: &Series| Ok(s.values(Metric::Flow).iter().sum())).with_unit("m3"))
    }

    #[tokio::test]
    async fn test_registered_strategy_is_evaluated() {
        let registry = KpiRegistry::new();
        registry.register(total_flow()).await;

        let kpi = registry.evaluate("total_flow", &series(&[1.0, 2.0, 3.5])).await.unwrap();
        assert_eq!(kpi.value, 6.5);
        assert_eq!(kpi.unit.as_deref(), Some("m3"));
        assert_eq!(kpi.node_id, "N1");
        assert_eq!(registry.names().await, vec!["total_flow".to_string()]);
    }

    #[tokio::test]
    async fn test_unknown_strategy_is_not_found() {
        let registry = KpiRegistry::new();
        assert!(matches!(
            registry.evaluate("efficiency", &series(&[1.0])).await,
            Err(EngineError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_non_finite_value_rejected() {
        let registry = KpiRegistry::new();
        registry
            .register(Arc::new(FnKpi::new("ratio", |s: &Series| {
                Ok(s.values(Metric::Flow).iter().sum::<f64>() / 0.0)
            })))
            .await;
        assert!(registry.evaluate("ratio", &series(&[1.0])).await.is_err());
    }

    #[tokio::test]
    async fn test_degraded_series_marks_kpi() {
        let registry = KpiRegistry::new();
        registry.register(total_flow()).await;
        let mut s = series(&[1.0]);
        s.degraded = true;
        assert!(registry.evaluate("total_flow", &s).await.unwrap().degraded);
    }
}
