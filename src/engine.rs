//! Engine façade
//!
//! Wires the tiers, write buffer, router, anomaly scanner, lifecycle manager
//! and scheduler from one [`EngineConfig`] and exposes the ingest, query and
//! admin surfaces. Every admin action writes an audit row to `sync_jobs`.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::anomaly::AnomalyScanner;
use crate::config::{EngineConfig, RetentionPolicy};
use crate::error::{EngineError, EngineResult};
use crate::lifecycle::{ModelLifecycleManager, ModelTrainer};
use crate::observability::EngineMetrics;
use crate::orchestrator::ShutdownCoordinator;
use crate::scoring::{KpiRegistry, KpiStrategy, KpiValue};
use crate::sync::{record_admin_action, register_default_jobs, JobOutcome, JobStatusView, SyncScheduler, SyncStores};
use crate::tiered_storage::{
    ColdArchiveStorage, HotMemoryStorage, TierAlert, TierRouter, WarmSqliteStorage, WriteBuffer,
};
use crate::types::{Anomaly, AnomalyQuery, Model, Prediction, RangeQuery, Reading, Resolution, Series};

/// Settings key under which operator retention changes are persisted
pub const RETENTION_SETTING: &str = "retention_policy";

/// Hot tier housekeeping and tier health checks
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

pub struct Engine {
    config: Arc<EngineConfig>,
    warm: Arc<WarmSqliteStorage>,
    buffer: Arc<WriteBuffer>,
    router: Arc<TierRouter>,
    scanner: Arc<AnomalyScanner>,
    scheduler: Arc<SyncScheduler>,
    lifecycle: Arc<ModelLifecycleManager>,
    stores: SyncStores,
    kpis: KpiRegistry,
    metrics: Arc<EngineMetrics>,
    shutdown: Mutex<ShutdownCoordinator>,
    started: AtomicBool,
}

impl Engine {
    /// Open all stores and register the default jobs. Background loops are
    /// not running until [`Engine::start`].
    pub async fn open(config: EngineConfig) -> EngineResult<Self> {
        Self::open_with_trainers(config, Vec::new()).await
    }

    /// Like [`Engine::open`], with extra model trainers next to the defaults
    pub async fn open_with_trainers(
        config: EngineConfig,
        trainers: Vec<Arc<dyn ModelTrainer>>,
    ) -> EngineResult<Self> {
        config.validate()?;
        let config = Arc::new(config);

        let metrics = Arc::new(
            EngineMetrics::new().map_err(|e| EngineError::Configuration(format!("metrics registry: {:#}", e)))?,
        );

        let hot = Arc::new(HotMemoryStorage::new(&config.hot));
        let warm = Arc::new(WarmSqliteStorage::from_config(&config.warm).await?);
        let cold = Arc::new(ColdArchiveStorage::from_config(&config.cold).await?);

        let buffer = Arc::new(
            WriteBuffer::new(warm.clone(), config.buffer.clone())
                .with_recorder(warm.clone())
                .with_metrics(metrics.clone()),
        );
        let scanner = Arc::new(AnomalyScanner::new(config.anomaly.clone(), warm.clone()).with_metrics(metrics.clone()));
        let router = Arc::new(
            TierRouter::from_config(hot.clone(), warm.clone(), cold.clone(), buffer.clone(), &config)
                .with_scanner(scanner.clone())
                .with_metrics(metrics.clone()),
        );

        let lifecycle = Arc::new(
            trainers
                .into_iter()
                .fold(
                    ModelLifecycleManager::from_config(warm.clone(), cold.clone(), &config),
                    |manager, trainer| manager.with_trainer(trainer),
                )
                .with_metrics(metrics.clone()),
        );

        let stores = SyncStores::new(hot, warm.clone(), cold, config.clone());
        if let Some(policy) = warm.get_setting::<RetentionPolicy>(RETENTION_SETTING).await? {
            info!("Using persisted retention policy {:?}", policy);
            *stores.retention.write().await = policy;
        }

        let scheduler = Arc::new(SyncScheduler::new(warm.clone(), config.scheduler.clone()).with_metrics(metrics.clone()));
        register_default_jobs(&scheduler, &stores, scanner.clone(), lifecycle.clone()).await?;

        info!(
            "Engine opened: warm={}, cold={}, {} model types",
            config.warm.database_path,
            config.cold.base_path,
            lifecycle.model_types().len()
        );

        Ok(Self {
            config,
            warm,
            buffer,
            router,
            scanner,
            scheduler,
            lifecycle,
            stores,
            kpis: KpiRegistry::new(),
            metrics,
            shutdown: Mutex::new(ShutdownCoordinator::new()),
            started: AtomicBool::new(false),
        })
    }

    /// Spawn the write buffer, scheduler and maintenance loops
    pub async fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("Engine already started");
            return;
        }
        let mut shutdown = self.shutdown.lock().await;

        let buffer = self.buffer.clone();
        shutdown.spawn("write_buffer", move |cancel| buffer.run(cancel));

        let scheduler = self.scheduler.clone();
        shutdown.spawn("scheduler", move |cancel| scheduler.run(cancel));

        let router = self.router.clone();
        shutdown.spawn("tier_maintenance", move |cancel| async move {
            let mut ticker = tokio::time::interval(MAINTENANCE_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = router.run_maintenance().await {
                            warn!("Tier maintenance failed: {}", e);
                        }
                    }
                }
            }
        });

        info!("Engine started with {} background components", shutdown.component_count());
    }

    /// Stop background loops, flush what is still buffered and close the pool
    pub async fn shutdown(&self) {
        self.shutdown.lock().await.shutdown().await;
        if self.buffer.pending_len().await > 0 {
            if let Err(e) = self.buffer.flush().await {
                warn!("Final flush on shutdown failed: {}", e);
            }
        }
        self.warm.close().await;
        info!("Engine stopped");
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn router(&self) -> &Arc<TierRouter> {
        &self.router
    }

    pub fn scheduler(&self) -> &Arc<SyncScheduler> {
        &self.scheduler
    }

    pub fn lifecycle(&self) -> &Arc<ModelLifecycleManager> {
        &self.lifecycle
    }

    pub fn scanner(&self) -> &Arc<AnomalyScanner> {
        &self.scanner
    }

    pub fn warm(&self) -> &Arc<WarmSqliteStorage> {
        &self.warm
    }

    // ------------------------------------------------------------------
    // Ingest
    // ------------------------------------------------------------------

    /// Accept one reading. Durable once a later buffer flush completes.
    pub async fn put_reading(&self, reading: Reading) -> EngineResult<()> {
        self.router.write(reading).await
    }

    /// Persist everything buffered now instead of waiting for a trigger
    pub async fn flush(&self) -> EngineResult<u64> {
        Ok(self.buffer.flush().await?.flushed as u64)
    }

    // ------------------------------------------------------------------
    // Query
    // ------------------------------------------------------------------

    pub async fn get_series(
        &self,
        node_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        resolution: Resolution,
    ) -> EngineResult<Series> {
        self.router
            .read_range(&RangeQuery::new(node_id, start, end, resolution))
            .await
    }

    pub async fn get_latest(&self, node_ids: &[String]) -> EngineResult<HashMap<String, Reading>> {
        self.router.read_latest(node_ids).await
    }

    pub async fn get_anomalies(&self, filter: &AnomalyQuery) -> EngineResult<Vec<Anomaly>> {
        self.warm.query_anomalies(filter).await
    }

    /// Predictions of the active models for `node_id` from now to now + horizon
    pub async fn get_active_predictions(&self, node_id: &str, horizon: ChronoDuration) -> EngineResult<Vec<Prediction>> {
        let now = Utc::now();
        self.warm.active_predictions(node_id, now, now + horizon).await
    }

    pub async fn list_models(&self, model_type: Option<&str>) -> EngineResult<Vec<Model>> {
        self.warm.list_models(model_type).await
    }

    pub async fn tier_alerts(&self) -> Vec<TierAlert> {
        self.router.alerts().await
    }

    /// Prometheus text exposition of this engine's metrics
    pub fn metrics_text(&self) -> String {
        self.metrics.render()
    }

    // ------------------------------------------------------------------
    // KPIs
    // ------------------------------------------------------------------

    pub async fn register_kpi(&self, strategy: Arc<dyn KpiStrategy>) {
        self.kpis.register(strategy).await;
    }

    pub async fn evaluate_kpi(
        &self,
        name: &str,
        node_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        resolution: Resolution,
    ) -> EngineResult<KpiValue> {
        let series = self.get_series(node_id, start, end, resolution).await?;
        self.kpis.evaluate(name, &series).await
    }

    // ------------------------------------------------------------------
    // Admin
    // ------------------------------------------------------------------

    pub async fn list_job_status(&self) -> EngineResult<Vec<JobStatusView>> {
        self.scheduler.list_status().await
    }

    pub async fn pause_job(&self, job_name: &str) -> EngineResult<()> {
        self.scheduler.pause(job_name).await
    }

    pub async fn resume_job(&self, job_name: &str) -> EngineResult<()> {
        self.scheduler.resume(job_name).await
    }

    /// Run a job now, outside its schedule. A job already running is skipped.
    pub async fn trigger_job(&self, job_name: &str, params: Value) -> EngineResult<JobOutcome> {
        self.scheduler.trigger_now(job_name, params).await
    }

    /// Promote a shadow or retired model over the current active one
    pub async fn force_promote(&self, model_id: &str) -> EngineResult<Option<String>> {
        let replaced = self.lifecycle.force_promote(model_id).await?;
        record_admin_action(
            self.warm.as_ref(),
            "force_promote",
            json!({ "model_id": model_id, "replaced": replaced }),
        )
        .await?;
        Ok(replaced)
    }

    pub async fn resolve_anomaly(&self, id: i64) -> EngineResult<bool> {
        let resolved = self.warm.resolve_anomaly(id, Utc::now()).await?;
        record_admin_action(
            self.warm.as_ref(),
            "resolve_anomaly",
            json!({ "anomaly_id": id, "changed": resolved }),
        )
        .await?;
        Ok(resolved)
    }

    pub async fn retention_policy(&self) -> RetentionPolicy {
        self.stores.retention.read().await.clone()
    }

    /// Replace the retention policy; persisted and picked up by the next cleanup run
    pub async fn set_retention_policy(&self, policy: RetentionPolicy) -> EngineResult<()> {
        if policy.sync_job_days == 0
            || policy.resolved_anomaly_days == 0
            || policy.anomaly_auto_resolve_hours == 0
            || policy.quality_report_days == 0
        {
            return Err(EngineError::DataIntegrity(format!(
                "retention windows must be positive: {:?}",
                policy
            )));
        }

        self.warm.put_setting(RETENTION_SETTING, &policy).await?;
        let previous = {
            let mut current = self.stores.retention.write().await;
            std::mem::replace(&mut *current, policy.clone())
        };
        record_admin_action(
            self.warm.as_ref(),
            "set_retention",
            json!({ "previous": previous, "policy": policy }),
        )
        .await?;
        info!("Retention policy updated: {:?}", policy);
        Ok(())
    }
}
