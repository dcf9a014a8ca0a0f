//! Model lifecycle manager
//!
//! Drives each model type through
//! `created -> training -> validating -> {shadow | created} -> active <-> retired`.
//! All state lives in the warm store's `models` table; the only in-memory state
//! is a cache of deserialized forecasters keyed by model id. Exactly one active
//! model per type is enforced by the store's promote transaction.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::forecaster::{Forecaster, ModelTrainer, SeasonalProfileTrainer};
use super::sampling::{mean_absolute_error, sample_readings, sampling_horizon, split_holdout, HOLDOUT_RATIO};
use crate::config::{EngineConfig, LifecycleConfig};
use crate::error::{EngineError, EngineResult};
use crate::observability::EngineMetrics;
use crate::tiered_storage::{ColdArchiveStorage, WarmSqliteStorage};
use crate::types::{Metric, Model, ModelMetrics, ModelStatus, Prediction, Reading, Resolution};
use crate::utils::retry_transient;

/// How far from a prediction's target a reading may be to count as its actual
const ACTUAL_MATCH_TOLERANCE_MINUTES: i64 = 15;

/// Why a model type is due for a new candidate
#[derive(Debug, Clone, PartialEq)]
pub enum RetrainReason {
    NoActiveModel,
    Age { days: i64 },
    Degraded { live_mae: f64, baseline_mae: f64 },
    Drift { mean: f64, baseline_mean: f64, baseline_std: f64 },
}

impl fmt::Display for RetrainReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetrainReason::NoActiveModel => write!(f, "no active model"),
            RetrainReason::Age { days } => write!(f, "active model is {} days old", days),
            RetrainReason::Degraded { live_mae, baseline_mae } => write!(
                f,
                "live MAE {:.4} degraded from baseline {:.4}",
                live_mae, baseline_mae
            ),
            RetrainReason::Drift {
                mean,
                baseline_mean,
                baseline_std,
            } => write!(
                f,
                "input mean {:.4} drifted from {:.4} (std {:.4})",
                mean, baseline_mean, baseline_std
            ),
        }
    }
}

/// What validation decided for a freshly trained candidate
#[derive(Debug, Clone, PartialEq)]
pub enum CandidateOutcome {
    /// No active model existed, the candidate went straight to active
    Promoted,
    Shadowed,
    Rejected(String),
}

/// Result of reviewing the shadow models of one type
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ShadowReview {
    pub promoted: Vec<String>,
    /// Shadows retired for losing or for thin samples, plus demoted actives
    pub retired: Vec<String>,
    pub pending: Vec<String>,
}

/// Summary of one scheduled cycle across all model types
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub model_types: u64,
    pub failures: u64,
    pub trained: u64,
    pub promoted: Vec<String>,
    pub retired: Vec<String>,
    pub predictions: u64,
}

pub struct ModelLifecycleManager {
    warm: Arc<WarmSqliteStorage>,
    cold: Arc<ColdArchiveStorage>,
    trainers: Vec<Arc<dyn ModelTrainer>>,
    config: LifecycleConfig,
    /// Readings older than this live only in the cold tier
    warm_horizon: ChronoDuration,
    artifact_dir: PathBuf,
    loaded: RwLock<HashMap<String, Arc<dyn Forecaster>>>,
    metrics: Option<Arc<EngineMetrics>>,
}

impl ModelLifecycleManager {
    pub fn new(
        warm: Arc<WarmSqliteStorage>,
        cold: Arc<ColdArchiveStorage>,
        config: LifecycleConfig,
        warm_horizon: ChronoDuration,
    ) -> Self {
        let artifact_dir = PathBuf::from(&config.artifact_dir);
        Self {
            warm,
            cold,
            trainers: Vec::new(),
            config,
            warm_horizon,
            artifact_dir,
            loaded: RwLock::new(HashMap::new()),
            metrics: None,
        }
    }

    /// Manager with the default seasonal flow and pressure forecasters
    pub fn from_config(
        warm: Arc<WarmSqliteStorage>,
        cold: Arc<ColdArchiveStorage>,
        config: &EngineConfig,
    ) -> Self {
        let min = config.lifecycle.min_training_samples;
        Self::new(
            warm,
            cold,
            config.lifecycle.clone(),
            ChronoDuration::days(config.warm.retention_days as i64),
        )
        .with_trainer(Arc::new(SeasonalProfileTrainer::new("flow_seasonal", Metric::Flow, min)))
        .with_trainer(Arc::new(SeasonalProfileTrainer::new(
            "pressure_seasonal",
            Metric::Pressure,
            min,
        )))
    }

    pub fn with_trainer(mut self, trainer: Arc<dyn ModelTrainer>) -> Self {
        self.trainers.retain(|t| t.model_type() != trainer.model_type());
        self.trainers.push(trainer);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<EngineMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn model_types(&self) -> Vec<String> {
        self.trainers.iter().map(|t| t.model_type().to_string()).collect()
    }

    fn trainer(&self, model_type: &str) -> EngineResult<Arc<dyn ModelTrainer>> {
        self.trainers
            .iter()
            .find(|t| t.model_type() == model_type)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("trainer for model type '{}'", model_type)))
    }

    fn count_promotion(&self) {
        if let Some(m) = &self.metrics {
            m.model_promotions.inc();
        }
    }

    fn count_retirements(&self, n: usize) {
        if let Some(m) = &self.metrics {
            m.model_retirements.inc_by(n as u64);
        }
    }

    /// One pass over every model type. A failing type is logged and counted
    /// without stopping the others.
    pub async fn run_cycle(&self, cancel: &CancellationToken) -> CycleReport {
        let mut report = CycleReport::default();
        for trainer in &self.trainers {
            if cancel.is_cancelled() {
                info!("Model cycle cancelled before {}", trainer.model_type());
                break;
            }
            report.model_types += 1;
            if let Err(e) = self.cycle_type(trainer.clone(), Utc::now(), cancel, &mut report).await {
                report.failures += 1;
                error!("Model cycle failed for {}: {}", trainer.model_type(), e);
            }
        }
        info!(
            "Model cycle done: {} types, {} trained, {} promoted, {} retired, {} predictions, {} failures",
            report.model_types,
            report.trained,
            report.promoted.len(),
            report.retired.len(),
            report.predictions,
            report.failures
        );
        report
    }

    async fn cycle_type(
        &self,
        trainer: Arc<dyn ModelTrainer>,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
        report: &mut CycleReport,
    ) -> EngineResult<()> {
        let model_type = trainer.model_type().to_string();

        self.fill_actuals(&model_type, trainer.target_metric(), now).await?;

        let review = self.evaluate_shadows(&model_type, now).await?;
        report.promoted.extend(review.promoted);
        report.retired.extend(review.retired);

        // Training errors are held back so inference still runs for the active model
        let mut training_error = None;
        if !review.pending.is_empty() {
            debug!("{}: {} shadow(s) still monitored, no retrain", model_type, review.pending.len());
        } else if let Some(reason) = self.should_retrain(trainer.as_ref(), now).await? {
            info!("Retraining {}: {}", model_type, reason);
            match self.train_candidate(trainer.clone(), now, cancel).await {
                Ok(candidate) => {
                    report.trained += 1;
                    match self.validate_candidate(&candidate, now).await? {
                        CandidateOutcome::Promoted => report.promoted.push(candidate.model_id.clone()),
                        CandidateOutcome::Shadowed => {}
                        CandidateOutcome::Rejected(why) => {
                            info!("Candidate {} rejected: {}", candidate.model_id, why)
                        }
                    }
                }
                Err(EngineError::ModelValidation(msg)) => {
                    warn!("{}: candidate not trained: {}", model_type, msg);
                }
                Err(e) => training_error = Some(e),
            }
        }

        if !cancel.is_cancelled() {
            report.predictions += self.run_inference(&model_type, now).await?;
        }

        match training_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn fill_actuals(&self, model_type: &str, metric: Metric, now: DateTime<Utc>) -> EngineResult<u64> {
        let mut filled = 0;
        for status in [ModelStatus::Active, ModelStatus::Shadow] {
            for model in self.warm.models_with_status(model_type, status).await? {
                filled += self
                    .warm
                    .fill_prediction_actuals(
                        &model.model_id,
                        metric,
                        ChronoDuration::minutes(ACTUAL_MATCH_TOLERANCE_MINUTES),
                        now,
                    )
                    .await?;
            }
        }
        if filled > 0 {
            debug!("{}: matched {} predictions with actuals", model_type, filled);
        }
        Ok(filled)
    }

    /// Promote or retire every shadow whose monitoring window has elapsed.
    ///
    /// The shadow's live MAE since it entered shadow is compared with the
    /// active model's live MAE over the same window, falling back to the
    /// active model's validation MAE when it has no matured predictions there.
    pub async fn evaluate_shadows(&self, model_type: &str, now: DateTime<Utc>) -> EngineResult<ShadowReview> {
        let window = ChronoDuration::hours(self.config.monitoring_window_hours as i64);
        let mut review = ShadowReview::default();

        for shadow in self.warm.models_with_status(model_type, ModelStatus::Shadow).await? {
            let since = shadow.shadow_at.unwrap_or(shadow.created_at);
            if now - since < window {
                review.pending.push(shadow.model_id);
                continue;
            }

            let (shadow_mae, samples) = self.warm.live_error(&shadow.model_id, since).await?;
            let shadow_mae = match shadow_mae {
                Some(mae) if samples >= self.config.min_shadow_samples => mae,
                _ => {
                    info!(
                        "Retiring shadow {}: {} matured predictions, need {}",
                        shadow.model_id, samples, self.config.min_shadow_samples
                    );
                    self.retire_shadow(&shadow.model_id, &mut review).await?;
                    continue;
                }
            };

            let active = self.warm.active_model(model_type).await?;
            let baseline = match &active {
                Some(a) => match self.warm.live_error(&a.model_id, since).await? {
                    (Some(mae), n) if n > 0 => Some(mae),
                    _ => a.metrics.validation_mae,
                },
                None => None,
            };

            let better = baseline.map_or(true, |b| shadow_mae < b);
            if !better {
                info!(
                    "Retiring shadow {}: live MAE {:.4} not better than active {:.4}",
                    shadow.model_id,
                    shadow_mae,
                    baseline.unwrap_or_default()
                );
                self.retire_shadow(&shadow.model_id, &mut review).await?;
                continue;
            }

            let expected = active.as_ref().map(|a| a.model_id.as_str());
            match self.warm.promote_model(&shadow.model_id, model_type, expected, now).await {
                Ok(demoted) => {
                    info!(
                        "Shadow {} promoted (live MAE {:.4} over {} samples, baseline {:?})",
                        shadow.model_id, shadow_mae, samples, baseline
                    );
                    self.count_promotion();
                    review.promoted.push(shadow.model_id);
                    if let Some(old) = demoted {
                        self.count_retirements(1);
                        review.retired.push(old);
                    }
                }
                Err(EngineError::ConcurrencyConflict(msg)) => {
                    warn!("Promotion of {} lost a race: {}", shadow.model_id, msg);
                }
                Err(e) => return Err(e),
            }
        }

        Ok(review)
    }

    async fn retire_shadow(&self, model_id: &str, review: &mut ShadowReview) -> EngineResult<()> {
        self.warm
            .transition_model(model_id, ModelStatus::Shadow, ModelStatus::Retired, None, None)
            .await?;
        self.loaded.write().await.remove(model_id);
        self.count_retirements(1);
        review.retired.push(model_id.to_string());
        Ok(())
    }

    /// First retrain trigger that fires for the type, if any
    pub async fn should_retrain(
        &self,
        trainer: &dyn ModelTrainer,
        now: DateTime<Utc>,
    ) -> EngineResult<Option<RetrainReason>> {
        let Some(active) = self.warm.active_model(trainer.model_type()).await? else {
            return Ok(Some(RetrainReason::NoActiveModel));
        };

        let activated = active.activated_at.unwrap_or(active.created_at);
        let age = now - activated;
        if age >= ChronoDuration::days(self.config.retrain_threshold_days as i64) {
            return Ok(Some(RetrainReason::Age { days: age.num_days() }));
        }

        if let Some(baseline_mae) = active.metrics.validation_mae {
            let since = (now - ChronoDuration::days(self.config.degradation_window_days as i64)).max(activated);
            if let (Some(live_mae), n) = self.warm.live_error(&active.model_id, since).await? {
                if n >= self.config.min_degradation_samples
                    && live_mae > baseline_mae * self.config.degradation_factor
                {
                    return Ok(Some(RetrainReason::Degraded { live_mae, baseline_mae }));
                }
            }
        }

        if let (Some(baseline_mean), Some(baseline_std)) = (active.metrics.feature_mean, active.metrics.feature_std) {
            if baseline_std > 0.0 {
                let since = now - ChronoDuration::hours(self.config.drift_window_hours as i64);
                if let (Some(mean), n) = self.warm.metric_mean_since(trainer.target_metric(), since).await? {
                    if n > 0 && (mean - baseline_mean).abs() > self.config.drift_sigma * baseline_std {
                        return Ok(Some(RetrainReason::Drift {
                            mean,
                            baseline_mean,
                            baseline_std,
                        }));
                    }
                }
            }
        }

        Ok(None)
    }

    /// Train a candidate and leave it in `validating`. On failure the model
    /// row goes back to `created` with the error recorded in its metrics.
    pub async fn train_candidate(
        &self,
        trainer: Arc<dyn ModelTrainer>,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> EngineResult<Model> {
        let model_type = trainer.model_type().to_string();
        let fresh = ModelMetrics {
            target_metric: Some(trainer.target_metric()),
            ..Default::default()
        };

        // A failed or rejected attempt left in `created` is retrained in place
        let stale = self
            .warm
            .models_with_status(&model_type, ModelStatus::Created)
            .await?
            .into_iter()
            .next();
        let mut model = match stale {
            Some(mut model) => {
                debug!("Retraining {} v{} in place ({})", model_type, model.version, model.model_id);
                model.metrics = fresh.clone();
                model.storage_path = None;
                model
            }
            None => {
                let model = Model {
                    model_id: Uuid::new_v4().to_string(),
                    model_type: model_type.clone(),
                    version: self.warm.next_model_version(&model_type).await?,
                    status: ModelStatus::Created,
                    metrics: fresh.clone(),
                    storage_path: None,
                    created_at: now,
                    shadow_at: None,
                    activated_at: None,
                    retired_at: None,
                };
                self.warm.insert_model(&model).await?;
                model
            }
        };
        let version = model.version;
        self.warm
            .transition_model(&model.model_id, ModelStatus::Created, ModelStatus::Training, Some(&fresh), None)
            .await?;

        match self.fit_and_save(trainer, &model, now, cancel).await {
            Ok((metrics, path)) => {
                self.warm
                    .transition_model(
                        &model.model_id,
                        ModelStatus::Training,
                        ModelStatus::Validating,
                        Some(&metrics),
                        Some(&path),
                    )
                    .await?;
                info!(
                    "Trained {} v{} ({}): holdout MAE {:?} on {} samples",
                    model_type, version, model.model_id, metrics.validation_mae, metrics.training_samples
                );
                model.status = ModelStatus::Validating;
                model.metrics = metrics;
                model.storage_path = Some(path);
                Ok(model)
            }
            Err(e) => {
                let failed = ModelMetrics {
                    note: Some(format!("training failed: {}", e)),
                    ..model.metrics.clone()
                };
                if let Err(revert) = self
                    .warm
                    .transition_model(
                        &model.model_id,
                        ModelStatus::Training,
                        ModelStatus::Created,
                        Some(&failed),
                        None,
                    )
                    .await
                {
                    error!("Could not revert {} to created: {}", model.model_id, revert);
                }
                Err(e)
            }
        }
    }

    async fn fit_and_save(
        &self,
        trainer: Arc<dyn ModelTrainer>,
        model: &Model,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> EngineResult<(ModelMetrics, String)> {
        let metric = trainer.target_metric();
        let history = self.load_history(metric, now, cancel).await?;
        let sampled: Vec<Reading> = sample_readings(history, &self.config.bands, now, self.config.sampling_seed)
            .into_iter()
            .filter(|r| r.value(metric).is_some())
            .collect();
        let (train, holdout) = split_holdout(sampled, HOLDOUT_RATIO);

        let needed = self.config.min_training_samples.max(trainer.min_samples());
        if train.len() < needed || holdout.is_empty() {
            return Err(EngineError::ModelValidation(format!(
                "{}: {} training and {} holdout samples, need {}",
                model.model_type,
                train.len(),
                holdout.len(),
                needed
            )));
        }
        if cancel.is_cancelled() {
            return Err(EngineError::transient("training", "cancelled"));
        }

        let (feature_mean, feature_std) = mean_std(train.iter().filter_map(|r| r.value(metric)));
        let training_samples = train.len() as u64;

        let fit_with = trainer.clone();
        let forecaster = tokio::task::spawn_blocking(move || fit_with.train(&train))
            .await
            .map_err(|e| EngineError::ModelValidation(format!("training task aborted: {}", e)))??;

        let mae = mean_absolute_error(forecaster.as_ref(), &holdout, metric).ok_or_else(|| {
            EngineError::ModelValidation(format!("{}: no holdout reading could be forecast", model.model_type))
        })?;

        tokio::fs::create_dir_all(&self.artifact_dir).await?;
        let path = self
            .artifact_dir
            .join(format!("{}-v{}.json", model.model_type, model.version));
        tokio::fs::write(&path, forecaster.to_bytes()?).await?;

        self.loaded
            .write()
            .await
            .insert(model.model_id.clone(), Arc::from(forecaster));

        let metrics = ModelMetrics {
            target_metric: Some(metric),
            validation_mae: Some(mae),
            training_samples,
            holdout_samples: holdout.len() as u64,
            feature_mean,
            feature_std,
            note: None,
        };
        Ok((metrics, path.to_string_lossy().into_owned()))
    }

    /// Readings within the sampling horizon: cold for the span older than the
    /// warm horizon, warm for the rest
    async fn load_history(
        &self,
        metric: Metric,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> EngineResult<Vec<Reading>> {
        let horizon = sampling_horizon(&self.config.bands, now);
        let warm_boundary = (now - self.warm_horizon).max(horizon);
        let mut seen: HashSet<(String, i64)> = HashSet::new();
        let mut readings = Vec::new();

        if horizon < warm_boundary {
            for table in self.cold.tables() {
                if cancel.is_cancelled() {
                    return Err(EngineError::transient("training", "cancelled"));
                }
                match retry_transient("cold scan", || self.cold.scan_table(&table, horizon, warm_boundary, None)).await {
                    Ok(scan) => {
                        for r in scan.readings {
                            if r.value(metric).is_some() && seen.insert(r.key()) {
                                readings.push(r);
                            }
                        }
                    }
                    // Training proceeds on warm data alone
                    Err(e) => warn!("Cold scan of {} for training failed: {}", table, e),
                }
            }
        }

        let mut nodes: BTreeSet<String> = self
            .warm
            .list_nodes(false)
            .await?
            .into_iter()
            .map(|n| n.node_id)
            .collect();
        nodes.extend(self.warm.nodes_with_readings_since(warm_boundary).await?);

        for node in nodes {
            if cancel.is_cancelled() {
                return Err(EngineError::transient("training", "cancelled"));
            }
            for r in self.warm.readings_between(&node, warm_boundary, now).await? {
                if r.value(metric).is_some() && seen.insert(r.key()) {
                    readings.push(r);
                }
            }
        }

        debug!("Loaded {} {} readings for training", readings.len(), metric);
        Ok(readings)
    }

    /// Accept or reject a `validating` candidate against the active model
    pub async fn validate_candidate(&self, candidate: &Model, now: DateTime<Utc>) -> EngineResult<CandidateOutcome> {
        let active = self.warm.active_model(&candidate.model_type).await?;

        let Some(active) = active else {
            self.warm
                .promote_model(&candidate.model_id, &candidate.model_type, None, now)
                .await?;
            self.count_promotion();
            info!(
                "{} had no active model, {} v{} promoted directly",
                candidate.model_type, candidate.model_id, candidate.version
            );
            return Ok(CandidateOutcome::Promoted);
        };

        let candidate_mae = candidate.metrics.validation_mae;
        if let (Some(mae), Some(baseline)) = (candidate_mae, active.metrics.validation_mae) {
            let limit = baseline * (1.0 + self.config.validation_tolerance);
            if mae > limit {
                let reason = format!(
                    "validation MAE {:.4} exceeds {:.4} (active {:.4} + {:.0}%)",
                    mae,
                    limit,
                    baseline,
                    self.config.validation_tolerance * 100.0
                );
                let metrics = ModelMetrics {
                    note: Some(reason.clone()),
                    ..candidate.metrics.clone()
                };
                self.warm
                    .transition_model(
                        &candidate.model_id,
                        ModelStatus::Validating,
                        ModelStatus::Created,
                        Some(&metrics),
                        None,
                    )
                    .await?;
                self.loaded.write().await.remove(&candidate.model_id);
                return Ok(CandidateOutcome::Rejected(reason));
            }
        }

        self.warm
            .transition_model(
                &candidate.model_id,
                ModelStatus::Validating,
                ModelStatus::Shadow,
                None,
                None,
            )
            .await?;
        info!(
            "Candidate {} v{} deployed in shadow next to {}",
            candidate.model_type, candidate.version, active.model_id
        );
        Ok(CandidateOutcome::Shadowed)
    }

    /// Hourly forecasts over the horizon from every active and shadow model of
    /// the type, for active nodes and nodes with recent data
    pub async fn run_inference(&self, model_type: &str, now: DateTime<Utc>) -> EngineResult<u64> {
        let mut models = self.warm.models_with_status(model_type, ModelStatus::Active).await?;
        models.extend(self.warm.models_with_status(model_type, ModelStatus::Shadow).await?);
        if models.is_empty() {
            return Ok(0);
        }

        let mut nodes: BTreeSet<String> = self
            .warm
            .list_nodes(true)
            .await?
            .into_iter()
            .map(|n| n.node_id)
            .collect();
        let recent = now - ChronoDuration::hours(self.config.monitoring_window_hours as i64);
        nodes.extend(self.warm.nodes_with_readings_since(recent).await?);

        let base = Resolution::Hourly.bucket_start(now);
        let targets: Vec<DateTime<Utc>> = (1..=self.config.horizon_hours as i64)
            .map(|h| base + ChronoDuration::hours(h))
            .collect();

        let mut written = 0;
        for model in &models {
            let forecaster = match self.forecaster(model).await {
                Ok(f) => f,
                Err(e) => {
                    warn!("Skipping inference for {}: {}", model.model_id, e);
                    continue;
                }
            };
            let predictions: Vec<Prediction> = nodes
                .iter()
                .flat_map(|node| targets.iter().map(move |t| (node, *t)))
                .filter_map(|(node, target)| {
                    let f = forecaster.predict(node, target)?;
                    Some(Prediction {
                        model_id: model.model_id.clone(),
                        node_id: node.clone(),
                        issued_at: now,
                        target_time: target,
                        predicted_value: f.value,
                        lower_bound: f.lower,
                        upper_bound: f.upper,
                        confidence: f.confidence,
                        actual_value: None,
                    })
                })
                .collect();
            written += self.warm.upsert_predictions(&predictions).await?;
        }
        Ok(written)
    }

    async fn forecaster(&self, model: &Model) -> EngineResult<Arc<dyn Forecaster>> {
        if let Some(f) = self.loaded.read().await.get(&model.model_id) {
            return Ok(f.clone());
        }
        let path = model
            .storage_path
            .as_deref()
            .ok_or_else(|| EngineError::NotFound(format!("artifact for model {}", model.model_id)))?;
        let bytes = tokio::fs::read(path).await?;
        let forecaster: Arc<dyn Forecaster> = Arc::from(self.trainer(&model.model_type)?.load(&bytes)?);
        self.loaded
            .write()
            .await
            .insert(model.model_id.clone(), forecaster.clone());
        Ok(forecaster)
    }

    /// Operator override: make a shadow or retired model the active one.
    /// Returns the model it replaced.
    pub async fn force_promote(&self, model_id: &str) -> EngineResult<Option<String>> {
        let model = self
            .warm
            .get_model(model_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("model {}", model_id)))?;
        if !matches!(model.status, ModelStatus::Shadow | ModelStatus::Retired) {
            return Err(EngineError::InvalidTransition(format!(
                "model {} is {}, only shadow or retired models can be promoted",
                model_id, model.status
            )));
        }

        let active = self.warm.active_model(&model.model_type).await?;
        let expected = active.as_ref().map(|a| a.model_id.as_str());
        let demoted = self
            .warm
            .promote_model(model_id, &model.model_type, expected, Utc::now())
            .await?;

        self.count_promotion();
        if demoted.is_some() {
            self.count_retirements(1);
        }
        warn!("Model {} force-promoted, replacing {:?}", model_id, demoted);
        Ok(demoted)
    }
}

fn mean_std(values: impl Iterator<Item = f64>) -> (Option<f64>, Option<f64>) {
    let values: Vec<f64> = values.collect();
    if values.is_empty() {
        return (None, None);
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (Some(mean), Some(var.sqrt()))
}
