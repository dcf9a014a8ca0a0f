//! Model lifecycle against a real warm store: shadow promotion, concurrent
//! overrides and a full train/promote/infer cycle

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use hydrotier::config::LifecycleConfig;
use hydrotier::lifecycle::{CandidateOutcome, ModelLifecycleManager, SeasonalProfileTrainer};
use hydrotier::tiered_storage::{ColdArchiveStorage, StorageTier, WarmSqliteStorage, WriteMode};
use hydrotier::types::{Metric, Model, ModelMetrics, ModelStatus, Prediction, Reading, Resolution};

const MODEL_TYPE: &str = "flow_seasonal";

struct Fixture {
    dir: PathBuf,
    warm: Arc<WarmSqliteStorage>,
    manager: ModelLifecycleManager,
}

async fn fixture(name: &str) -> Fixture {
    let dir = std::env::temp_dir().join(format!("hydrotier_lifecycle_{}_{}", name, rand::random::<u64>()));
    std::fs::create_dir_all(&dir).unwrap();
    let db = dir.join("warm.db");
    let warm = Arc::new(
        WarmSqliteStorage::new(db.to_str().unwrap(), 4, Duration::from_secs(5))
            .await
            .unwrap(),
    );
    let cold = Arc::new(
        ColdArchiveStorage::new(dir.join("cold"), "readings", Vec::new())
            .await
            .unwrap(),
    );
    let config = LifecycleConfig {
        artifact_dir: dir.join("models").to_string_lossy().into_owned(),
        ..LifecycleConfig::default()
    };
    let manager = ModelLifecycleManager::new(warm.clone(), cold, config, ChronoDuration::days(90))
        .with_trainer(Arc::new(SeasonalProfileTrainer::new(MODEL_TYPE, Metric::Flow, 48)));
    Fixture { dir, warm, manager }
}

fn model(id: &str, version: i64, status: ModelStatus, mae: f64, now: DateTime<Utc>) -> Model {
    Model {
        model_id: id.to_string(),
        model_type: MODEL_TYPE.to_string(),
        version,
        status,
        metrics: ModelMetrics {
            target_metric: Some(Metric::Flow),
            validation_mae: Some(mae),
            ..Default::default()
        },
        storage_path: None,
        created_at: now - ChronoDuration::days(10),
        shadow_at: None,
        activated_at: None,
        retired_at: None,
    }
}

/// Matured predictions: `nodes` x `hours` targets after `since`, each off by `error`
fn matured(model_id: &str, since: DateTime<Utc>, nodes: usize, hours: i64, error: f64) -> Vec<Prediction> {
    let mut out = Vec::new();
    for n in 0..nodes {
        for h in 1..=hours {
            let target = since + ChronoDuration::hours(h);
            out.push(Prediction {
                model_id: model_id.to_string(),
                node_id: format!("N{}", n),
                issued_at: target - ChronoDuration::hours(1),
                target_time: target,
                predicted_value: 10.0 + error,
                lower_bound: 8.0,
                upper_bound: 12.0,
                confidence: 0.9,
                actual_value: Some(10.0),
            });
        }
    }
    out
}

#[tokio::test]
async fn test_better_shadow_replaces_active() {
    let fx = fixture("promote").await;
    let now = Utc::now();
    let shadow_since = now - ChronoDuration::hours(120);

    let mut active = model("active-v1", 1, ModelStatus::Active, 1.0, now);
    active.activated_at = Some(now - ChronoDuration::days(9));
    let mut shadow = model("shadow-v2", 2, ModelStatus::Shadow, 0.9, now);
    shadow.shadow_at = Some(shadow_since);
    fx.warm.insert_model(&active).await.unwrap();
    fx.warm.insert_model(&shadow).await.unwrap();

    // 1000 matured predictions each; the shadow's error is 15% lower
    fx.warm
        .upsert_predictions(&matured("active-v1", shadow_since, 10, 100, 1.0))
        .await
        .unwrap();
    fx.warm
        .upsert_predictions(&matured("shadow-v2", shadow_since, 10, 100, 0.85))
        .await
        .unwrap();

    let review = fx.manager.evaluate_shadows(MODEL_TYPE, now).await.unwrap();
    assert_eq!(review.promoted, vec!["shadow-v2".to_string()]);
    assert_eq!(review.retired, vec!["active-v1".to_string()]);
    assert!(review.pending.is_empty());

    assert_eq!(fx.warm.count_active_models(MODEL_TYPE).await.unwrap(), 1);
    let current = fx.warm.active_model(MODEL_TYPE).await.unwrap().unwrap();
    assert_eq!(current.model_id, "shadow-v2");
    let old = fx.warm.get_model("active-v1").await.unwrap().unwrap();
    assert_eq!(old.status, ModelStatus::Retired);
    assert!(old.retired_at.is_some());
}

#[tokio::test]
async fn test_worse_or_thin_shadows_are_retired() {
    let fx = fixture("retire").await;
    let now = Utc::now();
    let since = now - ChronoDuration::hours(48);

    fx.warm
        .insert_model(&model("active-v1", 1, ModelStatus::Active, 1.0, now))
        .await
        .unwrap();
    let mut worse = model("worse-v2", 2, ModelStatus::Shadow, 0.9, now);
    worse.shadow_at = Some(since);
    let mut thin = model("thin-v3", 3, ModelStatus::Shadow, 0.5, now);
    thin.shadow_at = Some(since);
    let mut fresh = model("fresh-v4", 4, ModelStatus::Shadow, 0.5, now);
    fresh.shadow_at = Some(now - ChronoDuration::hours(2));
    for m in [&worse, &thin, &fresh] {
        fx.warm.insert_model(m).await.unwrap();
    }

    fx.warm
        .upsert_predictions(&matured("active-v1", since, 5, 40, 1.0))
        .await
        .unwrap();
    fx.warm
        .upsert_predictions(&matured("worse-v2", since, 5, 40, 1.2))
        .await
        .unwrap();
    fx.warm
        .upsert_predictions(&matured("thin-v3", since, 1, 10, 0.1))
        .await
        .unwrap();

    let mut review = fx.manager.evaluate_shadows(MODEL_TYPE, now).await.unwrap();
    review.retired.sort();
    assert!(review.promoted.is_empty());
    assert_eq!(review.retired, vec!["thin-v3".to_string(), "worse-v2".to_string()]);
    assert_eq!(review.pending, vec!["fresh-v4".to_string()]);

    let active = fx.warm.active_model(MODEL_TYPE).await.unwrap().unwrap();
    assert_eq!(active.model_id, "active-v1");
}

#[tokio::test]
async fn test_concurrent_force_promote_has_one_winner() {
    let fx = fixture("race").await;
    let now = Utc::now();
    fx.warm
        .insert_model(&model("active-v1", 1, ModelStatus::Active, 1.0, now))
        .await
        .unwrap();
    let mut a = model("shadow-a", 2, ModelStatus::Shadow, 0.9, now);
    a.shadow_at = Some(now - ChronoDuration::hours(1));
    let mut b = model("shadow-b", 3, ModelStatus::Shadow, 0.9, now);
    b.shadow_at = Some(now - ChronoDuration::hours(1));
    fx.warm.insert_model(&a).await.unwrap();
    fx.warm.insert_model(&b).await.unwrap();

    let (ra, rb) = tokio::join!(fx.manager.force_promote("shadow-a"), fx.manager.force_promote("shadow-b"));
    let winners = [ra.is_ok(), rb.is_ok()].iter().filter(|ok| **ok).count();
    assert_eq!(winners, 1, "a: {:?}, b: {:?}", ra, rb);
    assert_eq!(fx.warm.count_active_models(MODEL_TYPE).await.unwrap(), 1);

    let retired = fx.warm.get_model("active-v1").await.unwrap().unwrap();
    assert_eq!(retired.status, ModelStatus::Retired);
}

#[tokio::test]
async fn test_force_promote_rejects_invalid_states() {
    let fx = fixture("invalid").await;
    let now = Utc::now();
    fx.warm
        .insert_model(&model("training-v1", 1, ModelStatus::Training, 1.0, now))
        .await
        .unwrap();

    assert!(matches!(
        fx.manager.force_promote("training-v1").await,
        Err(hydrotier::EngineError::InvalidTransition(_))
    ));
    assert!(matches!(
        fx.manager.force_promote("missing").await,
        Err(hydrotier::EngineError::NotFound(_))
    ));
    assert_eq!(fx.warm.count_active_models(MODEL_TYPE).await.unwrap(), 0);
}

#[tokio::test]
async fn test_candidate_worse_than_tolerance_is_rejected() {
    let fx = fixture("reject").await;
    let now = Utc::now();
    fx.warm
        .insert_model(&model("active-v1", 1, ModelStatus::Active, 1.0, now))
        .await
        .unwrap();
    let candidate = model("candidate-v2", 2, ModelStatus::Validating, 1.5, now);
    fx.warm.insert_model(&candidate).await.unwrap();

    let outcome = fx.manager.validate_candidate(&candidate, now).await.unwrap();
    assert!(matches!(outcome, CandidateOutcome::Rejected(_)));
    let stored = fx.warm.get_model("candidate-v2").await.unwrap().unwrap();
    assert_eq!(stored.status, ModelStatus::Created);
    assert!(stored.metrics.note.is_some());

    let close = model("candidate-v3", 3, ModelStatus::Validating, 1.05, now);
    fx.warm.insert_model(&close).await.unwrap();
    assert_eq!(
        fx.manager.validate_candidate(&close, now).await.unwrap(),
        CandidateOutcome::Shadowed
    );
    let stored = fx.warm.get_model("candidate-v3").await.unwrap().unwrap();
    assert_eq!(stored.status, ModelStatus::Shadow);
    assert!(stored.shadow_at.is_some());
}

#[tokio::test]
async fn test_cycle_trains_promotes_and_forecasts() {
    let fx = fixture("cycle").await;
    let now = Utc::now();
    let start = Resolution::Hourly.bucket_start(now - ChronoDuration::days(3));
    let readings: Vec<Reading> = ["N1", "N2"]
        .iter()
        .flat_map(|node| {
            (0..(3 * 24 * 4))
                .map(move |i| Reading::new(*node, start + ChronoDuration::minutes(15 * i)).with_flow(20.0))
        })
        .filter(|r| r.timestamp < now)
        .collect();
    fx.warm.write_batch(&readings, WriteMode::SkipExisting).await.unwrap();

    let cancel = CancellationToken::new();
    let report = fx.manager.run_cycle(&cancel).await;
    assert_eq!(report.model_types, 1);
    assert_eq!(report.failures, 0);
    assert_eq!(report.trained, 1);
    assert_eq!(report.promoted.len(), 1);
    assert_eq!(report.predictions, 2 * 24);

    let active = fx.warm.active_model(MODEL_TYPE).await.unwrap().unwrap();
    assert_eq!(active.version, 1);
    assert_eq!(active.metrics.validation_mae, Some(0.0));
    let artifact = active.storage_path.clone().expect("artifact path recorded");
    assert!(PathBuf::from(&artifact).starts_with(&fx.dir));
    assert!(PathBuf::from(&artifact).exists());

    let forecasts = fx.warm.predictions_for_model(&active.model_id).await.unwrap();
    assert_eq!(forecasts.len(), 48);
    assert!(forecasts.iter().all(|p| p.target_time > now && p.predicted_value == 20.0));

    // A fresh, healthy active model is not retrained
    let again = fx.manager.run_cycle(&cancel).await;
    assert_eq!(again.trained, 0);
    assert_eq!(again.failures, 0);
    assert_eq!(fx.warm.list_models(Some(MODEL_TYPE)).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_cycle_without_data_leaves_no_active_model() {
    let fx = fixture("empty").await;
    let report = fx.manager.run_cycle(&CancellationToken::new()).await;
    assert_eq!(report.trained, 0);
    assert_eq!(report.failures, 0);
    assert_eq!(fx.warm.count_active_models(MODEL_TYPE).await.unwrap(), 0);

    // The failed attempt is kept in `created` with its reason
    let models = fx.warm.list_models(Some(MODEL_TYPE)).await.unwrap();
    assert_eq!(models.len(), 1);
    assert_eq!(models[0].status, ModelStatus::Created);
    assert!(models[0].metrics.note.is_some());
}

#[tokio::test]
async fn test_repeated_cycles_without_data_reuse_the_created_row() {
    let fx = fixture("repeat").await;
    for _ in 0..5 {
        let report = fx.manager.run_cycle(&CancellationToken::new()).await;
        assert_eq!(report.trained, 0);
    }

    let models = fx.warm.list_models(None).await.unwrap();
    assert_eq!(models.len(), 1);
    assert_eq!(models[0].version, 1);
    assert_eq!(models[0].status, ModelStatus::Created);
    assert!(models[0].metrics.note.as_deref().unwrap().contains("training failed"));
}
