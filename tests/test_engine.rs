//! End-to-end tests through the engine façade

use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;

use hydrotier::config::{EngineConfig, RetentionPolicy};
use hydrotier::scoring::FnKpi;
use hydrotier::types::{Metric, Model, ModelMetrics, ModelStatus, Reading, Resolution};
use hydrotier::{Engine, EngineError};

fn config_in(dir: &PathBuf) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.warm.database_path = dir.join("warm.db").to_string_lossy().into_owned();
    config.warm.pool_size = 2;
    config.cold.base_path = dir.join("cold").to_string_lossy().into_owned();
    config.lifecycle.artifact_dir = dir.join("models").to_string_lossy().into_owned();
    config
}

fn temp_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("hydrotier_engine_{}_{}", name, rand::random::<u64>()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

async fn engine(name: &str) -> (PathBuf, Engine) {
    let dir = temp_dir(name);
    let engine = Engine::open(config_in(&dir)).await.unwrap();
    (dir, engine)
}

#[tokio::test]
async fn test_put_reading_then_latest_and_series() {
    let (_dir, engine) = engine("ingest").await;
    let now = Utc::now();
    for i in 0..5 {
        engine
            .put_reading(Reading::new("N1", now - ChronoDuration::minutes(20 - i * 5)).with_flow(10.0 + i as f64))
            .await
            .unwrap();
    }

    let latest = engine.get_latest(&["N1".to_string()]).await.unwrap();
    assert_eq!(latest["N1"].flow, Some(14.0));

    assert_eq!(engine.flush().await.unwrap(), 5);
    assert_eq!(engine.flush().await.unwrap(), 0);

    let series = engine
        .get_series("N1", now - ChronoDuration::hours(1), now + ChronoDuration::minutes(1), Resolution::Raw)
        .await
        .unwrap();
    assert_eq!(series.len(), 5);
    assert!(!series.degraded);
    assert_eq!(series.values(Metric::Flow), vec![10.0, 11.0, 12.0, 13.0, 14.0]);

    let text = engine.metrics_text();
    assert!(text.contains("hydrotier_readings_ingested_total 5"));
}

#[tokio::test]
async fn test_invalid_reading_is_rejected_and_counted() {
    let (_dir, engine) = engine("reject").await;
    let future = Reading::new("N1", Utc::now() + ChronoDuration::hours(2)).with_flow(1.0);
    assert!(matches!(engine.put_reading(future).await, Err(EngineError::DataIntegrity(_))));
    let negative = Reading::new("N1", Utc::now()).with_flow(-3.0);
    assert!(engine.put_reading(negative).await.is_err());
    let empty = Reading::new("N1", Utc::now());
    assert!(engine.put_reading(empty).await.is_err());

    assert!(engine.get_latest(&["N1".to_string()]).await.unwrap().is_empty());
    assert!(engine.metrics_text().contains("hydrotier_readings_rejected_total 3"));
}

#[tokio::test]
async fn test_boundary_queries_return_empty_series() {
    let (_dir, engine) = engine("boundary").await;
    let now = Utc::now();
    let same = engine
        .get_series("N1", now, now, Resolution::Hourly)
        .await
        .unwrap();
    assert!(same.is_empty());

    let unknown = engine
        .get_series("ghost", now - ChronoDuration::days(3), now, Resolution::Daily)
        .await
        .unwrap();
    assert!(unknown.is_empty());
    assert!(engine.get_latest(&[]).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_retention_policy_is_validated_persisted_and_audited() {
    let dir = temp_dir("retention");
    let engine = Engine::open(config_in(&dir)).await.unwrap();
    assert_eq!(engine.retention_policy().await, RetentionPolicy::default());

    let invalid = RetentionPolicy {
        sync_job_days: 0,
        ..RetentionPolicy::default()
    };
    assert!(matches!(
        engine.set_retention_policy(invalid).await,
        Err(EngineError::DataIntegrity(_))
    ));

    let policy = RetentionPolicy {
        sync_job_days: 7,
        resolved_anomaly_days: 14,
        anomaly_auto_resolve_hours: 12,
        quality_report_days: 3,
    };
    engine.set_retention_policy(policy.clone()).await.unwrap();
    assert_eq!(engine.retention_policy().await, policy);
    let audit = engine.warm().list_jobs(Some("admin:set_retention"), 10).await.unwrap();
    assert_eq!(audit.len(), 1);
    engine.shutdown().await;

    let reopened = Engine::open(config_in(&dir)).await.unwrap();
    assert_eq!(reopened.retention_policy().await, policy);
    reopened.shutdown().await;
}

#[tokio::test]
async fn test_kpi_strategies_are_injected() {
    let (_dir, engine) = engine("kpi").await;
    let now = Utc::now();
    for (i, flow) in [4.0, 6.0, 8.0].iter().enumerate() {
        engine
            .put_reading(Reading::new("N9", now - ChronoDuration::minutes(30 - i as i64 * 10)).with_flow(*flow))
            .await
            .unwrap();
    }
    engine.flush().await.unwrap();

    engine
        .register_kpi(Arc::new(
            FnKpi::new("mean_flow", |series| {
                let values = series.values(Metric::Flow);
                if values.is_empty() {
                    return Err(EngineError::DataIntegrity("no flow values".into()));
                }
                Ok(values.iter().sum::<f64>() / values.len() as f64)
            })
            .with_unit("m3/h"),
        ))
        .await;

    let kpi = engine
        .evaluate_kpi("mean_flow", "N9", now - ChronoDuration::hours(1), now, Resolution::Raw)
        .await
        .unwrap();
    assert_eq!(kpi.value, 6.0);
    assert_eq!(kpi.node_id, "N9");
    assert_eq!(kpi.unit.as_deref(), Some("m3/h"));
    assert!(!kpi.degraded);

    assert!(engine
        .evaluate_kpi("mean_flow", "ghost", now - ChronoDuration::hours(1), now, Resolution::Raw)
        .await
        .is_err());
    assert!(matches!(
        engine
            .evaluate_kpi("water_loss", "N9", now - ChronoDuration::hours(1), now, Resolution::Raw)
            .await,
        Err(EngineError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_default_jobs_are_registered_and_controllable() {
    let (_dir, engine) = engine("jobs").await;
    let status = engine.list_job_status().await.unwrap();
    let names: Vec<&str> = status.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(
        names,
        vec![
            "aggregate_refresh",
            "anomaly_scan",
            "cache_refresh",
            "cold_archive",
            "data_quality_audit",
            "historical_backfill",
            "model_cycle",
            "recent_sync",
            "retention_cleanup",
        ]
    );

    engine.pause_job("recent_sync").await.unwrap();
    let paused = engine.list_job_status().await.unwrap();
    assert!(paused.iter().any(|s| s.name == "recent_sync" && s.paused));

    // Manual triggers run even while paused
    let outcome = engine.trigger_job("recent_sync", json!({})).await.unwrap();
    assert!(outcome.is_completed());
    engine.resume_job("recent_sync").await.unwrap();

    assert!(matches!(
        engine.trigger_job("missing", json!({})).await,
        Err(EngineError::NotFound(_))
    ));
    assert!(matches!(engine.force_promote("missing").await, Err(EngineError::NotFound(_))));
    assert!(!engine.resolve_anomaly(12345).await.unwrap());
    assert_eq!(
        engine
            .warm()
            .list_jobs(Some("admin:resolve_anomaly"), 10)
            .await
            .unwrap()
            .len(),
        1
    );
}

#[tokio::test]
async fn test_shutdown_flushes_buffered_readings() {
    let dir = temp_dir("shutdown");
    let engine = Engine::open(config_in(&dir)).await.unwrap();
    engine.start().await;
    engine
        .put_reading(Reading::new("N4", Utc::now() - ChronoDuration::seconds(3)).with_pressure(4.0))
        .await
        .unwrap();
    engine.shutdown().await;

    let reopened = Engine::open(config_in(&dir)).await.unwrap();
    let latest = reopened.get_latest(&["N4".to_string()]).await.unwrap();
    assert_eq!(latest["N4"].pressure, Some(4.0));
    reopened.shutdown().await;
}

#[tokio::test]
async fn test_force_promote_is_audited() {
    let (_dir, engine) = engine("promote").await;
    let now = Utc::now();
    let model = |id: &str, version: i64, status: ModelStatus| Model {
        model_id: id.to_string(),
        model_type: "flow_seasonal".to_string(),
        version,
        status,
        metrics: ModelMetrics {
            target_metric: Some(Metric::Flow),
            validation_mae: Some(1.0),
            ..Default::default()
        },
        storage_path: None,
        created_at: now - ChronoDuration::days(2),
        shadow_at: (status == ModelStatus::Shadow).then(|| now - ChronoDuration::hours(1)),
        activated_at: None,
        retired_at: None,
    };
    engine.warm().insert_model(&model("flow-v1", 1, ModelStatus::Active)).await.unwrap();
    engine.warm().insert_model(&model("flow-v2", 2, ModelStatus::Shadow)).await.unwrap();

    let replaced = engine.force_promote("flow-v2").await.unwrap();
    assert_eq!(replaced.as_deref(), Some("flow-v1"));

    let audit = engine.warm().list_jobs(Some("admin:force_promote"), 10).await.unwrap();
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].metadata["model_id"], json!("flow-v2"));
    assert_eq!(audit[0].metadata["replaced"], json!("flow-v1"));
}
