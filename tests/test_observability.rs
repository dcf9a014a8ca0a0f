//! Integration tests for logging setup and engine metrics

use hydrotier::observability::{get_metrics, init_observability, EngineMetrics, ObservabilityConfig};
use serde_json::Value;
use std::sync::{Arc, Once};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use hydrotier::config::SchedulerConfig;
use hydrotier::sync::{JobContext, JobDescriptor, JobHandler, JobReport, JobSchedule, JobTrigger, SyncScheduler};
use hydrotier::tiered_storage::WarmSqliteStorage;
use hydrotier::types::JobKind;

static INIT: Once = Once::new();

/// Install the subscriber once for the whole test binary
fn init_test_observability() {
    INIT.call_once(|| {
        let config = ObservabilityConfig {
            enable_tracing: false,
            enable_metrics: false,
            default_filter: "debug".to_string(),
            ..Default::default()
        };
        // Another test binary may already own the global subscriber
        if let Ok(guard) = init_observability(Some(config)) {
            std::mem::forget(guard);
        }
    });
}

#[test]
fn test_observability_config_default() {
    let config = ObservabilityConfig::default();
    assert_eq!(config.service_name, "hydrotier");
    assert_eq!(config.default_filter, "info");
    assert!((0.0..=1.0).contains(&config.sampling_ratio));
}

#[test]
fn test_global_metrics_render() {
    let metrics = get_metrics();
    assert!(metrics.is_empty() || metrics.contains("# HELP") || metrics.contains("# TYPE"));
}

#[test]
fn test_engine_metrics_are_isolated_per_instance() {
    let a = EngineMetrics::new().unwrap();
    let b = EngineMetrics::new().unwrap();
    a.readings_ingested.inc_by(2);
    a.tier_fallthroughs.with_label_values(&["hot"]).inc();

    let text = a.render();
    assert!(text.contains("hydrotier_readings_ingested_total 2"));
    assert!(text.contains("hydrotier_tier_fallthroughs_total{tier=\"hot\"} 1"));
    assert!(b.render().contains("hydrotier_readings_ingested_total 0"));
}

struct NoopJob;

#[async_trait::async_trait]
impl JobHandler for NoopJob {
    fn kind(&self) -> JobKind {
        JobKind::CacheRefresh
    }

    async fn run(&self, ctx: &JobContext) -> anyhow::Result<JobReport> {
        tracing::info!(job = %ctx.job_name, "noop job running");
        tokio::time::sleep(Duration::from_millis(5)).await;
        Ok(JobReport::new(1, 0))
    }
}

#[tokio::test]
async fn test_job_outcomes_are_counted() {
    init_test_observability();

    let dir = std::env::temp_dir().join(format!("hydrotier_obs_{}", rand::random::<u64>()));
    std::fs::create_dir_all(&dir).unwrap();
    let db = dir.join("warm.db");
    let warm = Arc::new(
        WarmSqliteStorage::new(db.to_str().unwrap(), 2, Duration::from_secs(1))
            .await
            .unwrap(),
    );
    let metrics = Arc::new(EngineMetrics::new().unwrap());
    let scheduler = SyncScheduler::new(warm, SchedulerConfig::default()).with_metrics(metrics.clone());
    scheduler
        .register(JobDescriptor::new("noop", JobSchedule::Manual, Arc::new(NoopJob)))
        .await
        .unwrap();

    for _ in 0..2 {
        let outcome = scheduler
            .execute("noop", JobTrigger::Manual, Value::Null, CancellationToken::new())
            .await
            .unwrap();
        assert!(outcome.is_completed());
    }

    let text = metrics.render();
    assert!(text.contains("hydrotier_job_runs_total{job=\"noop\",outcome=\"completed\"} 2"));
}

#[tokio::test]
async fn test_spans_survive_task_boundaries() {
    init_test_observability();

    let span = tracing::info_span!("flush_cycle", node = "N1");
    let _enter = span.enter();
    tracing::info!("parent span entered");

    let handle = tokio::spawn(async {
        tracing::debug!("child task running");
        tokio::time::sleep(Duration::from_millis(5)).await;
    });
    handle.await.expect("child task failed");
}
