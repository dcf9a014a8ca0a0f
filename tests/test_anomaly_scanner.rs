//! Anomaly detection against the warm tier sink

use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use hydrotier::anomaly::AnomalyScanner;
use hydrotier::config::{AnomalyConfig, EngineConfig};
use hydrotier::sync::{AnomalyScanJob, JobContext, JobHandler, SyncStores};
use hydrotier::tiered_storage::{ColdArchiveStorage, HotMemoryStorage, StorageTier, WarmSqliteStorage, WriteMode};
use hydrotier::types::{AnomalyKind, AnomalyQuery, Metric, Reading, Severity};

const WINDOW: usize = 48;

async fn warm_store(name: &str) -> (std::path::PathBuf, Arc<WarmSqliteStorage>) {
    let dir = std::env::temp_dir().join(format!("hydrotier_anomaly_{}_{}", name, rand::random::<u64>()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("warm.db");
    let warm = WarmSqliteStorage::new(path.to_str().unwrap(), 2, Duration::from_secs(1))
        .await
        .unwrap();
    (dir, Arc::new(warm))
}

fn scanner_config() -> AnomalyConfig {
    AnomalyConfig {
        window_size: WINDOW,
        min_samples: WINDOW,
        ..AnomalyConfig::default()
    }
}

/// 50 readings over ten minutes: 49 alternating around 10.0, then one at
/// five times the mean
fn spike_series(node: &str) -> Vec<Reading> {
    let start = Utc::now() - ChronoDuration::minutes(11);
    (0..50)
        .map(|i| {
            let flow = if i == 49 {
                50.0
            } else if i % 2 == 0 {
                9.5
            } else {
                10.5
            };
            Reading::new(node, start + ChronoDuration::seconds(12 * i)).with_flow(flow)
        })
        .collect()
}

#[tokio::test]
async fn test_spike_is_flagged_exactly_once() {
    let (_dir, warm) = warm_store("spike").await;
    let scanner = AnomalyScanner::new(scanner_config(), warm.clone());
    let readings = spike_series("N1");

    let mut flagged = Vec::new();
    for reading in &readings {
        flagged.extend(scanner.observe(reading).await.unwrap());
    }
    assert_eq!(flagged.len(), 1);
    assert_eq!(flagged[0].kind, AnomalyKind::HighFlow);
    assert_eq!(flagged[0].timestamp, readings[49].timestamp);
    assert_eq!(flagged[0].severity, Severity::Critical);
    assert!((flagged[0].expected_value - 10.0).abs() < 1e-6);
    assert_eq!(scanner.rolling_len("N1", Metric::Flow).await, WINDOW);

    // The batch pass sees the same spike again but the key already exists
    let rescanned = scanner.scan_window("N1", &readings).await.unwrap();
    assert!(rescanned.is_empty());

    let stored = warm.query_anomalies(&AnomalyQuery::default()).await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].kind, AnomalyKind::HighFlow);
    assert_eq!(stored[0].node_id, "N1");
}

#[tokio::test]
async fn test_short_history_is_never_flagged() {
    let (_dir, warm) = warm_store("short").await;
    let scanner = AnomalyScanner::new(scanner_config(), warm.clone());
    let readings = spike_series("N2");

    // Skip most of the warm-up: only 10 samples precede the spike
    for reading in &readings[39..] {
        assert!(scanner.observe(reading).await.unwrap().is_empty());
    }
    assert!(warm.query_anomalies(&AnomalyQuery::default()).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_batch_job_catches_spike_missed_after_reset() {
    let (dir, warm) = warm_store("batch").await;
    let cold = ColdArchiveStorage::new(dir.join("cold"), "readings", Vec::new())
        .await
        .unwrap();
    let stores = SyncStores::new(
        Arc::new(HotMemoryStorage::with_defaults()),
        warm.clone(),
        Arc::new(cold),
        Arc::new(EngineConfig::default()),
    );
    let readings = spike_series("N3");
    warm.write_batch(&readings, WriteMode::SkipExisting).await.unwrap();

    let scanner = Arc::new(AnomalyScanner::new(scanner_config(), warm.clone()));
    let job = AnomalyScanJob::new(stores, scanner.clone());

    let first = job.run(&JobContext::manual("anomaly_scan", json!({}))).await.unwrap();
    assert_eq!(first.records_processed, 50);
    assert_eq!(first.metadata.get("anomalies_recorded"), Some(&json!(1)));

    let second = job.run(&JobContext::manual("anomaly_scan", json!({}))).await.unwrap();
    assert_eq!(second.metadata.get("anomalies_recorded"), Some(&json!(0)));

    let query = AnomalyQuery {
        node_ids: vec!["N3".to_string()],
        kinds: vec![AnomalyKind::HighFlow],
        ..Default::default()
    };
    let stored = warm.query_anomalies(&query).await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].observed_value, 50.0);
}

#[tokio::test]
async fn test_batch_baseline_ignores_other_nodes() {
    let (_dir, warm) = warm_store("mixed").await;
    let scanner = AnomalyScanner::new(scanner_config(), warm.clone());

    // A much busier neighbour would swamp the baseline of N4
    let mut mixed = spike_series("N4");
    mixed.extend(spike_series("N5").into_iter().map(|r| {
        let flow = r.flow.unwrap_or(0.0) * 100.0;
        r.with_flow(flow)
    }));

    let found = scanner.scan_window("N4", &mixed).await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].node_id, "N4");
    assert_eq!(found[0].observed_value, 50.0);
    assert!((found[0].expected_value - 10.79).abs() < 1e-6);
}
