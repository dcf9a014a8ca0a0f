//! Integration tests for the ETL jobs: idempotence, subset sync and archiving

use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use hydrotier::config::EngineConfig;
use hydrotier::sync::{
    AggregateRefreshJob, ColdArchiveJob, HistoricalBackfillJob, JobContext, JobHandler, RecentSyncJob, SyncStores,
    COLD_ARCHIVE_WATERMARK, RECENT_SYNC_WATERMARK,
};
use hydrotier::tiered_storage::{ColdArchiveStorage, HotMemoryStorage, StorageTier, WarmSqliteStorage, WriteMode};
use hydrotier::types::{Provenance, RangeQuery, Reading, Resolution};

async fn stores(name: &str) -> SyncStores {
    let dir = std::env::temp_dir().join(format!("hydrotier_sync_{}_{}", name, rand::random::<u64>()));
    std::fs::create_dir_all(&dir).unwrap();
    let db = dir.join("warm.db");
    let warm = WarmSqliteStorage::new(db.to_str().unwrap(), 2, Duration::from_secs(1))
        .await
        .unwrap();
    let cold = ColdArchiveStorage::new(dir.join("cold"), "readings", Vec::new())
        .await
        .unwrap();
    SyncStores::new(
        Arc::new(HotMemoryStorage::with_defaults()),
        Arc::new(warm),
        Arc::new(cold),
        Arc::new(EngineConfig::default()),
    )
}

/// 24 readings per node at 15 minute cadence, starting on an hour boundary
fn history(node: &str, hours_ago: i64) -> Vec<Reading> {
    let base = Resolution::Hourly.bucket_start(Utc::now() - ChronoDuration::hours(hours_ago));
    (0..24)
        .map(|i| {
            Reading::new(node, base + ChronoDuration::minutes(15 * i))
                .with_flow(10.0 + (i % 4) as f64)
                .with_pressure(3.5)
        })
        .collect()
}

#[tokio::test]
async fn test_backfill_and_aggregates_are_idempotent() {
    let stores = stores("idempotent").await;
    let mut seeded = history("N1", 10);
    seeded.extend(history("N2", 10));
    stores.cold.write_batch(&seeded, WriteMode::SkipExisting).await.unwrap();

    let backfill = HistoricalBackfillJob::new(stores.clone());
    let refresh = AggregateRefreshJob::new(stores.clone());
    let params = json!({ "start": (Utc::now() - ChronoDuration::days(1)).to_rfc3339() });

    let first = backfill
        .run(&JobContext::manual("historical_backfill", params.clone()))
        .await
        .unwrap();
    refresh
        .run(&JobContext::manual("aggregate_refresh", json!({})))
        .await
        .unwrap();
    let readings_once = stores.warm.count().await.unwrap();
    let aggregates_once = stores.warm.count_aggregates().await.unwrap();
    assert_eq!(first.records_processed, 48);
    assert_eq!(readings_once, 48);
    assert!(aggregates_once >= 12, "expected hourly rollups, got {}", aggregates_once);

    let second = backfill
        .run(&JobContext::manual("historical_backfill", params))
        .await
        .unwrap();
    refresh
        .run(&JobContext::manual("aggregate_refresh", json!({})))
        .await
        .unwrap();

    assert_eq!(second.records_processed, 0);
    assert_eq!(second.metadata.get("skipped_existing"), Some(&json!(48)));
    assert_eq!(stores.warm.count().await.unwrap(), readings_once);
    assert_eq!(stores.warm.count_aggregates().await.unwrap(), aggregates_once);

    let imported = stores
        .warm
        .readings_between("N1", Utc::now() - ChronoDuration::days(1), Utc::now())
        .await
        .unwrap();
    assert!(imported.iter().all(|r| r.provenance == Provenance::Backfill));
}

#[tokio::test]
async fn test_backfill_rejects_unknown_table() {
    let stores = stores("unknown_table").await;
    let job = HistoricalBackfillJob::new(stores);
    let params = json!({
        "start": (Utc::now() - ChronoDuration::days(1)).to_rfc3339(),
        "tables": ["no_such_table"],
    });
    assert!(job
        .run(&JobContext::manual("historical_backfill", params))
        .await
        .is_err());
}

#[tokio::test]
async fn test_recent_sync_fills_only_missing_keys() {
    let stores = stores("subset").await;
    let cold_rows = history("N1", 8);
    stores.cold.write_batch(&cold_rows, WriteMode::SkipExisting).await.unwrap();
    // Half the window already landed through live ingest
    stores
        .warm
        .write_batch(&cold_rows[..12], WriteMode::SkipExisting)
        .await
        .unwrap();

    let job = RecentSyncJob::new(stores.clone());
    let report = job.run(&JobContext::manual("recent_sync", json!({}))).await.unwrap();

    assert_eq!(report.records_processed, 12);
    assert_eq!(report.metadata.get("skipped_existing"), Some(&json!(12)));
    assert_eq!(stores.warm.count().await.unwrap(), 24);
    assert!(stores.warm.get_watermark(RECENT_SYNC_WATERMARK).await.unwrap().is_some());
    assert!(stores.warm.get_node("N1").await.unwrap().is_some());

    // Latest value is visible in the hot tier after the sync
    let latest = stores.hot.latest("N1").await.unwrap().expect("hot latest refreshed");
    assert_eq!(latest.timestamp, cold_rows[23].timestamp);

    // Watermark moved past the window: a rerun imports nothing
    let rerun = job.run(&JobContext::manual("recent_sync", json!({}))).await.unwrap();
    assert_eq!(rerun.records_processed, 0);
    assert_eq!(stores.warm.count().await.unwrap(), 24);
}

#[tokio::test]
async fn test_cold_archive_copies_live_rows_once() {
    let stores = stores("archive").await;
    let received = Utc::now() - ChronoDuration::hours(3);
    let live: Vec<Reading> = history("N5", 6)
        .into_iter()
        .map(|mut r| {
            r.received_at = received;
            r
        })
        .collect();
    stores.warm.write_batch(&live, WriteMode::SkipExisting).await.unwrap();

    // Came from cold in the first place; must not be written back
    let synced: Vec<Reading> = history("N6", 6)
        .into_iter()
        .map(|mut r| {
            r.received_at = received;
            r.with_provenance(Provenance::ColdSync)
        })
        .collect();
    stores.warm.write_batch(&synced, WriteMode::SkipExisting).await.unwrap();

    let job = ColdArchiveJob::new(stores.clone());
    let report = job.run(&JobContext::manual("cold_archive", json!({}))).await.unwrap();
    assert_eq!(report.records_processed, 24);
    assert!(stores.warm.get_watermark(COLD_ARCHIVE_WATERMARK).await.unwrap().is_some());

    let start = Utc::now() - ChronoDuration::days(1);
    let archived = stores
        .cold
        .scan_table("readings", start, Utc::now(), None)
        .await
        .unwrap();
    assert_eq!(archived.readings.len(), 24);
    assert!(archived.readings.iter().all(|r| r.node_id == "N5"));

    let rerun = job.run(&JobContext::manual("cold_archive", json!({}))).await.unwrap();
    assert_eq!(rerun.records_processed, 0);
    let archived = stores
        .cold
        .scan_table("readings", start, Utc::now(), None)
        .await
        .unwrap();
    assert_eq!(archived.readings.len(), 24);
}

#[tokio::test]
async fn test_backfill_inside_hot_window_withdraws_hot_coverage() {
    let stores = stores("coverage").await;
    let live = Reading::new("N7", Utc::now() - ChronoDuration::hours(9)).with_flow(12.0);
    stores.hot.write_batch(&[live.clone()], WriteMode::SkipExisting).await.unwrap();
    stores.warm.write_batch(&[live.clone()], WriteMode::SkipExisting).await.unwrap();
    assert_eq!(stores.hot.coverage_start("N7").await, Some(live.timestamp));

    // Rows newer than the live reading reach warm without passing through hot
    stores.cold.write_batch(&history("N7", 8), WriteMode::SkipExisting).await.unwrap();
    let backfill = HistoricalBackfillJob::new(stores.clone());
    let params = json!({ "start": (Utc::now() - ChronoDuration::days(1)).to_rfc3339() });
    let report = backfill
        .run(&JobContext::manual("historical_backfill", params))
        .await
        .unwrap();
    assert_eq!(report.records_processed, 24);

    assert_eq!(stores.hot.coverage_start("N7").await, None);
    let query = RangeQuery::new("N7", live.timestamp, Utc::now(), Resolution::Raw);
    let hot = stores.hot.read_range(&query).await.unwrap();
    assert!(hot.partial);
    assert_eq!(hot.points.len(), 1);
}
