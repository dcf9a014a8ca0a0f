//! Scheduled synchronization between tiers and the maintenance jobs around it

mod jobs;
mod scheduler;

pub use jobs::{
    AggregateRefreshJob, AnomalyScanJob, CacheRefreshJob, ColdArchiveJob, DataQualityAuditJob,
    HistoricalBackfillJob, ModelCycleJob, RecentSyncJob, RetentionCleanupJob, SyncStores,
    COLD_ARCHIVE_WATERMARK, RECENT_SYNC_WATERMARK,
};
pub use scheduler::{
    record_admin_action, JobContext, JobDescriptor, JobHandler, JobOutcome, JobReport, JobSchedule,
    JobStatusView, JobTrigger, SyncScheduler,
};

use std::sync::Arc;
use std::time::Duration;

use crate::anomaly::AnomalyScanner;
use crate::error::{EngineError, EngineResult};
use crate::lifecycle::ModelLifecycleManager;

/// Register the standard job set under their default names
pub async fn register_default_jobs(
    scheduler: &SyncScheduler,
    stores: &SyncStores,
    scanner: Arc<AnomalyScanner>,
    manager: Arc<ModelLifecycleManager>,
) -> EngineResult<()> {
    let cfg = &stores.config.scheduler;
    let every = |secs: u64| JobSchedule::Interval(Duration::from_secs(secs));
    let cron = |expr: &str| {
        JobSchedule::cron(expr).map_err(|e| EngineError::Configuration(format!("{:#}", e)))
    };

    let descriptors = vec![
        JobDescriptor::new(
            "recent_sync",
            every(cfg.recent_sync_interval_secs),
            Arc::new(RecentSyncJob::new(stores.clone())),
        ),
        JobDescriptor::new(
            "historical_backfill",
            JobSchedule::Manual,
            Arc::new(HistoricalBackfillJob::new(stores.clone())),
        ),
        JobDescriptor::new(
            "aggregate_refresh",
            cron(&cfg.aggregate_refresh_cron)?,
            Arc::new(AggregateRefreshJob::new(stores.clone())),
        ),
        JobDescriptor::new(
            "data_quality_audit",
            cron(&cfg.data_quality_cron)?,
            Arc::new(DataQualityAuditJob::new(stores.clone())),
        ),
        JobDescriptor::new(
            "retention_cleanup",
            cron(&cfg.retention_cron)?,
            Arc::new(RetentionCleanupJob::new(stores.clone())),
        ),
        JobDescriptor::new(
            "anomaly_scan",
            every(cfg.anomaly_scan_interval_secs),
            Arc::new(AnomalyScanJob::new(stores.clone(), scanner)),
        ),
        JobDescriptor::new(
            "cache_refresh",
            every(cfg.cache_refresh_interval_secs),
            Arc::new(CacheRefreshJob::new(stores.clone())),
        ),
        JobDescriptor::new(
            "cold_archive",
            every(cfg.cold_archive_interval_secs),
            Arc::new(ColdArchiveJob::new(stores.clone())),
        ),
        JobDescriptor::new(
            "model_cycle",
            every(cfg.model_cycle_interval_secs),
            Arc::new(ModelCycleJob::new(manager)),
        ),
    ];

    for descriptor in descriptors {
        scheduler.register(descriptor).await?;
    }
    Ok(())
}
