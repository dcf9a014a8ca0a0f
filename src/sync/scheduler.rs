//! Job scheduler
//!
//! Jobs are explicit descriptors (name, schedule, handler) registered into a
//! job table. Each tick runs whatever is due. A job that is still running when
//! it comes due again is skipped, not queued, and its next run is computed from
//! the current time so missed runs coalesce into one.
//!
//! `max_instances = 1` is enforced twice: an in-process flag per job, and the
//! persisted `running` row in `sync_jobs`, which also holds across restarts.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cron::Schedule;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::error::{EngineError, EngineResult};
use crate::observability::EngineMetrics;
use crate::tiered_storage::{JobRecorder, WarmSqliteStorage};
use crate::types::{JobKind, JobStatus, SyncJob};
use crate::utils::retry_transient;

/// When a job runs on its own
#[derive(Debug, Clone)]
pub enum JobSchedule {
    /// Fixed interval, first run one interval after registration
    Interval(Duration),
    /// 6-field cron expression (seconds first)
    Cron(Box<Schedule>),
    /// Only via `trigger_now`
    Manual,
}

impl JobSchedule {
    /// Parse and validate a cron expression
    pub fn parse_cron(expr: &str) -> Result<Schedule> {
        Schedule::from_str(expr)
            .map_err(|e| anyhow::anyhow!("Invalid cron expression '{}': {}", expr, e))
    }

    pub fn cron(expr: &str) -> Result<Self> {
        Ok(JobSchedule::Cron(Box::new(Self::parse_cron(expr)?)))
    }

    /// Next run strictly after `after`
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            JobSchedule::Interval(every) => chrono::Duration::from_std(*every)
                .ok()
                .map(|d| after + d),
            JobSchedule::Cron(schedule) => schedule.after(&after).next(),
            JobSchedule::Manual => None,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            JobSchedule::Interval(every) => format!("every {}s", every.as_secs()),
            JobSchedule::Cron(schedule) => format!("cron {}", schedule),
            JobSchedule::Manual => "manual".to_string(),
        }
    }
}

/// What started a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobTrigger {
    Schedule,
    Manual,
}

/// Everything a handler gets for one run. Handlers must not capture ambient
/// scheduler state; parameters and cancellation arrive here.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub run_id: String,
    pub job_name: String,
    pub trigger: JobTrigger,
    pub started_at: DateTime<Utc>,
    pub params: Value,
    pub cancel: CancellationToken,
}

impl JobContext {
    /// Context for running a handler outside the scheduler (tests, one-off tools)
    pub fn manual(job_name: &str, params: Value) -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            job_name: job_name.to_string(),
            trigger: JobTrigger::Manual,
            started_at: Utc::now(),
            params,
            cancel: CancellationToken::new(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Bail out between pipeline stages once shutdown has started
    pub fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            anyhow::bail!("job {} cancelled", self.job_name);
        }
        Ok(())
    }

    pub fn param_bool(&self, key: &str) -> bool {
        self.params.get(key).and_then(Value::as_bool).unwrap_or(false)
    }

    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(Value::as_str)
    }
}

/// Counts and metadata a handler reports back; persisted on the SyncJob row
#[derive(Debug, Clone, Default)]
pub struct JobReport {
    pub records_processed: u64,
    pub records_failed: u64,
    pub metadata: serde_json::Map<String, Value>,
}

impl JobReport {
    pub fn new(records_processed: u64, records_failed: u64) -> Self {
        Self {
            records_processed,
            records_failed,
            metadata: serde_json::Map::new(),
        }
    }

    pub fn with_meta(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    pub fn merge(&mut self, other: JobReport) {
        self.records_processed += other.records_processed;
        self.records_failed += other.records_failed;
        self.metadata.extend(other.metadata);
    }
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    fn kind(&self) -> JobKind;

    async fn run(&self, ctx: &JobContext) -> Result<JobReport>;
}

/// A registered job
pub struct JobDescriptor {
    pub name: String,
    pub schedule: JobSchedule,
    pub handler: Arc<dyn JobHandler>,
    /// Overrides the scheduler-wide job timeout
    pub timeout: Option<Duration>,
}

impl JobDescriptor {
    pub fn new(name: impl Into<String>, schedule: JobSchedule, handler: Arc<dyn JobHandler>) -> Self {
        Self {
            name: name.into(),
            schedule,
            handler,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Result of asking the scheduler to run a job
#[derive(Debug, Clone)]
pub enum JobOutcome {
    Completed(SyncJob),
    Failed(SyncJob),
    /// Another instance was running (in this process or per the audit table)
    Skipped { job_name: String, reason: String },
}

impl JobOutcome {
    pub fn job(&self) -> Option<&SyncJob> {
        match self {
            JobOutcome::Completed(job) | JobOutcome::Failed(job) => Some(job),
            JobOutcome::Skipped { .. } => None,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, JobOutcome::Completed(_))
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, JobOutcome::Skipped { .. })
    }

    fn label(&self) -> &'static str {
        match self {
            JobOutcome::Completed(_) => "completed",
            JobOutcome::Failed(_) => "failed",
            JobOutcome::Skipped { .. } => "skipped",
        }
    }
}

/// Operator-facing view of one job
#[derive(Debug, Clone, Serialize)]
pub struct JobStatusView {
    pub name: String,
    pub kind: JobKind,
    pub schedule: String,
    pub paused: bool,
    pub running: bool,
    pub next_run: Option<DateTime<Utc>>,
    pub last_run: Option<SyncJob>,
}

struct JobSlot {
    descriptor: JobDescriptor,
    running: Arc<AtomicBool>,
    paused: bool,
    next_run: Option<DateTime<Utc>>,
}

/// Releases the in-process instance flag however the run ends
struct InstanceGuard(Arc<AtomicBool>);

impl Drop for InstanceGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Write an audit row for an operator action
pub async fn record_admin_action(
    recorder: &dyn JobRecorder,
    action: &str,
    metadata: Value,
) -> EngineResult<()> {
    let now = Utc::now();
    let job = SyncJob {
        run_id: Uuid::new_v4().to_string(),
        job_name: format!("admin:{}", action),
        kind: JobKind::Admin,
        status: JobStatus::Completed,
        started_at: now,
        completed_at: Some(now),
        records_processed: 0,
        records_failed: 0,
        error_message: None,
        metadata,
    };
    recorder.record_job(&job).await
}

pub struct SyncScheduler {
    warm: Arc<WarmSqliteStorage>,
    config: SchedulerConfig,
    jobs: RwLock<HashMap<String, JobSlot>>,
    in_flight: Mutex<Vec<JoinHandle<()>>>,
    /// Terminal rows that could not be written; their `running` row still
    /// holds the job lock until they are
    unfinished: Mutex<Vec<SyncJob>>,
    metrics: Option<Arc<EngineMetrics>>,
}

impl SyncScheduler {
    pub fn new(warm: Arc<WarmSqliteStorage>, config: SchedulerConfig) -> Self {
        Self {
            warm,
            config,
            jobs: RwLock::new(HashMap::new()),
            in_flight: Mutex::new(Vec::new()),
            unfinished: Mutex::new(Vec::new()),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<EngineMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub async fn register(&self, descriptor: JobDescriptor) -> EngineResult<()> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&descriptor.name) {
            return Err(EngineError::Configuration(format!(
                "job '{}' registered twice",
                descriptor.name
            )));
        }
        let next_run = descriptor.schedule.next_after(Utc::now());
        info!(
            "Registered job {} ({}, {})",
            descriptor.name,
            descriptor.handler.kind(),
            descriptor.schedule.describe()
        );
        jobs.insert(
            descriptor.name.clone(),
            JobSlot {
                descriptor,
                running: Arc::new(AtomicBool::new(false)),
                paused: false,
                next_run,
            },
        );
        Ok(())
    }

    pub async fn job_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.jobs.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Fail `running` rows older than the stale threshold (left by a crash)
    pub async fn recover_stale_jobs(&self) -> EngineResult<u64> {
        let cutoff = Utc::now() - chrono::Duration::seconds(self.config.stale_job_after_secs as i64);
        let n = self.warm.fail_stale_jobs(cutoff).await?;
        if n > 0 {
            warn!("Marked {} stale running job(s) as failed", n);
        }
        Ok(n)
    }

    fn count(&self, job_name: &str, outcome: &JobOutcome) {
        if let Some(m) = &self.metrics {
            m.job_runs.with_label_values(&[job_name, outcome.label()]).inc();
        }
    }

    /// Run one job now and wait for it. Overlapping runs are skipped.
    pub async fn execute(
        &self,
        job_name: &str,
        trigger: JobTrigger,
        params: Value,
        cancel: CancellationToken,
    ) -> EngineResult<JobOutcome> {
        let (handler, flag, budget) = {
            let jobs = self.jobs.read().await;
            let slot = jobs
                .get(job_name)
                .ok_or_else(|| EngineError::NotFound(format!("job '{}'", job_name)))?;
            (
                slot.descriptor.handler.clone(),
                slot.running.clone(),
                slot.descriptor
                    .timeout
                    .unwrap_or(Duration::from_secs(self.config.job_timeout_secs)),
            )
        };

        if flag.swap(true, Ordering::AcqRel) {
            let outcome = JobOutcome::Skipped {
                job_name: job_name.to_string(),
                reason: "already running in this process".to_string(),
            };
            debug!("Skipping {}: previous run still in progress", job_name);
            self.count(job_name, &outcome);
            return Ok(outcome);
        }
        let _guard = InstanceGuard(flag);

        let ctx = JobContext {
            run_id: Uuid::new_v4().to_string(),
            job_name: job_name.to_string(),
            trigger,
            started_at: Utc::now(),
            params: params.clone(),
            cancel: cancel.child_token(),
        };
        let mut job = SyncJob {
            run_id: ctx.run_id.clone(),
            job_name: job_name.to_string(),
            kind: handler.kind(),
            status: JobStatus::Running,
            started_at: ctx.started_at,
            completed_at: None,
            records_processed: 0,
            records_failed: 0,
            error_message: None,
            metadata: json!({ "trigger": trigger, "params": params }),
        };

        self.settle_unfinished().await;
        if !self.warm.try_start_job(&job).await? {
            let outcome = JobOutcome::Skipped {
                job_name: job_name.to_string(),
                reason: "a running instance is recorded in sync_jobs".to_string(),
            };
            info!("Skipping {}: another instance holds the job lock", job_name);
            self.count(job_name, &outcome);
            return Ok(outcome);
        }

        info!("Job {} started (run {}, {:?})", job_name, job.run_id, trigger);
        let result = tokio::time::timeout(budget, handler.run(&ctx)).await;
        job.completed_at = Some(Utc::now());

        match result {
            Ok(Ok(report)) => {
                job.status = JobStatus::Completed;
                job.records_processed = report.records_processed;
                job.records_failed = report.records_failed;
                if let Value::Object(meta) = &mut job.metadata {
                    meta.extend(report.metadata);
                }
            }
            Ok(Err(e)) => {
                job.status = JobStatus::Failed;
                job.error_message = Some(format!("{:#}", e));
            }
            Err(_) => {
                // Stop whatever the handler left in flight
                ctx.cancel.cancel();
                job.status = JobStatus::Failed;
                job.error_message = Some(format!("timed out after {}s", budget.as_secs()));
            }
        }

        if let Err(e) = retry_transient("finish job", || self.warm.finish_job(&job)).await {
            error!("Could not record the end of {} run {}: {}", job_name, job.run_id, e);
            self.unfinished.lock().await.push(job.clone());
        }

        let outcome = if job.status == JobStatus::Completed {
            info!(
                "Job {} completed: {} processed, {} failed",
                job_name, job.records_processed, job.records_failed
            );
            JobOutcome::Completed(job)
        } else {
            error!(
                "Job {} failed: {}",
                job_name,
                job.error_message.as_deref().unwrap_or("unknown error")
            );
            JobOutcome::Failed(job)
        };
        self.count(job_name, &outcome);
        Ok(outcome)
    }

    /// Write terminal rows that failed to persist earlier. Returns how many
    /// are still pending.
    pub async fn settle_unfinished(&self) -> usize {
        let mut unfinished = self.unfinished.lock().await;
        if unfinished.is_empty() {
            return 0;
        }
        let mut pending = Vec::new();
        for job in unfinished.drain(..) {
            match self.warm.finish_job(&job).await {
                Ok(()) => info!("Recorded late end of {} run {}", job.job_name, job.run_id),
                Err(EngineError::NotFound(_)) => {
                    warn!("Run {} of {} no longer in sync_jobs", job.run_id, job.job_name)
                }
                Err(e) => {
                    debug!("End of {} run {} still not recorded: {}", job.job_name, job.run_id, e);
                    pending.push(job);
                }
            }
        }
        *unfinished = pending;
        unfinished.len()
    }

    /// Operator trigger; runs even if the job is paused
    pub async fn trigger_now(&self, job_name: &str, params: Value) -> EngineResult<JobOutcome> {
        record_admin_action(
            self.warm.as_ref(),
            "trigger",
            json!({ "job": job_name, "params": params.clone() }),
        )
        .await?;
        self.execute(job_name, JobTrigger::Manual, params, CancellationToken::new())
            .await
    }

    async fn set_paused(&self, job_name: &str, paused: bool) -> EngineResult<()> {
        {
            let mut jobs = self.jobs.write().await;
            let slot = jobs
                .get_mut(job_name)
                .ok_or_else(|| EngineError::NotFound(format!("job '{}'", job_name)))?;
            if slot.paused == paused {
                return Ok(());
            }
            slot.paused = paused;
            if !paused {
                slot.next_run = slot.descriptor.schedule.next_after(Utc::now());
            }
        }
        let action = if paused { "pause" } else { "resume" };
        info!("Job {} {}d", job_name, action);
        record_admin_action(self.warm.as_ref(), action, json!({ "job": job_name })).await
    }

    pub async fn pause(&self, job_name: &str) -> EngineResult<()> {
        self.set_paused(job_name, true).await
    }

    pub async fn resume(&self, job_name: &str) -> EngineResult<()> {
        self.set_paused(job_name, false).await
    }

    pub async fn list_status(&self) -> EngineResult<Vec<JobStatusView>> {
        let snapshot: Vec<JobStatusView> = {
            let jobs = self.jobs.read().await;
            jobs.values()
                .map(|slot| JobStatusView {
                    name: slot.descriptor.name.clone(),
                    kind: slot.descriptor.handler.kind(),
                    schedule: slot.descriptor.schedule.describe(),
                    paused: slot.paused,
                    running: slot.running.load(Ordering::Acquire),
                    next_run: slot.next_run,
                    last_run: None,
                })
                .collect()
        };

        let mut views = Vec::with_capacity(snapshot.len());
        for mut view in snapshot {
            view.last_run = self.warm.last_job(&view.name).await?;
            views.push(view);
        }
        views.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(views)
    }

    /// Names due at `now`; their next run is advanced from `now` (coalescing)
    async fn take_due(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut jobs = self.jobs.write().await;
        let mut due = Vec::new();
        for (name, slot) in jobs.iter_mut() {
            if slot.paused {
                continue;
            }
            if slot.next_run.map_or(false, |next| next <= now) {
                slot.next_run = slot.descriptor.schedule.next_after(now);
                due.push(name.clone());
            }
        }
        due
    }

    /// Spawn every due job; returns how many were started
    pub async fn tick(self: &Arc<Self>, cancel: &CancellationToken) -> usize {
        self.settle_unfinished().await;
        let due = self.take_due(Utc::now()).await;
        let mut in_flight = self.in_flight.lock().await;
        in_flight.retain(|h| !h.is_finished());

        for name in &due {
            let scheduler = self.clone();
            let name = name.clone();
            let cancel = cancel.clone();
            in_flight.push(tokio::spawn(async move {
                if let Err(e) = scheduler
                    .execute(&name, JobTrigger::Schedule, Value::Null, cancel)
                    .await
                {
                    error!("Could not run job {}: {}", name, e);
                }
            }));
        }
        due.len()
    }

    /// Scheduler loop; returns after cancellation once in-flight runs have
    /// stopped or the grace period ran out
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        if let Err(e) = self.recover_stale_jobs().await {
            warn!("Stale job recovery failed: {}", e);
        }

        let mut ticker = tokio::time::interval(Duration::from_millis(self.config.tick_ms.max(10)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!("Scheduler started with {} job(s)", self.jobs.read().await.len());

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.tick(&cancel).await;
                }
            }
        }

        let handles: Vec<JoinHandle<()>> = self.in_flight.lock().await.drain(..).collect();
        if !handles.is_empty() {
            info!("Waiting for {} in-flight job(s)", handles.len());
            let drain = futures::future::join_all(handles);
            if tokio::time::timeout(Duration::from_secs(30), drain).await.is_err() {
                warn!("In-flight jobs did not stop within the grace period");
            }
        }
        info!("Scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cron() {
        assert!(JobSchedule::parse_cron("0 5 * * * *").is_ok());
        assert!(JobSchedule::parse_cron("not a cron").is_err());
    }

    #[test]
    fn test_next_after() {
        let t = Utc::now();
        let every = JobSchedule::Interval(Duration::from_secs(300));
        assert_eq!(every.next_after(t), Some(t + chrono::Duration::seconds(300)));
        assert_eq!(JobSchedule::Manual.next_after(t), None);

        let hourly = JobSchedule::cron("0 0 * * * *").unwrap();
        let next = hourly.next_after(t).unwrap();
        assert!(next > t);
        assert!(next - t <= chrono::Duration::hours(1));
    }

    #[test]
    fn test_report_merge() {
        let mut a = JobReport::new(3, 1).with_meta("nodes", 2);
        a.merge(JobReport::new(4, 0).with_meta("skipped_existing", 5));
        assert_eq!(a.records_processed, 7);
        assert_eq!(a.records_failed, 1);
        assert_eq!(a.metadata["skipped_existing"], 5);
    }
}
