//! Write buffer
//!
//! Accumulates accepted readings and persists them to the warm tier in bulk.
//! A flush fires when the batch size is reached or the flush interval has
//! elapsed, whichever comes first. A failed batch is put back in front of the
//! queue and retried with exponential backoff; every `max_consecutive_failures`
//! failures the incident is recorded as a failed `buffer_flush` job.

use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::traits::{JobRecorder, StorageTier, WriteMode};
use crate::config::BufferConfig;
use crate::error::{EngineError, EngineResult};
use crate::observability::EngineMetrics;
use crate::types::{JobKind, JobStatus, Reading, SyncJob};

#[derive(Debug)]
struct BufferState {
    pending: Vec<Reading>,
    last_flush: Instant,
    consecutive_failures: u32,
    retry_at: Option<Instant>,
}

/// What a single flush persisted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Readings taken from the queue
    pub flushed: usize,
    pub written: u64,
    /// Already present in the warm tier
    pub skipped: u64,
}

pub struct WriteBuffer {
    state: Mutex<BufferState>,
    /// Serializes flushes; enqueue never waits on it
    flush_lock: Mutex<()>,
    notify: Notify,
    sink: Arc<dyn StorageTier>,
    recorder: Option<Arc<dyn JobRecorder>>,
    config: BufferConfig,
    metrics: Option<Arc<EngineMetrics>>,
}

impl WriteBuffer {
    pub fn new(sink: Arc<dyn StorageTier>, config: BufferConfig) -> Self {
        Self {
            state: Mutex::new(BufferState {
                pending: Vec::with_capacity(config.batch_size),
                last_flush: Instant::now(),
                consecutive_failures: 0,
                retry_at: None,
            }),
            flush_lock: Mutex::new(()),
            notify: Notify::new(),
            sink,
            recorder: None,
            config,
            metrics: None,
        }
    }

    pub fn with_recorder(mut self, recorder: Arc<dyn JobRecorder>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<EngineMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &BufferConfig {
        &self.config
    }

    /// Queue a reading. Never drops: the queue grows past `batch_size` while a
    /// flush is failing. Returns the pending count after the push.
    pub async fn enqueue(&self, reading: Reading) -> usize {
        let len = {
            let mut state = self.state.lock().await;
            state.pending.push(reading);
            state.pending.len()
        };
        if let Some(m) = &self.metrics {
            m.buffer_pending.set(len as i64);
        }
        if len >= self.config.batch_size {
            self.notify.notify_one();
        }
        len
    }

    pub async fn pending_len(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    pub async fn consecutive_failures(&self) -> u32 {
        self.state.lock().await.consecutive_failures
    }

    /// Flush if the size or interval trigger has fired and no backoff is in
    /// effect. All pending readings go out in the one flush.
    pub async fn flush_if_due(&self) -> EngineResult<Option<FlushReport>> {
        let due = {
            let state = self.state.lock().await;
            let backing_off = state.retry_at.map_or(false, |at| Instant::now() < at);
            !state.pending.is_empty()
                && !backing_off
                && (state.pending.len() >= self.config.batch_size
                    || state.last_flush.elapsed() >= self.config.max_flush_interval())
        };
        if !due {
            return Ok(None);
        }
        self.flush().await.map(Some)
    }

    /// Persist everything pending in one bulk insert. The queue is cleared
    /// only once the insert has committed.
    pub async fn flush(&self) -> EngineResult<FlushReport> {
        let _flushing = self.flush_lock.lock().await;

        let batch = {
            let mut state = self.state.lock().await;
            if state.pending.is_empty() {
                state.last_flush = Instant::now();
                return Ok(FlushReport::default());
            }
            std::mem::take(&mut state.pending)
        };

        let started = Instant::now();
        match self.sink.write_batch(&batch, WriteMode::SkipExisting).await {
            Ok(outcome) => {
                let pending = {
                    let mut state = self.state.lock().await;
                    state.last_flush = Instant::now();
                    state.consecutive_failures = 0;
                    state.retry_at = None;
                    state.pending.len()
                };
                if let Some(m) = &self.metrics {
                    m.buffer_flushes.inc();
                    m.buffer_pending.set(pending as i64);
                }
                debug!(
                    "Flushed {} readings to {} tier in {:?} ({} written, {} skipped)",
                    batch.len(),
                    self.sink.tier(),
                    started.elapsed(),
                    outcome.written,
                    outcome.skipped
                );
                Ok(FlushReport {
                    flushed: batch.len(),
                    written: outcome.written,
                    skipped: outcome.skipped,
                })
            }
            Err(e) => {
                let batch_len = batch.len();
                let (failures, backoff, pending) = {
                    let mut state = self.state.lock().await;
                    // Failed batch goes back ahead of anything enqueued meanwhile
                    let newer = std::mem::replace(&mut state.pending, batch);
                    state.pending.extend(newer);
                    state.consecutive_failures += 1;
                    let backoff = self.backoff_for(state.consecutive_failures);
                    state.retry_at = Some(Instant::now() + backoff);
                    (state.consecutive_failures, backoff, state.pending.len())
                };
                if let Some(m) = &self.metrics {
                    m.buffer_flush_failures.inc();
                    m.buffer_pending.set(pending as i64);
                }
                warn!(
                    "Flush of {} readings failed (attempt {}), retrying in {:?}: {}",
                    batch_len, failures, backoff, e
                );

                let threshold = self.config.max_consecutive_failures.max(1);
                if failures % threshold == 0 {
                    self.escalate(failures, pending, &e).await;
                }
                Err(e)
            }
        }
    }

    /// `base * 2^(failures-1)`, capped
    fn backoff_for(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(20);
        let ms = self
            .config
            .backoff_base_ms
            .saturating_mul(1u64 << exp)
            .min(self.config.backoff_max_ms);
        Duration::from_millis(ms)
    }

    async fn escalate(&self, failures: u32, pending: usize, cause: &EngineError) {
        error!(
            "Write buffer flush failed {} consecutive times; {} readings pending: {}",
            failures, pending, cause
        );

        let Some(recorder) = &self.recorder else {
            return;
        };
        let now = Utc::now();
        let job = SyncJob {
            run_id: uuid::Uuid::new_v4().to_string(),
            job_name: "write_buffer".to_string(),
            kind: JobKind::BufferFlush,
            status: JobStatus::Failed,
            started_at: now,
            completed_at: Some(now),
            records_processed: 0,
            records_failed: pending as u64,
            error_message: Some(cause.to_string()),
            metadata: serde_json::json!({
                "consecutive_failures": failures,
                "pending": pending,
            }),
        };
        if let Err(e) = recorder.record_job(&job).await {
            warn!("Could not record flush escalation: {}", e);
        }
    }

    /// Background loop: flush on size trigger or tick, drain on cancellation
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let tick = (self.config.max_flush_interval() / 4).max(Duration::from_millis(50));
        let mut ticker = tokio::time::interval(tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(
            "Write buffer started: batch_size={}, max_flush_interval={:?}",
            self.config.batch_size,
            self.config.max_flush_interval()
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.notify.notified() => {}
                _ = ticker.tick() => {}
            }
            if let Err(e) = self.flush_if_due().await {
                debug!("Scheduled flush failed: {}", e);
            }
        }

        match self.flush().await {
            Ok(report) => info!("Write buffer drained on shutdown: {} readings", report.flushed),
            Err(e) => error!(
                "Final flush failed, {} readings not persisted: {}",
                self.pending_len().await,
                e
            ),
        }
    }
}
