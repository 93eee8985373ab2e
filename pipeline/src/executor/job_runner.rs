//! Device workers
//!
//! One worker per device pulls items from its queue and runs them on the
//! compute backend, one at a time:
//!
//! ```text
//! JobQueue → DeviceWorker → ComputeBackend
//!                 ↓
//!     shard append + progress mark → WorkerEvent → coordinator
//! ```
//!
//! Measurement rows go to the worker's own shard file, so workers never
//! contend on shared output. Transient backend failures are retried with
//! exponential backoff; anything else marks the item failed and the worker
//! moves on.

use super::backend::ComputeBackend;
use super::shutdown::Shutdown;
use super::types::{MeasureRequest, QuantizeRequest};
use crate::config::RetryPolicy;
use crate::device::Device;
use crate::errors::{PipelineError, Result};
use crate::executor::BackendError;
use crate::fsutil::now_ms;
use crate::layout::ModelLayout;
use crate::progress::ProgressStore;
use crate::record::{MeasurementRow, ShardWriter};
use crate::scheduler::{JobQueue, QueuedJob};
use crate::work::{ItemId, Stage, VariantKey, WorkItem};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Quantizer state file whose presence means a build can be resumed
const RESUME_MARKER: &str = "args.json";

/// Job execution statistics
#[derive(Debug, Default)]
pub struct JobStats {
    /// Total number of jobs successfully completed
    pub jobs_completed: AtomicU64,

    /// Total number of jobs that failed for good
    pub jobs_failed: AtomicU64,

    /// Failed attempts that were put back on the queue
    pub jobs_retried: AtomicU64,

    /// Total execution time across all attempts (milliseconds)
    pub total_execution_time_ms: AtomicU64,
}

impl JobStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successful job completion
    pub fn record_success(&self, execution_time_ms: u64) {
        self.jobs_completed.fetch_add(1, Ordering::Relaxed);
        self.total_execution_time_ms
            .fetch_add(execution_time_ms, Ordering::Relaxed);
    }

    /// Record a final job failure
    pub fn record_failure(&self, execution_time_ms: u64) {
        self.jobs_failed.fetch_add(1, Ordering::Relaxed);
        self.total_execution_time_ms
            .fetch_add(execution_time_ms, Ordering::Relaxed);
    }

    /// Record an attempt that will be retried
    pub fn record_retry(&self, execution_time_ms: u64) {
        self.jobs_retried.fetch_add(1, Ordering::Relaxed);
        self.total_execution_time_ms
            .fetch_add(execution_time_ms, Ordering::Relaxed);
    }

    pub fn completed(&self) -> u64 {
        self.jobs_completed.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.jobs_failed.load(Ordering::Relaxed)
    }

    pub fn retried(&self) -> u64 {
        self.jobs_retried.load(Ordering::Relaxed)
    }

    /// Get total jobs processed (completed + failed)
    pub fn total_jobs(&self) -> u64 {
        self.completed() + self.failed()
    }

    /// Get average execution time per finished job (milliseconds)
    pub fn avg_execution_time_ms(&self) -> f64 {
        let total_jobs = self.total_jobs();
        if total_jobs == 0 {
            return 0.0;
        }

        let total_time = self.total_execution_time_ms.load(Ordering::Relaxed);
        total_time as f64 / total_jobs as f64
    }

    /// Get success rate (0.0 - 1.0)
    pub fn success_rate(&self) -> f64 {
        let total_jobs = self.total_jobs();
        if total_jobs == 0 {
            return 0.0;
        }
        self.completed() as f64 / total_jobs as f64
    }

    /// Print statistics summary
    pub fn print_summary(&self, device: Device) {
        info!(
            device = device.id,
            total_jobs = self.total_jobs(),
            completed = self.completed(),
            failed = self.failed(),
            retried = self.retried(),
            avg_execution_time_ms = format!("{:.2}", self.avg_execution_time_ms()),
            success_rate = format!("{:.1}%", self.success_rate() * 100.0),
            "Device statistics"
        );
    }
}

/// Progress reported by workers to the coordinator
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    /// An item finished and its progress is durable
    Completed {
        device: u32,
        item: ItemId,
        row: Option<MeasurementRow>,
    },

    /// An item failed and will not be retried in this run
    Failed {
        device: u32,
        item: ItemId,
        error: String,
    },
}

/// What a worker did before it stopped
#[derive(Debug)]
pub struct WorkerReport {
    pub device: Device,
    pub stats: Arc<JobStats>,
    pub failures: Vec<(ItemId, String)>,
}

/// Shared collaborators handed to every worker of a stage
#[derive(Clone)]
pub struct WorkerContext {
    pub backend: Arc<dyn ComputeBackend>,
    pub store: Arc<dyn ProgressStore>,
    pub layout: ModelLayout,
    pub retry: RetryPolicy,
    pub shutdown: Shutdown,
    pub events: mpsc::UnboundedSender<WorkerEvent>,

    /// Names this run's shard files
    pub run_id: Uuid,
}

/// Runs the items of one device, strictly sequentially
pub struct DeviceWorker {
    device: Device,
    queue: JobQueue,
    ctx: WorkerContext,
    shard: Option<ShardWriter>,
    stats: Arc<JobStats>,
    failures: Vec<(ItemId, String)>,
}

impl DeviceWorker {
    pub fn new(device: Device, queue: JobQueue, ctx: WorkerContext) -> Self {
        Self {
            device,
            queue,
            ctx,
            shard: None,
            stats: Arc::new(JobStats::new()),
            failures: Vec::new(),
        }
    }

    pub fn stats(&self) -> &Arc<JobStats> {
        &self.stats
    }

    /// Pull and run items until the queue is empty or shutdown is requested.
    ///
    /// Item failures never stop the loop; only a broken queue does.
    #[instrument(skip(self), fields(device = self.device.id))]
    pub async fn run(mut self) -> Result<WorkerReport> {
        info!("Device worker started");

        loop {
            if self.ctx.shutdown.is_triggered() {
                info!("Shutdown requested, not taking new work");
                break;
            }
            let Some(job) = self.queue.dequeue()? else {
                break;
            };
            self.run_job(job).await?;
        }

        self.stats.print_summary(self.device);
        Ok(WorkerReport {
            device: self.device,
            stats: self.stats,
            failures: self.failures,
        })
    }

    async fn run_job(&mut self, job: QueuedJob) -> Result<()> {
        let item_id = job.item.id();
        info!(item = %item_id, attempt = job.attempt + 1, "Starting item");

        let start = Instant::now();
        let result = self.execute(&job.item).await;
        let execution_time_ms = start.elapsed().as_millis() as u64;

        match result {
            Ok(row) => {
                self.stats.record_success(execution_time_ms);
                info!(item = %item_id, execution_time_ms, "Item completed");
                self.notify(WorkerEvent::Completed {
                    device: self.device.id,
                    item: item_id,
                    row,
                });
            }
            Err(e) if self.should_retry(&e, job.attempt) => {
                self.stats.record_retry(execution_time_ms);
                let attempt = job.attempt + 1;
                let backoff = self.ctx.retry.backoff(attempt);
                warn!(
                    item = %item_id,
                    error = %e,
                    attempt,
                    max_retries = self.ctx.retry.max_retries,
                    backoff_ms = backoff.as_millis() as u64,
                    "Transient failure, retrying"
                );
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = self.ctx.shutdown.wait() => {}
                }
                // Left queued if shutdown arrived during the backoff
                self.queue.enqueue(job.retry())?;
            }
            Err(e) => {
                self.stats.record_failure(execution_time_ms);
                error!(item = %item_id, error = %e, execution_time_ms, "Item failed");
                self.failures.push((item_id.clone(), e.to_string()));
                self.notify(WorkerEvent::Failed {
                    device: self.device.id,
                    item: item_id,
                    error: e.to_string(),
                });
            }
        }
        Ok(())
    }

    fn should_retry(&self, error: &PipelineError, attempt: u32) -> bool {
        let transient = matches!(error, PipelineError::Backend(b) if b.is_transient());
        transient && attempt < self.ctx.retry.max_retries && !self.ctx.shutdown.is_triggered()
    }

    fn notify(&self, event: WorkerEvent) {
        if self.ctx.events.send(event).is_err() {
            debug!("Coordinator no longer listening");
        }
    }

    async fn execute(&mut self, item: &WorkItem) -> Result<Option<MeasurementRow>> {
        match item.stage {
            Stage::Quantize => {
                self.quantize(item).await?;
                Ok(None)
            }
            Stage::Measure => self.measure(item).await.map(Some),
        }
    }

    async fn quantize(&self, item: &WorkItem) -> Result<()> {
        let bpw = item.variant.bpw().ok_or_else(|| {
            PipelineError::Plan(format!("{} cannot be quantized", item.variant))
        })?;
        let layout = &self.ctx.layout;
        let out_dir = layout.variant_dir(&item.variant);
        let work_dir = layout.work_dir(&item.variant);

        self.ctx.store.clear_quantized(item)?;

        let request = QuantizeRequest {
            model_dir: layout.model_dir().to_path_buf(),
            resume: work_dir.join(RESUME_MARKER).is_file(),
            out_dir,
            work_dir,
            bpw,
            device: self.device.id,
            passthrough: item.params.passthrough.clone(),
        };
        self.ctx.backend.run_quantize(&request).await?;

        let marker = request.out_dir.join(layout.artifact_marker());
        if !marker.is_file() {
            return Err(BackendError::MissingArtifact(marker.display().to_string()).into());
        }

        self.ctx.store.mark_quantized(item)
    }

    async fn measure(&mut self, item: &WorkItem) -> Result<MeasurementRow> {
        let request = MeasureRequest {
            model_dir: self.ctx.layout.model_dir().to_path_buf(),
            variant_dir: self.ctx.layout.variant_dir(&item.variant),
            variant: item.variant,
            device: self.device.id,
            ppl_rows: item.params.ppl_rows,
            kl_rows: item.params.kl_rows,
            passthrough: item.params.passthrough.clone(),
        };
        let measurement = self.ctx.backend.run_measure(&request).await?;

        let row = MeasurementRow {
            variant: item.variant,
            gib: measurement.gib,
            kl_div: if item.variant == VariantKey::Base {
                0.0
            } else {
                measurement.kl_div
            },
            ppl: measurement.ppl,
            device: self.device.id,
            measured_at_ms: now_ms(),
        };

        self.shard_writer()?.append(&row)?;
        self.ctx.store.mark_measured(&item.model_id, &item.variant)?;
        Ok(row)
    }

    /// This worker's shard, created on first use
    fn shard_writer(&mut self) -> Result<&mut ShardWriter> {
        if self.shard.is_none() {
            let path = self.ctx.layout.shard_path(self.device.id, self.ctx.run_id);
            debug!(path = %path.display(), "Opening shard");
            self.shard = Some(ShardWriter::open(&path)?);
        }
        self.shard
            .as_mut()
            .ok_or_else(|| PipelineError::Queue("shard writer unavailable".to_string()))
    }
}
