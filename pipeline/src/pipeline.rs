//! Batch coordinator
//!
//! Runs the quantize stage then the measure stage for one model. For each
//! stage it plans against the progress store, spawns one worker per device,
//! merges shards into the canonical record as measurements complete, and
//! retires the shards once the final merge is durable.

use crate::config::PipelineConfig;
use crate::errors::{PipelineError, Result};
use crate::executor::{ComputeBackend, DeviceWorker, Shutdown, WorkerContext, WorkerEvent, WorkerReport};
use crate::layout::ModelLayout;
use crate::progress::{FsProgressStore, ProgressStore};
use crate::record::{MergeReport, ShardMerger};
use crate::scheduler::{DispatchPlan, JobQueue, Scheduler};
use crate::work::{ItemId, Stage, VariantKey};
use std::collections::HashSet;
use std::fs;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// Outcome of one stage
#[derive(Debug, Clone)]
pub struct StageSummary {
    pub stage: Stage,

    /// Items that needed work
    pub planned: usize,

    /// Items already complete
    pub skipped: usize,

    pub completed: u64,
    pub failed: u64,
    pub retried: u64,

    /// Items never started because of shutdown
    pub abandoned: usize,

    /// Permanently failed items with their last error
    pub failures: Vec<(ItemId, String)>,

    /// Final merge (measure stage only)
    pub merge: Option<MergeReport>,

    pub elapsed: Duration,
}

impl StageSummary {
    fn new(stage: Stage, plan: &DispatchPlan) -> Self {
        Self {
            stage,
            planned: plan.pending.len(),
            skipped: plan.skipped.len(),
            completed: 0,
            failed: 0,
            retried: 0,
            abandoned: 0,
            failures: Vec::new(),
            merge: None,
            elapsed: Duration::ZERO,
        }
    }

    fn absorb(&mut self, report: &WorkerReport) {
        self.completed += report.stats.completed();
        self.failed += report.stats.failed();
        self.retried += report.stats.retried();
        self.failures.extend(report.failures.iter().cloned());
    }
}

/// Outcome of a whole run
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub dry_run: bool,

    /// Shutdown was requested before the run finished
    pub interrupted: bool,

    pub stages: Vec<StageSummary>,
    pub elapsed: Duration,
}

impl RunSummary {
    pub fn stage(&self, stage: Stage) -> Option<&StageSummary> {
        self.stages.iter().find(|s| s.stage == stage)
    }

    pub fn failed(&self) -> u64 {
        self.stages.iter().map(|s| s.failed).sum()
    }

    /// Every planned item completed and nothing was cut short
    pub fn is_clean(&self) -> bool {
        !self.interrupted
            && self
                .stages
                .iter()
                .all(|s| s.failed == 0 && s.abandoned == 0)
    }

    pub fn log(&self) {
        for s in &self.stages {
            info!(
                stage = %s.stage,
                planned = s.planned,
                skipped = s.skipped,
                completed = s.completed,
                failed = s.failed,
                retried = s.retried,
                abandoned = s.abandoned,
                elapsed_secs = s.elapsed.as_secs(),
                "Stage summary"
            );
            for (item, err) in &s.failures {
                error!(item = %item, error = %err, "Item still pending after failure");
            }
        }
        info!(
            run_id = %self.run_id,
            interrupted = self.interrupted,
            dry_run = self.dry_run,
            elapsed_secs = self.elapsed.as_secs(),
            "Run finished"
        );
    }
}

/// Coordinates one model's batch
pub struct Pipeline {
    config: PipelineConfig,
    layout: ModelLayout,
    backend: Arc<dyn ComputeBackend>,
    store: Arc<dyn ProgressStore>,
    shutdown: Shutdown,
    run_id: Uuid,
}

impl Pipeline {
    /// Create a pipeline with a filesystem progress store.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::Config` if the configuration is invalid.
    pub fn new(config: PipelineConfig, backend: Arc<dyn ComputeBackend>) -> Result<Self> {
        config.validate()?;
        let layout = config.layout()?;
        let store = Arc::new(FsProgressStore::new(layout.clone()));

        Ok(Self {
            config,
            layout,
            backend,
            store,
            shutdown: Shutdown::new(),
            run_id: Uuid::new_v4(),
        })
    }

    /// Use a different progress store
    pub fn with_store(mut self, store: Arc<dyn ProgressStore>) -> Self {
        self.store = store;
        self
    }

    /// Handle that stops dispatch when triggered
    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    pub fn layout(&self) -> &ModelLayout {
        &self.layout
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    fn enabled_stages(&self) -> Vec<Stage> {
        let mut stages = Vec::new();
        if self.config.pipeline.quantize {
            stages.push(Stage::Quantize);
        }
        if self.config.pipeline.measure {
            stages.push(Stage::Measure);
        }
        stages
    }

    /// Plan one stage against the current progress
    pub fn plan(&self, stage: Stage) -> Result<DispatchPlan> {
        self.plan_excluding(stage, &HashSet::new())
    }

    fn plan_excluding(&self, stage: Stage, exclude: &HashSet<VariantKey>) -> Result<DispatchPlan> {
        let requested: Vec<_> = self
            .config
            .items(stage, self.layout.model_id())
            .into_iter()
            .filter(|item| !exclude.contains(&item.variant))
            .collect();

        Scheduler::new(self.store.clone())
            .with_force(self.config.pipeline.force)
            .plan(
                stage,
                &requested,
                &self.config.device_pool()?,
                self.config.devices.schedule,
            )
    }

    /// Fold unmerged shards into the canonical record and retire them
    pub fn merge(&self) -> Result<MergeReport> {
        ShardMerger::new(&self.layout).finalize(self.config.pipeline.shard_retention)
    }

    /// Run every enabled stage.
    ///
    /// Item failures are reported in the summary; only plan-time and
    /// canonical-write failures are returned as errors.
    #[instrument(skip(self), fields(model = %self.layout.model_id(), run_id = %self.run_id))]
    pub async fn run(&self) -> Result<RunSummary> {
        let start = Instant::now();
        let dry_run = self.config.pipeline.dry_run;
        let mut stages = Vec::new();
        let mut failed_builds: HashSet<VariantKey> = HashSet::new();

        info!(
            variants = self.config.pipeline.variants.len(),
            devices = ?self.config.devices.ids,
            dry_run,
            force = self.config.pipeline.force,
            "Starting run"
        );

        for stage in self.enabled_stages() {
            if self.shutdown.is_triggered() {
                warn!(stage = %stage, "Shutdown requested, skipping stage");
                break;
            }

            if stage == Stage::Measure && !dry_run {
                // Rows left by an interrupted run count as progress
                if let Err(e) = ShardMerger::new(&self.layout).merge() {
                    warn!(error = %e, "Initial merge failed, unmerged rows may be measured again");
                }
            }

            let plan = self.plan_excluding(stage, &failed_builds)?;
            plan.log();

            if dry_run {
                stages.push(StageSummary::new(stage, &plan));
                continue;
            }

            let summary = self.run_stage(plan).await?;
            if stage == Stage::Quantize {
                failed_builds.extend(summary.failures.iter().map(|(id, _)| id.variant));
                for variant in &failed_builds {
                    warn!(variant = %variant, "Build failed, not measuring this variant");
                }
            }
            stages.push(summary);
        }

        let summary = RunSummary {
            run_id: self.run_id,
            dry_run,
            interrupted: self.shutdown.is_triggered(),
            stages,
            elapsed: start.elapsed(),
        };
        summary.log();

        if self.config.pipeline.cleanup && !dry_run && summary.is_clean() {
            self.cleanup();
        }

        Ok(summary)
    }

    #[instrument(skip(self, plan), fields(stage = %plan.stage))]
    async fn run_stage(&self, plan: DispatchPlan) -> Result<StageSummary> {
        let start = Instant::now();
        let stage = plan.stage;
        let mut summary = StageSummary::new(stage, &plan);
        let merger = ShardMerger::new(&self.layout);

        let queues = plan.queues();
        let mut worker_error = None;

        if !plan.is_empty() {
            let (tx, mut rx) = mpsc::unbounded_channel();
            let ctx = WorkerContext {
                backend: self.backend.clone(),
                store: self.store.clone(),
                layout: self.layout.clone(),
                retry: self.config.retry,
                shutdown: self.shutdown.clone(),
                events: tx,
                run_id: self.run_id,
            };

            let handles: Vec<_> = queues
                .iter()
                .map(|(device, queue)| {
                    tokio::spawn(DeviceWorker::new(*device, queue.clone(), ctx.clone()).run())
                })
                .collect();
            drop(ctx);

            // Ends once every worker has dropped its sender
            while let Some(event) = rx.recv().await {
                self.handle_event(event, &merger);
            }

            for result in futures::future::join_all(handles).await {
                match result {
                    Ok(Ok(report)) => summary.absorb(&report),
                    Ok(Err(e)) => {
                        error!(error = %e, "Device worker stopped");
                        worker_error = worker_error.or(Some(e));
                    }
                    Err(e) => {
                        error!(error = %e, "Device worker task failed");
                        let e = PipelineError::Queue(format!("worker task failed: {}", e));
                        worker_error = worker_error.or(Some(e));
                    }
                }
            }

            summary.abandoned = drain_all(&queues)?;
            if summary.abandoned > 0 {
                warn!(abandoned = summary.abandoned, "Items left pending by shutdown");
            }
        }

        if stage == Stage::Measure {
            summary.merge = Some(merger.finalize(self.config.pipeline.shard_retention)?);
        }

        summary.elapsed = start.elapsed();
        match worker_error {
            Some(e) => Err(e),
            None => Ok(summary),
        }
    }

    fn handle_event(&self, event: WorkerEvent, merger: &ShardMerger) {
        match event {
            WorkerEvent::Completed {
                device,
                item,
                row: Some(row),
            } => {
                info!(
                    device,
                    item = %item,
                    gib = row.gib,
                    kl_div = row.kl_div,
                    ppl = row.ppl,
                    "Measurement recorded"
                );
                if let Err(e) = merger.merge() {
                    warn!(error = %e, "Real-time merge failed, shards kept for the final merge");
                }
            }
            WorkerEvent::Completed {
                device,
                item,
                row: None,
            } => {
                info!(device, item = %item, "Build recorded");
            }
            WorkerEvent::Failed { device, item, error } => {
                warn!(device, item = %item, error = %error, "Item failed, left pending");
            }
        }
    }

    /// Remove scratch state after a clean run
    fn cleanup(&self) {
        let mut targets: Vec<_> = self
            .config
            .pipeline
            .variants
            .iter()
            .filter(|v| !v.is_base())
            .map(|v| self.layout.work_dir(v))
            .collect();
        targets.push(self.layout.shard_dir());
        targets.push(self.layout.log_dir());

        for dir in targets {
            match fs::remove_dir_all(&dir) {
                Ok(()) => info!(path = %dir.display(), "Removed"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %dir.display(), error = %e, "Cleanup failed"),
            }
        }
    }
}

/// Empty every distinct queue, returning how many jobs were left
fn drain_all(queues: &[(crate::device::Device, JobQueue)]) -> Result<usize> {
    let mut seen: Vec<&JobQueue> = Vec::new();
    let mut left = 0;
    for (_, queue) in queues {
        if seen.iter().any(|q| q.same_queue(queue)) {
            continue;
        }
        left += queue.drain()?.len();
        seen.push(queue);
    }
    Ok(left)
}
