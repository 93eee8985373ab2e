//! End-to-end tests for the batch pipeline
//!
//! A scripted in-process backend stands in for the quantizer and the
//! evaluation tools. Everything else (progress store, shards, merge,
//! canonical record) runs against a temporary model directory.

use async_trait::async_trait;
use quantpipe::executor::BackendResult;
use quantpipe::{
    BackendError, CanonicalRecord, ComputeBackend, DispatchMode, InMemoryProgressStore,
    MeasureRequest, Measurement, MeasurementRow, Pipeline, PipelineConfig, QuantizeRequest, Stage,
    VariantKey,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

#[derive(Debug, Clone, PartialEq)]
struct Call {
    stage: Stage,
    variant: VariantKey,
    device: u32,
}

/// Backend with scripted failures and a fixed per-item latency
#[derive(Default)]
struct FakeBackend {
    calls: Mutex<Vec<Call>>,
    failures: Mutex<HashMap<(Stage, VariantKey), Vec<BackendError>>>,
    latency: Duration,
    ppl_offset: f64,
}

impl FakeBackend {
    fn new() -> Self {
        Self::default()
    }

    fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    fn with_ppl_offset(mut self, offset: f64) -> Self {
        self.ppl_offset = offset;
        self
    }

    fn fail(self, stage: Stage, variant: &str, errors: Vec<BackendError>) -> Self {
        self.failures
            .lock()
            .unwrap()
            .insert((stage, variant.parse().unwrap()), errors);
        self
    }

    fn calls(&self, stage: Stage) -> Vec<Call> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.stage == stage)
            .cloned()
            .collect()
    }

    fn measured_variants(&self) -> Vec<String> {
        let mut v: Vec<String> = self
            .calls(Stage::Measure)
            .iter()
            .map(|c| c.variant.to_string())
            .collect();
        v.sort();
        v
    }

    async fn attempt(&self, stage: Stage, variant: VariantKey, device: u32) -> BackendResult<()> {
        self.calls.lock().unwrap().push(Call {
            stage,
            variant,
            device,
        });
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let scripted = self
            .failures
            .lock()
            .unwrap()
            .get_mut(&(stage, variant))
            .and_then(|errors| (!errors.is_empty()).then(|| errors.remove(0)));
        match scripted {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ComputeBackend for FakeBackend {
    async fn run_quantize(&self, request: &QuantizeRequest) -> BackendResult<()> {
        self.attempt(Stage::Quantize, VariantKey::Bpw(request.bpw), request.device)
            .await?;
        std::fs::create_dir_all(&request.out_dir).unwrap();
        std::fs::write(request.out_dir.join("config.json"), b"{}").unwrap();
        Ok(())
    }

    async fn run_measure(&self, request: &MeasureRequest) -> BackendResult<Measurement> {
        self.attempt(Stage::Measure, request.variant, request.device)
            .await?;
        let bpw = request.variant.bpw().map(|b| b.as_f64()).unwrap_or(16.0);
        Ok(Measurement {
            gib: bpw * 0.5,
            kl_div: 1.0 / bpw,
            ppl: 6.0 + 1.0 / bpw + self.ppl_offset,
        })
    }
}

struct Fixture {
    _root: TempDir,
    model_dir: PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let root = TempDir::new().unwrap();
        let model_dir = root.path().join("tiny-model");
        std::fs::create_dir_all(&model_dir).unwrap();
        std::fs::write(model_dir.join("config.json"), b"{}").unwrap();
        Self {
            _root: root,
            model_dir,
        }
    }

    fn config(&self, variants: &str, devices: &[u32]) -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.pipeline.model_dir = self.model_dir.clone();
        config.pipeline.variants = quantpipe::parse_variant_list(variants).unwrap();
        config.pipeline.quantize = false;
        config.pipeline.measure_base = false;
        config.devices.ids = devices.to_vec();
        config.retry.backoff_ms = 1;
        config.logging.log_to_file = false;
        config
    }

    fn canonical_path(&self) -> PathBuf {
        self.model_dir.join("tiny-modelMeasured.csv")
    }

    fn canonical(&self) -> CanonicalRecord {
        CanonicalRecord::load(&self.canonical_path()).unwrap()
    }

    fn seed_canonical(&self, rows: &[MeasurementRow]) {
        let mut record = CanonicalRecord::new();
        for row in rows {
            record.fold(row.clone());
        }
        record.write_atomic(&self.canonical_path()).unwrap();
    }
}

fn old_row(variant: &str) -> MeasurementRow {
    MeasurementRow {
        variant: variant.parse().unwrap(),
        gib: 9.0,
        kl_div: 9.0,
        ppl: 99.0,
        device: 7,
        measured_at_ms: 1,
    }
}

fn variants_of(record: &CanonicalRecord) -> Vec<String> {
    record.variants().map(|v| v.to_string()).collect()
}

fn csv_files(dir: &Path) -> usize {
    std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .flatten()
                .filter(|e| e.path().extension().map(|x| x == "csv").unwrap_or(false))
                .count()
        })
        .unwrap_or(0)
}

async fn run(config: PipelineConfig, backend: Arc<FakeBackend>) -> quantpipe::RunSummary {
    Pipeline::new(config, backend).unwrap().run().await.unwrap()
}

#[tokio::test]
async fn test_resume_measures_only_missing_variants() {
    let fx = Fixture::new();
    fx.seed_canonical(&[old_row("3")]);

    let backend = Arc::new(FakeBackend::new());
    let summary = run(fx.config("2 3 4", &[0, 1]), backend.clone()).await;

    assert_eq!(backend.measured_variants(), vec!["2", "4"]);
    let measure = summary.stage(Stage::Measure).unwrap();
    assert_eq!(measure.planned, 2);
    assert_eq!(measure.skipped, 1);
    assert_eq!(measure.completed, 2);

    let record = fx.canonical();
    assert_eq!(variants_of(&record), vec!["2", "3", "4"]);
    // The row that was already there is untouched
    assert_eq!(record.get(&"3".parse().unwrap()).unwrap(), &old_row("3"));
}

#[tokio::test]
async fn test_rerun_is_idempotent() {
    let fx = Fixture::new();
    let config = fx.config("2 3 4", &[0, 1]);

    run(config.clone(), Arc::new(FakeBackend::new())).await;
    let first = std::fs::read(fx.canonical_path()).unwrap();

    let backend = Arc::new(FakeBackend::new());
    let summary = run(config, backend.clone()).await;

    assert!(backend.calls(Stage::Measure).is_empty());
    assert_eq!(summary.stage(Stage::Measure).unwrap().skipped, 3);
    assert_eq!(std::fs::read(fx.canonical_path()).unwrap(), first);
}

#[tokio::test]
async fn test_queue_mode_balances_equal_latency_work() {
    let fx = Fixture::new();
    let backend = Arc::new(FakeBackend::new().with_latency(Duration::from_millis(20)));
    run(fx.config("2 3 4 5 6 7", &[0, 1]), backend.clone()).await;

    let calls = backend.calls(Stage::Measure);
    let on_dev0 = calls.iter().filter(|c| c.device == 0).count() as i64;
    let on_dev1 = calls.iter().filter(|c| c.device == 1).count() as i64;
    assert_eq!(on_dev0 + on_dev1, 6);
    assert!((on_dev0 - on_dev1).abs() <= 1);

    let record = fx.canonical();
    assert_eq!(record.len(), 6);
    // Each row names the device that produced it
    for call in &calls {
        assert_eq!(record.get(&call.variant).unwrap().device, call.device);
    }
}

#[tokio::test]
async fn test_static_mode_follows_ratios() {
    let fx = Fixture::new();
    let mut config = fx.config("2 3 4 5 6 7", &[0, 1]);
    config.devices.schedule = DispatchMode::Static;
    config.devices.ratios = Some(vec![2.0, 1.0]);

    let backend = Arc::new(FakeBackend::new());
    run(config, backend.clone()).await;

    let calls = backend.calls(Stage::Measure);
    assert_eq!(calls.iter().filter(|c| c.device == 0).count(), 4);
    assert_eq!(calls.iter().filter(|c| c.device == 1).count(), 2);
    assert_eq!(fx.canonical().len(), 6);
}

#[tokio::test]
async fn test_forced_remeasure_replaces_row() {
    let fx = Fixture::new();
    fx.seed_canonical(&[old_row("2"), old_row("3")]);

    let mut config = fx.config("3", &[0]);
    config.pipeline.force = true;
    let backend = Arc::new(FakeBackend::new().with_ppl_offset(1.0));
    run(config, backend.clone()).await;

    assert_eq!(backend.measured_variants(), vec!["3"]);
    let record = fx.canonical();
    let row = record.get(&"3".parse().unwrap()).unwrap();
    assert_eq!(row.device, 0);
    assert!(row.measured_at_ms > 1);
    assert!((row.ppl - (7.0 + 1.0 / 3.0)).abs() < 1e-9);
    assert_eq!(record.get(&"2".parse().unwrap()).unwrap(), &old_row("2"));
}

#[tokio::test]
async fn test_transient_failure_is_retried() {
    let fx = Fixture::new();
    let backend = Arc::new(FakeBackend::new().fail(
        Stage::Measure,
        "2",
        vec![BackendError::OutOfMemory("CUDA out of memory".into())],
    ));
    let summary = run(fx.config("2 3", &[0]), backend.clone()).await;

    let measure = summary.stage(Stage::Measure).unwrap();
    assert_eq!(measure.completed, 2);
    assert_eq!(measure.retried, 1);
    assert_eq!(measure.failed, 0);
    assert_eq!(fx.canonical().len(), 2);
}

#[tokio::test]
async fn test_failed_item_stays_pending() {
    let fx = Fixture::new();
    let config = fx.config("2 3 4", &[0, 1]);

    let backend = Arc::new(FakeBackend::new().fail(
        Stage::Measure,
        "4",
        vec![BackendError::Parse("no perplexity".into())],
    ));
    let summary = run(config.clone(), backend).await;

    assert_eq!(summary.failed(), 1);
    assert!(!summary.is_clean());
    assert_eq!(variants_of(&fx.canonical()), vec!["2", "3"]);

    // Next run picks up only the failed variant
    let backend = Arc::new(FakeBackend::new());
    let summary = run(config, backend.clone()).await;
    assert_eq!(backend.measured_variants(), vec!["4"]);
    assert!(summary.is_clean());
    assert_eq!(variants_of(&fx.canonical()), vec!["2", "3", "4"]);
}

#[tokio::test]
async fn test_shards_are_archived_after_final_merge() {
    let fx = Fixture::new();
    run(fx.config("2 3", &[0, 1]), Arc::new(FakeBackend::new())).await;

    let shard_dir = fx.model_dir.join(".shards");
    assert_eq!(csv_files(&shard_dir), 0);
    assert!(csv_files(&shard_dir.join("merged")) >= 1);
    assert_eq!(fx.canonical().len(), 2);
}

#[tokio::test]
async fn test_leftover_shards_count_as_progress() {
    let fx = Fixture::new();
    let shard_dir = fx.model_dir.join(".shards");
    std::fs::create_dir_all(&shard_dir).unwrap();

    // A crashed run left a shard with one complete row and one torn row
    let mut bytes = b"variant,gib,kl_div,ppl,device,measured_at_ms\n".to_vec();
    bytes.extend_from_slice(b"3,1.5,0.2,6.5,1,1000\n");
    bytes.extend_from_slice(b"4,2.0,0.1,6.");
    std::fs::write(shard_dir.join("tiny-model.dev1.crashed.csv"), bytes).unwrap();

    let backend = Arc::new(FakeBackend::new());
    run(fx.config("3 4", &[0]), backend.clone()).await;

    assert_eq!(backend.measured_variants(), vec!["4"]);
    let record = fx.canonical();
    assert_eq!(record.get(&"3".parse().unwrap()).unwrap().ppl, 6.5);
    assert_eq!(record.len(), 2);
}

#[tokio::test]
async fn test_quantize_then_measure_with_base() {
    let fx = Fixture::new();
    let mut config = fx.config("2 4", &[0, 1]);
    config.pipeline.quantize = true;
    config.pipeline.measure_base = true;

    let backend = Arc::new(FakeBackend::new());
    let summary = run(config.clone(), backend.clone()).await;

    assert_eq!(backend.calls(Stage::Quantize).len(), 2);
    assert_eq!(summary.stage(Stage::Quantize).unwrap().completed, 2);
    assert!(fx.model_dir.join("2").join("quantpipe.fingerprint.json").is_file());

    let record = fx.canonical();
    assert_eq!(variants_of(&record), vec!["bf16", "2", "4"]);
    assert_eq!(record.get(&VariantKey::Base).unwrap().kl_div, 0.0);

    // Second run finds both stages complete
    let backend = Arc::new(FakeBackend::new());
    let summary = run(config, backend.clone()).await;
    assert!(backend.calls(Stage::Quantize).is_empty());
    assert!(backend.calls(Stage::Measure).is_empty());
    assert_eq!(summary.stage(Stage::Quantize).unwrap().skipped, 2);
}

#[tokio::test]
async fn test_changed_quantize_args_trigger_rebuild() {
    let fx = Fixture::new();
    let mut config = fx.config("3", &[0]);
    config.pipeline.quantize = true;
    config.pipeline.measure = false;
    run(config.clone(), Arc::new(FakeBackend::new())).await;

    config.backend.quantize_args = vec!["--head-bits".to_string(), "8".to_string()];
    let backend = Arc::new(FakeBackend::new());
    run(config, backend.clone()).await;
    assert_eq!(backend.calls(Stage::Quantize).len(), 1);
}

#[tokio::test]
async fn test_failed_build_is_not_measured() {
    let fx = Fixture::new();
    let mut config = fx.config("2 3", &[0]);
    config.pipeline.quantize = true;

    let backend = Arc::new(FakeBackend::new().fail(
        Stage::Quantize,
        "3",
        vec![BackendError::Failed("exit status 1".into())],
    ));
    let summary = run(config, backend.clone()).await;

    assert_eq!(summary.stage(Stage::Quantize).unwrap().failed, 1);
    assert_eq!(backend.measured_variants(), vec!["2"]);
    assert!(!fx.model_dir.join("3").join("quantpipe.fingerprint.json").exists());
}

#[tokio::test]
async fn test_dry_run_writes_nothing() {
    let fx = Fixture::new();
    let mut config = fx.config("2 3", &[0, 1]);
    config.pipeline.quantize = true;
    config.pipeline.dry_run = true;

    let backend = Arc::new(FakeBackend::new());
    let summary = run(config, backend.clone()).await;

    assert!(summary.dry_run);
    assert_eq!(summary.stage(Stage::Quantize).unwrap().planned, 2);
    assert_eq!(summary.stage(Stage::Measure).unwrap().planned, 2);
    assert!(backend.calls.lock().unwrap().is_empty());
    assert!(!fx.canonical_path().exists());
    assert!(!fx.model_dir.join(".shards").exists());
}

#[tokio::test]
async fn test_shutdown_before_start_runs_nothing() {
    let fx = Fixture::new();
    let backend = Arc::new(FakeBackend::new());
    let pipeline = Pipeline::new(fx.config("2 3", &[0]), backend.clone()).unwrap();

    pipeline.shutdown_handle().trigger();
    let summary = pipeline.run().await.unwrap();

    assert!(summary.interrupted);
    assert!(summary.stages.is_empty());
    assert!(backend.calls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_shutdown_mid_run_keeps_finished_rows() {
    let fx = Fixture::new();
    let backend = Arc::new(FakeBackend::new().with_latency(Duration::from_millis(200)));
    let pipeline = Pipeline::new(fx.config("2 3 4 5", &[0]), backend.clone()).unwrap();

    let shutdown = pipeline.shutdown_handle();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        shutdown.trigger();
    });
    let summary = pipeline.run().await.unwrap();

    assert!(summary.interrupted);
    let measure = summary.stage(Stage::Measure).unwrap();
    // The in-flight item finishes, nothing new starts
    assert_eq!(measure.completed, 2);
    assert_eq!(measure.abandoned, 2);
    assert_eq!(fx.canonical().len(), 2);
}

#[tokio::test]
async fn test_cleanup_after_clean_run() {
    let fx = Fixture::new();
    let mut config = fx.config("2", &[0]);
    config.pipeline.quantize = true;
    config.pipeline.cleanup = true;
    std::fs::create_dir_all(fx.model_dir.join("w-2")).unwrap();

    run(config, Arc::new(FakeBackend::new())).await;

    assert!(!fx.model_dir.join("w-2").exists());
    assert!(!fx.model_dir.join(".shards").exists());
    assert_eq!(fx.canonical().len(), 1);
}

#[tokio::test]
async fn test_in_memory_store_drives_resume() {
    let fx = Fixture::new();
    let store = Arc::new(
        InMemoryProgressStore::new().with_measured("tiny-model", &["3".parse().unwrap()]),
    );

    let backend = Arc::new(FakeBackend::new());
    let summary = Pipeline::new(fx.config("2 3 4", &[0, 1]), backend.clone())
        .unwrap()
        .with_store(store.clone())
        .run()
        .await
        .unwrap();

    assert_eq!(backend.measured_variants(), vec!["2", "4"]);
    assert_eq!(summary.stage(Stage::Measure).unwrap().skipped, 1);
    assert_eq!(store.measured_count(), 3);
    assert_eq!(variants_of(&fx.canonical()), vec!["2", "4"]);
}
