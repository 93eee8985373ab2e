//! Pipeline configuration
//!
//! Loaded from TOML (`~/.quantpipe/pipeline.toml` by default). Every section
//! has defaults, so a file only needs the fields it changes. Command-line
//! flags are applied on top before `validate` runs.

use crate::device::DevicePool;
use crate::errors::{PipelineError, Result};
use crate::layout::{ModelLayout, DEFAULT_ARTIFACT_MARKER, DEFAULT_OUT_TEMPLATE, DEFAULT_WORK_TEMPLATE};
use crate::record::ShardRetention;
use crate::scheduler::DispatchMode;
use crate::work::{Stage, VariantKey, VariantParams, WorkItem};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const MAX_RETRIES_LIMIT: u32 = 10;

/// Main configuration for a pipeline run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub pipeline: RunConfig,
    pub devices: DevicesConfig,
    pub retry: RetryPolicy,
    pub backend: BackendConfig,
    pub paths: PathsConfig,
    pub logging: LoggingConfig,
}

/// What to run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Source model directory
    pub model_dir: PathBuf,

    /// Requested bit-per-weight variants
    pub variants: Vec<VariantKey>,

    pub quantize: bool,
    pub measure: bool,

    /// Also measure the unquantized base model
    pub measure_base: bool,

    /// Redo items even if they are already complete
    pub force: bool,

    /// Plan and log only
    pub dry_run: bool,

    /// Remove work dirs and shards after a clean run
    pub cleanup: bool,

    pub shard_retention: ShardRetention,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            model_dir: PathBuf::new(),
            variants: Vec::new(),
            quantize: true,
            measure: true,
            measure_base: true,
            force: false,
            dry_run: false,
            cleanup: false,
            shard_retention: ShardRetention::default(),
        }
    }
}

/// Device pool and dispatch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DevicesConfig {
    pub ids: Vec<u32>,

    /// Relative capacity per device, same order as `ids`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ratios: Option<Vec<f64>>,

    pub schedule: DispatchMode,
}

impl Default for DevicesConfig {
    fn default() -> Self {
        Self {
            ids: vec![0],
            ratios: None,
            schedule: DispatchMode::default(),
        }
    }
}

/// Retry policy for transient backend failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,

    /// Delay before the first retry; doubles on each further retry
    pub backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            backoff_ms: 500,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        Duration::from_millis(self.backoff_ms.saturating_mul(1u64 << exp))
    }
}

/// External commands run by the process backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Quantizer program and fixed arguments
    pub quantize_command: Vec<String>,

    /// Perplexity evaluation program and fixed arguments
    pub ppl_command: Vec<String>,

    /// Divergence evaluation program and fixed arguments
    pub kl_command: Vec<String>,

    /// Per-command limit; unset or 0 means none
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,

    /// Forwarded verbatim to every quantize job
    pub quantize_args: Vec<String>,

    /// Forwarded verbatim to every measurement
    pub measure_args: Vec<String>,

    pub ppl_rows: u32,
    pub kl_rows: u32,
}

impl Default for BackendConfig {
    fn default() -> Self {
        let params = VariantParams::default();
        Self {
            quantize_command: vec!["python".to_string(), "convert.py".to_string()],
            ppl_command: vec!["python".to_string(), "eval/ppl.py".to_string()],
            kl_command: vec!["python".to_string(), "eval/model_diff.py".to_string()],
            timeout_secs: None,
            quantize_args: Vec::new(),
            measure_args: Vec::new(),
            ppl_rows: params.ppl_rows,
            kl_rows: params.kl_rows,
        }
    }
}

/// Output layout templates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub out_template: String,
    pub work_template: String,

    /// File whose presence marks a finished quantization
    pub artifact_marker: String,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            out_template: DEFAULT_OUT_TEMPLATE.to_string(),
            work_template: DEFAULT_WORK_TEMPLATE.to_string(),
            artifact_marker: DEFAULT_ARTIFACT_MARKER.to_string(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,

    /// Also write a daily log file under `<model_dir>/logs`
    pub log_to_file: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_to_file: true,
        }
    }
}

impl PipelineConfig {
    /// Get default configuration file path: `~/.quantpipe/pipeline.toml`
    pub fn default_path() -> Result<PathBuf> {
        let home = dirs::home_dir()
            .ok_or_else(|| PipelineError::Config("Cannot determine home directory".into()))?;
        Ok(home.join(".quantpipe").join("pipeline.toml"))
    }

    /// Load configuration from file. Validation is left to the caller so
    /// command-line overrides can be applied first.
    pub fn load(path: &Path) -> Result<Self> {
        tracing::info!(path = %path.display(), "Loading configuration");

        let content = std::fs::read_to_string(path).map_err(|e| {
            tracing::error!(path = %path.display(), error = %e, "Failed to read config file");
            e
        })?;

        let config: PipelineConfig = toml::from_str(&content)
            .map_err(|e| PipelineError::Config(format!("{}: {}", path.display(), e)))?;
        Ok(config)
    }

    /// Save configuration atomically, creating parent directories
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                tracing::error!(path = %parent.display(), error = %e, "Failed to create config directory");
                e
            })?;
        }

        let toml_string = toml::to_string_pretty(self)?;
        crate::fsutil::write_atomic(path, toml_string.as_bytes())?;

        tracing::info!(path = %path.display(), "Configuration saved");
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.pipeline.model_dir.as_os_str().is_empty() {
            return Err(PipelineError::Config("model_dir is required".into()));
        }

        if self.pipeline.variants.is_empty() {
            return Err(PipelineError::Config("at least one variant is required".into()));
        }

        if self.devices.ids.is_empty() {
            return Err(PipelineError::Config("at least one device is required".into()));
        }

        if let Some(ratios) = &self.devices.ratios {
            if ratios.len() != self.devices.ids.len() {
                return Err(PipelineError::Config(format!(
                    "{} device ratios given for {} devices",
                    ratios.len(),
                    self.devices.ids.len()
                )));
            }
            if ratios.iter().any(|r| !r.is_finite() || *r < 0.0) {
                return Err(PipelineError::Config(
                    "device ratios must be non-negative numbers".into(),
                ));
            }
            if ratios.iter().all(|r| *r == 0.0) {
                return Err(PipelineError::Config(
                    "at least one device ratio must be positive".into(),
                ));
            }
        }

        if self.retry.max_retries > MAX_RETRIES_LIMIT {
            return Err(PipelineError::Config(format!(
                "max_retries must be at most {}",
                MAX_RETRIES_LIMIT
            )));
        }

        for (name, template) in [
            ("out_template", &self.paths.out_template),
            ("work_template", &self.paths.work_template),
        ] {
            if !template.contains("{bpw}") {
                return Err(PipelineError::Config(format!(
                    "{} must contain {{bpw}}",
                    name
                )));
            }
        }

        if self.pipeline.quantize && self.backend.quantize_command.is_empty() {
            return Err(PipelineError::Config("quantize_command is empty".into()));
        }
        if self.pipeline.measure
            && (self.backend.ppl_command.is_empty() || self.backend.kl_command.is_empty())
        {
            return Err(PipelineError::Config("measurement commands are empty".into()));
        }

        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => {
                return Err(PipelineError::Config(
                    "log level must be one of: trace, debug, info, warn, error".into(),
                ))
            }
        }

        Ok(())
    }

    /// Paths for the configured model
    pub fn layout(&self) -> Result<ModelLayout> {
        Ok(ModelLayout::new(&self.pipeline.model_dir)?
            .with_templates(&self.paths.out_template, &self.paths.work_template)
            .with_artifact_marker(&self.paths.artifact_marker))
    }

    /// The configured devices, weighted when ratios are given
    pub fn device_pool(&self) -> Result<DevicePool> {
        match &self.devices.ratios {
            Some(ratios) => DevicePool::with_weights(&self.devices.ids, ratios),
            None => DevicePool::new(&self.devices.ids),
        }
    }

    /// Items requested for a stage, before progress filtering
    pub fn items(&self, stage: Stage, model_id: &str) -> Vec<WorkItem> {
        match stage {
            Stage::Quantize => {
                let params = VariantParams {
                    passthrough: self.backend.quantize_args.clone(),
                    ..VariantParams::default()
                };
                self.pipeline
                    .variants
                    .iter()
                    .filter(|v| !v.is_base())
                    .map(|v| WorkItem::quantize(model_id, *v, params.clone()))
                    .collect()
            }
            Stage::Measure => {
                let params = VariantParams {
                    passthrough: self.backend.measure_args.clone(),
                    ppl_rows: self.backend.ppl_rows,
                    kl_rows: self.backend.kl_rows,
                };
                let variants = &self.pipeline.variants;
                let base = (self.pipeline.measure_base && !variants.contains(&VariantKey::Base))
                    .then_some(VariantKey::Base);
                base.into_iter()
                    .chain(variants.iter().copied())
                    .map(|v| WorkItem::measure(model_id, v, params.clone()))
                    .collect()
            }
        }
    }
}
