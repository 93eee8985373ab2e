//! On-disk layout of a model directory
//!
//! ```text
//! <model_dir>/
//!   config.json, *.safetensors        source model (variant bf16)
//!   <bpw>/                            quantized output, one per variant
//!     quantpipe.fingerprint.json      progress marker
//!   w-<bpw>/                          quantizer work dir (resumable)
//!   <model_id>Measured.csv            canonical record
//!   .shards/                          per-device shards for the current run
//!     merged/                         shards already folded into the record
//!   logs/
//! ```

use crate::errors::{PipelineError, Result};
use crate::work::VariantKey;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Default template for quantized output directories
pub const DEFAULT_OUT_TEMPLATE: &str = "{model}/{bpw}";

/// Default template for quantizer work directories
pub const DEFAULT_WORK_TEMPLATE: &str = "{model}/w-{bpw}";

/// Artifact whose presence marks a finished quantization output
pub const DEFAULT_ARTIFACT_MARKER: &str = "config.json";

const FINGERPRINT_FILE: &str = "quantpipe.fingerprint.json";
const SHARD_DIR: &str = ".shards";
const ARCHIVE_DIR: &str = "merged";
const LOG_DIR: &str = "logs";

/// Resolves every path the pipeline reads or writes for one model
#[derive(Debug, Clone)]
pub struct ModelLayout {
    model_dir: PathBuf,
    model_id: String,
    out_template: String,
    work_template: String,
    artifact_marker: String,
}

impl ModelLayout {
    /// Create a layout with default templates.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::Config` if the directory has no usable name.
    pub fn new(model_dir: impl Into<PathBuf>) -> Result<Self> {
        let model_dir: PathBuf = model_dir.into();
        let model_id = model_dir
            .file_name()
            .and_then(|n| n.to_str())
            .filter(|n| !n.is_empty())
            .ok_or_else(|| {
                PipelineError::Config(format!(
                    "Cannot derive model id from '{}'",
                    model_dir.display()
                ))
            })?
            .to_string();

        Ok(Self {
            model_dir,
            model_id,
            out_template: DEFAULT_OUT_TEMPLATE.to_string(),
            work_template: DEFAULT_WORK_TEMPLATE.to_string(),
            artifact_marker: DEFAULT_ARTIFACT_MARKER.to_string(),
        })
    }

    /// Override the output and work directory templates
    pub fn with_templates(mut self, out_template: &str, work_template: &str) -> Self {
        self.out_template = out_template.to_string();
        self.work_template = work_template.to_string();
        self
    }

    /// Override the artifact that marks a finished quantization
    pub fn with_artifact_marker(mut self, marker: &str) -> Self {
        self.artifact_marker = marker.to_string();
        self
    }

    pub fn model_dir(&self) -> &Path {
        &self.model_dir
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn artifact_marker(&self) -> &str {
        &self.artifact_marker
    }

    /// Directory holding the model weights for a variant.
    ///
    /// The base variant is the model directory itself.
    pub fn variant_dir(&self, variant: &VariantKey) -> PathBuf {
        match variant {
            VariantKey::Base => self.model_dir.clone(),
            VariantKey::Bpw(_) => self.expand(&self.out_template, variant),
        }
    }

    /// Quantizer work directory for a variant
    pub fn work_dir(&self, variant: &VariantKey) -> PathBuf {
        self.expand(&self.work_template, variant)
    }

    /// Progress marker for a quantized variant
    pub fn fingerprint_path(&self, variant: &VariantKey) -> PathBuf {
        self.variant_dir(variant).join(FINGERPRINT_FILE)
    }

    /// Canonical measurement record
    pub fn canonical_path(&self) -> PathBuf {
        self.model_dir.join(format!("{}Measured.csv", self.model_id))
    }

    /// Working area for unmerged shards
    pub fn shard_dir(&self) -> PathBuf {
        self.model_dir.join(SHARD_DIR)
    }

    /// Where shards go once they are folded into the canonical record
    pub fn archive_dir(&self) -> PathBuf {
        self.shard_dir().join(ARCHIVE_DIR)
    }

    /// Fresh shard file for one device worker in one run
    pub fn shard_path(&self, device: u32, run_id: Uuid) -> PathBuf {
        self.shard_dir()
            .join(format!("{}.dev{}.{}.csv", self.model_id, device, run_id))
    }

    pub fn log_dir(&self) -> PathBuf {
        self.model_dir.join(LOG_DIR)
    }

    fn expand(&self, template: &str, variant: &VariantKey) -> PathBuf {
        let model = self.model_dir.to_string_lossy();
        let model = model.trim_end_matches('/');
        PathBuf::from(
            template
                .replace("{model}", model)
                .replace("{model_name}", &self.model_id)
                .replace("{bpw}", &variant.to_string()),
        )
    }
}
