//! Request and result types exchanged with a compute backend.

use crate::work::{BitsPerWeight, VariantKey};
use std::path::PathBuf;
use thiserror::Error;

/// Error types for backend execution
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BackendError {
    #[error("Timeout after {0}ms")]
    Timeout(u64),

    #[error("Out of memory: {0}")]
    OutOfMemory(String),

    #[error("Interrupted: {0}")]
    Interrupted(String),

    #[error("Failed to start backend: {0}")]
    Spawn(String),

    #[error("Backend failed: {0}")]
    Failed(String),

    #[error("Could not parse backend output: {0}")]
    Parse(String),

    #[error("Missing artifact: {0}")]
    MissingArtifact(String),
}

impl BackendError {
    /// Whether retrying the same item may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BackendError::Timeout(_)
                | BackendError::OutOfMemory(_)
                | BackendError::Interrupted(_)
                | BackendError::Spawn(_)
        )
    }
}

/// Result type for backend operations
pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Everything a backend needs to build one quantized variant
#[derive(Debug, Clone, PartialEq)]
pub struct QuantizeRequest {
    /// Source model directory
    pub model_dir: PathBuf,

    /// Where the finished variant must end up
    pub out_dir: PathBuf,

    /// Scratch directory for the quantizer's own resumable state
    pub work_dir: PathBuf,

    pub bpw: BitsPerWeight,

    /// Device ordinal to run on
    pub device: u32,

    /// Continue the job found in `work_dir` instead of starting over
    pub resume: bool,

    /// Extra arguments forwarded verbatim
    pub passthrough: Vec<String>,
}

/// Everything a backend needs to measure one variant
#[derive(Debug, Clone, PartialEq)]
pub struct MeasureRequest {
    /// Source model directory (the reference for divergence)
    pub model_dir: PathBuf,

    /// Directory of the variant being measured
    pub variant_dir: PathBuf,

    pub variant: VariantKey,

    /// Device ordinal to run on
    pub device: u32,

    /// Evaluation rows for perplexity
    pub ppl_rows: u32,

    /// Evaluation rows for divergence
    pub kl_rows: u32,

    /// Extra arguments forwarded verbatim
    pub passthrough: Vec<String>,
}

/// Metrics returned by a successful measurement
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Measurement {
    pub gib: f64,
    pub kl_div: f64,
    pub ppl: f64,
}
