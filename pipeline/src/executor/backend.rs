//! Compute backend seam
//!
//! The numerical work (quantization, perplexity, divergence) is opaque to the
//! pipeline. Anything that can build a variant and measure one can drive it.

use super::types::{BackendResult, MeasureRequest, Measurement, QuantizeRequest};
use async_trait::async_trait;

/// Executes one work item on one device
#[async_trait]
pub trait ComputeBackend: Send + Sync {
    /// Build a quantized variant into `request.out_dir`.
    ///
    /// Success means the output is complete; the pipeline still checks for
    /// the artifact marker before recording progress.
    async fn run_quantize(&self, request: &QuantizeRequest) -> BackendResult<()>;

    /// Measure a variant (or the base model)
    async fn run_measure(&self, request: &MeasureRequest) -> BackendResult<Measurement>;
}
