//! Work items
//!
//! A work item is one quantization or measurement job for one variant of one
//! model. Items are immutable once the scheduler creates them.

use super::variant::VariantKey;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Pipeline stage a work item belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Quantize,
    Measure,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Quantize => "quantize",
            Stage::Measure => "measure",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Device-independent parameters for a work item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariantParams {
    /// Extra arguments forwarded verbatim to the compute backend
    #[serde(default)]
    pub passthrough: Vec<String>,

    /// Rows of evaluation data used for perplexity (measure only)
    pub ppl_rows: u32,

    /// Rows of evaluation data used for KL divergence (measure only)
    pub kl_rows: u32,
}

impl Default for VariantParams {
    fn default() -> Self {
        Self {
            passthrough: Vec::new(),
            ppl_rows: 100,
            kl_rows: 10,
        }
    }
}

/// Identity of a work item: (stage, model, variant)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ItemId {
    pub stage: Stage,
    pub model_id: String,
    pub variant: VariantKey,
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.stage, self.model_id, self.variant)
    }
}

/// A unit of work
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub stage: Stage,
    pub model_id: String,
    pub variant: VariantKey,
    pub params: VariantParams,
}

impl WorkItem {
    /// Create a quantization item
    pub fn quantize(model_id: impl Into<String>, variant: VariantKey, params: VariantParams) -> Self {
        Self {
            stage: Stage::Quantize,
            model_id: model_id.into(),
            variant,
            params,
        }
    }

    /// Create a measurement item
    pub fn measure(model_id: impl Into<String>, variant: VariantKey, params: VariantParams) -> Self {
        Self {
            stage: Stage::Measure,
            model_id: model_id.into(),
            variant,
            params,
        }
    }

    /// Identity of this item
    pub fn id(&self) -> ItemId {
        ItemId {
            stage: self.stage,
            model_id: self.model_id.clone(),
            variant: self.variant,
        }
    }
}
