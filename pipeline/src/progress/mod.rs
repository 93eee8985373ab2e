//! Progress store: which work items are already complete.
//!
//! The scheduler consults the store once at plan time; workers mark the items
//! they finish. Any doubt about completeness (unreadable marker, mismatched
//! fingerprint) resolves to "not complete" so work is redone rather than
//! silently skipped.

mod fingerprint;
mod fs_store;
mod memory;

pub use fingerprint::Fingerprint;
pub use fs_store::FsProgressStore;
pub use memory::InMemoryProgressStore;

use crate::errors::Result;
use crate::work::{Stage, VariantKey, WorkItem};

/// Durable record of completed work
pub trait ProgressStore: Send + Sync {
    /// Output artifacts exist and were built with this item's parameters
    fn is_quantized(&self, item: &WorkItem) -> bool;

    /// The canonical record has a row for this variant
    fn is_measured(&self, model_id: &str, variant: &VariantKey) -> bool;

    /// Record a successful quantization. Idempotent.
    fn mark_quantized(&self, item: &WorkItem) -> Result<()>;

    /// Record a successful measurement. Idempotent.
    fn mark_measured(&self, model_id: &str, variant: &VariantKey) -> Result<()>;

    /// Drop the quantization marker before an item is (re)built, so an
    /// interrupted build is never taken for a finished one.
    fn clear_quantized(&self, item: &WorkItem) -> Result<()>;

    /// Completion for the item's own stage
    fn is_complete(&self, item: &WorkItem) -> bool {
        match item.stage {
            Stage::Quantize => self.is_quantized(item),
            Stage::Measure => self.is_measured(&item.model_id, &item.variant),
        }
    }

    /// Mark the item complete for its own stage
    fn mark_complete(&self, item: &WorkItem) -> Result<()> {
        match item.stage {
            Stage::Quantize => self.mark_quantized(item),
            Stage::Measure => self.mark_measured(&item.model_id, &item.variant),
        }
    }
}
