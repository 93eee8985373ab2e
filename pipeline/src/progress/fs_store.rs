//! Filesystem-backed progress store
//!
//! Quantization progress lives next to each variant's output as a fingerprint
//! file. Measurement progress is the canonical record itself, plus the keys
//! marked during this run (their durable copy is the shard row).

use super::{Fingerprint, ProgressStore};
use crate::errors::{PipelineError, Result};
use crate::layout::ModelLayout;
use crate::record::CanonicalRecord;
use crate::work::{VariantKey, WorkItem};
use std::collections::BTreeSet;
use std::fs;
use std::sync::RwLock;
use tracing::{debug, info, warn};

/// Progress store rooted at one model directory
#[derive(Debug)]
pub struct FsProgressStore {
    layout: ModelLayout,
    measured: RwLock<BTreeSet<VariantKey>>,
}

impl FsProgressStore {
    pub fn new(layout: ModelLayout) -> Self {
        Self {
            layout,
            measured: RwLock::new(BTreeSet::new()),
        }
    }

    pub fn layout(&self) -> &ModelLayout {
        &self.layout
    }

    fn owns(&self, model_id: &str) -> bool {
        if model_id != self.layout.model_id() {
            debug!(
                model_id = model_id,
                store_model = self.layout.model_id(),
                "Progress query for a different model"
            );
            return false;
        }
        true
    }
}

impl ProgressStore for FsProgressStore {
    fn is_quantized(&self, item: &WorkItem) -> bool {
        if !self.owns(&item.model_id) {
            return false;
        }

        let variant_dir = self.layout.variant_dir(&item.variant);
        if !variant_dir.join(self.layout.artifact_marker()).is_file() {
            return false;
        }

        let path = self.layout.fingerprint_path(&item.variant);
        let expected = Fingerprint::for_item(item);

        match Fingerprint::load(&path) {
            Ok(Some(found)) if !found.is_intact() => {
                warn!(
                    variant = %item.variant,
                    path = %path.display(),
                    "Fingerprint is corrupt, treating variant as incomplete"
                );
                false
            }
            Ok(Some(found)) if !found.matches(&expected) => {
                warn!(
                    variant = %item.variant,
                    found = ?found.passthrough,
                    expected = ?expected.passthrough,
                    "Output was built with different parameters, re-running"
                );
                false
            }
            Ok(Some(_)) => true,
            Ok(None) => {
                warn!(
                    variant = %item.variant,
                    dir = %variant_dir.display(),
                    "Output exists without a fingerprint, re-running"
                );
                false
            }
            Err(e) => {
                warn!(
                    variant = %item.variant,
                    path = %path.display(),
                    error = %e,
                    "Fingerprint is unreadable, treating variant as incomplete"
                );
                false
            }
        }
    }

    fn is_measured(&self, model_id: &str, variant: &VariantKey) -> bool {
        if !self.owns(model_id) {
            return false;
        }

        if self
            .measured
            .read()
            .map(|set| set.contains(variant))
            .unwrap_or(false)
        {
            return true;
        }

        let path = self.layout.canonical_path();
        match CanonicalRecord::load(&path) {
            Ok(record) => record.contains(variant),
            Err(e) => {
                warn!(
                    path = %path.display(),
                    error = %e,
                    "Canonical record is unreadable, treating variant as unmeasured"
                );
                false
            }
        }
    }

    fn mark_quantized(&self, item: &WorkItem) -> Result<()> {
        let path = self.layout.fingerprint_path(&item.variant);
        Fingerprint::for_item(item).save(&path)?;
        info!(variant = %item.variant, path = %path.display(), "Variant marked quantized");
        Ok(())
    }

    fn mark_measured(&self, _model_id: &str, variant: &VariantKey) -> Result<()> {
        self.measured
            .write()
            .map_err(|_| PipelineError::Queue("Progress store lock poisoned".to_string()))?
            .insert(*variant);
        Ok(())
    }

    fn clear_quantized(&self, item: &WorkItem) -> Result<()> {
        let path = self.layout.fingerprint_path(&item.variant);
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!(variant = %item.variant, "Cleared stale fingerprint");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
