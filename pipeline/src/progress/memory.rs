//! In-memory progress store for tests and dry runs.

use super::{Fingerprint, ProgressStore};
use crate::errors::{PipelineError, Result};
use crate::work::{VariantKey, WorkItem};
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

type Key = (String, VariantKey);

/// Progress store that forgets everything when dropped
#[derive(Debug, Default)]
pub struct InMemoryProgressStore {
    quantized: Mutex<HashMap<Key, String>>,
    measured: Mutex<HashSet<Key>>,
}

impl InMemoryProgressStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed measured variants for a model
    pub fn with_measured(self, model_id: &str, variants: &[VariantKey]) -> Self {
        if let Ok(mut set) = self.measured.lock() {
            for v in variants {
                set.insert((model_id.to_string(), *v));
            }
        }
        self
    }

    /// Seed quantized items (with their current parameters)
    pub fn with_quantized(self, items: &[WorkItem]) -> Self {
        for item in items {
            let _ = self.mark_quantized(item);
        }
        self
    }

    /// Number of measured variants recorded
    pub fn measured_count(&self) -> usize {
        self.measured.lock().map(|s| s.len()).unwrap_or(0)
    }
}

impl ProgressStore for InMemoryProgressStore {
    fn is_quantized(&self, item: &WorkItem) -> bool {
        let expected = Fingerprint::for_item(item).digest;
        self.quantized
            .lock()
            .map(|m| m.get(&(item.model_id.clone(), item.variant)) == Some(&expected))
            .unwrap_or(false)
    }

    fn is_measured(&self, model_id: &str, variant: &VariantKey) -> bool {
        self.measured
            .lock()
            .map(|s| s.contains(&(model_id.to_string(), *variant)))
            .unwrap_or(false)
    }

    fn mark_quantized(&self, item: &WorkItem) -> Result<()> {
        lock(&self.quantized)?.insert(
            (item.model_id.clone(), item.variant),
            Fingerprint::for_item(item).digest,
        );
        Ok(())
    }

    fn mark_measured(&self, model_id: &str, variant: &VariantKey) -> Result<()> {
        lock(&self.measured)?.insert((model_id.to_string(), *variant));
        Ok(())
    }

    fn clear_quantized(&self, item: &WorkItem) -> Result<()> {
        lock(&self.quantized)?.remove(&(item.model_id.clone(), item.variant));
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| PipelineError::Queue("Progress store lock poisoned".to_string()))
}
