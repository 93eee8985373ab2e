//! Dispatch planning
//!
//! Turns a requested item set into an ordered pending set (resume/skip) and
//! assigns it to devices. Planning the same request against the same store
//! always yields the same plan, which is what makes an interrupted run
//! resumable: re-planning reproduces the original plan restricted to what is
//! still pending.

use super::job_queue::JobQueue;
use crate::device::{Device, DevicePool};
use crate::errors::{PipelineError, Result};
use crate::progress::ProgressStore;
use crate::work::{ItemId, Stage, WorkItem};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// How pending items are handed to devices
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    /// One shared queue; idle devices pull the next item
    #[default]
    Queue,
    /// Items split up front in proportion to device ratios
    Static,
}

impl fmt::Display for DispatchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchMode::Queue => f.write_str("queue"),
            DispatchMode::Static => f.write_str("static"),
        }
    }
}

/// Items pre-assigned to one device (static mode)
#[derive(Debug, Clone)]
pub struct DeviceAssignment {
    pub device: Device,
    pub items: Vec<WorkItem>,
}

/// Result of planning one stage
#[derive(Debug, Clone)]
pub struct DispatchPlan {
    pub stage: Stage,
    pub mode: DispatchMode,

    /// Items to run, ascending by variant
    pub pending: Vec<WorkItem>,

    /// Items already complete
    pub skipped: Vec<WorkItem>,

    /// Per-device split; every device appears, possibly with no items.
    /// In queue mode this is empty and all devices share `pending`.
    pub assignments: Vec<DeviceAssignment>,

    devices: Vec<Device>,
}

impl DispatchPlan {
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    /// Build the work queue each device will pull from, in device order
    pub fn queues(&self) -> Vec<(Device, JobQueue)> {
        match self.mode {
            DispatchMode::Queue => {
                let shared = JobQueue::from_items(self.pending.clone());
                self.devices.iter().map(|d| (*d, shared.clone())).collect()
            }
            DispatchMode::Static => self
                .assignments
                .iter()
                .map(|a| (a.device, JobQueue::from_items(a.items.clone())))
                .collect(),
        }
    }

    /// Log the plan
    pub fn log(&self) {
        if self.is_empty() {
            info!(
                stage = %self.stage,
                skipped = self.skipped.len(),
                "Nothing to do"
            );
            return;
        }

        let pending: Vec<String> = self.pending.iter().map(|i| i.variant.to_string()).collect();
        info!(
            stage = %self.stage,
            mode = %self.mode,
            devices = self.devices.len(),
            pending = ?pending,
            skipped = self.skipped.len(),
            "Dispatch plan"
        );
        for a in &self.assignments {
            let items: Vec<String> = a.items.iter().map(|i| i.variant.to_string()).collect();
            info!(stage = %self.stage, device = a.device.id, items = ?items, "Static assignment");
        }
    }
}

/// Builds dispatch plans against a progress store
pub struct Scheduler {
    store: Arc<dyn ProgressStore>,
    force: bool,
}

impl Scheduler {
    pub fn new(store: Arc<dyn ProgressStore>) -> Self {
        Self { store, force: false }
    }

    /// Treat every requested item as pending
    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// Split requested items into (pending, skipped), both ascending by
    /// variant. Duplicate identities keep their first occurrence.
    pub fn pending(&self, requested: &[WorkItem]) -> (Vec<WorkItem>, Vec<WorkItem>) {
        let mut seen: HashSet<ItemId> = HashSet::new();
        let mut pending = Vec::new();
        let mut skipped = Vec::new();

        for item in requested {
            if !seen.insert(item.id()) {
                continue;
            }
            if !self.force && self.store.is_complete(item) {
                debug!(item = %item.id(), "Already complete, skipping");
                skipped.push(item.clone());
            } else {
                pending.push(item.clone());
            }
        }

        pending.sort_by(|a, b| a.id().cmp(&b.id()));
        skipped.sort_by(|a, b| a.id().cmp(&b.id()));
        (pending, skipped)
    }

    /// Plan one stage.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::Plan` if the pool has no devices or the
    /// requested items span more than one stage.
    pub fn plan(
        &self,
        stage: Stage,
        requested: &[WorkItem],
        pool: &DevicePool,
        mode: DispatchMode,
    ) -> Result<DispatchPlan> {
        if pool.is_empty() {
            return Err(PipelineError::Plan(format!(
                "No devices available for {} stage",
                stage
            )));
        }
        if let Some(item) = requested.iter().find(|i| i.stage != stage) {
            return Err(PipelineError::Plan(format!(
                "Item {} does not belong to {} stage",
                item.id(),
                stage
            )));
        }

        let (pending, skipped) = self.pending(requested);

        // Static buckets come from the full request so finished items never
        // shift later ones to another device.
        let assignments = match mode {
            DispatchMode::Queue => Vec::new(),
            DispatchMode::Static => {
                let pending_ids: HashSet<ItemId> = pending.iter().map(|i| i.id()).collect();
                let mut all = pending.clone();
                all.extend(skipped.iter().cloned());
                all.sort_by(|a, b| a.id().cmp(&b.id()));

                pool.devices()
                    .iter()
                    .copied()
                    .zip(pool.partition_weighted(all))
                    .map(|(device, items)| DeviceAssignment {
                        device,
                        items: items
                            .into_iter()
                            .filter(|i| pending_ids.contains(&i.id()))
                            .collect(),
                    })
                    .collect()
            }
        };

        Ok(DispatchPlan {
            stage,
            mode,
            pending,
            skipped,
            assignments,
            devices: pool.devices().to_vec(),
        })
    }
}
