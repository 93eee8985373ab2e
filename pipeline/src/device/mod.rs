//! Device pool
//!
//! A fixed set of compute device identifiers (CUDA ordinals) with optional
//! relative capacity weights. The pool never changes during a run.

use crate::errors::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One compute device participating in a run
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Device {
    /// Device ordinal passed to the backend
    pub id: u32,

    /// Relative capacity, only used by static ratio dispatch
    pub weight: f64,
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dev{}", self.id)
    }
}

/// Set of devices available to a run
#[derive(Debug, Clone, PartialEq)]
pub struct DevicePool {
    devices: Vec<Device>,
}

impl DevicePool {
    /// Create a pool with equal weights.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::Config` if an id appears twice.
    pub fn new(ids: &[u32]) -> Result<Self> {
        let weights = vec![1.0; ids.len()];
        Self::with_weights(ids, &weights)
    }

    /// Create a pool with explicit per-device weights.
    ///
    /// Weights may be zero (the device idles in static mode) but at least one
    /// must be positive when the pool is not empty.
    pub fn with_weights(ids: &[u32], weights: &[f64]) -> Result<Self> {
        if ids.len() != weights.len() {
            return Err(PipelineError::Config(format!(
                "{} devices but {} ratios",
                ids.len(),
                weights.len()
            )));
        }

        for (i, id) in ids.iter().enumerate() {
            if ids[..i].contains(id) {
                return Err(PipelineError::Config(format!("Duplicate device id {}", id)));
            }
        }

        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(PipelineError::Config(
                "Device ratios must be finite and non-negative".to_string(),
            ));
        }

        if !weights.is_empty() && weights.iter().all(|w| *w == 0.0) {
            return Err(PipelineError::Config(
                "At least one device ratio must be positive".to_string(),
            ));
        }

        let devices = ids
            .iter()
            .zip(weights)
            .map(|(&id, &weight)| Device { id, weight })
            .collect();

        Ok(Self { devices })
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Split an ordered item list across devices proportionally to weight.
    ///
    /// Items are dealt one at a time to the device whose load after receiving
    /// the item would be smallest relative to its weight (ties go to the
    /// earlier device), so each device's share stays in input order and
    /// adjacent items land on different devices. The result has one entry per
    /// device, in pool order.
    pub fn partition_weighted<T>(&self, items: Vec<T>) -> Vec<Vec<T>> {
        let mut buckets: Vec<Vec<T>> = self.devices.iter().map(|_| Vec::new()).collect();
        if self.devices.is_empty() {
            return buckets;
        }

        for item in items {
            let mut best = 0;
            let mut best_load = f64::INFINITY;
            for (i, device) in self.devices.iter().enumerate() {
                if device.weight == 0.0 {
                    continue;
                }
                let load = (buckets[i].len() + 1) as f64 / device.weight;
                if load < best_load {
                    best_load = load;
                    best = i;
                }
            }
            buckets[best].push(item);
        }

        buckets
    }
}

/// Parse a comma-separated device list, e.g. `"0,1"`.
pub fn parse_device_list(s: &str) -> Result<Vec<u32>> {
    let ids: Vec<u32> = s
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(|t| {
            t.parse()
                .map_err(|_| PipelineError::Config(format!("Invalid device id '{}'", t)))
        })
        .collect::<Result<_>>()?;

    if ids.is_empty() {
        return Err(PipelineError::Config("Empty device list".to_string()));
    }
    Ok(ids)
}

/// Parse a comma-separated ratio list, e.g. `"1,1"` or `"2,1.5"`.
pub fn parse_ratio_list(s: &str) -> Result<Vec<f64>> {
    s.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(|t| {
            t.parse()
                .map_err(|_| PipelineError::Config(format!("Invalid device ratio '{}'", t)))
        })
        .collect()
}
