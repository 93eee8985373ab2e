//! Resumable multi-device quantize/measure batch pipeline.
//!
//! Quantizes one model at several bit-per-weight targets, measures every
//! variant on a pool of devices, and aggregates the measurements into one
//! canonical CSV record that survives interruption at any point.

pub mod config;
pub mod device;
pub mod errors;
pub mod executor;
pub mod fsutil;
pub mod layout;
pub mod observability;
pub mod pipeline;
pub mod progress;
pub mod record;
pub mod scheduler;
pub mod work;

pub use config::{PipelineConfig, RetryPolicy};
pub use device::{parse_device_list, parse_ratio_list, Device, DevicePool};
pub use errors::{PipelineError, Result};
pub use executor::{
    BackendError, ComputeBackend, MeasureRequest, Measurement, ProcessBackend, QuantizeRequest,
    Shutdown,
};
pub use layout::ModelLayout;
pub use observability::{init_production_logging, init_simple_logging};
pub use pipeline::{Pipeline, RunSummary, StageSummary};
pub use progress::{FsProgressStore, InMemoryProgressStore, ProgressStore};
pub use record::{CanonicalRecord, MeasurementRow, MergeReport, ShardMerger, ShardRetention};
pub use scheduler::{DispatchMode, DispatchPlan, Scheduler};
pub use work::{parse_variant_list, Stage, VariantKey, WorkItem};
