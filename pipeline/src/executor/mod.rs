//! Work item execution
//!
//! - `backend`: the compute backend seam (quantize / measure)
//! - `process`: backend that runs external tools as subprocesses
//! - `job_runner`: per-device worker loop with retry and statistics
//! - `shutdown`: cooperative cancellation

pub mod backend;
pub mod job_runner;
pub mod process;
pub mod shutdown;
pub mod types;

pub use backend::ComputeBackend;
pub use job_runner::{DeviceWorker, JobStats, WorkerContext, WorkerEvent, WorkerReport};
pub use process::ProcessBackend;
pub use shutdown::Shutdown;
pub use types::{BackendError, BackendResult, MeasureRequest, Measurement, QuantizeRequest};
