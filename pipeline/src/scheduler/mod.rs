//! Job scheduling: pending-set computation, device assignment and the shared
//! work queue device workers pull from.

mod job_queue;
mod planner;

pub use job_queue::{JobQueue, QueuedJob};
pub use planner::{DeviceAssignment, DispatchMode, DispatchPlan, Scheduler};
