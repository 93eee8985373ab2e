//! Shared work queue
//!
//! A mutex-guarded deque that any number of device workers pull from. In
//! dynamic mode every worker holds a clone of the same queue, so an idle
//! device always takes the next unclaimed item. In static mode each device
//! gets a queue of its own.

use crate::errors::{PipelineError, Result};
use crate::work::WorkItem;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tracing::debug;

/// A work item with queue metadata
#[derive(Debug, Clone)]
pub struct QueuedJob {
    /// The item to run
    pub item: WorkItem,

    /// Failed attempts so far (0 on first dispatch)
    pub attempt: u32,

    /// When this job was (re)queued
    pub queued_at: Instant,
}

impl QueuedJob {
    /// Create a fresh job
    pub fn new(item: WorkItem) -> Self {
        Self {
            item,
            attempt: 0,
            queued_at: Instant::now(),
        }
    }

    /// Same item, one more failed attempt
    pub fn retry(self) -> Self {
        Self {
            item: self.item,
            attempt: self.attempt + 1,
            queued_at: Instant::now(),
        }
    }

    /// Get age in milliseconds
    pub fn age_ms(&self) -> u64 {
        self.queued_at.elapsed().as_millis() as u64
    }
}

/// Cloneable handle to a shared FIFO of jobs
#[derive(Debug, Clone, Default)]
pub struct JobQueue {
    inner: Arc<Mutex<VecDeque<QueuedJob>>>,
}

impl JobQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a queue holding `items` in order
    pub fn from_items(items: impl IntoIterator<Item = WorkItem>) -> Self {
        let jobs: VecDeque<QueuedJob> = items.into_iter().map(QueuedJob::new).collect();
        Self {
            inner: Arc::new(Mutex::new(jobs)),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, VecDeque<QueuedJob>>> {
        self.inner
            .lock()
            .map_err(|_| PipelineError::Queue("Queue lock poisoned".to_string()))
    }

    /// Put a job at the back of the queue
    pub fn enqueue(&self, job: QueuedJob) -> Result<()> {
        let item_id = job.item.id();
        let attempt = job.attempt;
        let mut queue = self.lock()?;
        queue.push_back(job);
        debug!(item = %item_id, attempt, queue_size = queue.len(), "Job enqueued");
        Ok(())
    }

    /// Take the next unclaimed job, `None` when the queue is empty
    pub fn dequeue(&self) -> Result<Option<QueuedJob>> {
        let mut queue = self.lock()?;
        let job = queue.pop_front();
        if let Some(job) = &job {
            debug!(
                item = %job.item.id(),
                attempt = job.attempt,
                age_ms = job.age_ms(),
                "Job dequeued"
            );
        }
        Ok(job)
    }

    /// Remove and return everything still queued
    pub fn drain(&self) -> Result<Vec<QueuedJob>> {
        Ok(self.lock()?.drain(..).collect())
    }

    /// Current queue size
    pub fn size(&self) -> usize {
        self.inner.lock().map(|q| q.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Whether two handles refer to the same queue
    pub fn same_queue(&self, other: &JobQueue) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}
