//! Native work queue.
//!
//! A FIFO of boxed jobs that native threads hand to the interpreter thread.
//! Unlike postponed jobs, every enqueued job runs exactly once and carries
//! its own captured data; the queue is guarded by a lock, so it must not be
//! used from a signal handler.

use ember_core::EmberResult;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;

/// A job queued for execution on the interpreter thread.
pub struct WorkQueueJob {
    func: Box<dyn FnOnce() -> EmberResult<()> + Send>,
}

impl WorkQueueJob {
    /// Wrap a closure.
    pub fn new(func: impl FnOnce() -> EmberResult<()> + Send + 'static) -> Self {
        Self { func: Box::new(func) }
    }

    /// Consume the job and run it.
    #[inline]
    pub fn run(self) -> EmberResult<()> {
        (self.func)()
    }
}

impl fmt::Debug for WorkQueueJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("WorkQueueJob")
    }
}

/// The queue.
#[derive(Default)]
pub struct WorkQueue {
    jobs: Mutex<VecDeque<WorkQueueJob>>,
}

impl WorkQueue {
    /// Empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a job. Returns `false` if the queue cannot grow; the job is
    /// dropped in that case.
    pub fn push(&self, job: WorkQueueJob) -> bool {
        let mut jobs = self.jobs.lock();
        if jobs.try_reserve(1).is_err() {
            return false;
        }
        jobs.push_back(job);
        true
    }

    /// Take every queued job, leaving the queue empty.
    pub fn take_all(&self) -> VecDeque<WorkQueueJob> {
        std::mem::take(&mut *self.jobs.lock())
    }

    /// Put jobs back at the front, ahead of anything queued since they
    /// were taken, preserving their order.
    pub fn prepend(&self, mut remaining: VecDeque<WorkQueueJob>) {
        if remaining.is_empty() {
            return;
        }
        let mut jobs = self.jobs.lock();
        remaining.append(&mut jobs);
        *jobs = remaining;
    }

    /// Number of queued jobs.
    pub fn len(&self) -> usize {
        self.jobs.lock().len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.jobs.lock().is_empty()
    }

    /// Bytes used by the queue's storage.
    pub fn memsize(&self) -> usize {
        let jobs = self.jobs.lock();
        std::mem::size_of::<Self>() + jobs.capacity() * std::mem::size_of::<WorkQueueJob>()
    }
}
