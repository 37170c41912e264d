//! Ember deferred execution
//!
//! Work requested from contexts that cannot safely run language code (signal
//! handlers, native threads) is recorded here and executed later on the
//! interpreter thread at a safe point.
//!
//! # Components
//!
//! - [`PostponedJobTable`]: fixed slots registered and triggered with atomics
//!   only; safe to use from a signal handler. Repeated triggers coalesce.
//! - [`WorkQueue`]: a locked FIFO of boxed jobs for native threads; every
//!   job runs exactly once.
//! - [`flush`]: drains both at a safe point.
//!
//! [`JobQueues`] bundles them with the interrupt word they arm.
//!
//! # Usage
//!
//! ```ignore
//! let queues = Arc::new(JobQueues::new(interrupts));
//! let handle = queues.preregister(sample_stack, JobData::NONE);
//! // later, possibly from a signal handler:
//! queues.trigger(handle);
//! // at the next safe point on the interpreter thread:
//! queues.flush(&ctx)?;
//! ```

#![warn(clippy::all)]

pub mod flush;
pub mod postponed;
pub mod signal;
pub mod workqueue;

mod stats;

pub use flush::{FlushReport, SafePoint};
pub use postponed::{JobData, JobHandle, PostponedJobFn, PostponedJobTable, PJOB_TABLE_SIZE};
pub use stats::{JobStats, JobStatsSnapshot};
pub use workqueue::{WorkQueue, WorkQueueJob};

use ember_core::{EmberResult, InterruptBits, InterruptFlags};
use std::sync::Arc;

/// Postponed job table, work queue and the interrupt word they arm.
pub struct JobQueues {
    table: PostponedJobTable,
    workqueue: WorkQueue,
    interrupts: Arc<InterruptFlags>,
    stats: JobStats,
}

impl JobQueues {
    /// Queues that arm `interrupts` (the main execution context's word).
    pub fn new(interrupts: Arc<InterruptFlags>) -> Self {
        Self {
            table: PostponedJobTable::new(),
            workqueue: WorkQueue::new(),
            interrupts,
            stats: JobStats::new(),
        }
    }

    /// See [`PostponedJobTable::preregister`]. Async-signal-safe.
    #[inline]
    pub fn preregister(&self, func: PostponedJobFn, data: JobData) -> JobHandle {
        self.table.preregister(func, data)
    }

    /// Mark a postponed job to run at the next safe point. Invalid handles
    /// are ignored. Async-signal-safe.
    #[inline]
    pub fn trigger(&self, handle: JobHandle) {
        if self.table.mark_triggered(handle) {
            self.interrupts.set(InterruptBits::POSTPONED_JOB);
            JobStats::bump(&self.stats.triggers, 1);
        }
    }

    /// Register and trigger in one step. Returns `false` if the table is
    /// full. Async-signal-safe.
    pub fn register_and_trigger(&self, func: PostponedJobFn, data: JobData) -> bool {
        let handle = self.preregister(func, data);
        if !handle.is_valid() {
            return false;
        }
        self.trigger(handle);
        true
    }

    /// Queue a native job. Returns `false` if the queue could not grow.
    /// Must not be called from a signal handler.
    pub fn enqueue(&self, job: WorkQueueJob) -> bool {
        if !self.workqueue.push(job) {
            return false;
        }
        self.interrupts.set(InterruptBits::POSTPONED_JOB);
        JobStats::bump(&self.stats.enqueued, 1);
        true
    }

    /// Run pending jobs on `ctx`. See [`flush::flush`].
    #[inline]
    pub fn flush(&self, ctx: &dyn SafePoint) -> EmberResult<FlushReport> {
        flush::flush(self, ctx)
    }

    /// Whether anything is waiting to run.
    pub fn has_pending(&self) -> bool {
        self.table.has_triggered() || !self.workqueue.is_empty()
    }

    /// Re-arm the interrupt in a forked child for jobs that were pending
    /// when the parent forked.
    pub fn after_fork(&self) {
        if self.has_pending() {
            self.interrupts.set(InterruptBits::POSTPONED_JOB);
        }
    }

    /// Drop every registration and queued job (runtime teardown).
    pub fn reset(&self) {
        self.table.reset();
        drop(self.workqueue.take_all());
        self.interrupts.clear(InterruptBits::POSTPONED_JOB);
    }

    /// Bytes used by the table and the queue.
    pub fn memsize(&self) -> usize {
        self.table.memsize() + self.workqueue.memsize()
    }

    /// The postponed job table.
    #[inline]
    pub fn table(&self) -> &PostponedJobTable {
        &self.table
    }

    /// The native work queue.
    #[inline]
    pub fn workqueue(&self) -> &WorkQueue {
        &self.workqueue
    }

    /// The interrupt word armed by triggers and enqueues.
    #[inline]
    pub fn interrupts(&self) -> &Arc<InterruptFlags> {
        &self.interrupts
    }

    /// Activity counters.
    #[inline]
    pub fn stats(&self) -> &JobStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(_: JobData) -> EmberResult<()> {
        Ok(())
    }

    #[test]
    fn test_trigger_arms_interrupt() {
        let interrupts = Arc::new(InterruptFlags::new());
        let queues = JobQueues::new(Arc::clone(&interrupts));
        let handle = queues.preregister(noop, JobData::NONE);
        assert!(interrupts.pending().is_empty());
        queues.trigger(handle);
        assert!(interrupts.pending().contains(InterruptBits::POSTPONED_JOB));
        assert_eq!(queues.stats().snapshot().triggers, 1);
    }

    #[test]
    fn test_invalid_trigger_is_ignored() {
        let interrupts = Arc::new(InterruptFlags::new());
        let queues = JobQueues::new(Arc::clone(&interrupts));
        queues.trigger(JobHandle::INVALID);
        assert!(interrupts.pending().is_empty());
        assert!(!queues.has_pending());
    }

    #[test]
    fn test_register_and_trigger() {
        let queues = JobQueues::new(Arc::new(InterruptFlags::new()));
        assert!(queues.register_and_trigger(noop, JobData::new(3)));
        assert!(queues.table().has_triggered());
    }

    #[test]
    fn test_after_fork_rearms() {
        let interrupts = Arc::new(InterruptFlags::new());
        let queues = JobQueues::new(Arc::clone(&interrupts));
        queues.enqueue(WorkQueueJob::new(|| Ok(())));
        interrupts.take_pending();
        queues.after_fork();
        assert!(interrupts.pending().contains(InterruptBits::POSTPONED_JOB));
    }

    #[test]
    fn test_reset() {
        let interrupts = Arc::new(InterruptFlags::new());
        let queues = JobQueues::new(Arc::clone(&interrupts));
        assert!(queues.register_and_trigger(noop, JobData::NONE));
        queues.enqueue(WorkQueueJob::new(|| Ok(())));
        queues.reset();
        assert!(!queues.has_pending());
        assert_eq!(queues.table().registered(), 0);
        assert!(interrupts.pending().is_empty());
        assert!(queues.memsize() >= std::mem::size_of::<PostponedJobTable>());
    }
}
