//! Job execution statistics.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for postponed-job and work-queue activity.
///
/// `triggers` is bumped from signal context, so every counter is a relaxed
/// atomic.
#[derive(Debug, Default)]
pub struct JobStats {
    /// Successful `trigger` calls.
    pub triggers: AtomicU64,
    /// Jobs handed to the work queue.
    pub enqueued: AtomicU64,
    /// Postponed jobs executed.
    pub postponed_executed: AtomicU64,
    /// Work-queue jobs executed.
    pub work_executed: AtomicU64,
    /// Flushes that ran to completion.
    pub flushes: AtomicU64,
    /// Flushes interrupted by a failing job.
    pub failed_flushes: AtomicU64,
    /// Jobs (of either kind) put back after a failing job.
    pub requeued: AtomicU64,
}

impl JobStats {
    /// Zeroed statistics.
    pub const fn new() -> Self {
        Self {
            triggers: AtomicU64::new(0),
            enqueued: AtomicU64::new(0),
            postponed_executed: AtomicU64::new(0),
            work_executed: AtomicU64::new(0),
            flushes: AtomicU64::new(0),
            failed_flushes: AtomicU64::new(0),
            requeued: AtomicU64::new(0),
        }
    }

    #[inline]
    pub(crate) fn bump(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }

    /// Point-in-time copy of every counter.
    pub fn snapshot(&self) -> JobStatsSnapshot {
        JobStatsSnapshot {
            triggers: self.triggers.load(Ordering::Relaxed),
            enqueued: self.enqueued.load(Ordering::Relaxed),
            postponed_executed: self.postponed_executed.load(Ordering::Relaxed),
            work_executed: self.work_executed.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            failed_flushes: self.failed_flushes.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
        }
    }

    /// Reset all counters.
    pub fn reset(&self) {
        for counter in [
            &self.triggers,
            &self.enqueued,
            &self.postponed_executed,
            &self.work_executed,
            &self.flushes,
            &self.failed_flushes,
            &self.requeued,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// Plain copy of [`JobStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobStatsSnapshot {
    pub triggers: u64,
    pub enqueued: u64,
    pub postponed_executed: u64,
    pub work_executed: u64,
    pub flushes: u64,
    pub failed_flushes: u64,
    pub requeued: u64,
}
