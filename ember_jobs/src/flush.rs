//! Safe-point flush of postponed jobs and work-queue jobs.

use crate::JobQueues;
use ember_core::{EmberError, EmberResult, Exception, InterruptBits, InterruptFlags};
use log::debug;
use std::collections::VecDeque;

/// Interrupt bits masked while jobs run, so a job reaching a safe point
/// does not re-enter the flush.
const FLUSH_MASK: InterruptBits = InterruptBits::POSTPONED_JOB.union(InterruptBits::TRAP);

/// The execution context a flush runs on.
pub trait SafePoint {
    /// Interrupt words of the context.
    fn interrupts(&self) -> &InterruptFlags;

    /// Remove and return the pending exception.
    fn take_errinfo(&self) -> Option<Exception>;

    /// Reinstate a previously taken pending exception.
    fn restore_errinfo(&self, errinfo: Option<Exception>);
}

/// What a flush executed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Postponed jobs run.
    pub postponed: usize,
    /// Work-queue jobs run.
    pub work: usize,
}

impl FlushReport {
    /// Total jobs run.
    pub fn total(&self) -> usize {
        self.postponed + self.work
    }
}

/// Run every triggered postponed job, highest slot first, then every
/// work-queue job in FIFO order.
///
/// The first failing job stops the flush. Triggered bits not yet consumed
/// are put back, unexecuted work-queue jobs go back to the front of the
/// queue, the interrupt is re-armed for whatever was put back, and the
/// job's error is returned. The context's pending exception and the
/// postponed-job and trap bits of its interrupt mask are the same
/// afterwards as before, whether or not a job failed.
///
/// # Panics
///
/// Panics if a triggered slot holds no job function.
pub fn flush(queues: &JobQueues, ctx: &dyn SafePoint) -> EmberResult<FlushReport> {
    let mut work = queues.workqueue().take_all();
    let mut triggered = queues.table().take_triggered();

    let interrupts = ctx.interrupts();
    let saved_mask = interrupts.masked() & FLUSH_MASK;
    let saved_errinfo = ctx.take_errinfo();
    interrupts.mask(FLUSH_MASK);

    let mut report = FlushReport::default();
    let result = run_jobs(queues, &mut triggered, &mut work, &mut report);

    interrupts.unmask(FLUSH_MASK.difference(saved_mask));
    ctx.restore_errinfo(saved_errinfo);

    let stats = queues.stats();
    crate::JobStats::bump(&stats.postponed_executed, report.postponed as u64);
    crate::JobStats::bump(&stats.work_executed, report.work as u64);

    match result {
        Ok(()) => {
            crate::JobStats::bump(&stats.flushes, 1);
            Ok(report)
        }
        Err(err) => {
            crate::JobStats::bump(&stats.failed_flushes, 1);
            let requeued = work.len() + triggered.count_ones() as usize;
            if !work.is_empty() {
                queues.workqueue().prepend(work);
                interrupts.set(InterruptBits::POSTPONED_JOB);
            }
            if triggered != 0 {
                queues.table().restore_triggered(triggered);
                interrupts.set(InterruptBits::POSTPONED_JOB);
            }
            crate::JobStats::bump(&stats.requeued, requeued as u64);
            debug!(
                "job flush stopped after {} jobs: {err}; {requeued} jobs put back",
                report.total()
            );
            Err(err)
        }
    }
}

fn run_jobs(
    queues: &JobQueues,
    triggered: &mut usize,
    work: &mut VecDeque<crate::WorkQueueJob>,
    report: &mut FlushReport,
) -> Result<(), EmberError> {
    while *triggered != 0 {
        let index = (usize::BITS - 1 - triggered.leading_zeros()) as usize;
        *triggered &= !(1usize << index);
        let Some((func, data)) = queues.table().job(index) else {
            panic!("postponed job slot {index} was triggered but holds no job function");
        };
        report.postponed += 1;
        func(data)?;
    }

    while let Some(job) = work.pop_front() {
        report.work += 1;
        job.run()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{JobData, WorkQueueJob};
    use std::cell::RefCell;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct TestContext {
        interrupts: Arc<InterruptFlags>,
        errinfo: RefCell<Option<Exception>>,
    }

    impl TestContext {
        fn new(interrupts: Arc<InterruptFlags>) -> Self {
            Self {
                interrupts,
                errinfo: RefCell::new(None),
            }
        }
    }

    impl SafePoint for TestContext {
        fn interrupts(&self) -> &InterruptFlags {
            &self.interrupts
        }

        fn take_errinfo(&self) -> Option<Exception> {
            self.errinfo.borrow_mut().take()
        }

        fn restore_errinfo(&self, errinfo: Option<Exception>) {
            *self.errinfo.borrow_mut() = errinfo;
        }
    }

    fn setup() -> (JobQueues, TestContext) {
        let interrupts = Arc::new(InterruptFlags::new());
        (JobQueues::new(Arc::clone(&interrupts)), TestContext::new(interrupts))
    }

    static ORDER: parking_lot::Mutex<Vec<usize>> = parking_lot::const_mutex(Vec::new());

    fn record(data: JobData) -> EmberResult<()> {
        ORDER.lock().push(data.get());
        Ok(())
    }

    fn record_other(data: JobData) -> EmberResult<()> {
        ORDER.lock().push(data.get() * 10);
        Ok(())
    }

    fn succeed(_: JobData) -> EmberResult<()> {
        Ok(())
    }

    fn failing(_: JobData) -> EmberResult<()> {
        Err(EmberError::raise("RuntimeError", "job failed"))
    }

    #[test]
    fn test_flush_empty() {
        let (queues, ctx) = setup();
        assert_eq!(flush(&queues, &ctx).unwrap(), FlushReport::default());
    }

    #[test]
    fn test_slots_highest_first_then_work_queue() {
        let (queues, ctx) = setup();
        ORDER.lock().clear();
        let low = queues.preregister(record, JobData::new(1));
        let high = queues.preregister(record_other, JobData::new(2));
        queues.trigger(low);
        queues.trigger(high);
        queues.trigger(high);
        assert!(queues.enqueue(WorkQueueJob::new(|| {
            ORDER.lock().push(99);
            Ok(())
        })));

        let report = flush(&queues, &ctx).unwrap();
        assert_eq!(report, FlushReport { postponed: 2, work: 1 });
        assert_eq!(*ORDER.lock(), vec![20, 1, 99]);
        assert!(!queues.has_pending());
        assert!(ctx.interrupts.masked().is_empty());
    }

    #[test]
    fn test_failure_requeues_remaining_work() {
        let (queues, ctx) = setup();
        let ran = Arc::new(AtomicUsize::new(0));
        queues.enqueue(WorkQueueJob::new(|| Err(EmberError::raise("RuntimeError", "first"))));
        let counter = Arc::clone(&ran);
        queues.enqueue(WorkQueueJob::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));
        ctx.interrupts.take_pending();

        let err = flush(&queues, &ctx).unwrap_err();
        assert_eq!(err.exception().unwrap().message(), "first");
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(queues.workqueue().len(), 1);
        assert!(ctx.interrupts.pending().contains(InterruptBits::POSTPONED_JOB));

        assert_eq!(flush(&queues, &ctx).unwrap().work, 1);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failure_restores_untaken_bits_and_skips_work() {
        let (queues, ctx) = setup();
        let fail = queues.preregister(failing, JobData::NONE);
        let other = queues.preregister(succeed, JobData::NONE);
        // `other` sits in a higher slot and runs before the failure.
        assert!(other.index() > fail.index());
        queues.trigger(fail);
        queues.trigger(other);
        queues.enqueue(WorkQueueJob::new(|| Ok(())));

        assert!(flush(&queues, &ctx).is_err());
        assert!(!queues.table().has_triggered());
        assert_eq!(queues.workqueue().len(), 1);
        assert_eq!(queues.stats().snapshot().failed_flushes, 1);
    }

    #[test]
    fn test_errinfo_and_mask_preserved() {
        let (queues, ctx) = setup();
        let pending = Exception::new("IOError", "pending");
        ctx.restore_errinfo(Some(pending.clone()));
        ctx.interrupts.mask(InterruptBits::TRAP);
        queues.enqueue(WorkQueueJob::new(|| Err(EmberError::raise("RuntimeError", "x"))));

        assert!(flush(&queues, &ctx).is_err());
        assert_eq!(ctx.take_errinfo(), Some(pending));
        assert_eq!(ctx.interrupts.masked(), InterruptBits::TRAP);
    }

    #[test]
    #[should_panic(expected = "holds no job function")]
    fn test_triggered_empty_slot_is_fatal() {
        let (queues, ctx) = setup();
        queues.table().mark_triggered(crate::JobHandle::from_index(7));
        let _ = flush(&queues, &ctx);
    }
}
