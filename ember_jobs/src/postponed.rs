//! Postponed job table.
//!
//! A fixed table of `usize::BITS` slots, each holding a job function and a
//! word of data, plus one word of "triggered" bits. Registration and
//! triggering touch only atomics, so both may be called from a signal
//! handler or from any thread. Jobs run later, on the interpreter thread,
//! when [`flush`](crate::flush::flush) reaches a safe point.
//!
//! Triggering an already-triggered slot before it runs coalesces into a
//! single execution.

use ember_core::EmberResult;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

/// Number of postponed job slots.
pub const PJOB_TABLE_SIZE: usize = usize::BITS as usize;

/// A postponed job function.
///
/// Plain function pointers only; they are stored atomically in the table.
pub type PostponedJobFn = fn(JobData) -> EmberResult<()>;

/// Word-sized payload handed to a postponed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct JobData(usize);

impl JobData {
    /// Empty payload.
    pub const NONE: JobData = JobData(0);

    /// Wrap a raw word.
    #[inline]
    pub const fn new(raw: usize) -> Self {
        Self(raw)
    }

    /// Raw word.
    #[inline]
    pub const fn get(self) -> usize {
        self.0
    }

    /// Carry a pointer as the payload. The job owns whatever it points to.
    #[inline]
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr as usize)
    }

    /// Reinterpret the payload as a pointer.
    #[inline]
    pub fn as_ptr<T>(self) -> *const T {
        self.0 as *const T
    }
}

/// Index of a registered slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobHandle(u32);

impl JobHandle {
    /// Returned when registration failed because every slot is taken.
    pub const INVALID: JobHandle = JobHandle(u32::MAX);

    /// Handle for a slot index.
    #[inline]
    pub const fn from_index(index: usize) -> Self {
        if index < PJOB_TABLE_SIZE {
            Self(index as u32)
        } else {
            Self::INVALID
        }
    }

    /// Whether this handle names a slot.
    #[inline]
    pub const fn is_valid(self) -> bool {
        (self.0 as usize) < PJOB_TABLE_SIZE
    }

    /// Slot index, if valid.
    #[inline]
    pub const fn index(self) -> Option<usize> {
        if self.is_valid() {
            Some(self.0 as usize)
        } else {
            None
        }
    }

    /// Raw handle value, suitable for storing in an atomic.
    #[inline]
    pub const fn to_raw(self) -> u32 {
        self.0
    }

    /// Inverse of [`JobHandle::to_raw`].
    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }
}

/// One slot. The function pointer is null while the slot is free.
struct PostponedJobSlot {
    func: AtomicPtr<()>,
    data: AtomicUsize,
}

impl PostponedJobSlot {
    const fn new() -> Self {
        Self {
            func: AtomicPtr::new(ptr::null_mut()),
            data: AtomicUsize::new(0),
        }
    }
}

/// The postponed job table.
pub struct PostponedJobTable {
    slots: [PostponedJobSlot; PJOB_TABLE_SIZE],
    triggered: AtomicUsize,
}

impl PostponedJobTable {
    /// Empty table.
    pub const fn new() -> Self {
        #[allow(clippy::declare_interior_mutable_const)]
        const EMPTY: PostponedJobSlot = PostponedJobSlot::new();
        Self {
            slots: [EMPTY; PJOB_TABLE_SIZE],
            triggered: AtomicUsize::new(0),
        }
    }

    /// Claim a slot for `func`, or reuse the slot already holding `func`.
    ///
    /// In both cases the slot's data is replaced with `data`; if the slot is
    /// triggered concurrently the job may observe either the old or the new
    /// data. Returns [`JobHandle::INVALID`] when every slot holds some other
    /// function. Async-signal-safe.
    pub fn preregister(&self, func: PostponedJobFn, data: JobData) -> JobHandle {
        let wanted = func as *const () as *mut ();
        for (index, slot) in self.slots.iter().enumerate() {
            let claimed = match slot.func.compare_exchange(
                ptr::null_mut(),
                wanted,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => true,
                Err(existing) => existing == wanted,
            };
            if claimed {
                slot.data.swap(data.get(), Ordering::AcqRel);
                return JobHandle::from_index(index);
            }
        }
        JobHandle::INVALID
    }

    /// Set the triggered bit of `handle`. Returns `false` for an invalid
    /// handle. Async-signal-safe.
    #[inline]
    pub fn mark_triggered(&self, handle: JobHandle) -> bool {
        match handle.index() {
            Some(index) => {
                self.triggered.fetch_or(1usize << index, Ordering::AcqRel);
                true
            }
            None => false,
        }
    }

    /// Atomically take every triggered bit, leaving none set.
    #[inline]
    pub fn take_triggered(&self) -> usize {
        self.triggered.swap(0, Ordering::AcqRel)
    }

    /// Put bits back after an interrupted flush.
    #[inline]
    pub fn restore_triggered(&self, bits: usize) {
        if bits != 0 {
            self.triggered.fetch_or(bits, Ordering::AcqRel);
        }
    }

    /// Whether any slot is triggered.
    #[inline]
    pub fn has_triggered(&self) -> bool {
        self.triggered.load(Ordering::Acquire) != 0
    }

    /// Function and data currently in slot `index`, or `None` if free.
    pub fn job(&self, index: usize) -> Option<(PostponedJobFn, JobData)> {
        let slot = self.slots.get(index)?;
        let func = slot.func.load(Ordering::Acquire);
        if func.is_null() {
            return None;
        }
        let data = JobData::new(slot.data.load(Ordering::Acquire));
        // SAFETY: non-null values in `func` are only ever written by
        // `preregister`, which stores a `PostponedJobFn` cast to a pointer.
        let func = unsafe { std::mem::transmute::<*mut (), PostponedJobFn>(func) };
        Some((func, data))
    }

    /// Number of claimed slots.
    pub fn registered(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| !slot.func.load(Ordering::Acquire).is_null())
            .count()
    }

    /// Release every slot and drop pending triggers (runtime teardown).
    pub fn reset(&self) {
        for slot in &self.slots {
            slot.func.store(ptr::null_mut(), Ordering::Release);
            slot.data.store(0, Ordering::Release);
        }
        self.triggered.store(0, Ordering::Release);
    }

    /// Bytes used by the table itself.
    pub const fn memsize(&self) -> usize {
        std::mem::size_of::<Self>()
    }
}

impl Default for PostponedJobTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job_a(_: JobData) -> EmberResult<()> {
        Ok(())
    }

    fn job_b(_: JobData) -> EmberResult<()> {
        Ok(())
    }

    #[test]
    fn test_preregister_claims_first_free_slot() {
        let table = PostponedJobTable::new();
        let a = table.preregister(job_a, JobData::new(1));
        let b = table.preregister(job_b, JobData::new(2));
        assert_eq!(a.index(), Some(0));
        assert_eq!(b.index(), Some(1));
        assert_eq!(table.registered(), 2);
    }

    #[test]
    fn test_preregister_same_function_reuses_slot() {
        let table = PostponedJobTable::new();
        let first = table.preregister(job_a, JobData::new(1));
        let second = table.preregister(job_a, JobData::new(7));
        assert_eq!(first, second);
        let (_, data) = table.job(first.index().unwrap()).unwrap();
        assert_eq!(data.get(), 7);
        assert_eq!(table.registered(), 1);
    }

    #[test]
    fn test_full_table_returns_invalid() {
        let table = PostponedJobTable::new();
        for index in 0..PJOB_TABLE_SIZE {
            // Same slot reuse would defeat the test, so fill directly.
            table.slots[index]
                .func
                .store(job_b as *const () as *mut (), Ordering::Release);
        }
        assert_eq!(table.preregister(job_a, JobData::NONE), JobHandle::INVALID);
        // The function already present is still found.
        assert!(table.preregister(job_b, JobData::NONE).is_valid());
    }

    #[test]
    fn test_trigger_bits() {
        let table = PostponedJobTable::new();
        assert!(!table.mark_triggered(JobHandle::INVALID));
        assert!(table.mark_triggered(JobHandle::from_index(3)));
        assert!(table.mark_triggered(JobHandle::from_index(3)));
        assert!(table.has_triggered());
        assert_eq!(table.take_triggered(), 1 << 3);
        assert!(!table.has_triggered());
        table.restore_triggered(1 << 5);
        assert_eq!(table.take_triggered(), 1 << 5);
    }

    #[test]
    fn test_handle_bounds() {
        assert!(!JobHandle::from_index(PJOB_TABLE_SIZE).is_valid());
        assert_eq!(JobHandle::from_raw(JobHandle::from_index(4).to_raw()).index(), Some(4));
    }

    #[test]
    fn test_reset() {
        let table = PostponedJobTable::new();
        let h = table.preregister(job_a, JobData::NONE);
        table.mark_triggered(h);
        table.reset();
        assert_eq!(table.registered(), 0);
        assert!(!table.has_triggered());
        assert!(table.job(0).is_none());
    }
}
