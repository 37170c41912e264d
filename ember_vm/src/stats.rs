//! Dispatch statistics.

use std::cell::Cell;

/// Counters for hook dispatch activity on one runtime.
///
/// Only touched from the interpreter thread.
#[derive(Debug, Default)]
pub struct TraceStats {
    enabled: bool,
    dispatches: Cell<u64>,
    hook_calls: Cell<u64>,
    cleanups: Cell<u64>,
    global_updates: Cell<u64>,
    jit_invalidations: Cell<u64>,
}

impl TraceStats {
    /// Counters that only count when `enabled`.
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            ..Self::default()
        }
    }

    /// Whether counting is on.
    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    #[inline]
    fn bump(&self, counter: &Cell<u64>) {
        if self.enabled {
            counter.set(counter.get() + 1);
        }
    }

    #[inline]
    pub(crate) fn record_dispatch(&self) {
        self.bump(&self.dispatches);
    }

    #[inline]
    pub(crate) fn record_hook_call(&self) {
        self.bump(&self.hook_calls);
    }

    #[inline]
    pub(crate) fn record_cleanup(&self) {
        self.bump(&self.cleanups);
    }

    #[inline]
    pub(crate) fn record_global_update(&self) {
        self.bump(&self.global_updates);
    }

    #[inline]
    pub(crate) fn record_jit_invalidation(&self) {
        self.bump(&self.jit_invalidations);
    }

    /// Point-in-time copy.
    pub fn snapshot(&self) -> TraceStatsSnapshot {
        TraceStatsSnapshot {
            dispatches: self.dispatches.get(),
            hook_calls: self.hook_calls.get(),
            cleanups: self.cleanups.get(),
            global_updates: self.global_updates.get(),
            jit_invalidations: self.jit_invalidations.get(),
        }
    }

    /// Zero every counter.
    pub fn reset(&self) {
        self.dispatches.set(0);
        self.hook_calls.set(0);
        self.cleanups.set(0);
        self.global_updates.set(0);
        self.jit_invalidations.set(0);
    }
}

/// Plain copy of [`TraceStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TraceStatsSnapshot {
    /// Hook lists walked.
    pub dispatches: u64,
    /// Hook callbacks invoked.
    pub hook_calls: u64,
    /// Deferred cleanups performed.
    pub cleanups: u64,
    /// Global event mask changes propagated.
    pub global_updates: u64,
    /// Machine-code invalidations requested.
    pub jit_invalidations: u64,
}
