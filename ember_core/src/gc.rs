//! Collaborator interfaces toward the memory manager.
//!
//! Hook lists and trace points hold values the collector must keep alive.
//! The collector visits them through a [`Tracer`]; connecting a hook to a
//! list owned by some other object goes through a [`WriteBarrier`].

use crate::value::Value;

/// Visitor used during marking.
///
/// Structures holding values report each one with `trace_value`. Immediate
/// values may be reported too; the tracer ignores what it does not manage.
pub trait Tracer {
    /// Mark a value reachable.
    fn trace_value(&mut self, value: &Value);
}

/// A tracer that does nothing (for testing).
pub struct NullTracer;

impl Tracer for NullTracer {
    #[inline]
    fn trace_value(&mut self, _value: &Value) {}
}

/// A counting tracer for debugging and statistics.
#[derive(Debug, Default)]
pub struct CountingTracer {
    /// Number of values traced.
    pub value_count: usize,
    /// Number of traced values that were heap objects.
    pub object_count: usize,
}

impl CountingTracer {
    /// Create a new counting tracer.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Tracer for CountingTracer {
    fn trace_value(&mut self, value: &Value) {
        self.value_count += 1;
        if value.as_object().is_some() {
            self.object_count += 1;
        }
    }
}

/// Write barrier for stores of a value into a structure owned by `owner`.
///
/// `owner` is the identity of the owning object (a code unit or method
/// entry id).
pub trait WriteBarrier {
    /// Record that `owner` now references `value`.
    fn record_write(&self, owner: u64, value: &Value);
}

/// Barrier for collectors that do not track old-to-young stores.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoBarrier;

impl WriteBarrier for NoBarrier {
    #[inline]
    fn record_write(&self, _owner: u64, _value: &Value) {}
}
