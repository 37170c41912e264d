//! Collaborators notified when the set of observed events changes.
//!
//! Compiled-code decoration itself lives on [`CodeUnit`](crate::code::CodeUnit);
//! the caches and machine code owned by other subsystems are reached
//! through this trait.

use ember_core::EventFlags;
use std::cell::RefCell;

/// Hooks into the method cache, the JIT and the memory manager.
pub trait Instrumentation {
    /// Every registered code unit was re-decorated for `events`.
    fn code_retraced(&self, _events: EventFlags) {}

    /// Drop call caches that short-circuit attribute accessors.
    fn clear_attr_call_caches(&self) {}

    /// Drop call caches that inline builtin methods.
    fn clear_builtin_call_caches(&self) {}

    /// Tell the memory manager which internal events are observed.
    fn set_allocation_tracing(&self, _events: EventFlags) {}

    /// Invalidate all compiled machine code.
    fn invalidate_jit(&self) {}
}

/// Instrumentation for a runtime with no caches and no JIT.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullInstrumentation;

impl Instrumentation for NullInstrumentation {}

/// One notification received by [`RecordingInstrumentation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstrumentationEvent {
    CodeRetraced(EventFlags),
    AttrCachesCleared,
    BuiltinCachesCleared,
    AllocationTracing(EventFlags),
    JitInvalidated,
}

/// Instrumentation that records every notification, for diagnostics.
#[derive(Debug, Default)]
pub struct RecordingInstrumentation {
    log: RefCell<Vec<InstrumentationEvent>>,
}

impl RecordingInstrumentation {
    /// Empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Notifications received so far.
    pub fn events(&self) -> Vec<InstrumentationEvent> {
        self.log.borrow().clone()
    }

    /// Take and clear the notifications received so far.
    pub fn take(&self) -> Vec<InstrumentationEvent> {
        std::mem::take(&mut *self.log.borrow_mut())
    }

    /// How many times `event` was received.
    pub fn count(&self, event: InstrumentationEvent) -> usize {
        self.log.borrow().iter().filter(|e| **e == event).count()
    }

    fn push(&self, event: InstrumentationEvent) {
        self.log.borrow_mut().push(event);
    }
}

impl Instrumentation for RecordingInstrumentation {
    fn code_retraced(&self, events: EventFlags) {
        self.push(InstrumentationEvent::CodeRetraced(events));
    }

    fn clear_attr_call_caches(&self) {
        self.push(InstrumentationEvent::AttrCachesCleared);
    }

    fn clear_builtin_call_caches(&self) {
        self.push(InstrumentationEvent::BuiltinCachesCleared);
    }

    fn set_allocation_tracing(&self, events: EventFlags) {
        self.push(InstrumentationEvent::AllocationTracing(events));
    }

    fn invalidate_jit(&self) {
        self.push(InstrumentationEvent::JitInvalidated);
    }
}
