//! Execution contexts.
//!
//! One context per interpreter thread (or fiber). It owns the frame stack
//! and the per-context state the dispatcher saves and restores around hook
//! execution: the pending exception, the active trace-arg, the recursion
//! guard scratch set and the "raised" flag.

use crate::frame::Frame;
use crate::runtime::Runtime;
use crate::trace_arg::TraceArg;
use ember_core::{DomainId, Exception, InterruptFlags, ThreadId};
use ember_jobs::SafePoint;
use rustc_hash::FxHashSet;
use std::cell::{Cell, Ref, RefCell};
use std::rc::Rc;
use std::sync::Arc;

/// Object ids already being visited by a recursion-sensitive operation
/// (inspect of cyclic structures and the like).
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecursionGuard {
    active: FxHashSet<usize>,
}

impl RecursionGuard {
    /// Start visiting `id`. Returns `false` if it is already being visited.
    pub fn enter(&mut self, id: usize) -> bool {
        self.active.insert(id)
    }

    pub fn leave(&mut self, id: usize) {
        self.active.remove(&id);
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }
}

/// Per-thread interpreter state.
pub struct ExecutionContext {
    runtime: Rc<Runtime>,
    thread: ThreadId,
    domain: DomainId,
    frame: RefCell<Option<Rc<Frame>>>,
    errinfo: RefCell<Option<Exception>>,
    trace_arg: RefCell<Option<Rc<TraceArg>>>,
    recursion: RefCell<RecursionGuard>,
    recursion_for_trace: RefCell<RecursionGuard>,
    raised: Cell<bool>,
    interrupts: Arc<InterruptFlags>,
}

impl ExecutionContext {
    pub(crate) fn new(
        runtime: Rc<Runtime>,
        thread: ThreadId,
        domain: DomainId,
        interrupts: Arc<InterruptFlags>,
    ) -> Self {
        Self {
            runtime,
            thread,
            domain,
            frame: RefCell::new(None),
            errinfo: RefCell::new(None),
            trace_arg: RefCell::new(None),
            recursion: RefCell::new(RecursionGuard::default()),
            recursion_for_trace: RefCell::new(RecursionGuard::default()),
            raised: Cell::new(false),
            interrupts,
        }
    }

    #[inline]
    pub fn runtime(&self) -> &Rc<Runtime> {
        &self.runtime
    }

    #[inline]
    pub fn thread_id(&self) -> ThreadId {
        self.thread
    }

    #[inline]
    pub fn domain(&self) -> DomainId {
        self.domain
    }

    #[inline]
    pub fn interrupt_flags(&self) -> &Arc<InterruptFlags> {
        &self.interrupts
    }

    // -------------------------------------------------------------------------
    // Frames
    // -------------------------------------------------------------------------

    pub fn current_frame(&self) -> Option<Rc<Frame>> {
        self.frame.borrow().clone()
    }

    /// Number of frames on the stack.
    pub fn stack_depth(&self) -> usize {
        self.frame.borrow().as_ref().map_or(0, |frame| frame.depth() + 1)
    }

    /// Line of the current frame, 0 without one.
    pub fn current_line(&self) -> u32 {
        self.frame.borrow().as_ref().map_or(0, |frame| frame.line())
    }

    /// Push `frame`; its parent must be the current top.
    pub fn push_frame(&self, frame: Rc<Frame>) {
        debug_assert!(
            match (frame.parent(), self.frame.borrow().as_ref()) {
                (Some(parent), Some(top)) => Rc::ptr_eq(parent, top),
                (None, None) => true,
                _ => false,
            },
            "pushed frame is not linked to the current top"
        );
        *self.frame.borrow_mut() = Some(frame);
    }

    /// Pop and return the top frame.
    pub fn pop_frame(&self) -> Option<Rc<Frame>> {
        let mut top = self.frame.borrow_mut();
        let popped = top.take()?;
        *top = popped.parent().cloned();
        Some(popped)
    }

    /// Pop frames until `frame` is no longer on the stack.
    pub fn unwind_to_below(&self, frame: &Rc<Frame>) {
        while let Some(top) = self.current_frame() {
            if top.depth() < frame.depth() {
                break;
            }
            self.pop_frame();
        }
    }

    // -------------------------------------------------------------------------
    // Pending exception
    // -------------------------------------------------------------------------

    pub fn errinfo(&self) -> Option<Exception> {
        self.errinfo.borrow().clone()
    }

    pub fn set_errinfo(&self, errinfo: Option<Exception>) {
        *self.errinfo.borrow_mut() = errinfo;
    }

    // -------------------------------------------------------------------------
    // Active event
    // -------------------------------------------------------------------------

    /// The event being dispatched on this context, if any.
    pub fn trace_arg(&self) -> Option<Rc<TraceArg>> {
        self.trace_arg.borrow().clone()
    }

    #[inline]
    pub fn has_trace_arg(&self) -> bool {
        self.trace_arg.borrow().is_some()
    }

    /// Whether the active event is an internal one.
    pub(crate) fn in_internal_event(&self) -> bool {
        self.trace_arg
            .borrow()
            .as_ref()
            .is_some_and(|arg| arg.event().is_internal())
    }

    pub(crate) fn replace_trace_arg(&self, arg: Option<Rc<TraceArg>>) -> Option<Rc<TraceArg>> {
        std::mem::replace(&mut *self.trace_arg.borrow_mut(), arg)
    }

    // -------------------------------------------------------------------------
    // Recursion guard and raised flag
    // -------------------------------------------------------------------------

    pub fn recursion_guard(&self) -> Ref<'_, RecursionGuard> {
        self.recursion.borrow()
    }

    /// Run `f` with the recursion guard mutably borrowed.
    pub fn with_recursion_guard<R>(&self, f: impl FnOnce(&mut RecursionGuard) -> R) -> R {
        f(&mut self.recursion.borrow_mut())
    }

    /// Exchange the live recursion guard with the one reserved for hook
    /// execution. Called in pairs around a dispatch.
    pub(crate) fn swap_recursion_for_trace(&self) {
        self.recursion.swap(&self.recursion_for_trace);
    }

    #[inline]
    pub fn is_raised(&self) -> bool {
        self.raised.get()
    }

    #[inline]
    pub fn set_raised(&self) {
        self.raised.set(true);
    }

    /// Clear the flag, returning its previous value.
    #[inline]
    pub fn reset_raised(&self) -> bool {
        self.raised.replace(false)
    }
}

impl SafePoint for ExecutionContext {
    fn interrupts(&self) -> &InterruptFlags {
        &self.interrupts
    }

    fn take_errinfo(&self) -> Option<Exception> {
        self.errinfo.borrow_mut().take()
    }

    fn restore_errinfo(&self, errinfo: Option<Exception>) {
        self.set_errinfo(errinfo);
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("thread", &self.thread)
            .field("domain", &self.domain)
            .field("depth", &self.stack_depth())
            .field("tracing", &self.has_trace_arg())
            .finish()
    }
}
