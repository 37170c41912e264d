//! A single event subscription.

use crate::context::ExecutionContext;
use crate::trace_arg::TraceArg;
use bitflags::bitflags;
use ember_core::{EmberError, EmberResult, EventFlags, Symbol, ThreadId, Value};
use std::cell::Cell;
use std::fmt;
use std::rc::Rc;

bitflags! {
    /// Per-hook state and calling convention.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct HookFlags: u32 {
        /// The callback runs inside dispatch containment.
        const SAFE     = 1 << 0;
        /// Tombstone: the hook no longer fires and is unlinked at the next
        /// cleanup.
        const DELETED  = 1 << 1;
        /// The callback takes the whole trace-arg.
        const RAW_ARG  = 1 << 2;
        /// The hook observes internal events.
        const INTERNAL = 1 << 3;
    }
}

/// Decoded arguments handed to a [`HookFn::Decoded`] callback.
#[derive(Debug, Clone, Copy)]
pub struct HookArgs<'a> {
    /// The event that occurred.
    pub event: EventFlags,
    /// Data registered with the hook.
    pub data: &'a Value,
    /// Receiver at the point of the event.
    pub self_value: &'a Value,
    /// Method id supplied by the event source, if any.
    pub method_id: Option<&'a Symbol>,
    /// Defining class supplied by the event source, if any.
    pub defined_class: Option<&'a Value>,
}

/// Callback taking decoded arguments.
pub type DecodedHookFn = dyn Fn(&ExecutionContext, &HookArgs<'_>) -> EmberResult<()>;

/// Callback taking the hook's data and the full trace-arg.
pub type RawHookFn = dyn Fn(&ExecutionContext, &Value, &TraceArg) -> EmberResult<()>;

/// A hook callback in one of the two calling conventions.
///
/// Removal by callback compares the callback allocation, so keep a clone
/// of the `HookFn` used to subscribe.
#[derive(Clone)]
pub enum HookFn {
    /// `fn(ec, decoded args)`.
    Decoded(Rc<DecodedHookFn>),
    /// `fn(ec, data, trace-arg)`.
    Raw(Rc<RawHookFn>),
}

impl HookFn {
    /// Wrap a decoded-argument callback.
    pub fn decoded(
        f: impl Fn(&ExecutionContext, &HookArgs<'_>) -> EmberResult<()> + 'static,
    ) -> Self {
        HookFn::Decoded(Rc::new(f))
    }

    /// Wrap a raw trace-arg callback.
    pub fn raw(
        f: impl Fn(&ExecutionContext, &Value, &TraceArg) -> EmberResult<()> + 'static,
    ) -> Self {
        HookFn::Raw(Rc::new(f))
    }

    /// Whether this uses the raw convention.
    #[inline]
    pub fn is_raw(&self) -> bool {
        matches!(self, HookFn::Raw(_))
    }

    #[inline]
    fn addr(&self) -> *const () {
        match self {
            HookFn::Decoded(f) => Rc::as_ptr(f) as *const (),
            HookFn::Raw(f) => Rc::as_ptr(f) as *const (),
        }
    }

    /// Whether both name the same callback.
    #[inline]
    pub fn ptr_eq(&self, other: &HookFn) -> bool {
        self.addr() == other.addr()
    }
}

impl fmt::Debug for HookFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.is_raw() { "Raw" } else { "Decoded" };
        write!(f, "HookFn::{}({:p})", kind, self.addr())
    }
}

/// Restrictions on when a hook fires.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HookFilter {
    /// Only fire on this thread.
    pub thread: Option<ThreadId>,
    /// Only fire when the current frame is on this line.
    pub target_line: Option<u32>,
}

/// Thread selector for hook removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadFilter {
    /// Hooks registered without a thread filter.
    Global,
    /// Hooks registered for this thread.
    Thread(ThreadId),
    /// Hooks on any thread, filtered or not.
    Any,
}

impl ThreadFilter {
    #[inline]
    pub(crate) fn matches(self, hook_thread: Option<ThreadId>) -> bool {
        match self {
            ThreadFilter::Any => true,
            ThreadFilter::Global => hook_thread.is_none(),
            ThreadFilter::Thread(thread) => hook_thread == Some(thread),
        }
    }
}

/// One subscription in a [`HookList`](super::HookList).
pub struct EventHook {
    flags: Cell<HookFlags>,
    events: EventFlags,
    func: HookFn,
    data: Value,
    filter: HookFilter,
}

impl EventHook {
    /// Build a hook. Fails if `events` mixes internal and regular events.
    ///
    /// `RAW_ARG` and `INTERNAL` are derived from `func` and `events`;
    /// callers only choose `SAFE`.
    pub fn new(
        func: HookFn,
        events: EventFlags,
        data: Value,
        flags: HookFlags,
    ) -> EmberResult<Self> {
        if events.mixes_internal() {
            return Err(EmberError::MixedEventKinds);
        }
        let mut flags = flags & HookFlags::SAFE;
        flags.set(HookFlags::RAW_ARG, func.is_raw());
        flags.set(HookFlags::INTERNAL, events.is_internal());
        Ok(Self {
            flags: Cell::new(flags),
            events,
            func,
            data,
            filter: HookFilter::default(),
        })
    }

    /// Restrict to one thread.
    pub fn for_thread(mut self, thread: Option<ThreadId>) -> Self {
        self.filter.thread = thread;
        self
    }

    /// Restrict to one source line.
    pub fn with_target_line(mut self, line: Option<u32>) -> Self {
        self.filter.target_line = line;
        self
    }

    #[inline]
    pub fn flags(&self) -> HookFlags {
        self.flags.get()
    }

    #[inline]
    pub fn events(&self) -> EventFlags {
        self.events
    }

    #[inline]
    pub fn func(&self) -> &HookFn {
        &self.func
    }

    #[inline]
    pub fn data(&self) -> &Value {
        &self.data
    }

    #[inline]
    pub fn filter(&self) -> HookFilter {
        self.filter
    }

    #[inline]
    pub fn is_deleted(&self) -> bool {
        self.flags.get().contains(HookFlags::DELETED)
    }

    #[inline]
    pub(crate) fn mark_deleted(&self) {
        self.flags.set(self.flags.get() | HookFlags::DELETED);
    }

    /// Removal predicate: thread filter, then callback, then data.
    pub(crate) fn matches(
        &self,
        thread: ThreadFilter,
        func: Option<&HookFn>,
        data: Option<&Value>,
    ) -> bool {
        thread.matches(self.filter.thread)
            && func.map_or(true, |f| f.ptr_eq(&self.func))
            && data.map_or(true, |d| *d == self.data)
    }
}

impl fmt::Debug for EventHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventHook")
            .field("flags", &self.flags.get())
            .field("events", &self.events)
            .field("func", &self.func)
            .field("data", &self.data)
            .field("filter", &self.filter)
            .finish()
    }
}
