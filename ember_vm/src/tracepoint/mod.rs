//! Trace points: user-facing observers built on hooks.
//!
//! A trace point is either disabled, enabled globally (one hook on the
//! global list, optionally filtered to one thread), or enabled for specific
//! targets (hooks on the local lists of code units and block-defined
//! methods). Every hook a trace point installs carries the trace point's
//! value as data and the runtime's shared trampoline as callback.

mod attrs;
mod enable;

use crate::callable::Proc;
use crate::code::{CodeUnit, MethodEntry};
use crate::context::ExecutionContext;
use crate::hooks::HookStat;
use crate::runtime::Runtime;
use crate::trace_arg::TraceArg;
use ember_core::{DomainId, EmberError, EmberResult, EventFlags, ThreadId, Tracer, Value};
use smallvec::SmallVec;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

pub use enable::{EnableOptions, ThreadSelector};

/// Callback of a trace point created from native code.
pub type NativeTraceFn = fn(&ExecutionContext, &TracePoint, &Value) -> EmberResult<()>;

type ClosureFn = dyn Fn(&ExecutionContext, &TracePoint) -> EmberResult<()>;

/// What a trace point calls when it fires.
#[derive(Clone)]
pub enum DispatchTarget {
    /// Native function with its data. Fires in every domain.
    Native { func: NativeTraceFn, data: Value },
    /// Rust closure. Bound to the creating domain unless shareable.
    Closure { func: Rc<ClosureFn>, shareable: bool },
    /// Callable value, called with the trace point as only argument.
    Proc { value: Value, proc: Rc<Proc> },
}

impl DispatchTarget {
    pub fn native(func: NativeTraceFn, data: Value) -> Self {
        DispatchTarget::Native { func, data }
    }

    pub fn closure(
        func: impl Fn(&ExecutionContext, &TracePoint) -> EmberResult<()> + 'static,
    ) -> Self {
        DispatchTarget::Closure {
            func: Rc::new(func),
            shareable: false,
        }
    }

    pub fn shareable_closure(
        func: impl Fn(&ExecutionContext, &TracePoint) -> EmberResult<()> + 'static,
    ) -> Self {
        DispatchTarget::Closure {
            func: Rc::new(func),
            shareable: true,
        }
    }

    /// Target calling the proc stored in `value`.
    pub fn from_proc(value: &Value) -> EmberResult<Self> {
        let proc = Proc::from_value(value, "tracepoint block")?;
        Ok(DispatchTarget::Proc {
            value: value.clone(),
            proc,
        })
    }

    /// Domain the target is bound to when created on `ec`.
    fn bound_domain(&self, ec: &ExecutionContext) -> Option<DomainId> {
        match self {
            DispatchTarget::Native { .. } => None,
            DispatchTarget::Closure { shareable: true, .. } => None,
            DispatchTarget::Closure { shareable: false, .. } => Some(ec.domain()),
            DispatchTarget::Proc { proc, .. } if proc.is_shareable() => None,
            DispatchTarget::Proc { .. } => Some(ec.domain()),
        }
    }
}

impl fmt::Debug for DispatchTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchTarget::Native { func, data } => {
                write!(f, "Native({:p}, {})", *func as *const (), data)
            }
            DispatchTarget::Closure { shareable, .. } => {
                write!(f, "Closure(shareable: {shareable})")
            }
            DispatchTarget::Proc { proc, .. } => write!(f, "Proc({proc:?})"),
        }
    }
}

/// Something a trace point can be enabled for.
#[derive(Debug, Clone)]
pub enum TraceTarget {
    /// A code unit and, recursively, the units nested in it.
    Code(Rc<CodeUnit>),
    /// A language-level method. Block-defined methods additionally get
    /// their call and return observed on the method's own list.
    Method(Rc<MethodEntry>),
}

/// Lifecycle state of a trace point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TracingState {
    Disabled,
    EnabledGlobal,
    EnabledTargeted,
}

type TargetSet = SmallVec<[TraceTarget; 2]>;

struct TracePointInner {
    events: EventFlags,
    target: DispatchTarget,
    domain: Option<DomainId>,
    tracing: Cell<bool>,
    target_thread: Cell<Option<ThreadId>>,
    /// `Some` while enabled for specific targets.
    local_targets: RefCell<Option<TargetSet>>,
}

/// A trace point. Cloning yields another handle to the same trace point.
#[derive(Clone)]
pub struct TracePoint(Rc<TracePointInner>);

impl TracePoint {
    pub const CLASS: &'static str = "TracePoint";

    /// A disabled trace point for `events`, created on `ec`.
    pub fn new(
        ec: &ExecutionContext,
        events: EventFlags,
        target: DispatchTarget,
    ) -> EmberResult<Self> {
        if events.mixes_internal() {
            return Err(EmberError::MixedEventKinds);
        }
        let domain = target.bound_domain(ec);
        Ok(TracePoint(Rc::new(TracePointInner {
            events,
            target,
            domain,
            tracing: Cell::new(false),
            target_thread: Cell::new(None),
            local_targets: RefCell::new(None),
        })))
    }

    /// A trace point for the named events; no names means every
    /// non-internal event.
    pub fn from_names(
        ec: &ExecutionContext,
        names: &[&str],
        target: DispatchTarget,
    ) -> EmberResult<Self> {
        let events = if names.is_empty() {
            EventFlags::TRACEPOINT_ALL
        } else {
            names.iter().try_fold(EventFlags::empty(), |acc, name| {
                Ok::<_, EmberError>(acc | EventFlags::parse_name(name)?)
            })?
        };
        Self::new(ec, events, target)
    }

    /// A trace point calling the proc stored in `block`.
    pub fn from_proc(ec: &ExecutionContext, names: &[&str], block: &Value) -> EmberResult<Self> {
        Self::from_names(ec, names, DispatchTarget::from_proc(block)?)
    }

    /// Create and enable globally.
    pub fn trace(ec: &ExecutionContext, names: &[&str], block: &Value) -> EmberResult<Self> {
        let tp = Self::from_proc(ec, names, block)?;
        tp.enable(ec, EnableOptions::default())?;
        Ok(tp)
    }

    /// The trace point recovered from a hook's data.
    pub fn from_value(value: &Value) -> Option<Self> {
        value.downcast::<TracePointInner>().map(TracePoint)
    }

    /// The trace point as a value; equal for every call.
    pub fn to_value(&self) -> Value {
        Value::object(Self::CLASS, Rc::clone(&self.0))
    }

    #[inline]
    pub fn events(&self) -> EventFlags {
        self.0.events
    }

    #[inline]
    pub fn domain(&self) -> Option<DomainId> {
        self.0.domain
    }

    #[inline]
    pub fn target(&self) -> &DispatchTarget {
        &self.0.target
    }

    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.0.tracing.get()
    }

    pub fn state(&self) -> TracingState {
        if !self.0.tracing.get() {
            TracingState::Disabled
        } else if self.0.local_targets.borrow().is_some() {
            TracingState::EnabledTargeted
        } else {
            TracingState::EnabledGlobal
        }
    }

    /// Thread filter of the global hook.
    #[inline]
    pub fn target_thread(&self) -> Option<ThreadId> {
        self.0.target_thread.get()
    }

    /// Targets the trace point is enabled for.
    pub fn local_targets(&self) -> Vec<TraceTarget> {
        self.0
            .local_targets
            .borrow()
            .as_ref()
            .map_or_else(Vec::new, |targets| targets.to_vec())
    }

    fn fires_in(&self, domain: DomainId) -> bool {
        self.0.domain.map_or(true, |bound| bound == domain)
    }

    fn call(&self, ec: &ExecutionContext) -> EmberResult<()> {
        match &self.0.target {
            DispatchTarget::Native { func, data } => func(ec, self, data),
            DispatchTarget::Closure { func, .. } => {
                if self.fires_in(ec.domain()) {
                    func(ec, self)?;
                }
                Ok(())
            }
            DispatchTarget::Proc { proc, .. } => {
                if self.fires_in(ec.domain()) {
                    proc.call(ec, &[self.to_value()])?;
                }
                Ok(())
            }
        }
    }

    /// `#<TracePoint:...>` describing the active event, or the enabled
    /// state outside dispatch.
    pub fn inspect(&self, ec: &ExecutionContext) -> String {
        let Some(arg) = ec.trace_arg() else {
            let state = if self.is_enabled() { "enabled" } else { "disabled" };
            return format!("#<TracePoint:{state}>");
        };
        let event = arg.event();
        let name = arg.event_name().unwrap_or("unknown");
        let path = arg.path();
        let path = path.as_deref().unwrap_or("");
        let line = arg.lineno();
        let call_events =
            EventFlags::CALL | EventFlags::C_CALL | EventFlags::RETURN | EventFlags::C_RETURN;
        if event == EventFlags::LINE {
            if let Some(method) = arg.method_id() {
                return format!("#<TracePoint:{name} {path}:{line} in '{method}'>");
            }
        } else if event.intersects(call_events) {
            let method = arg.method_id().map(|m| m.to_string()).unwrap_or_default();
            return format!("#<TracePoint:{name} '{method}' {path}:{line}>");
        } else if event.intersects(EventFlags::THREAD_BEGIN | EventFlags::THREAD_END) {
            return format!("#<TracePoint:{name} {}>", arg.self_value());
        }
        format!("#<TracePoint:{name} {path}:{line}>")
    }

    /// Active and deleted hooks on the global list.
    pub fn stat(runtime: &Runtime) -> HookStat {
        runtime.global_hooks().stat()
    }

    /// Run `f` with the active event lifted, so events raised inside `f`
    /// are dispatched.
    ///
    /// # Panics
    ///
    /// Panics if `f` returns with an event still active.
    pub fn allow_reentry<R>(
        ec: &ExecutionContext,
        f: impl FnOnce(&ExecutionContext) -> EmberResult<R>,
    ) -> EmberResult<R> {
        let arg = ec.replace_trace_arg(None).ok_or(EmberError::ReentryNotNeeded)?;
        let result = f(ec);
        let leaked = ec.replace_trace_arg(Some(arg));
        assert!(leaked.is_none(), "event left active after re-entered dispatch");
        result
    }

    /// Report the values the trace point keeps alive.
    pub fn mark(&self, tracer: &mut dyn Tracer) {
        match &self.0.target {
            DispatchTarget::Native { data, .. } => tracer.trace_value(data),
            DispatchTarget::Proc { value, .. } => tracer.trace_value(value),
            DispatchTarget::Closure { .. } => {}
        }
    }
}

impl PartialEq for TracePoint {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for TracePoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TracePoint")
            .field("events", &self.0.events)
            .field("state", &self.state())
            .field("target_thread", &self.0.target_thread.get())
            .field("domain", &self.0.domain)
            .field("target", &self.0.target)
            .finish()
    }
}

/// Trampoline shared by every trace point hook.
pub(crate) fn dispatch_to_tracepoint(
    ec: &ExecutionContext,
    data: &Value,
    _arg: &TraceArg,
) -> EmberResult<()> {
    match TracePoint::from_value(data) {
        Some(tp) => tp.call(ec),
        None => panic!("trace point hook registered with non-trace-point data {data}"),
    }
}
