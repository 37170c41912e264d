//! Ember instrumentation
//!
//! Event hooks, the event dispatcher and trace points of the Ember runtime.
//!
//! # Architecture
//!
//! - [`hooks`]: hook records and the hook lists they live in. A list is
//!   either global or local to one code unit or block-defined method.
//!   Removal during a dispatch only tombstones; the list is compacted when
//!   the last dispatch over it finishes.
//! - [`runtime::Runtime`]: owns the global list and the runtime-wide event
//!   mask, and re-decorates code units when new code events are observed.
//! - [`dispatch`]: delivers an event to the global list, the current code
//!   unit's list and a block-defined method's list, inside containment
//!   that saves and restores the context's pending exception.
//! - [`tracepoint`]: the user-facing tracer object, globally or per target.
//! - [`trace_func`]: legacy per-process and per-thread trace functions.
//! - [`interpreter`]: a scripted interpreter loop that raises events and
//!   polls for postponed jobs at safe points.
//!
//! Everything here is single-threaded (`!Send`); only the job queues in
//! `ember_jobs` are shared with other threads.

#![warn(clippy::all)]

pub mod callable;
pub mod code;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod frame;
pub mod hooks;
pub mod instrumentation;
pub mod interpreter;
pub mod runtime;
pub mod stats;
pub mod trace_arg;
pub mod trace_func;
pub mod tracepoint;

pub use callable::Proc;
pub use code::{CodeKind, CodeUnit, MethodBody, MethodEntry, ParamKind, Parameter};
pub use config::TraceConfig;
pub use context::ExecutionContext;
pub use dispatch::suppress_tracing;
pub use frame::{Frame, FrameKind};
pub use hooks::{EventHook, HookArgs, HookFlags, HookFn, HookList, HookScope, HookStat};
pub use instrumentation::{
    Instrumentation, InstrumentationEvent, NullInstrumentation, RecordingInstrumentation,
};
pub use interpreter::{Interpreter, Op};
pub use runtime::{Registration, Runtime, RuntimeBuilder};
pub use stats::{TraceStats, TraceStatsSnapshot};
pub use trace_arg::{EventOccurrence, EventPayload, TraceArg};
pub use trace_func::{set_trace_func, thread_add_trace_func, thread_set_trace_func};
pub use tracepoint::{
    DispatchTarget, EnableOptions, ThreadSelector, TracePoint, TraceTarget, TracingState,
};
