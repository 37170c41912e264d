//! Legacy trace functions.
//!
//! A trace function is a proc called for every event in
//! [`EventFlags::ALL`] with six arguments: the legacy event name, path,
//! line, method id, binding and class.

use crate::callable::Proc;
use crate::context::ExecutionContext;
use crate::frame::path_and_lineno;
use crate::hooks::{HookArgs, HookFlags};
use ember_core::{EmberResult, EventFlags, ThreadId, Value};

/// Replace the global trace function. `nil` only removes the current one.
/// Returns `trace`.
pub fn set_trace_func(ec: &ExecutionContext, trace: &Value) -> EmberResult<Value> {
    let rt = ec.runtime();
    rt.remove_event_hook(Some(rt.trace_func_hook()), None);
    if trace.is_nil() {
        return Ok(Value::Nil);
    }
    Proc::from_value(trace, "trace_func")?;
    rt.add_event_hook(rt.trace_func_hook().clone(), EventFlags::ALL, trace.clone())?;
    Ok(trace.clone())
}

/// Replace the trace functions of `thread`.
pub fn thread_set_trace_func(
    ec: &ExecutionContext,
    thread: ThreadId,
    trace: &Value,
) -> EmberResult<Value> {
    let rt = ec.runtime();
    rt.remove_thread_event_hook(thread, Some(rt.trace_func_hook()), None);
    if trace.is_nil() {
        return Ok(Value::Nil);
    }
    thread_add_trace_func(ec, thread, trace)?;
    Ok(trace.clone())
}

/// Add a trace function for `thread`, keeping existing ones.
pub fn thread_add_trace_func(
    ec: &ExecutionContext,
    thread: ThreadId,
    trace: &Value,
) -> EmberResult<()> {
    Proc::from_value(trace, "trace_func")?;
    let rt = ec.runtime();
    rt.add_thread_event_hook(
        thread,
        rt.trace_func_hook().clone(),
        EventFlags::ALL,
        trace.clone(),
        HookFlags::SAFE,
    )
}

/// Hook callback shared by every trace function.
pub(crate) fn call_trace_func(ec: &ExecutionContext, args: &HookArgs<'_>) -> EmberResult<()> {
    let proc = Proc::from_value(args.data, "trace_func")?;
    let frame = ec.current_frame();
    let (path, line) = path_and_lineno(frame.as_ref(), args.event);

    let (id, klass) = match args.defined_class {
        Some(klass) => (args.method_id.cloned(), klass.clone()),
        None => match frame.as_ref() {
            Some(frame) => (
                frame.method_id().cloned(),
                frame.defined_class().cloned().unwrap_or_default(),
            ),
            None => (None, Value::Nil),
        },
    };

    let native = args.event.intersects(EventFlags::C_CALL | EventFlags::C_RETURN);
    let binding = match frame.as_ref() {
        Some(frame) if path.is_some() && !native && frame.is_language_level() => frame.binding(),
        _ => Value::Nil,
    };

    let argv = [
        Value::str(args.event.legacy_name()),
        path.map_or(Value::Nil, Value::Str),
        Value::Int(i64::from(line)),
        id.map_or(Value::Nil, Value::Symbol),
        binding,
        klass,
    ];
    proc.call(ec, &argv)?;
    Ok(())
}
