//! A scripted interpreter loop.
//!
//! Executes a tree of [`Op`]s, pushing frames and raising events the way
//! the bytecode loop does. Code events only fire at sites a code unit is
//! currently decorated for. Raise, allocation and compile events always
//! reach the dispatcher, as do the call and return of native and
//! block-defined methods.

use crate::code::{CodeUnit, MethodBody, MethodEntry};
use crate::context::ExecutionContext;
use crate::frame::{Frame, FrameKind};
use crate::runtime::Runtime;
use crate::trace_arg::EventOccurrence;
use ember_core::{EmberError, EmberResult, EventFlags, Exception, InterruptBits, Value};
use ember_jobs::FlushReport;
use log::trace;
use std::fmt;
use std::rc::Rc;

/// Native step run inside a script.
pub type NativeOp = dyn Fn(&ExecutionContext) -> EmberResult<Value>;

/// One instruction of a script.
#[derive(Clone)]
pub enum Op {
    /// Start executing `line` of the current code unit.
    Line(u32),
    /// Produce a value.
    Push(Value),
    /// Call `method` on `recv`. `body` is the method's implementation.
    Send {
        method: Rc<MethodEntry>,
        recv: Value,
        body: Vec<Op>,
    },
    /// Run a block of the current frame.
    Yield { code: Rc<CodeUnit>, body: Vec<Op> },
    /// Run a class body with `recv` as self.
    Class {
        code: Rc<CodeUnit>,
        recv: Value,
        body: Vec<Op>,
    },
    /// Raise an exception.
    Raise(Exception),
    /// Run `body`; a raised exception runs `handler` instead of propagating.
    Rescue { body: Vec<Op>, handler: Vec<Op> },
    /// Allocate an object of the named class.
    Allocate(Rc<str>),
    /// Compile `code` at runtime from `source`.
    Compile {
        code: Rc<CodeUnit>,
        source: Option<Rc<str>>,
    },
    /// Poll interrupts.
    SafePoint,
    /// Call back into native code.
    Native(Rc<NativeOp>),
}

impl Op {
    pub fn send(method: &Rc<MethodEntry>, recv: Value, body: Vec<Op>) -> Self {
        Op::Send {
            method: Rc::clone(method),
            recv,
            body,
        }
    }

    pub fn native(f: impl Fn(&ExecutionContext) -> EmberResult<Value> + 'static) -> Self {
        Op::Native(Rc::new(f))
    }
}

impl fmt::Debug for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Op::Line(line) => write!(f, "Line({line})"),
            Op::Push(value) => write!(f, "Push({value:?})"),
            Op::Send { method, body, .. } => {
                write!(f, "Send({}, {} ops)", method.called_name(), body.len())
            }
            Op::Yield { code, body } => write!(f, "Yield({}, {} ops)", code.name(), body.len()),
            Op::Class { code, body, .. } => write!(f, "Class({}, {} ops)", code.name(), body.len()),
            Op::Raise(exc) => write!(f, "Raise({exc:?})"),
            Op::Rescue { body, handler } => {
                write!(f, "Rescue({} ops, {} ops)", body.len(), handler.len())
            }
            Op::Allocate(class) => write!(f, "Allocate({class})"),
            Op::Compile { code, .. } => write!(f, "Compile({})", code.name()),
            Op::SafePoint => f.write_str("SafePoint"),
            Op::Native(_) => f.write_str("Native"),
        }
    }
}

/// Runs scripts on one execution context.
pub struct Interpreter<'ec> {
    ec: &'ec ExecutionContext,
}

impl<'ec> Interpreter<'ec> {
    pub fn new(ec: &'ec ExecutionContext) -> Self {
        Self { ec }
    }

    #[inline]
    fn runtime(&self) -> &Rc<Runtime> {
        self.ec.runtime()
    }

    /// Run `ops` as the top-level script of `code`. Returns the value of
    /// the last value-producing op.
    pub fn run(&self, code: &Rc<CodeUnit>, ops: &[Op]) -> EmberResult<Value> {
        self.runtime().register_code(code);
        let frame = Frame::new(
            FrameKind::Top,
            Some(Rc::clone(code)),
            None,
            Value::Nil,
            self.ec.current_frame(),
        );
        self.ec.push_frame(Rc::clone(&frame));
        let result = self.exec(ops);
        self.ec.unwind_to_below(&frame);
        result
    }

    /// Poll the context's interrupts and run pending jobs.
    pub fn check_ints(&self) -> EmberResult<Option<FlushReport>> {
        let flags = self.ec.interrupt_flags();
        let runnable = flags.pending() - flags.masked();
        if !runnable.contains(InterruptBits::POSTPONED_JOB) {
            return Ok(None);
        }
        // Other interrupt kinds stay pending for their own handlers.
        flags.clear(InterruptBits::POSTPONED_JOB);
        let report = self.runtime().flush_jobs(self.ec)?;
        trace!("safe point ran {} jobs", report.total());
        Ok(Some(report))
    }

    fn exec(&self, ops: &[Op]) -> EmberResult<Value> {
        let mut last = Value::Nil;
        for op in ops {
            if let Some(value) = self.step(op)? {
                last = value;
            }
        }
        Ok(last)
    }

    fn step(&self, op: &Op) -> EmberResult<Option<Value>> {
        match op {
            Op::Line(line) => {
                self.line(*line)?;
                Ok(None)
            }
            Op::Push(value) => Ok(Some(value.clone())),
            Op::Send { method, recv, body } => self.send(method, recv, body).map(Some),
            Op::Yield { code, body } => self.yield_block(code, body).map(Some),
            Op::Class { code, recv, body } => self.class_body(code, recv, body).map(Some),
            Op::Raise(exc) => Err(self.raise(exc)),
            Op::Rescue { body, handler } => self.rescue(body, handler).map(Some),
            Op::Allocate(class) => {
                let obj = Value::new_object(class);
                let recv = self.current_self();
                let occurrence = EventOccurrence::allocated(EventFlags::NEWOBJ, recv, obj.clone());
                self.emit_occurrence(occurrence)?;
                Ok(Some(obj))
            }
            Op::Compile { code, source } => {
                self.runtime().register_code(code);
                self.emit_occurrence(EventOccurrence::compiled(
                    self.current_self(),
                    source.clone(),
                    Rc::clone(code),
                ))?;
                Ok(None)
            }
            Op::SafePoint => {
                self.check_ints()?;
                Ok(None)
            }
            Op::Native(f) => f(self.ec).map(Some),
        }
    }

    fn line(&self, line: u32) -> EmberResult<()> {
        let Some(frame) = self.ec.current_frame() else {
            return Ok(());
        };
        frame.set_line(line);
        if frame.code().is_some_and(|code| code.is_traced_at(EventFlags::LINE, line)) {
            self.emit(EventFlags::LINE)?;
        }
        Ok(())
    }

    fn send(&self, method: &Rc<MethodEntry>, recv: &Value, body: &[Op]) -> EmberResult<Value> {
        match method.body() {
            MethodBody::Native { .. } => {
                let frame = self.push(FrameKind::Native, None, Some(method), recv.clone());
                let identify = |occurrence: EventOccurrence| {
                    occurrence.with_method(method.original_name().clone(), method.owner().clone())
                };
                let call = identify(EventOccurrence::new(EventFlags::C_CALL, recv.clone()));
                let result = self.emit_occurrence(call).and_then(|()| self.exec(body));
                frame.mark_finished();
                let value = returned_value(&result);
                let ret = EventOccurrence::returning(EventFlags::C_RETURN, recv.clone(), value);
                let returned = self.runtime().emit_with(self.ec, identify(ret), true);
                self.leave(&frame, result, returned)
            }
            MethodBody::Compiled(code) => {
                self.runtime().register_code(code);
                let frame = self.push(FrameKind::Method, Some(code), Some(method), recv.clone());
                let result = self.fire(&frame, EventFlags::CALL).and_then(|()| self.exec(body));
                frame.mark_finished();
                let returned = self.fire_return(&frame, EventFlags::RETURN, &result);
                self.leave(&frame, result, returned)
            }
            MethodBody::BlockDefined(code) => {
                self.runtime().register_code(code);
                let kind = FrameKind::Block { lambda: true };
                let frame = self.push(kind, Some(code), Some(method), recv.clone());
                let result = self
                    .emit(EventFlags::CALL)
                    .and_then(|()| self.fire(&frame, EventFlags::B_CALL))
                    .and_then(|()| self.exec(body));
                frame.mark_finished();
                let returned = self
                    .fire_return(&frame, EventFlags::B_RETURN, &result)
                    .and_then(|()| {
                        let value = returned_value(&result);
                        let ret =
                            EventOccurrence::returning(EventFlags::RETURN, recv.clone(), value);
                        self.runtime().emit_with(self.ec, ret, true)
                    });
                self.leave(&frame, result, returned)
            }
        }
    }

    fn yield_block(&self, code: &Rc<CodeUnit>, body: &[Op]) -> EmberResult<Value> {
        self.runtime().register_code(code);
        let parent = self.ec.current_frame();
        let method = parent.as_ref().and_then(|frame| frame.method().cloned());
        let recv = parent.as_ref().map_or(Value::Nil, |frame| frame.self_value().clone());
        let kind = FrameKind::Block { lambda: false };
        let frame = self.push(kind, Some(code), method.as_ref(), recv);
        let result = self.fire(&frame, EventFlags::B_CALL).and_then(|()| self.exec(body));
        frame.mark_finished();
        let returned = self.fire_return(&frame, EventFlags::B_RETURN, &result);
        self.leave(&frame, result, returned)
    }

    fn class_body(&self, code: &Rc<CodeUnit>, recv: &Value, body: &[Op]) -> EmberResult<Value> {
        self.runtime().register_code(code);
        let frame = self.push(FrameKind::Class, Some(code), None, recv.clone());
        let result = self.fire(&frame, EventFlags::CLASS).and_then(|()| self.exec(body));
        frame.mark_finished();
        let returned = if traced(&frame, EventFlags::END) {
            self.runtime()
                .emit_with(self.ec, EventOccurrence::new(EventFlags::END, recv.clone()), true)
        } else {
            Ok(())
        };
        self.leave(&frame, result, returned)
    }

    fn raise(&self, exc: &Exception) -> EmberError {
        self.ec.set_errinfo(Some(exc.clone()));
        let recv = self.current_self();
        let occurrence = EventOccurrence::raising(EventFlags::RAISE, recv, exc.clone());
        if let Err(err) = self.emit_occurrence(occurrence) {
            return err;
        }
        EmberError::Raised(exc.clone())
    }

    fn rescue(&self, body: &[Op], handler: &[Op]) -> EmberResult<Value> {
        match self.exec(body) {
            Err(EmberError::Raised(exc)) => {
                let frame = self.ec.current_frame();
                if let Some(frame) = frame.filter(|frame| traced(frame, EventFlags::RESCUE)) {
                    let recv = frame.self_value().clone();
                    self.emit_occurrence(EventOccurrence::raising(EventFlags::RESCUE, recv, exc))?;
                }
                let result = self.exec(handler);
                self.ec.set_errinfo(None);
                result
            }
            other => other,
        }
    }

    // -------------------------------------------------------------------------
    // Frames and events
    // -------------------------------------------------------------------------

    fn push(
        &self,
        kind: FrameKind,
        code: Option<&Rc<CodeUnit>>,
        method: Option<&Rc<MethodEntry>>,
        recv: Value,
    ) -> Rc<Frame> {
        let frame = Frame::new(kind, code.cloned(), method.cloned(), recv, self.ec.current_frame());
        self.ec.push_frame(Rc::clone(&frame));
        frame
    }

    /// Pop `frame` (unless a failing return hook already did). The body's
    /// error wins over the return hook's.
    fn leave(
        &self,
        frame: &Rc<Frame>,
        result: EmberResult<Value>,
        returned: EmberResult<()>,
    ) -> EmberResult<Value> {
        self.ec.unwind_to_below(frame);
        let value = result?;
        returned?;
        Ok(value)
    }

    fn current_self(&self) -> Value {
        self.ec
            .current_frame()
            .map_or(Value::Nil, |frame| frame.self_value().clone())
    }

    /// Raise a payload-free `event` with the current frame's self.
    fn emit(&self, event: EventFlags) -> EmberResult<()> {
        self.emit_occurrence(EventOccurrence::new(event, self.current_self()))
    }

    fn emit_occurrence(&self, occurrence: EventOccurrence) -> EmberResult<()> {
        self.runtime().emit(self.ec, occurrence)
    }

    /// Raise a payload-free code event if `frame`'s unit is decorated for it.
    fn fire(&self, frame: &Frame, event: EventFlags) -> EmberResult<()> {
        if !traced(frame, event) {
            return Ok(());
        }
        self.emit_occurrence(EventOccurrence::new(event, frame.self_value().clone()))
    }

    fn fire_return(
        &self,
        frame: &Frame,
        event: EventFlags,
        result: &EmberResult<Value>,
    ) -> EmberResult<()> {
        if !traced(frame, event) {
            return Ok(());
        }
        self.runtime().emit_with(
            self.ec,
            EventOccurrence::returning(event, frame.self_value().clone(), returned_value(result)),
            true,
        )
    }
}

fn traced(frame: &Frame, event: EventFlags) -> bool {
    frame
        .code()
        .is_some_and(|code| code.trace_events().intersects(event) && code.has_site(event))
}

/// Return value of a finished call; `nil` when it raised.
fn returned_value(result: &EmberResult<Value>) -> Value {
    result.as_ref().map_or(Value::Nil, Value::clone)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::CodeKind;
    use crate::config::TraceConfig;
    use crate::hooks::HookFn;
    use ember_jobs::{JobData, WorkQueueJob};
    use std::cell::RefCell;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn recorder(rt: &Runtime, events: EventFlags) -> Rc<RefCell<Vec<String>>> {
        let log: Rc<RefCell<Vec<String>>> = Rc::default();
        let inner = Rc::clone(&log);
        rt.add_event_hook(
            HookFn::decoded(move |ec, args| {
                let name = args.event.event_name().unwrap_or("?");
                inner.borrow_mut().push(format!("{name}@{}", ec.current_line()));
                Ok(())
            }),
            events,
            Value::Nil,
        )
        .unwrap();
        log
    }

    #[test]
    fn test_line_events_only_at_sites() {
        let rt = Runtime::new();
        let ec = rt.main_context();
        let code = CodeUnit::builder(CodeKind::Top, "<main>", "main.rb", 1)
            .site(1, EventFlags::LINE)
            .site(3, EventFlags::LINE)
            .build();
        let log = recorder(&rt, EventFlags::LINE);
        Interpreter::new(&ec)
            .run(&code, &[Op::Line(1), Op::Line(2), Op::Line(3)])
            .unwrap();
        assert_eq!(*log.borrow(), ["line@1", "line@3"]);
    }

    #[test]
    fn test_undecorated_code_is_silent() {
        let rt = Runtime::builder().config(TraceConfig::for_testing()).build();
        let ec = rt.main_context();
        let code = CodeUnit::builder(CodeKind::Top, "<main>", "main.rb", 1)
            .site(1, EventFlags::LINE)
            .build();
        let value = Interpreter::new(&ec)
            .run(&code, &[Op::Line(1), Op::Push(Value::Int(3))])
            .unwrap();
        assert_eq!(value, Value::Int(3));
        assert_eq!(rt.stats().snapshot().dispatches, 0);
    }

    #[test]
    fn test_native_call_reports_method() {
        let rt = Runtime::new();
        let ec = rt.main_context();
        let seen: Rc<RefCell<Vec<(String, Value)>>> = Rc::default();
        let inner = Rc::clone(&seen);
        rt.add_event_hook(
            HookFn::decoded(move |_, args| {
                let id = args.method_id.map(ToString::to_string).unwrap_or_default();
                inner.borrow_mut().push((id, args.defined_class.cloned().unwrap_or_default()));
                Ok(())
            }),
            EventFlags::C_CALL | EventFlags::C_RETURN,
            Value::Nil,
        )
        .unwrap();
        let body = MethodBody::Native { arity: -1 };
        let puts = MethodEntry::new("puts", Value::symbol("Kernel"), body);
        let code = CodeUnit::builder(CodeKind::Top, "<main>", "main.rb", 1).build();
        Interpreter::new(&ec)
            .run(&code, &[Op::send(&puts, Value::Nil, vec![])])
            .unwrap();
        let seen = seen.borrow();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], ("puts".to_string(), Value::symbol("Kernel")));
    }

    #[test]
    fn test_raise_and_rescue() {
        let rt = Runtime::new();
        let ec = rt.main_context();
        let log = recorder(&rt, EventFlags::RAISE | EventFlags::RESCUE);
        let code = CodeUnit::builder(CodeKind::Top, "<main>", "main.rb", 1)
            .site(2, EventFlags::RESCUE)
            .build();
        let value = Interpreter::new(&ec)
            .run(
                &code,
                &[Op::Rescue {
                    body: vec![Op::Line(2), Op::Raise(Exception::new("RuntimeError", "boom"))],
                    handler: vec![Op::Push(Value::Int(1))],
                }],
            )
            .unwrap();
        assert_eq!(value, Value::Int(1));
        assert_eq!(*log.borrow(), ["raise@2", "rescue@2"]);
        assert!(ec.errinfo().is_none());
    }

    #[test]
    fn test_unrescued_raise_unwinds() {
        let rt = Runtime::new();
        let ec = rt.main_context();
        let code = CodeUnit::builder(CodeKind::Method, "boom", "m.rb", 1).build();
        let boom = MethodEntry::new("boom", Value::Nil, MethodBody::Compiled(Rc::clone(&code)));
        let top = CodeUnit::builder(CodeKind::Top, "<main>", "main.rb", 1).build();
        let err = Interpreter::new(&ec)
            .run(
                &top,
                &[Op::send(&boom, Value::Nil, vec![Op::Raise(Exception::new("KeyError", "k"))])],
            )
            .unwrap_err();
        assert_eq!(err, EmberError::raise("KeyError", "k"));
        assert_eq!(ec.stack_depth(), 0);
    }

    static RUNS: AtomicUsize = AtomicUsize::new(0);

    fn count_run(_: JobData) -> EmberResult<()> {
        RUNS.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    #[test]
    fn test_safe_point_flushes_jobs() {
        let rt = Runtime::new();
        let ec = rt.main_context();
        let handle = rt.jobs().preregister(count_run, JobData::NONE);
        let ran = Arc::new(AtomicUsize::new(0));
        let ran_inner = Arc::clone(&ran);
        rt.jobs().enqueue(WorkQueueJob::new(move || {
            ran_inner.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));
        rt.jobs().trigger(handle);

        let interp = Interpreter::new(&ec);
        let report = interp.check_ints().unwrap().unwrap();
        assert_eq!(report.postponed, 1);
        assert_eq!(report.work, 1);
        assert_eq!(RUNS.load(Ordering::SeqCst), 1);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert!(interp.check_ints().unwrap().is_none());
    }
}
