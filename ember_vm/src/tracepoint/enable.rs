//! Enabling and disabling trace points.

use super::{TargetSet, TracePoint, TraceTarget};
use crate::code::CodeUnit;
use crate::context::ExecutionContext;
use crate::hooks::{EventHook, HookFlags, ThreadFilter};
use crate::runtime::{release_local_list, Runtime};
use ember_core::{EmberError, EmberResult, EventFlags, ThreadId, Value};
use log::debug;
use std::rc::Rc;

/// Which thread a global enable observes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ThreadSelector {
    /// The current thread for a scoped enable without target or line,
    /// otherwise every thread.
    #[default]
    Default,
    /// Every thread.
    Unfiltered,
    /// One thread.
    Thread(ThreadId),
}

/// Arguments of [`TracePoint::enable`].
#[derive(Debug, Clone, Default)]
pub struct EnableOptions {
    pub target: Option<TraceTarget>,
    pub target_line: Option<u32>,
    pub target_thread: ThreadSelector,
}

impl EnableOptions {
    /// Enable for `target` only.
    pub fn target(target: TraceTarget) -> Self {
        Self {
            target: Some(target),
            ..Self::default()
        }
    }

    /// Restrict line events to `line`.
    pub fn line(mut self, line: u32) -> Self {
        self.target_line = Some(line);
        self
    }

    /// Only observe `thread`.
    pub fn thread(mut self, thread: ThreadId) -> Self {
        self.target_thread = ThreadSelector::Thread(thread);
        self
    }
}

/// Call and return also decorate the block call and return of a
/// block-defined method's body.
fn add_bmethod_events(events: EventFlags) -> EventFlags {
    let mut events = events;
    if events.contains(EventFlags::CALL) {
        events |= EventFlags::B_CALL;
    }
    if events.contains(EventFlags::RETURN) {
        events |= EventFlags::B_RETURN;
    }
    events
}

impl TracePoint {
    /// Enable the trace point. Returns whether it was enabled before.
    pub fn enable(&self, ec: &ExecutionContext, opts: EnableOptions) -> EmberResult<bool> {
        let previous = self.is_enabled();
        self.apply_enable(ec, opts, false)?;
        Ok(previous)
    }

    /// Enable for the duration of `scope`, then return to the previous
    /// state whether or not `scope` failed.
    pub fn enable_with<R>(
        &self,
        ec: &ExecutionContext,
        opts: EnableOptions,
        scope: impl FnOnce(&ExecutionContext) -> EmberResult<R>,
    ) -> EmberResult<R> {
        let previous = self.is_enabled();
        self.apply_enable(ec, opts, true)?;
        let result = scope(ec);
        let restored = self.restore(ec.runtime(), previous);
        let value = result?;
        restored?;
        Ok(value)
    }

    /// Disable the trace point. Returns whether it was enabled before.
    pub fn disable(&self, ec: &ExecutionContext) -> bool {
        let previous = self.is_enabled();
        self.remove_hooks(ec.runtime());
        previous
    }

    /// Disable for the duration of `scope`, then return to the previous
    /// state. Not allowed for a trace point enabled for specific targets.
    pub fn disable_with<R>(
        &self,
        ec: &ExecutionContext,
        scope: impl FnOnce(&ExecutionContext) -> EmberResult<R>,
    ) -> EmberResult<R> {
        if self.0.local_targets.borrow().is_some() {
            return Err(EmberError::TargetedDisableInBlock);
        }
        let previous = self.is_enabled();
        self.remove_hooks(ec.runtime());
        let result = scope(ec);
        let restored = self.restore(ec.runtime(), previous);
        let value = result?;
        restored?;
        Ok(value)
    }

    fn restore(&self, rt: &Runtime, enabled: bool) -> EmberResult<()> {
        if enabled {
            self.enable_global(rt)
        } else {
            self.remove_hooks(rt);
            Ok(())
        }
    }

    fn apply_enable(
        &self,
        ec: &ExecutionContext,
        opts: EnableOptions,
        scoped: bool,
    ) -> EmberResult<()> {
        let untargeted = opts.target.is_none() && opts.target_line.is_none();
        let thread = match opts.target_thread {
            ThreadSelector::Default if scoped && untargeted => Some(ec.thread_id()),
            ThreadSelector::Default | ThreadSelector::Unfiltered => None,
            ThreadSelector::Thread(thread) => Some(thread),
        };
        match thread {
            Some(thread) => {
                if self.0.target_thread.get().is_some() {
                    return Err(EmberError::ThreadFilterOverride);
                }
                self.0.target_thread.set(Some(thread));
            }
            // Keep the filter of a hook that is already installed.
            None if !self.is_enabled() => self.0.target_thread.set(None),
            None => {}
        }

        let rt = ec.runtime();
        match opts.target {
            None => {
                if opts.target_line.is_some() {
                    return Err(EmberError::LineFilterWithoutTarget);
                }
                self.enable_global(rt)
            }
            Some(target) => self.enable_targeted(rt, target, opts.target_line),
        }
    }

    fn enable_global(&self, rt: &Runtime) -> EmberResult<()> {
        if self.0.local_targets.borrow().is_some() {
            return Err(EmberError::NestedTargetedEnable);
        }
        if self.is_enabled() {
            return Ok(());
        }
        let func = rt.tracepoint_hook().clone();
        let (events, data) = (self.0.events, self.to_value());
        match self.0.target_thread.get() {
            Some(thread) => rt.add_thread_event_hook(thread, func, events, data, HookFlags::SAFE)?,
            None => rt.add_event_hook_with_flags(func, events, data, HookFlags::SAFE)?,
        }
        self.0.tracing.set(true);
        debug!("trace point enabled for {:?} on {:?}", self.0.events, self.0.target_thread.get());
        Ok(())
    }

    fn enable_targeted(
        &self,
        rt: &Runtime,
        target: TraceTarget,
        line: Option<u32>,
    ) -> EmberResult<()> {
        let (code, method) = match &target {
            TraceTarget::Code(code) => (Rc::clone(code), None),
            TraceTarget::Method(method) => match method.code() {
                Some(code) => (Rc::clone(code), Some(Rc::clone(method))),
                None => return Err(EmberError::UnsupportedTarget),
            },
        };
        if self.is_enabled() {
            return Err(EmberError::NestedTargetedEnable);
        }
        if line.is_some() && !self.0.events.contains(EventFlags::LINE) {
            return Err(EmberError::LineFilterWithoutLineEvent);
        }

        let events = self.0.events;
        let value = self.to_value();
        let mut targets = TargetSet::new();
        let mut attached = 0;
        let mut bmethod = false;

        if let Some(method) = method.filter(|method| method.is_block_defined()) {
            if events.intersects(EventFlags::CALL | EventFlags::RETURN) {
                let list = method.hooks().get_or_attach();
                rt.connect_local(method.id(), &list, self.local_hook(rt, &value, None)?);
                targets.push(TraceTarget::Method(method));
                bmethod = true;
                attached += 1;
            }
        }

        attached += self.attach_recursively(rt, &code, &value, line, bmethod)?;
        if events.intersects(EventFlags::CALL | EventFlags::RETURN) && code.is_builtin_leaf() {
            rt.instrumentation().clear_builtin_call_caches();
        }
        if attached == 0 {
            return Err(EmberError::NoHooksAttached);
        }
        targets.push(TraceTarget::Code(code));

        *self.0.local_targets.borrow_mut() = Some(targets);
        rt.invalidate_jit();
        rt.local_tracepoint_enabled();
        self.0.tracing.set(true);
        debug!("trace point enabled for {:?} at {} event sites", events, attached);
        Ok(())
    }

    fn local_hook(&self, rt: &Runtime, value: &Value, line: Option<u32>) -> EmberResult<EventHook> {
        let hook = EventHook::new(
            rt.tracepoint_hook().clone(),
            self.0.events.code_events(),
            value.clone(),
            HookFlags::SAFE,
        )?;
        Ok(hook.with_target_line(line))
    }

    /// Hook `code` and every unit nested in it that has a matching event
    /// site. Returns the number of matching sites.
    fn attach_recursively(
        &self,
        rt: &Runtime,
        code: &Rc<CodeUnit>,
        value: &Value,
        line: Option<u32>,
        bmethod: bool,
    ) -> EmberResult<usize> {
        let mut turnon = self.0.events.code_events();
        if bmethod {
            turnon = add_bmethod_events(turnon);
        }
        let mut sites = code.count_sites(turnon, line);
        if sites > 0 {
            let list = code.local_hooks().get_or_attach();
            rt.connect_local(code.id(), &list, self.local_hook(rt, value, line)?);
            code.set_local_trace_events(code.local_trace_events() | turnon);
        }
        for child in code.children() {
            sites += self.attach_recursively(rt, child, value, line, bmethod)?;
        }
        Ok(sites)
    }

    fn remove_hooks(&self, rt: &Runtime) {
        let value = self.to_value();
        let targets = self.0.local_targets.borrow_mut().take();
        match targets {
            Some(targets) => {
                for target in targets {
                    match target {
                        TraceTarget::Code(code) => detach_recursively(&code, &value),
                        TraceTarget::Method(method) => {
                            if let Some(list) = method.hooks().get() {
                                list.remove_tracepoint(&value);
                                release_local_list(method.hooks(), &list);
                            }
                        }
                    }
                }
                rt.local_tracepoint_disabled();
            }
            None => {
                let filter = match self.0.target_thread.get() {
                    Some(thread) => ThreadFilter::Thread(thread),
                    None => ThreadFilter::Global,
                };
                rt.remove_hooks(filter, Some(rt.tracepoint_hook()), Some(&value));
            }
        }
        if self.0.tracing.replace(false) {
            debug!("trace point disabled for {:?}", self.0.events);
        }
        self.0.target_thread.set(None);
    }
}

fn detach_recursively(code: &Rc<CodeUnit>, value: &Value) {
    if let Some(list) = code.local_hooks().get() {
        list.remove_tracepoint(value);
        release_local_list(code.local_hooks(), &list);
        code.set_local_trace_events(add_bmethod_events(code.local_hooks().events()));
    }
    for child in code.children() {
        detach_recursively(child, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::{CodeKind, MethodBody, MethodEntry};
    use crate::frame::{Frame, FrameKind};
    use crate::instrumentation::{Instrumentation, InstrumentationEvent, RecordingInstrumentation};
    use crate::tracepoint::{DispatchTarget, TracingState};
    use crate::trace_arg::EventOccurrence;
    use std::cell::{Cell, RefCell};

    fn counting_tp(ec: &ExecutionContext, events: EventFlags) -> (TracePoint, Rc<Cell<usize>>) {
        let count = Rc::new(Cell::new(0));
        let inner = Rc::clone(&count);
        let tp = TracePoint::new(
            ec,
            events,
            DispatchTarget::closure(move |_, _| {
                inner.set(inner.get() + 1);
                Ok(())
            }),
        )
        .unwrap();
        (tp, count)
    }

    fn method_unit() -> Rc<CodeUnit> {
        let block = CodeUnit::builder(CodeKind::Block, "block in m", "m.rb", 3)
            .site(3, EventFlags::B_CALL)
            .site(4, EventFlags::LINE)
            .site(4, EventFlags::B_RETURN)
            .build();
        CodeUnit::builder(CodeKind::Method, "m", "m.rb", 1)
            .site(1, EventFlags::CALL)
            .site(2, EventFlags::LINE)
            .site(5, EventFlags::LINE)
            .site(5, EventFlags::RETURN)
            .child(block)
            .build()
    }

    fn emit_line(ec: &ExecutionContext, code: &Rc<CodeUnit>, line: u32) {
        let parent = ec.current_frame();
        let frame = Frame::new(FrameKind::Method, Some(Rc::clone(code)), None, Value::Nil, parent);
        frame.set_line(line);
        ec.push_frame(frame);
        ec.runtime()
            .emit(ec, EventOccurrence::new(EventFlags::LINE, Value::Nil))
            .unwrap();
        ec.pop_frame();
    }

    #[test]
    fn test_global_enable_twice_is_idempotent() {
        let rt = Runtime::new();
        let ec = rt.main_context();
        let (tp, count) = counting_tp(&ec, EventFlags::LINE);
        assert!(!tp.enable(&ec, EnableOptions::default()).unwrap());
        assert!(tp.enable(&ec, EnableOptions::default()).unwrap());
        assert_eq!(rt.global_hooks().len(), 1);
        rt.emit(&ec, EventOccurrence::new(EventFlags::LINE, Value::Nil)).unwrap();
        assert_eq!(count.get(), 1);
        assert!(tp.disable(&ec));
        assert!(!tp.disable(&ec));
        assert_eq!(tp.state(), TracingState::Disabled);
    }

    #[test]
    fn test_scoped_enable_restores_after_error() {
        let rt = Runtime::new();
        let ec = rt.main_context();
        let (tp, _) = counting_tp(&ec, EventFlags::LINE);
        let result: EmberResult<()> = tp.enable_with(&ec, EnableOptions::default(), |_| {
            assert!(tp.is_enabled());
            Err(EmberError::raise("RuntimeError", "inside"))
        });
        assert_eq!(result.unwrap_err().exception().unwrap().message(), "inside");
        assert!(!tp.is_enabled());
        assert!(rt.global_hooks().is_empty());
    }

    #[test]
    fn test_scoped_enable_defaults_to_current_thread() {
        let rt = Runtime::new();
        let ec = rt.main_context();
        let other = rt.spawn_context(ec.domain());
        let (tp, count) = counting_tp(&ec, EventFlags::LINE);
        tp.enable_with(&ec, EnableOptions::default(), |ec| {
            assert_eq!(tp.target_thread(), Some(ec.thread_id()));
            ec.runtime().emit(&other, EventOccurrence::new(EventFlags::LINE, Value::Nil))?;
            ec.runtime().emit(ec, EventOccurrence::new(EventFlags::LINE, Value::Nil))
        })
        .unwrap();
        assert_eq!(count.get(), 1);
        assert_eq!(tp.target_thread(), None);
    }

    #[test]
    fn test_scoped_disable_restores_enabled() {
        let rt = Runtime::new();
        let ec = rt.main_context();
        let (tp, count) = counting_tp(&ec, EventFlags::LINE);
        tp.enable(&ec, EnableOptions::default()).unwrap();
        tp.disable_with(&ec, |ec| {
            ec.runtime().emit(ec, EventOccurrence::new(EventFlags::LINE, Value::Nil))
        })
        .unwrap();
        assert_eq!(count.get(), 0);
        assert!(tp.is_enabled());
    }

    #[test]
    fn test_thread_filter_override() {
        let rt = Runtime::new();
        let ec = rt.main_context();
        let (tp, _) = counting_tp(&ec, EventFlags::LINE);
        tp.enable(&ec, EnableOptions::default().thread(ThreadId::new(4))).unwrap();
        let err = tp
            .enable(&ec, EnableOptions::default().thread(ThreadId::new(5)))
            .unwrap_err();
        assert_eq!(err, EmberError::ThreadFilterOverride);
    }

    #[test]
    fn test_line_without_target() {
        let rt = Runtime::new();
        let ec = rt.main_context();
        let (tp, _) = counting_tp(&ec, EventFlags::LINE);
        let opts = EnableOptions {
            target_line: Some(3),
            ..EnableOptions::default()
        };
        assert_eq!(tp.enable(&ec, opts).unwrap_err(), EmberError::LineFilterWithoutTarget);
    }

    #[test]
    fn test_targeted_line_filter() {
        let rt = Runtime::new();
        let ec = rt.main_context();
        let code = method_unit();
        let (tp, count) = counting_tp(&ec, EventFlags::LINE);
        tp.enable(&ec, EnableOptions::target(TraceTarget::Code(Rc::clone(&code))).line(5))
            .unwrap();
        assert_eq!(tp.state(), TracingState::EnabledTargeted);
        assert_eq!(rt.local_tracepoint_count(), 1);
        assert!(code.local_trace_events().contains(EventFlags::LINE));
        // Global instrumentation untouched.
        assert!(rt.event_flags().is_empty());

        emit_line(&ec, &code, 2);
        assert_eq!(count.get(), 0);
        emit_line(&ec, &code, 5);
        assert_eq!(count.get(), 1);

        tp.disable(&ec);
        assert_eq!(rt.local_tracepoint_count(), 0);
        assert!(!code.local_hooks().is_attached());
        assert!(code.local_trace_events().is_empty());
        emit_line(&ec, &code, 5);
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn test_targeted_line_requires_line_event() {
        let rt = Runtime::new();
        let ec = rt.main_context();
        let (tp, _) = counting_tp(&ec, EventFlags::CALL);
        let err = tp
            .enable(&ec, EnableOptions::target(TraceTarget::Code(method_unit())).line(2))
            .unwrap_err();
        assert_eq!(err, EmberError::LineFilterWithoutLineEvent);
    }

    #[test]
    fn test_targeted_decorates_children() {
        let rt = Runtime::new();
        let ec = rt.main_context();
        let code = method_unit();
        let (tp, _) = counting_tp(&ec, EventFlags::B_CALL);
        tp.enable(&ec, EnableOptions::target(TraceTarget::Code(Rc::clone(&code))))
            .unwrap();
        let block = &code.children()[0];
        assert!(block.local_hooks().is_attached());
        assert!(!code.local_hooks().is_attached());
        assert_eq!(block.local_trace_events(), EventFlags::B_CALL);
        tp.disable(&ec);
        assert!(!block.local_hooks().is_attached());
    }

    #[test]
    fn test_no_hooks_attached_leaves_disabled() {
        let rt = Runtime::new();
        let ec = rt.main_context();
        let (tp, _) = counting_tp(&ec, EventFlags::RAISE);
        let err = tp
            .enable(&ec, EnableOptions::target(TraceTarget::Code(method_unit())))
            .unwrap_err();
        assert_eq!(err, EmberError::NoHooksAttached);
        assert_eq!(tp.state(), TracingState::Disabled);
        assert!(tp.local_targets().is_empty());
        assert_eq!(rt.local_tracepoint_count(), 0);
        // A later global enable is still possible.
        tp.enable(&ec, EnableOptions::default()).unwrap();
        assert_eq!(tp.state(), TracingState::EnabledGlobal);
    }

    #[test]
    fn test_nested_targeted_enable_rejected() {
        let rt = Runtime::new();
        let ec = rt.main_context();
        let code = method_unit();
        let (tp, _) = counting_tp(&ec, EventFlags::LINE);
        tp.enable(&ec, EnableOptions::target(TraceTarget::Code(Rc::clone(&code))))
            .unwrap();
        let again = tp.enable(&ec, EnableOptions::target(TraceTarget::Code(Rc::clone(&code))));
        assert_eq!(again.unwrap_err(), EmberError::NestedTargetedEnable);
        let global = tp.enable(&ec, EnableOptions::default());
        assert_eq!(global.unwrap_err(), EmberError::NestedTargetedEnable);
        let in_block: EmberResult<()> = tp.disable_with(&ec, |_| Ok(()));
        assert_eq!(in_block.unwrap_err(), EmberError::TargetedDisableInBlock);

        let (global_tp, _) = counting_tp(&ec, EventFlags::LINE);
        global_tp.enable(&ec, EnableOptions::default()).unwrap();
        let targeted = global_tp.enable(&ec, EnableOptions::target(TraceTarget::Code(code)));
        assert_eq!(targeted.unwrap_err(), EmberError::NestedTargetedEnable);
    }

    #[test]
    fn test_native_method_unsupported() {
        let rt = Runtime::new();
        let ec = rt.main_context();
        let (tp, _) = counting_tp(&ec, EventFlags::C_CALL);
        let body = MethodBody::Native { arity: -1 };
        let method = MethodEntry::new("puts", Value::symbol("Kernel"), body);
        let err = tp
            .enable(&ec, EnableOptions::target(TraceTarget::Method(method)))
            .unwrap_err();
        assert_eq!(err, EmberError::UnsupportedTarget);
    }

    #[test]
    fn test_block_defined_method_gets_own_hook() {
        let rt = Runtime::new();
        let ec = rt.main_context();
        let body = CodeUnit::builder(CodeKind::Block, "block", "b.rb", 1)
            .site(1, EventFlags::B_CALL)
            .site(2, EventFlags::B_RETURN)
            .build();
        let defined = MethodBody::BlockDefined(Rc::clone(&body));
        let method = MethodEntry::new("dyn", Value::symbol("K"), defined);
        let (tp, _) = counting_tp(&ec, EventFlags::CALL | EventFlags::RETURN);
        tp.enable(&ec, EnableOptions::target(TraceTarget::Method(Rc::clone(&method))))
            .unwrap();
        assert_eq!(method.hooks().events(), EventFlags::CALL | EventFlags::RETURN);
        assert!(body.local_trace_events().contains(EventFlags::B_CALL | EventFlags::B_RETURN));
        assert_eq!(tp.local_targets().len(), 2);
        tp.disable(&ec);
        assert!(!method.hooks().is_attached());
        assert!(!body.local_hooks().is_attached());
    }

    #[test]
    fn test_targeted_enable_invalidates_and_clears_builtin_caches() {
        let recorder = Rc::new(RecordingInstrumentation::new());
        let rt = Runtime::builder()
            .instrumentation(Rc::clone(&recorder) as Rc<dyn Instrumentation>)
            .build();
        let ec = rt.main_context();
        let leaf = CodeUnit::builder(CodeKind::Method, "size", "<builtin>", 1)
            .site(1, EventFlags::CALL)
            .builtin_leaf()
            .build();
        let (tp, _) = counting_tp(&ec, EventFlags::CALL);
        tp.enable(&ec, EnableOptions::target(TraceTarget::Code(leaf))).unwrap();
        let events = recorder.take();
        assert!(events.contains(&InstrumentationEvent::BuiltinCachesCleared));
        assert!(events.contains(&InstrumentationEvent::JitInvalidated));
    }

    #[test]
    fn test_removal_while_dispatching_local_list() {
        let rt = Runtime::new();
        let ec = rt.main_context();
        let code = method_unit();
        let tp_cell: Rc<RefCell<Option<TracePoint>>> = Rc::default();
        let cell = Rc::clone(&tp_cell);
        let fired = Rc::new(Cell::new(0));
        let fired_inner = Rc::clone(&fired);
        let tp = TracePoint::new(
            &ec,
            EventFlags::LINE,
            DispatchTarget::closure(move |ec, _| {
                fired_inner.set(fired_inner.get() + 1);
                if let Some(tp) = cell.borrow().as_ref() {
                    tp.disable(ec);
                }
                Ok(())
            }),
        )
        .unwrap();
        *tp_cell.borrow_mut() = Some(tp.clone());
        tp.enable(&ec, EnableOptions::target(TraceTarget::Code(Rc::clone(&code))))
            .unwrap();
        emit_line(&ec, &code, 2);
        emit_line(&ec, &code, 2);
        assert_eq!(fired.get(), 1);
        assert!(!code.local_hooks().is_attached());
        tp_cell.borrow_mut().take();
    }
}
