//! The event dispatcher.
//!
//! Regular events run their hooks inside containment: the context's pending
//! exception, recursion guard and raised flag are saved around the hooks,
//! and the active trace-arg blocks nested dispatch. Internal events only
//! consult the global list, run without containment and are dropped while
//! another internal event is being delivered on the same context.

use crate::context::ExecutionContext;
use crate::hooks::{HookArgs, HookFn, HookList, HookScope};
use crate::runtime::Runtime;
use crate::trace_arg::{EventOccurrence, TraceArg};
use ember_core::{EmberResult, EventFlags};
use std::rc::Rc;

impl Runtime {
    /// Raise `occurrence` on `ec`.
    ///
    /// Delivered to the global list, then the current code unit's local
    /// list (code events only), then the local list of a block-defined
    /// method for its call and return.
    #[inline]
    pub fn emit(&self, ec: &ExecutionContext, occurrence: EventOccurrence) -> EmberResult<()> {
        self.emit_with(ec, occurrence, false)
    }

    /// Like [`emit`](Self::emit). With `pop_frame`, a failing hook pops the
    /// current frame first if its call has already finished.
    pub fn emit_with(
        &self,
        ec: &ExecutionContext,
        occurrence: EventOccurrence,
        pop_frame: bool,
    ) -> EmberResult<()> {
        let event = occurrence.event;
        if event.is_internal() {
            if !self.global_hooks().events().intersects(event) {
                return Ok(());
            }
            let arg = Rc::new(TraceArg::new(occurrence, ec.current_frame()));
            return self.exec_event_hooks(ec, &arg, self.global_hooks(), pop_frame);
        }

        let frame = ec.current_frame();
        // Call and return of a block-defined method belong to the method,
        // not to the block body running in the frame.
        let bmethod_call = event.intersects(EventFlags::CALL | EventFlags::RETURN)
            && frame
                .as_ref()
                .and_then(|frame| frame.method())
                .is_some_and(|method| method.is_block_defined());
        let code_hooks = frame
            .as_ref()
            .filter(|_| event.intersects(EventFlags::CODE_EVENTS) && !bmethod_call)
            .and_then(|frame| frame.code())
            .and_then(|code| code.local_hooks().get())
            .filter(|list| list.events().intersects(event));
        let method_hooks = frame
            .as_ref()
            .filter(|_| bmethod_call)
            .and_then(|frame| frame.method())
            .and_then(|method| method.hooks().get())
            .filter(|list| list.events().intersects(event));

        if !self.global_hooks().events().intersects(event)
            && code_hooks.is_none()
            && method_hooks.is_none()
        {
            return Ok(());
        }

        let arg = Rc::new(TraceArg::new(occurrence, frame));
        self.exec_event_hooks(ec, &arg, self.global_hooks(), pop_frame)?;
        if let Some(list) = code_hooks {
            self.exec_event_hooks(ec, &arg, &list, pop_frame)?;
        }
        if let Some(list) = method_hooks {
            self.exec_event_hooks(ec, &arg, &list, pop_frame)?;
        }
        Ok(())
    }

    /// Run the hooks of `list` for `arg`.
    ///
    /// The first failing hook stops the walk; its error is returned after
    /// the context is restored. The pending exception is only restored when
    /// every hook succeeded.
    pub fn exec_event_hooks(
        &self,
        ec: &ExecutionContext,
        arg: &Rc<TraceArg>,
        list: &HookList,
        pop_frame: bool,
    ) -> EmberResult<()> {
        let event = arg.event();

        if event.is_internal() {
            if ec.in_internal_event() {
                return Ok(());
            }
            if !list.begin_dispatch(event) {
                return Ok(());
            }
            let prev = ec.replace_trace_arg(Some(Rc::clone(arg)));
            let result = self.run_hooks(ec, list, arg);
            self.finish_dispatch(list);
            ec.replace_trace_arg(prev);
            return result;
        }

        if ec.has_trace_arg() || arg.self_value().is_bootstrap() {
            return Ok(());
        }
        if !list.begin_dispatch(event) {
            return Ok(());
        }

        let errinfo = ec.errinfo();
        ec.set_errinfo(None);
        ec.swap_recursion_for_trace();
        ec.replace_trace_arg(Some(Rc::clone(arg)));
        let raised = ec.reset_raised();

        let result = self.run_hooks(ec, list, arg);
        self.finish_dispatch(list);

        if raised {
            ec.set_raised();
        }
        ec.replace_trace_arg(None);
        ec.swap_recursion_for_trace();

        match result {
            Ok(()) => {
                ec.set_errinfo(errinfo);
                Ok(())
            }
            Err(err) => {
                if pop_frame && ec.current_frame().is_some_and(|frame| frame.is_finished()) {
                    ec.pop_frame();
                }
                Err(err)
            }
        }
    }

    /// Walk `list` newest first. Hooks linked during the walk are not
    /// visited; indices stay valid because cleanup waits for the walk.
    fn run_hooks(&self, ec: &ExecutionContext, list: &HookList, arg: &TraceArg) -> EmberResult<()> {
        self.stats.record_dispatch();
        let event = arg.event();
        let thread = ec.thread_id();
        for index in (0..list.len()).rev() {
            let Some(hook) = list.get(index) else {
                continue;
            };
            if hook.is_deleted() || !hook.events().intersects(event) {
                continue;
            }
            let filter = hook.filter();
            if filter.thread.is_some_and(|t| t != thread) {
                continue;
            }
            if filter.target_line.is_some_and(|line| line != ec.current_line()) {
                continue;
            }
            self.stats.record_hook_call();
            match hook.func() {
                HookFn::Decoded(func) => {
                    let (method_id, defined_class) = arg.supplied_method();
                    let args = HookArgs {
                        event,
                        data: hook.data(),
                        self_value: arg.self_value(),
                        method_id,
                        defined_class,
                    };
                    func(ec, &args)?;
                }
                HookFn::Raw(func) => func(ec, hook.data(), arg)?,
            }
        }
        Ok(())
    }

    fn finish_dispatch(&self, list: &HookList) {
        if let Some(change) = list.end_dispatch() {
            self.stats.record_cleanup();
            if list.scope() == HookScope::Global {
                self.apply_global_change(change);
            }
        }
    }
}

/// Run `f` with event dispatch suppressed on `ec`.
///
/// Regular events raised inside `f` are dropped; internal events still
/// reach their hooks. The raised flag is cleared for `f` and set again
/// afterwards if it was set before.
pub fn suppress_tracing<R>(ec: &ExecutionContext, f: impl FnOnce(&ExecutionContext) -> R) -> R {
    let installed = !ec.has_trace_arg();
    if installed {
        ec.replace_trace_arg(Some(Rc::new(TraceArg::suppressed())));
    }
    let raised = ec.reset_raised();
    let result = f(ec);
    if raised {
        ec.set_raised();
    }
    if installed {
        ec.replace_trace_arg(None);
    }
    result
}
