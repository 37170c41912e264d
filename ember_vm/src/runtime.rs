//! The runtime: global hook list, code registry and subscription API.
//!
//! A `Runtime` is owned by one interpreter thread (it is `!Send`). The only
//! pieces other threads or signal handlers touch are the job queues and the
//! interrupt words, which live behind `Arc`s.

use crate::code::CodeUnit;
use crate::config::TraceConfig;
use crate::context::ExecutionContext;
use crate::hooks::{EventChange, EventHook, HookFlags, HookFn, HookList, HookScope, ThreadFilter};
use crate::instrumentation::{Instrumentation, NullInstrumentation};
use crate::stats::TraceStats;
use crate::{trace_func, tracepoint};
use ember_core::{
    DomainId, EmberResult, EventFlags, InterruptFlags, NoBarrier, ThreadId, Tracer, Value,
    WriteBarrier,
};
use ember_jobs::{FlushReport, JobQueues};
use log::debug;
use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::sync::Arc;

/// Token returned by [`Runtime::subscribe`]; pass it to
/// [`Runtime::unsubscribe`].
#[derive(Debug, Clone)]
pub struct Registration {
    func: HookFn,
    data: Value,
    thread: Option<ThreadId>,
}

impl Registration {
    #[inline]
    pub fn func(&self) -> &HookFn {
        &self.func
    }

    #[inline]
    pub fn data(&self) -> &Value {
        &self.data
    }

    #[inline]
    pub fn thread(&self) -> Option<ThreadId> {
        self.thread
    }
}

/// Builder for [`Runtime`].
pub struct RuntimeBuilder {
    config: TraceConfig,
    instrumentation: Rc<dyn Instrumentation>,
    barrier: Rc<dyn WriteBarrier>,
    interrupts: Option<Arc<InterruptFlags>>,
}

impl RuntimeBuilder {
    pub fn config(mut self, config: TraceConfig) -> Self {
        self.config = config;
        self
    }

    pub fn instrumentation(mut self, instrumentation: Rc<dyn Instrumentation>) -> Self {
        self.instrumentation = instrumentation;
        self
    }

    pub fn write_barrier(mut self, barrier: Rc<dyn WriteBarrier>) -> Self {
        self.barrier = barrier;
        self
    }

    /// Interrupt word of the main context (shared with the job queues).
    pub fn interrupts(mut self, interrupts: Arc<InterruptFlags>) -> Self {
        self.interrupts = Some(interrupts);
        self
    }

    pub fn build(self) -> Rc<Runtime> {
        let interrupts = self.interrupts.unwrap_or_default();
        Rc::new(Runtime {
            stats: TraceStats::new(self.config.collect_stats),
            config: self.config,
            global_hooks: HookList::new(HookScope::Global),
            jobs: Arc::new(JobQueues::new(interrupts)),
            instrumentation: self.instrumentation,
            barrier: self.barrier,
            event_flags: Cell::new(EventFlags::empty()),
            enabled_global: Cell::new(EventFlags::empty()),
            local_tracepoints: Cell::new(0),
            code_units: RefCell::new(Vec::new()),
            tracepoint_hook: HookFn::raw(tracepoint::dispatch_to_tracepoint),
            trace_func_hook: HookFn::decoded(trace_func::call_trace_func),
            next_thread: Cell::new(1),
        })
    }
}

/// Runtime-wide instrumentation state.
pub struct Runtime {
    config: TraceConfig,
    global_hooks: HookList,
    jobs: Arc<JobQueues>,
    instrumentation: Rc<dyn Instrumentation>,
    barrier: Rc<dyn WriteBarrier>,
    /// Events observed by the global list right now.
    event_flags: Cell<EventFlags>,
    /// Every event ever observed by the global list.
    enabled_global: Cell<EventFlags>,
    local_tracepoints: Cell<usize>,
    code_units: RefCell<Vec<Weak<CodeUnit>>>,
    pub(crate) stats: TraceStats,
    tracepoint_hook: HookFn,
    trace_func_hook: HookFn,
    next_thread: Cell<u32>,
}

impl Runtime {
    /// Runtime with default configuration and no collaborators.
    pub fn new() -> Rc<Self> {
        Self::builder().build()
    }

    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder {
            config: TraceConfig::default(),
            instrumentation: Rc::new(NullInstrumentation),
            barrier: Rc::new(NoBarrier),
            interrupts: None,
        }
    }

    /// Context of the main thread. Shares its interrupt word with the job
    /// queues.
    pub fn main_context(self: &Rc<Self>) -> ExecutionContext {
        ExecutionContext::new(
            Rc::clone(self),
            ThreadId::MAIN,
            DomainId::MAIN,
            Arc::clone(self.jobs.interrupts()),
        )
    }

    /// Context for a new interpreter thread in `domain`.
    pub fn spawn_context(self: &Rc<Self>, domain: DomainId) -> ExecutionContext {
        let thread = ThreadId::new(self.next_thread.get());
        self.next_thread.set(thread.get() + 1);
        ExecutionContext::new(Rc::clone(self), thread, domain, Arc::new(InterruptFlags::new()))
    }

    #[inline]
    pub fn config(&self) -> &TraceConfig {
        &self.config
    }

    #[inline]
    pub fn stats(&self) -> &TraceStats {
        &self.stats
    }

    #[inline]
    pub fn jobs(&self) -> &Arc<JobQueues> {
        &self.jobs
    }

    #[inline]
    pub fn global_hooks(&self) -> &HookList {
        &self.global_hooks
    }

    /// Events the global list currently observes.
    #[inline]
    pub fn event_flags(&self) -> EventFlags {
        self.event_flags.get()
    }

    /// Every event the global list has ever observed.
    #[inline]
    pub fn enabled_global_flags(&self) -> EventFlags {
        self.enabled_global.get()
    }

    /// Trace points currently enabled for specific targets.
    #[inline]
    pub fn local_tracepoint_count(&self) -> usize {
        self.local_tracepoints.get()
    }

    pub(crate) fn local_tracepoint_enabled(&self) {
        self.local_tracepoints.set(self.local_tracepoints.get() + 1);
    }

    pub(crate) fn local_tracepoint_disabled(&self) {
        self.local_tracepoints.set(self.local_tracepoints.get().saturating_sub(1));
    }

    #[inline]
    pub(crate) fn instrumentation(&self) -> &dyn Instrumentation {
        &*self.instrumentation
    }

    #[inline]
    pub(crate) fn tracepoint_hook(&self) -> &HookFn {
        &self.tracepoint_hook
    }

    #[inline]
    pub(crate) fn trace_func_hook(&self) -> &HookFn {
        &self.trace_func_hook
    }

    // =========================================================================
    // Subscription API
    // =========================================================================

    /// Subscribe `func` to `events` on every thread. Fails if `events` mixes
    /// internal and regular events.
    pub fn add_event_hook(&self, func: HookFn, events: EventFlags, data: Value) -> EmberResult<()> {
        self.add_event_hook_with_flags(func, events, data, HookFlags::SAFE)
    }

    pub fn add_event_hook_with_flags(
        &self,
        func: HookFn,
        events: EventFlags,
        data: Value,
        flags: HookFlags,
    ) -> EmberResult<()> {
        let hook = EventHook::new(func, events, data, flags)?;
        self.connect_global(hook);
        Ok(())
    }

    /// Subscribe `func` to `events` raised on `thread` only.
    pub fn add_thread_event_hook(
        &self,
        thread: ThreadId,
        func: HookFn,
        events: EventFlags,
        data: Value,
        flags: HookFlags,
    ) -> EmberResult<()> {
        let hook = EventHook::new(func, events, data, flags)?.for_thread(Some(thread));
        self.connect_global(hook);
        Ok(())
    }

    /// Subscribe and return a token naming the subscription.
    pub fn subscribe(
        &self,
        thread: Option<ThreadId>,
        func: HookFn,
        events: EventFlags,
        data: Value,
    ) -> EmberResult<Registration> {
        let hook =
            EventHook::new(func.clone(), events, data.clone(), HookFlags::SAFE)?.for_thread(thread);
        self.connect_global(hook);
        Ok(Registration { func, data, thread })
    }

    /// Remove the subscription named by `registration`. Returns how many
    /// hooks were removed.
    pub fn unsubscribe(&self, registration: &Registration) -> usize {
        let filter = match registration.thread {
            Some(thread) => ThreadFilter::Thread(thread),
            None => ThreadFilter::Global,
        };
        self.remove_hooks(filter, Some(&registration.func), Some(&registration.data))
    }

    /// Remove global (unfiltered) hooks matching `func` and `data`; `None`
    /// matches anything.
    pub fn remove_event_hook(&self, func: Option<&HookFn>, data: Option<&Value>) -> usize {
        self.remove_hooks(ThreadFilter::Global, func, data)
    }

    /// Remove hooks registered for `thread` matching `func` and `data`.
    pub fn remove_thread_event_hook(
        &self,
        thread: ThreadId,
        func: Option<&HookFn>,
        data: Option<&Value>,
    ) -> usize {
        self.remove_hooks(ThreadFilter::Thread(thread), func, data)
    }

    /// Remove every hook registered for the context's thread.
    pub fn clear_current_thread_trace_func(&self, ec: &ExecutionContext) -> usize {
        self.remove_hooks(ThreadFilter::Thread(ec.thread_id()), None, None)
    }

    /// Remove every hook on any thread.
    pub fn clear_all_trace_func(&self) -> usize {
        self.remove_hooks(ThreadFilter::Any, None, None)
    }

    /// Subscribe `func` to code events raised inside `code` only.
    pub fn add_local_event_hook(
        &self,
        code: &CodeUnit,
        func: HookFn,
        events: EventFlags,
        data: Value,
    ) -> EmberResult<()> {
        let hook = EventHook::new(func, events.code_events(), data, HookFlags::SAFE)?;
        self.connect_local(code.id(), &code.local_hooks().get_or_attach(), hook);
        code.set_local_trace_events(code.local_hooks().events());
        Ok(())
    }

    /// Remove local hooks of `code` matching `func` and `data`, detaching
    /// the list once it observes nothing.
    pub fn remove_local_event_hook(
        &self,
        code: &CodeUnit,
        func: Option<&HookFn>,
        data: Option<&Value>,
    ) -> usize {
        let Some(list) = code.local_hooks().get() else {
            return 0;
        };
        let removed = list.remove_matching(ThreadFilter::Any, func, data).removed;
        release_local_list(code.local_hooks(), &list);
        code.set_local_trace_events(code.local_hooks().events());
        removed
    }

    pub(crate) fn connect_local(&self, owner: u64, list: &HookList, hook: EventHook) {
        self.barrier.record_write(owner, hook.data());
        list.connect(hook);
    }

    fn connect_global(&self, hook: EventHook) {
        let change = self.global_hooks.connect(hook);
        self.apply_global_change(change);
    }

    pub(crate) fn remove_hooks(
        &self,
        filter: ThreadFilter,
        func: Option<&HookFn>,
        data: Option<&Value>,
    ) -> usize {
        let removal = self.global_hooks.remove_matching(filter, func, data);
        self.apply_global_change(removal.change);
        if let Some(change) = self.global_hooks.clean_check() {
            self.stats.record_cleanup();
            self.apply_global_change(change);
        }
        removal.removed
    }

    pub(crate) fn apply_global_change(&self, change: EventChange) {
        if change.is_changed() {
            self.update_global_events(change.previous, change.current);
        }
    }

    // =========================================================================
    // Global instrumentation
    // =========================================================================

    /// Propagate a change of the global list's active mask from `prev` to
    /// `new`.
    ///
    /// Code events observed for the first time re-decorate every registered
    /// code unit; otherwise newly observed call/return kinds drop the call
    /// caches that would bypass them. Machine code is invalidated on
    /// re-decoration or when native call/return tracing starts.
    pub fn update_global_events(&self, prev: EventFlags, new: EventFlags) {
        let enabled_before = self.enabled_global.get();
        let new_code_events = new.code_events() - enabled_before.code_events();
        let first_time = !new_code_events.is_empty();
        let started = |event: EventFlags| !prev.intersects(event) && new.intersects(event);
        let enable_c_call = started(EventFlags::C_CALL);
        let enable_c_return = started(EventFlags::C_RETURN);
        let enable_call = started(EventFlags::CALL);
        let enable_return = started(EventFlags::RETURN);

        if first_time {
            self.retrace_all((new | enabled_before).code_events());
        } else {
            if enable_c_call || enable_c_return {
                self.instrumentation.clear_attr_call_caches();
            }
            if enable_call || enable_return {
                self.instrumentation.clear_builtin_call_caches();
            }
        }

        self.event_flags.set(new);
        self.enabled_global.set(enabled_before | new);
        self.instrumentation.set_allocation_tracing(new & EventFlags::INTERNAL);

        if first_time || enable_c_call || enable_c_return {
            self.invalidate_jit();
        }
        self.stats.record_global_update();
        debug!("global events {:?} -> {:?}", prev, new);
    }

    pub(crate) fn invalidate_jit(&self) {
        if self.config.jit_invalidation {
            self.instrumentation.invalidate_jit();
            self.stats.record_jit_invalidation();
        }
    }

    fn retrace_all(&self, events: EventFlags) {
        let mut units = self.code_units.borrow_mut();
        units.retain(|unit| match unit.upgrade() {
            Some(unit) => {
                unit.set_global_trace_events(events);
                true
            }
            None => false,
        });
        debug!("re-decorated {} code units for {:?}", units.len(), events);
        drop(units);
        self.instrumentation.code_retraced(events);
    }

    /// Make `code` and its children known to the runtime. New units are
    /// decorated for every code event observed globally so far.
    pub fn register_code(&self, code: &Rc<CodeUnit>) {
        if !code.mark_registered() {
            return;
        }
        code.set_global_trace_events(self.enabled_global.get());
        self.code_units.borrow_mut().push(Rc::downgrade(code));
        for child in code.children() {
            self.register_code(child);
        }
    }

    /// Number of live registered code units.
    pub fn registered_code_units(&self) -> usize {
        self.code_units
            .borrow()
            .iter()
            .filter(|unit| unit.strong_count() > 0)
            .count()
    }

    // =========================================================================
    // Jobs and GC
    // =========================================================================

    /// Run pending postponed and work-queue jobs on `ec`.
    pub fn flush_jobs(&self, ec: &ExecutionContext) -> EmberResult<FlushReport> {
        self.jobs.flush(ec)
    }

    /// Report every value held by hooks to the collector.
    pub fn mark(&self, tracer: &mut dyn Tracer) {
        self.global_hooks.mark(tracer);
        for unit in self.code_units.borrow().iter().filter_map(Weak::upgrade) {
            if let Some(list) = unit.local_hooks().get() {
                list.mark(tracer);
            }
        }
    }

    /// Remove every global and local hook, then drop all job registrations
    /// and queued jobs (teardown).
    pub fn teardown(&self) {
        self.clear_all_trace_func();
        let units: Vec<Rc<CodeUnit>> = self
            .code_units
            .borrow()
            .iter()
            .filter_map(Weak::upgrade)
            .collect();
        for unit in &units {
            self.remove_local_event_hook(unit, None, None);
        }
        self.jobs.reset();
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("event_flags", &self.event_flags.get())
            .field("enabled_global", &self.enabled_global.get())
            .field("hooks", &self.global_hooks.len())
            .field("local_tracepoints", &self.local_tracepoints.get())
            .finish()
    }
}

/// Free a local list whose hooks are all deleted and detach it from its
/// owner's slot.
pub(crate) fn release_local_list(slot: &crate::hooks::LocalHooks, list: &Rc<HookList>) {
    if list.events().is_empty() {
        list.free();
        slot.detach();
    } else {
        list.clean_check();
    }
}
