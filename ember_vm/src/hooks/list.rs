//! Ordered hook lists with deferred cleanup.
//!
//! Hooks are appended; dispatch walks them newest first. Removal only marks
//! a hook deleted. Deleted hooks are unlinked by [`HookList::cleanup`],
//! which must not run while a dispatch over the list is in progress, so the
//! list counts in-progress dispatches and defers cleanup until the count
//! drops to zero.
//!
//! The active event mask is kept equal to the union of the masks of the
//! non-deleted hooks at all times.

use super::hook::{EventHook, HookFn, ThreadFilter};
use ember_core::{EventFlags, Tracer, Value};
use log::trace;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

/// Whether a list is the runtime-wide list or belongs to one code unit or
/// method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookScope {
    Global,
    Local,
}

/// Active mask before and after a list operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventChange {
    pub previous: EventFlags,
    pub current: EventFlags,
}

impl EventChange {
    #[inline]
    pub fn is_changed(&self) -> bool {
        self.previous != self.current
    }
}

/// Result of [`HookList::remove_matching`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Removal {
    /// Hooks newly marked deleted.
    pub removed: usize,
    pub change: EventChange,
}

/// Active and deleted hook counts, see [`HookList::stat`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HookStat {
    pub active: usize,
    pub deleted: usize,
}

/// An ordered collection of hooks.
#[derive(Debug)]
pub struct HookList {
    hooks: RefCell<Vec<Rc<EventHook>>>,
    events: Cell<EventFlags>,
    running: Cell<u32>,
    need_clean: Cell<bool>,
    scope: HookScope,
}

impl HookList {
    /// Empty list.
    pub fn new(scope: HookScope) -> Self {
        Self {
            hooks: RefCell::new(Vec::new()),
            events: Cell::new(EventFlags::empty()),
            running: Cell::new(0),
            need_clean: Cell::new(false),
            scope,
        }
    }

    #[inline]
    pub fn scope(&self) -> HookScope {
        self.scope
    }

    #[inline]
    pub fn is_local(&self) -> bool {
        self.scope == HookScope::Local
    }

    /// Union of the events of every non-deleted hook.
    #[inline]
    pub fn events(&self) -> EventFlags {
        self.events.get()
    }

    /// In-progress dispatches over this list.
    #[inline]
    pub fn running(&self) -> u32 {
        self.running.get()
    }

    /// Whether deleted hooks are waiting to be unlinked.
    #[inline]
    pub fn needs_cleanup(&self) -> bool {
        self.need_clean.get()
    }

    /// Number of linked hooks, deleted ones included.
    #[inline]
    pub fn len(&self) -> usize {
        self.hooks.borrow().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.hooks.borrow().is_empty()
    }

    /// Hook at `index` in registration order.
    #[inline]
    pub fn get(&self, index: usize) -> Option<Rc<EventHook>> {
        self.hooks.borrow().get(index).cloned()
    }

    /// Link a hook. It is visited before every hook linked earlier, and not
    /// by dispatches already in progress.
    pub fn connect(&self, hook: EventHook) -> EventChange {
        let previous = self.events.get();
        let current = previous | hook.events();
        self.hooks.borrow_mut().push(Rc::new(hook));
        self.events.set(current);
        EventChange { previous, current }
    }

    /// Mark deleted every hook matching the thread filter and, when given,
    /// the callback and the data.
    pub fn remove_matching(
        &self,
        thread: ThreadFilter,
        func: Option<&HookFn>,
        data: Option<&Value>,
    ) -> Removal {
        let previous = self.events.get();
        let mut removed = 0;
        for hook in self.hooks.borrow().iter() {
            if !hook.is_deleted() && hook.matches(thread, func, data) {
                hook.mark_deleted();
                removed += 1;
            }
        }
        if removed > 0 {
            self.need_clean.set(true);
            self.events.set(self.live_events());
        }
        Removal {
            removed,
            change: EventChange {
                previous,
                current: self.events.get(),
            },
        }
    }

    /// Mark deleted every hook carrying `data` (a trace point's hooks).
    pub fn remove_tracepoint(&self, data: &Value) -> Removal {
        self.remove_matching(ThreadFilter::Any, None, Some(data))
    }

    fn live_events(&self) -> EventFlags {
        self.hooks
            .borrow()
            .iter()
            .filter(|hook| !hook.is_deleted())
            .fold(EventFlags::empty(), |acc, hook| acc | hook.events())
    }

    /// Unlink deleted hooks and recompute the mask.
    ///
    /// # Panics
    ///
    /// Panics if a dispatch over the list is in progress.
    pub fn cleanup(&self) -> EventChange {
        assert_eq!(self.running.get(), 0, "hook list cleaned while a dispatch is running");
        let previous = self.events.get();
        let mut hooks = self.hooks.borrow_mut();
        let before = hooks.len();
        hooks.retain(|hook| !hook.is_deleted());
        let current = hooks.iter().fold(EventFlags::empty(), |acc, hook| acc | hook.events());
        trace!("unlinked {} deleted hooks", before - hooks.len());
        drop(hooks);
        self.need_clean.set(false);
        self.events.set(current);
        EventChange { previous, current }
    }

    /// Run [`cleanup`](Self::cleanup) if it is pending and allowed.
    pub fn clean_check(&self) -> Option<EventChange> {
        if self.need_clean.get() && self.running.get() == 0 {
            Some(self.cleanup())
        } else {
            None
        }
    }

    /// Release the list's deleted hooks once no dispatch is running. The
    /// owner of a local list drops it after this; in-progress dispatches
    /// keep it alive until they finish.
    pub fn free(&self) -> Option<EventChange> {
        self.need_clean.set(true);
        self.clean_check()
    }

    /// Start a dispatch of `event`. Returns `false`, touching nothing, if no
    /// hook subscribes to `event`.
    #[inline]
    pub(crate) fn begin_dispatch(&self, event: EventFlags) -> bool {
        if !self.events.get().intersects(event) {
            return false;
        }
        self.running.set(self.running.get() + 1);
        true
    }

    /// Finish a dispatch started by [`begin_dispatch`](Self::begin_dispatch)
    /// and run any cleanup that became possible.
    #[inline]
    pub(crate) fn end_dispatch(&self) -> Option<EventChange> {
        let running = self.running.get();
        debug_assert!(running > 0, "hook list dispatch count underflow");
        self.running.set(running.saturating_sub(1));
        self.clean_check()
    }

    /// Report every hook's data to the collector.
    pub fn mark(&self, tracer: &mut dyn Tracer) {
        for hook in self.hooks.borrow().iter() {
            tracer.trace_value(hook.data());
        }
    }

    /// Count active and deleted hooks.
    pub fn stat(&self) -> HookStat {
        self.hooks.borrow().iter().fold(HookStat::default(), |mut stat, hook| {
            if hook.is_deleted() {
                stat.deleted += 1;
            } else {
                stat.active += 1;
            }
            stat
        })
    }
}

/// The local hook list slot of a code unit or method.
///
/// Empty until the first local hook is connected; the owner detaches the
/// list once it has no active events.
#[derive(Debug, Default)]
pub struct LocalHooks(RefCell<Option<Rc<HookList>>>);

impl LocalHooks {
    /// The attached list, if any.
    #[inline]
    pub fn get(&self) -> Option<Rc<HookList>> {
        self.0.borrow().clone()
    }

    /// The attached list, attaching an empty one first if needed.
    pub fn get_or_attach(&self) -> Rc<HookList> {
        let mut slot = self.0.borrow_mut();
        Rc::clone(slot.get_or_insert_with(|| Rc::new(HookList::new(HookScope::Local))))
    }

    /// Detach and return the list.
    #[inline]
    pub fn detach(&self) -> Option<Rc<HookList>> {
        self.0.borrow_mut().take()
    }

    #[inline]
    pub fn is_attached(&self) -> bool {
        self.0.borrow().is_some()
    }

    /// Active events of the attached list.
    #[inline]
    pub fn events(&self) -> EventFlags {
        self.0.borrow().as_ref().map_or(EventFlags::empty(), |list| list.events())
    }
}
