//! Compiled code units and method entries.
//!
//! A [`CodeUnit`] is one compiled body (top level, method, block, class
//! body or eval). It records which event kinds each of its event sites can
//! raise and which of those are currently decorated, globally or by local
//! trace points. The interpreter only emits code events for decorated
//! sites.

use crate::hooks::LocalHooks;
use ember_core::{EventFlags, Symbol, Value};
use std::cell::Cell;
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_OBJECT_ID: AtomicU64 = AtomicU64::new(1);

#[inline]
fn next_object_id() -> u64 {
    NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed)
}

/// What a code unit was compiled from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeKind {
    Top,
    Method,
    Block,
    Class,
    Eval,
}

/// An instruction position that can raise events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventSite {
    pub line: u32,
    pub events: EventFlags,
}

/// Parameter kinds, in the order a parameter list reports them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamKind {
    Req,
    Opt,
    Rest,
    KeyReq,
    Key,
    KeyRest,
    Block,
}

impl ParamKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ParamKind::Req => "req",
            ParamKind::Opt => "opt",
            ParamKind::Rest => "rest",
            ParamKind::KeyReq => "keyreq",
            ParamKind::Key => "key",
            ParamKind::KeyRest => "keyrest",
            ParamKind::Block => "block",
        }
    }
}

/// One entry of a parameter list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parameter {
    pub kind: ParamKind,
    pub name: Option<Symbol>,
}

impl Parameter {
    pub fn named(kind: ParamKind, name: &str) -> Self {
        Self {
            kind,
            name: Some(Symbol::new(name)),
        }
    }

    pub fn unnamed(kind: ParamKind) -> Self {
        Self { kind, name: None }
    }

    /// `[:kind, :name]` or `[:kind]`.
    pub fn to_value(&self) -> Value {
        let mut items = vec![Value::symbol(self.kind.as_str())];
        if let Some(name) = &self.name {
            items.push(Value::Symbol(name.clone()));
        }
        Value::array(items)
    }
}

/// Parameters of a native method of the given arity: `n >= 0` required
/// parameters, or `-n - 1` required parameters and a rest parameter.
pub fn unnamed_parameters(arity: i32) -> Vec<Parameter> {
    if arity >= 0 {
        (0..arity).map(|_| Parameter::unnamed(ParamKind::Req)).collect()
    } else {
        let required = -(arity + 1);
        (0..required)
            .map(|_| Parameter::unnamed(ParamKind::Req))
            .chain(std::iter::once(Parameter::unnamed(ParamKind::Rest)))
            .collect()
    }
}

// =============================================================================
// CodeUnit
// =============================================================================

/// A compiled body.
pub struct CodeUnit {
    id: u64,
    kind: CodeKind,
    name: Rc<str>,
    path: Rc<str>,
    first_lineno: u32,
    sites: Box<[EventSite]>,
    parameters: Rc<[Parameter]>,
    children: Box<[Rc<CodeUnit>]>,
    builtin_leaf: bool,
    global_events: Cell<EventFlags>,
    local_events: Cell<EventFlags>,
    registered: Cell<bool>,
    local_hooks: LocalHooks,
}

impl CodeUnit {
    /// Start building a unit.
    pub fn builder(kind: CodeKind, name: &str, path: &str, first_lineno: u32) -> CodeUnitBuilder {
        CodeUnitBuilder {
            kind,
            name: Rc::from(name),
            path: Rc::from(path),
            first_lineno,
            sites: Vec::new(),
            parameters: Vec::new(),
            children: Vec::new(),
            builtin_leaf: false,
        }
    }

    /// Unique identity, used as the owner id for write barriers.
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn kind(&self) -> CodeKind {
        self.kind
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn path(&self) -> &Rc<str> {
        &self.path
    }

    #[inline]
    pub fn first_lineno(&self) -> u32 {
        self.first_lineno
    }

    #[inline]
    pub fn sites(&self) -> &[EventSite] {
        &self.sites
    }

    #[inline]
    pub fn parameters(&self) -> &Rc<[Parameter]> {
        &self.parameters
    }

    /// Units nested directly inside this one (blocks, methods, class
    /// bodies).
    #[inline]
    pub fn children(&self) -> &[Rc<CodeUnit>] {
        &self.children
    }

    /// Whether this is a builtin whose calls may be inlined into the
    /// caller's call cache.
    #[inline]
    pub fn is_builtin_leaf(&self) -> bool {
        self.builtin_leaf
    }

    /// The unit's local hook list slot.
    #[inline]
    pub fn local_hooks(&self) -> &LocalHooks {
        &self.local_hooks
    }

    /// Every event kind some site of this unit can raise.
    pub fn site_events(&self) -> EventFlags {
        self.sites
            .iter()
            .fold(EventFlags::empty(), |acc, site| acc | site.events)
    }

    /// Events currently decorated, globally or locally.
    #[inline]
    pub fn trace_events(&self) -> EventFlags {
        self.global_events.get() | self.local_events.get()
    }

    #[inline]
    pub fn global_trace_events(&self) -> EventFlags {
        self.global_events.get()
    }

    #[inline]
    pub fn local_trace_events(&self) -> EventFlags {
        self.local_events.get()
    }

    /// Whether `event` would be raised at a site on `line`.
    pub fn is_traced_at(&self, event: EventFlags, line: u32) -> bool {
        self.trace_events().intersects(event)
            && self
                .sites
                .iter()
                .any(|site| site.line == line && site.events.intersects(event))
    }

    /// Whether some site raises `event`, decorated or not.
    pub fn has_site(&self, event: EventFlags) -> bool {
        self.sites.iter().any(|site| site.events.intersects(event))
    }

    /// Redecorate this unit for the globally observed code events.
    pub fn set_global_trace_events(&self, events: EventFlags) {
        self.global_events.set(events.code_events());
    }

    pub(crate) fn set_local_trace_events(&self, events: EventFlags) {
        self.local_events.set(events.code_events());
    }

    /// Count sites that raise any of `events`. With a line filter, line
    /// events only count on that line.
    pub fn count_sites(&self, events: EventFlags, target_line: Option<u32>) -> usize {
        self.sites
            .iter()
            .filter(|site| {
                let mut wanted = events;
                if target_line.is_some_and(|line| line != site.line) {
                    wanted.remove(EventFlags::LINE);
                }
                site.events.intersects(wanted)
            })
            .count()
    }

    /// Mark the unit as known to a runtime. Returns `true` the first time.
    pub(crate) fn mark_registered(&self) -> bool {
        !self.registered.replace(true)
    }
}

impl fmt::Debug for CodeUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#<CodeUnit:{}@{}:{} {:?}>",
            self.name, self.path, self.first_lineno, self.kind
        )
    }
}

/// Builder for [`CodeUnit`].
pub struct CodeUnitBuilder {
    kind: CodeKind,
    name: Rc<str>,
    path: Rc<str>,
    first_lineno: u32,
    sites: Vec<EventSite>,
    parameters: Vec<Parameter>,
    children: Vec<Rc<CodeUnit>>,
    builtin_leaf: bool,
}

impl CodeUnitBuilder {
    /// Add an event site.
    pub fn site(mut self, line: u32, events: EventFlags) -> Self {
        self.sites.push(EventSite { line, events });
        self
    }

    /// Add a parameter.
    pub fn param(mut self, kind: ParamKind, name: &str) -> Self {
        self.parameters.push(Parameter::named(kind, name));
        self
    }

    /// Nest a child unit.
    pub fn child(mut self, child: Rc<CodeUnit>) -> Self {
        self.children.push(child);
        self
    }

    /// Mark as an inlinable builtin.
    pub fn builtin_leaf(mut self) -> Self {
        self.builtin_leaf = true;
        self
    }

    pub fn build(self) -> Rc<CodeUnit> {
        Rc::new(CodeUnit {
            id: next_object_id(),
            kind: self.kind,
            name: self.name,
            path: self.path,
            first_lineno: self.first_lineno,
            sites: self.sites.into_boxed_slice(),
            parameters: Rc::from(self.parameters),
            children: self.children.into_boxed_slice(),
            builtin_leaf: self.builtin_leaf,
            global_events: Cell::new(EventFlags::empty()),
            local_events: Cell::new(EventFlags::empty()),
            registered: Cell::new(false),
            local_hooks: LocalHooks::default(),
        })
    }
}

// =============================================================================
// Method entries
// =============================================================================

/// How a method is implemented.
#[derive(Debug, Clone)]
pub enum MethodBody {
    /// Compiled language-level method.
    Compiled(Rc<CodeUnit>),
    /// Method defined from a block; keeps its own local hook list for call
    /// and return events.
    BlockDefined(Rc<CodeUnit>),
    /// Native method with the given arity.
    Native { arity: i32 },
}

/// A method as stored in a class's method table.
pub struct MethodEntry {
    id: u64,
    original_name: Symbol,
    called_name: Symbol,
    owner: Value,
    body: MethodBody,
    hooks: LocalHooks,
}

impl MethodEntry {
    pub fn new(name: &str, owner: Value, body: MethodBody) -> Rc<Self> {
        Rc::new(Self {
            id: next_object_id(),
            original_name: Symbol::new(name),
            called_name: Symbol::new(name),
            owner,
            body,
            hooks: LocalHooks::default(),
        })
    }

    /// An alias of this method reachable as `alias`. The alias shares the
    /// body but has its own entry.
    pub fn alias(&self, alias: &str) -> Rc<Self> {
        Rc::new(Self {
            id: next_object_id(),
            original_name: self.original_name.clone(),
            called_name: Symbol::new(alias),
            owner: self.owner.clone(),
            body: self.body.clone(),
            hooks: LocalHooks::default(),
        })
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Name the method was defined with.
    #[inline]
    pub fn original_name(&self) -> &Symbol {
        &self.original_name
    }

    /// Name the method was called by.
    #[inline]
    pub fn called_name(&self) -> &Symbol {
        &self.called_name
    }

    /// Class the method is defined in.
    #[inline]
    pub fn owner(&self) -> &Value {
        &self.owner
    }

    #[inline]
    pub fn body(&self) -> &MethodBody {
        &self.body
    }

    /// Code unit of a language-level body.
    pub fn code(&self) -> Option<&Rc<CodeUnit>> {
        match &self.body {
            MethodBody::Compiled(code) | MethodBody::BlockDefined(code) => Some(code),
            MethodBody::Native { .. } => None,
        }
    }

    #[inline]
    pub fn is_block_defined(&self) -> bool {
        matches!(self.body, MethodBody::BlockDefined(_))
    }

    /// Arity of a native body.
    pub fn native_arity(&self) -> Option<i32> {
        match self.body {
            MethodBody::Native { arity } => Some(arity),
            _ => None,
        }
    }

    /// Local hooks for call/return of a block-defined method.
    #[inline]
    pub fn hooks(&self) -> &LocalHooks {
        &self.hooks
    }
}

impl fmt::Debug for MethodEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#<MethodEntry:{}#{}>", self.owner, self.called_name)
    }
}
