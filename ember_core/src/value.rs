//! Dynamically-typed values.
//!
//! Values are what hook callbacks receive and what trace points hand back
//! to user code. Immediate values compare structurally; objects compare by
//! identity of their payload allocation.

use std::any::Any;
use std::fmt;
use std::rc::Rc;

/// Method names, event names and other identifiers.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Symbol(Rc<str>);

impl Symbol {
    /// Create a symbol from a name.
    pub fn new(name: &str) -> Self {
        Self(Rc::from(name))
    }

    /// The symbol's name.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Symbol {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl fmt::Debug for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, ":{}", self.0)
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Reference to a heap object owned by the binding layer.
///
/// The payload is opaque to this crate; consumers recover their type with
/// [`ObjectRef::downcast`].
#[derive(Clone)]
pub struct ObjectRef {
    class: Symbol,
    payload: Rc<dyn Any>,
    bootstrap: bool,
}

impl ObjectRef {
    /// Identity of the object (address of its payload allocation).
    #[inline]
    pub fn id(&self) -> usize {
        Rc::as_ptr(&self.payload) as *const () as usize
    }

    /// Name of the object's class.
    #[inline]
    pub fn class(&self) -> &Symbol {
        &self.class
    }

    /// Whether this is one of the runtime's own bootstrap objects.
    #[inline]
    pub fn is_bootstrap(&self) -> bool {
        self.bootstrap
    }

    /// Recover the payload as a concrete type.
    pub fn downcast<T: Any>(&self) -> Option<Rc<T>> {
        Rc::clone(&self.payload).downcast::<T>().ok()
    }

    /// Borrow the payload as a concrete type.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.payload.downcast_ref::<T>()
    }
}

impl PartialEq for ObjectRef {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#<{}:{:#x}>", self.class, self.id())
    }
}

/// A runtime value.
#[derive(Clone, Debug, Default)]
pub enum Value {
    /// Absence of a value.
    #[default]
    Nil,
    /// Boolean.
    Bool(bool),
    /// Integer.
    Int(i64),
    /// Float.
    Float(f64),
    /// Symbol.
    Symbol(Symbol),
    /// Immutable string.
    Str(Rc<str>),
    /// Immutable array.
    Array(Rc<[Value]>),
    /// Heap object.
    Object(ObjectRef),
}

impl Value {
    /// Wrap a payload as a heap object of `class`.
    pub fn object<T: Any>(class: &str, payload: Rc<T>) -> Self {
        Value::Object(ObjectRef {
            class: Symbol::new(class),
            payload,
            bootstrap: false,
        })
    }

    /// A bare object of `class` with no payload beyond its identity.
    pub fn new_object(class: &str) -> Self {
        Self::object(class, Rc::new(()))
    }

    /// A runtime-internal bootstrap object. Events whose subject is a
    /// bootstrap object are never delivered.
    pub fn bootstrap(class: &str) -> Self {
        Value::Object(ObjectRef {
            class: Symbol::new(class),
            payload: Rc::new(()),
            bootstrap: true,
        })
    }

    /// String value.
    pub fn str(s: &str) -> Self {
        Value::Str(Rc::from(s))
    }

    /// Symbol value.
    pub fn symbol(name: &str) -> Self {
        Value::Symbol(Symbol::new(name))
    }

    /// Array value.
    pub fn array(items: Vec<Value>) -> Self {
        Value::Array(Rc::from(items))
    }

    /// Whether this is `nil`.
    #[inline]
    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    /// See [`ObjectRef::is_bootstrap`].
    #[inline]
    pub fn is_bootstrap(&self) -> bool {
        matches!(self, Value::Object(obj) if obj.is_bootstrap())
    }

    /// The object reference, if this is a heap object.
    #[inline]
    pub fn as_object(&self) -> Option<&ObjectRef> {
        match self {
            Value::Object(obj) => Some(obj),
            _ => None,
        }
    }

    /// Recover an object payload as a concrete type.
    pub fn downcast<T: Any>(&self) -> Option<Rc<T>> {
        self.as_object().and_then(ObjectRef::downcast::<T>)
    }

    /// The integer, if this is one.
    #[inline]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// The string, if this is one.
    #[inline]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// The symbol, if this is one.
    #[inline]
    pub fn as_symbol(&self) -> Option<&Symbol> {
        match self {
            Value::Symbol(s) => Some(s),
            _ => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::Symbol(a), Value::Symbol(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => a == b,
            _ => false,
        }
    }
}

impl From<Symbol> for Value {
    fn from(sym: Symbol) -> Self {
        Value::Symbol(sym)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => f.write_str("nil"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Symbol(s) => write!(f, ":{s}"),
            Value::Str(s) => write!(f, "{s:?}"),
            Value::Array(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
            Value::Object(obj) => write!(f, "{obj:?}"),
        }
    }
}
