//! Callable values.

use crate::context::ExecutionContext;
use ember_core::{EmberError, EmberResult, Value};
use std::fmt;
use std::rc::Rc;

type ProcFn = dyn Fn(&ExecutionContext, &[Value]) -> EmberResult<Value>;

/// A closure that can be stored as a [`Value`] and called with arguments.
///
/// A shareable proc captures nothing bound to an isolation domain and may
/// run in any domain.
#[derive(Clone)]
pub struct Proc {
    body: Rc<ProcFn>,
    shareable: bool,
}

impl Proc {
    pub const CLASS: &'static str = "Proc";

    pub fn new(body: impl Fn(&ExecutionContext, &[Value]) -> EmberResult<Value> + 'static) -> Self {
        Self {
            body: Rc::new(body),
            shareable: false,
        }
    }

    /// A proc that may run in any domain.
    pub fn shareable(
        body: impl Fn(&ExecutionContext, &[Value]) -> EmberResult<Value> + 'static,
    ) -> Self {
        Self {
            body: Rc::new(body),
            shareable: true,
        }
    }

    #[inline]
    pub fn is_shareable(&self) -> bool {
        self.shareable
    }

    #[inline]
    pub fn call(&self, ec: &ExecutionContext, args: &[Value]) -> EmberResult<Value> {
        (self.body)(ec, args)
    }

    pub fn into_value(self) -> Value {
        Value::object(Self::CLASS, Rc::new(self))
    }

    /// The proc stored in `value`; `what` names the argument in the error.
    pub fn from_value(value: &Value, what: &'static str) -> EmberResult<Rc<Proc>> {
        value.downcast::<Proc>().ok_or(EmberError::NotCallable { what })
    }
}

impl fmt::Debug for Proc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shareable = if self.shareable { " (shareable)" } else { "" };
        write!(f, "#<Proc:{:p}{}>", Rc::as_ptr(&self.body) as *const (), shareable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Runtime;

    #[test]
    fn test_call_through_value() {
        let rt = Runtime::new();
        let ec = rt.main_context();
        let value = Proc::new(|_, args| Ok(Value::Int(args.len() as i64))).into_value();
        let proc = Proc::from_value(&value, "block").unwrap();
        assert!(!proc.is_shareable());
        assert_eq!(proc.call(&ec, &[Value::Nil, Value::Nil]).unwrap(), Value::Int(2));
    }

    #[test]
    fn test_non_proc_rejected() {
        let err = Proc::from_value(&Value::Int(1), "trace_func").unwrap_err();
        assert_eq!(err, EmberError::NotCallable { what: "trace_func" });
        assert_eq!(err.to_string(), "trace_func must be a proc");
    }
}
