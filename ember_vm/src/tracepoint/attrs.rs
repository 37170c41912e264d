//! Attributes of the event a trace point is observing.
//!
//! Each accessor reads the context's active event and fails with
//! [`EmberError::OutsideEvent`] when none is being dispatched.

use super::TracePoint;
use crate::code::{CodeUnit, Parameter};
use crate::context::ExecutionContext;
use crate::trace_arg::TraceArg;
use ember_core::{EmberError, EmberResult, EventFlags, Exception, Symbol, Value};
use std::rc::Rc;

fn active(ec: &ExecutionContext) -> EmberResult<Rc<TraceArg>> {
    ec.trace_arg().ok_or(EmberError::OutsideEvent)
}

impl TracePoint {
    pub fn event(&self, ec: &ExecutionContext) -> EmberResult<EventFlags> {
        Ok(active(ec)?.event())
    }

    pub fn event_name(&self, ec: &ExecutionContext) -> EmberResult<Option<&'static str>> {
        Ok(active(ec)?.event_name())
    }

    pub fn lineno(&self, ec: &ExecutionContext) -> EmberResult<u32> {
        Ok(active(ec)?.lineno())
    }

    pub fn path(&self, ec: &ExecutionContext) -> EmberResult<Option<Rc<str>>> {
        Ok(active(ec)?.path())
    }

    pub fn parameters(&self, ec: &ExecutionContext) -> EmberResult<Rc<[Parameter]>> {
        active(ec)?.parameters()
    }

    pub fn method_id(&self, ec: &ExecutionContext) -> EmberResult<Option<Symbol>> {
        Ok(active(ec)?.method_id())
    }

    pub fn callee_id(&self, ec: &ExecutionContext) -> EmberResult<Option<Symbol>> {
        Ok(active(ec)?.callee_id())
    }

    pub fn defined_class(&self, ec: &ExecutionContext) -> EmberResult<Value> {
        Ok(active(ec)?.defined_class())
    }

    pub fn binding(&self, ec: &ExecutionContext) -> EmberResult<Option<Value>> {
        Ok(active(ec)?.binding())
    }

    pub fn self_value(&self, ec: &ExecutionContext) -> EmberResult<Value> {
        Ok(active(ec)?.self_value().clone())
    }

    pub fn return_value(&self, ec: &ExecutionContext) -> EmberResult<Value> {
        active(ec)?.return_value().cloned()
    }

    pub fn raised_exception(&self, ec: &ExecutionContext) -> EmberResult<Exception> {
        active(ec)?.raised_exception().cloned()
    }

    pub fn eval_script(&self, ec: &ExecutionContext) -> EmberResult<Option<Rc<str>>> {
        active(ec)?.eval_script()
    }

    pub fn instruction_sequence(&self, ec: &ExecutionContext) -> EmberResult<Rc<CodeUnit>> {
        active(ec)?.instruction_sequence()
    }

    pub fn object(&self, ec: &ExecutionContext) -> EmberResult<Value> {
        active(ec)?.object().cloned()
    }
}
