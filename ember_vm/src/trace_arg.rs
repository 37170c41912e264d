//! Event occurrences and their lazily resolved attributes.
//!
//! The interpreter describes an event with an [`EventOccurrence`]; the
//! dispatcher wraps it in a [`TraceArg`] shared by every hook invoked for
//! that event. Attributes that need a stack walk (path, line, method
//! identity, parameters) are resolved on first access and memoized.

use crate::code::{unnamed_parameters, CodeUnit, ParamKind, Parameter};
use crate::frame::{path_and_lineno, Frame};
use ember_core::{EmberError, EmberResult, EventFlags, Exception, Symbol, Value};
use std::cell::OnceCell;
use std::rc::Rc;

/// Event-kind specific payload.
#[derive(Debug, Clone, Default)]
pub enum EventPayload {
    #[default]
    None,
    /// Return value of a return event.
    ReturnValue(Value),
    /// Exception of a raise or rescue event.
    Exception(Exception),
    /// Allocated or freed object.
    Object(Value),
    /// Source (absent for pre-compiled code) and the compiled unit.
    Script {
        source: Option<Rc<str>>,
        code: Rc<CodeUnit>,
    },
}

/// An event as raised by the interpreter.
#[derive(Debug, Clone)]
pub struct EventOccurrence {
    pub event: EventFlags,
    pub self_value: Value,
    /// Method id, when the source knows it better than the frame does.
    pub method_id: Option<Symbol>,
    /// Defining class, when the source knows it better than the frame does.
    pub defined_class: Option<Value>,
    pub payload: EventPayload,
}

impl EventOccurrence {
    /// An occurrence with no payload.
    ///
    /// # Panics
    ///
    /// Return, raise, rescue, allocation and script-compiled events carry a
    /// payload. Raised without one, reading it from a hook panics. Use
    /// [`returning`](Self::returning), [`raising`](Self::raising),
    /// [`allocated`](Self::allocated) or [`compiled`](Self::compiled) for
    /// those kinds.
    pub fn new(event: EventFlags, self_value: Value) -> Self {
        Self {
            event,
            self_value,
            method_id: None,
            defined_class: None,
            payload: EventPayload::None,
        }
    }

    /// A return, native-return or block-return event carrying `value`.
    pub fn returning(event: EventFlags, self_value: Value, value: Value) -> Self {
        Self::new(event, self_value).with_payload(EventPayload::ReturnValue(value))
    }

    /// A raise or rescue event carrying `exc`.
    pub fn raising(event: EventFlags, self_value: Value, exc: Exception) -> Self {
        Self::new(event, self_value).with_payload(EventPayload::Exception(exc))
    }

    /// An allocation or free event carrying `obj`.
    pub fn allocated(event: EventFlags, self_value: Value, obj: Value) -> Self {
        Self::new(event, self_value).with_payload(EventPayload::Object(obj))
    }

    /// A script-compiled event for `code`.
    pub fn compiled(self_value: Value, source: Option<Rc<str>>, code: Rc<CodeUnit>) -> Self {
        Self::new(EventFlags::SCRIPT_COMPILED, self_value)
            .with_payload(EventPayload::Script { source, code })
    }

    pub fn with_method(mut self, method_id: Symbol, defined_class: Value) -> Self {
        self.method_id = Some(method_id);
        self.defined_class = Some(defined_class);
        self
    }

    /// Replace the payload. The payload must match the event kind; see
    /// [`new`](Self::new).
    pub fn with_payload(mut self, payload: EventPayload) -> Self {
        self.payload = payload;
        self
    }
}

#[derive(Debug, Clone)]
struct MethodIdentity {
    id: Option<Symbol>,
    called_id: Option<Symbol>,
    klass: Value,
}

/// The event currently being dispatched.
#[derive(Debug)]
pub struct TraceArg {
    event: EventFlags,
    frame: Option<Rc<Frame>>,
    self_value: Value,
    method_id: Option<Symbol>,
    defined_class: Option<Value>,
    payload: EventPayload,
    path_line: OnceCell<(Option<Rc<str>>, u32)>,
    identity: OnceCell<MethodIdentity>,
    parameters: OnceCell<Rc<[Parameter]>>,
}

impl TraceArg {
    /// Wrap an occurrence raised while `frame` is the current frame.
    pub fn new(occurrence: EventOccurrence, frame: Option<Rc<Frame>>) -> Self {
        Self {
            event: occurrence.event,
            frame,
            self_value: occurrence.self_value,
            method_id: occurrence.method_id,
            defined_class: occurrence.defined_class,
            payload: occurrence.payload,
            path_line: OnceCell::new(),
            identity: OnceCell::new(),
            parameters: OnceCell::new(),
        }
    }

    /// Placeholder installed while dispatch is suppressed; it carries no
    /// event kind.
    pub(crate) fn suppressed() -> Self {
        Self::new(EventOccurrence::new(EventFlags::empty(), Value::Nil), None)
    }

    #[inline]
    pub fn event(&self) -> EventFlags {
        self.event
    }

    /// The event's name, e.g. `"c_return"`.
    #[inline]
    pub fn event_name(&self) -> Option<&'static str> {
        self.event.event_name()
    }

    /// Frame current when the event was raised.
    #[inline]
    pub fn frame(&self) -> Option<&Rc<Frame>> {
        self.frame.as_ref()
    }

    #[inline]
    pub fn self_value(&self) -> &Value {
        &self.self_value
    }

    /// Method id and class exactly as the event source supplied them.
    pub(crate) fn supplied_method(&self) -> (Option<&Symbol>, Option<&Value>) {
        (self.method_id.as_ref(), self.defined_class.as_ref())
    }

    fn path_line(&self) -> &(Option<Rc<str>>, u32) {
        self.path_line
            .get_or_init(|| path_and_lineno(self.frame.as_ref(), self.event))
    }

    /// Source path of the nearest language-level frame.
    pub fn path(&self) -> Option<Rc<str>> {
        self.path_line().0.clone()
    }

    /// Line of the nearest language-level frame (first line of the unit for
    /// class, call and block call events).
    pub fn lineno(&self) -> u32 {
        self.path_line().1
    }

    fn identity(&self) -> &MethodIdentity {
        self.identity.get_or_init(|| {
            if let Some(klass) = &self.defined_class {
                return MethodIdentity {
                    id: self.method_id.clone(),
                    called_id: self.method_id.clone(),
                    klass: klass.clone(),
                };
            }
            let method = self.frame.as_ref().and_then(|frame| frame.method());
            match method {
                Some(method) => MethodIdentity {
                    id: Some(method.original_name().clone()),
                    called_id: Some(method.called_name().clone()),
                    klass: method.owner().clone(),
                },
                None => MethodIdentity {
                    id: None,
                    called_id: None,
                    klass: Value::Nil,
                },
            }
        })
    }

    /// Name the current method was defined with.
    pub fn method_id(&self) -> Option<Symbol> {
        self.identity().id.clone()
    }

    /// Name the current method was called by.
    pub fn callee_id(&self) -> Option<Symbol> {
        self.identity().called_id.clone()
    }

    /// Class defining the current method, or `nil`.
    pub fn defined_class(&self) -> Value {
        self.identity().klass.clone()
    }

    /// Parameter list of the method or block being entered or left.
    pub fn parameters(&self) -> EmberResult<Rc<[Parameter]>> {
        if let Some(params) = self.parameters.get() {
            return Ok(Rc::clone(params));
        }
        let params = self.compute_parameters()?;
        Ok(Rc::clone(self.parameters.get_or_init(|| params)))
    }

    fn compute_parameters(&self) -> EmberResult<Rc<[Parameter]>> {
        let event = self.event;
        let frame_events =
            EventFlags::CALL | EventFlags::RETURN | EventFlags::B_CALL | EventFlags::B_RETURN;
        if event.intersects(frame_events) {
            let Some(frame) = self.frame.as_ref() else {
                return Ok(Rc::from(Vec::new()));
            };
            let Some(code) = frame.code() else {
                return Ok(Rc::from(Vec::new()));
            };
            let block_event = event.intersects(EventFlags::B_CALL | EventFlags::B_RETURN);
            if block_event && !frame.is_lambda() {
                let relaxed: Vec<Parameter> = code
                    .parameters()
                    .iter()
                    .map(|param| match param.kind {
                        ParamKind::Req => Parameter {
                            kind: ParamKind::Opt,
                            name: param.name.clone(),
                        },
                        _ => param.clone(),
                    })
                    .collect();
                return Ok(Rc::from(relaxed));
            }
            return Ok(Rc::clone(code.parameters()));
        }
        if event.intersects(EventFlags::C_CALL | EventFlags::C_RETURN) {
            let arity = self
                .frame
                .as_ref()
                .and_then(|frame| frame.method())
                .and_then(|method| method.native_arity())
                .unwrap_or(-1);
            return Ok(Rc::from(unnamed_parameters(arity)));
        }
        Err(EmberError::NotSupportedByEvent)
    }

    /// Frame to evaluate code in, absent for native call and return.
    pub fn binding(&self) -> Option<Value> {
        if self.event.intersects(EventFlags::C_CALL | EventFlags::C_RETURN) {
            return None;
        }
        self.frame
            .as_ref()
            .and_then(Frame::language_level)
            .map(|frame| frame.binding())
    }

    /// Return value of a return event.
    pub fn return_value(&self) -> EmberResult<&Value> {
        if !self.event.intersects(EventFlags::A_RETURN) {
            return Err(EmberError::NotSupportedByEvent);
        }
        match &self.payload {
            EventPayload::ReturnValue(value) => Ok(value),
            _ => panic!("{:?} event raised without a return value", self.event),
        }
    }

    /// Exception of a raise or rescue event.
    pub fn raised_exception(&self) -> EmberResult<&Exception> {
        if !self.event.intersects(EventFlags::RAISE | EventFlags::RESCUE) {
            return Err(EmberError::NotSupportedByEvent);
        }
        match &self.payload {
            EventPayload::Exception(exc) => Ok(exc),
            _ => panic!("{:?} event raised without an exception", self.event),
        }
    }

    /// Compiled source; `None` when compiled from pre-built code.
    pub fn eval_script(&self) -> EmberResult<Option<Rc<str>>> {
        self.script().map(|(source, _)| source.clone())
    }

    /// Code unit compiled by a script-compiled event.
    pub fn instruction_sequence(&self) -> EmberResult<Rc<CodeUnit>> {
        self.script().map(|(_, code)| Rc::clone(code))
    }

    fn script(&self) -> EmberResult<(&Option<Rc<str>>, &Rc<CodeUnit>)> {
        if !self.event.intersects(EventFlags::SCRIPT_COMPILED) {
            return Err(EmberError::NotSupportedByEvent);
        }
        match &self.payload {
            EventPayload::Script { source, code } => Ok((source, code)),
            _ => panic!("script_compiled event raised without a code unit"),
        }
    }

    /// Allocated or freed object.
    pub fn object(&self) -> EmberResult<&Value> {
        if !self.event.intersects(EventFlags::NEWOBJ | EventFlags::FREEOBJ) {
            return Err(EmberError::NotSupportedByEvent);
        }
        match &self.payload {
            EventPayload::Object(obj) => Ok(obj),
            _ => panic!("{:?} event raised without an object", self.event),
        }
    }
}
