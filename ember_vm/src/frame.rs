//! Control frames.
//!
//! Frames form a singly linked stack through their parent pointers. The
//! dispatcher only looks at a frame's code unit, current line, method
//! identity and whether the frame's call has logically finished.

use crate::code::{CodeUnit, MethodEntry};
use ember_core::{EventFlags, Symbol, Value};
use std::cell::Cell;
use std::fmt;
use std::rc::Rc;

/// What pushed the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Top,
    Method,
    Block { lambda: bool },
    Class,
    Eval,
    Native,
}

/// One activation record.
pub struct Frame {
    kind: FrameKind,
    code: Option<Rc<CodeUnit>>,
    method: Option<Rc<MethodEntry>>,
    self_value: Value,
    line: Cell<u32>,
    finished: Cell<bool>,
    parent: Option<Rc<Frame>>,
    depth: usize,
}

impl Frame {
    /// A frame on top of `parent`. Language-level frames carry a code unit;
    /// native frames do not.
    pub fn new(
        kind: FrameKind,
        code: Option<Rc<CodeUnit>>,
        method: Option<Rc<MethodEntry>>,
        self_value: Value,
        parent: Option<Rc<Frame>>,
    ) -> Rc<Self> {
        let line = code.as_ref().map_or(0, |code| code.first_lineno());
        let depth = parent.as_ref().map_or(0, |p| p.depth + 1);
        Rc::new(Self {
            kind,
            code,
            method,
            self_value,
            line: Cell::new(line),
            finished: Cell::new(false),
            parent,
            depth,
        })
    }

    #[inline]
    pub fn kind(&self) -> FrameKind {
        self.kind
    }

    #[inline]
    pub fn code(&self) -> Option<&Rc<CodeUnit>> {
        self.code.as_ref()
    }

    #[inline]
    pub fn method(&self) -> Option<&Rc<MethodEntry>> {
        self.method.as_ref()
    }

    #[inline]
    pub fn self_value(&self) -> &Value {
        &self.self_value
    }

    #[inline]
    pub fn parent(&self) -> Option<&Rc<Frame>> {
        self.parent.as_ref()
    }

    /// Number of frames below this one.
    #[inline]
    pub fn depth(&self) -> usize {
        self.depth
    }

    #[inline]
    pub fn line(&self) -> u32 {
        self.line.get()
    }

    #[inline]
    pub fn set_line(&self, line: u32) {
        self.line.set(line);
    }

    /// Whether the frame's call has returned, even though the frame is
    /// still on the stack (its return event is being delivered).
    #[inline]
    pub fn is_finished(&self) -> bool {
        self.finished.get()
    }

    #[inline]
    pub fn mark_finished(&self) {
        self.finished.set(true);
    }

    #[inline]
    pub fn is_language_level(&self) -> bool {
        self.code.is_some()
    }

    #[inline]
    pub fn is_lambda(&self) -> bool {
        matches!(self.kind, FrameKind::Block { lambda: true })
    }

    /// Method name the frame was defined under.
    pub fn method_id(&self) -> Option<&Symbol> {
        self.method.as_deref().map(MethodEntry::original_name)
    }

    /// Class the frame's method is defined in.
    pub fn defined_class(&self) -> Option<&Value> {
        self.method.as_deref().map(MethodEntry::owner)
    }

    /// This frame or the nearest ancestor with a code unit.
    pub fn language_level(self: &Rc<Self>) -> Option<Rc<Frame>> {
        let mut frame = Some(self);
        while let Some(current) = frame {
            if current.is_language_level() {
                return Some(Rc::clone(current));
            }
            frame = current.parent.as_ref();
        }
        None
    }

    /// A binding object capturing this frame.
    pub fn binding(self: &Rc<Self>) -> Value {
        Value::object("Binding", Rc::clone(self))
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("kind", &self.kind)
            .field("code", &self.code)
            .field("line", &self.line.get())
            .field("depth", &self.depth)
            .field("finished", &self.finished.get())
            .finish()
    }
}

/// Source path and line reported for `event` raised in `frame`.
///
/// Both come from the nearest language-level frame. Class, call and block
/// call events report the code unit's first line.
pub fn path_and_lineno(frame: Option<&Rc<Frame>>, event: EventFlags) -> (Option<Rc<str>>, u32) {
    let Some(frame) = frame.and_then(Frame::language_level) else {
        return (None, 0);
    };
    let Some(code) = frame.code() else {
        return (None, 0);
    };
    let line = if event.intersects(EventFlags::CLASS | EventFlags::CALL | EventFlags::B_CALL) {
        code.first_lineno()
    } else {
        frame.line()
    };
    (Some(Rc::clone(code.path())), line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::{CodeKind, MethodBody};

    #[test]
    fn test_language_level_skips_native_frames() {
        let code = CodeUnit::builder(CodeKind::Method, "foo", "a.rb", 10).build();
        let method = Frame::new(FrameKind::Method, Some(code), None, Value::Nil, None);
        method.set_line(12);
        let parent = Some(Rc::clone(&method));
        let native = Frame::new(FrameKind::Native, None, None, Value::Nil, parent);
        assert_eq!(native.depth(), 1);
        let found = native.language_level().unwrap();
        assert!(Rc::ptr_eq(&found, &method));

        let (path, line) = path_and_lineno(Some(&native), EventFlags::C_CALL);
        assert_eq!(path.as_deref(), Some("a.rb"));
        assert_eq!(line, 12);
        let (_, line) = path_and_lineno(Some(&native), EventFlags::CALL);
        assert_eq!(line, 10);
    }

    #[test]
    fn test_no_language_frame() {
        let native = Frame::new(FrameKind::Native, None, None, Value::Nil, None);
        assert_eq!(path_and_lineno(Some(&native), EventFlags::LINE), (None, 0));
        assert_eq!(path_and_lineno(None, EventFlags::LINE), (None, 0));
    }

    #[test]
    fn test_method_identity() {
        let entry = MethodEntry::new("bar", Value::symbol("K"), MethodBody::Native { arity: 0 });
        let frame = Frame::new(FrameKind::Native, None, Some(entry), Value::Nil, None);
        assert_eq!(frame.method_id().map(Symbol::as_str), Some("bar"));
        assert_eq!(frame.defined_class(), Some(&Value::symbol("K")));
    }
}
