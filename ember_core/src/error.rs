//! Error taxonomy for instrumentation and deferred execution.
//!
//! Failures fall into four groups (see [`ErrorKind`]):
//!
//! - **Configuration**: a subscription or trace point was set up wrongly and
//!   nothing was changed.
//! - **State**: the operation is not valid in the current enable state.
//! - **Access**: an event attribute was read outside an event, or for an
//!   event kind that does not carry it.
//! - **Raised**: a callback or job raised a language-level exception, which
//!   propagates to the code that triggered the event.
//!
//! Capacity exhaustion is reported through sentinel returns, and broken
//! internal invariants are panics.

use crate::value::Symbol;
use std::fmt;
use std::rc::Rc;
use thiserror::Error;

/// Result alias used throughout the runtime.
pub type EmberResult<T> = Result<T, EmberError>;

/// Broad category of an [`EmberError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Invalid subscription or trace point configuration.
    Configuration,
    /// Operation not valid in the current state.
    State,
    /// Event attribute unavailable.
    Access,
    /// Language-level exception raised by a callback.
    Raised,
}

/// A language-level exception.
#[derive(Clone, PartialEq, Eq)]
pub struct Exception {
    class: Symbol,
    message: Rc<str>,
}

impl Exception {
    /// Create an exception of `class` carrying `message`.
    pub fn new(class: &str, message: &str) -> Self {
        Self {
            class: Symbol::new(class),
            message: Rc::from(message),
        }
    }

    /// Exception class name.
    #[inline]
    pub fn class(&self) -> &Symbol {
        &self.class
    }

    /// Exception message.
    #[inline]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Debug for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#<{}: {}>", self.class, self.message)
    }
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.class)
    }
}

/// Every failure the instrumentation core reports.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EmberError {
    // Configuration
    /// Internal and regular events in one subscription.
    #[error("can not specify normal event and internal event simultaneously")]
    MixedEventKinds,

    /// Event name that does not name any event kind.
    #[error("unknown event: {0}")]
    UnknownEvent(String),

    /// Line filter given without subscribing to the line event.
    #[error("target_line is specified, but line event is not specified")]
    LineFilterWithoutLineEvent,

    /// Line filter given without a target.
    #[error("only target_line is specified")]
    LineFilterWithoutTarget,

    /// Target that cannot carry local hooks.
    #[error("specified target is not supported")]
    UnsupportedTarget,

    /// A callback argument that is not a callable value.
    #[error("{what} must be a proc")]
    NotCallable {
        /// What was expected to be callable.
        what: &'static str,
    },

    // State
    /// Enabling a trace point that is already enabled for specific targets,
    /// or targeting one that is already enabled.
    #[error("can't nest-enable a targeting TracePoint")]
    NestedTargetedEnable,

    /// Thread filter requested while one is already in force.
    #[error("can not override target_thread filter")]
    ThreadFilterOverride,

    /// Scoped disable of a targeted trace point.
    #[error("can't disable a targeting TracePoint in a block")]
    TargetedDisableInBlock,

    /// Targeted enable that matched no event site.
    #[error("can not enable any hooks")]
    NoHooksAttached,

    /// Re-entry requested while no event is active.
    #[error("No need to allow reentrance.")]
    ReentryNotNeeded,

    // Access
    /// Attribute not carried by the current event kind.
    #[error("not supported by this event")]
    NotSupportedByEvent,

    /// Attribute read while no event is being dispatched.
    #[error("access from outside")]
    OutsideEvent,

    // Raised
    /// Language-level exception.
    #[error("{0}")]
    Raised(Exception),
}

impl EmberError {
    /// Shorthand for a raised exception.
    pub fn raise(class: &str, message: &str) -> Self {
        EmberError::Raised(Exception::new(class, message))
    }

    /// Category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            EmberError::MixedEventKinds
            | EmberError::UnknownEvent(_)
            | EmberError::LineFilterWithoutLineEvent
            | EmberError::LineFilterWithoutTarget
            | EmberError::UnsupportedTarget
            | EmberError::NotCallable { .. } => ErrorKind::Configuration,
            EmberError::NestedTargetedEnable
            | EmberError::ThreadFilterOverride
            | EmberError::TargetedDisableInBlock
            | EmberError::NoHooksAttached
            | EmberError::ReentryNotNeeded => ErrorKind::State,
            EmberError::NotSupportedByEvent | EmberError::OutsideEvent => ErrorKind::Access,
            EmberError::Raised(_) => ErrorKind::Raised,
        }
    }

    /// The raised exception, if this error carries one.
    pub fn exception(&self) -> Option<&Exception> {
        match self {
            EmberError::Raised(exc) => Some(exc),
            _ => None,
        }
    }

    /// Language-level exception equivalent of this error.
    pub fn to_exception(&self) -> Exception {
        match self {
            EmberError::Raised(exc) => exc.clone(),
            EmberError::NotCallable { .. } => Exception::new("TypeError", &self.to_string()),
            EmberError::ReentryNotNeeded
            | EmberError::OutsideEvent
            | EmberError::NotSupportedByEvent => Exception::new("RuntimeError", &self.to_string()),
            _ => Exception::new("ArgumentError", &self.to_string()),
        }
    }
}

impl From<Exception> for EmberError {
    fn from(exc: Exception) -> Self {
        EmberError::Raised(exc)
    }
}
