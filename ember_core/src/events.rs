//! Event kinds.
//!
//! Each event kind is one bit. Regular events occupy the low half-word and
//! are the ones trace points and legacy trace functions observe; internal
//! events (allocation, GC phases) occupy the high half-word and are only
//! available to native subscribers.

use crate::error::{EmberError, EmberResult};
use bitflags::bitflags;

bitflags! {
    /// A set of event kinds.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct EventFlags: u32 {
        /// A new line of code starts executing.
        const LINE            = 0x0001;
        /// A class or module body starts.
        const CLASS           = 0x0002;
        /// A class or module body ends.
        const END             = 0x0004;
        /// A language-level method is called.
        const CALL            = 0x0008;
        /// A language-level method returns.
        const RETURN          = 0x0010;
        /// A native method is called.
        const C_CALL          = 0x0020;
        /// A native method returns.
        const C_RETURN        = 0x0040;
        /// An exception is raised.
        const RAISE           = 0x0080;
        /// A block starts.
        const B_CALL          = 0x0100;
        /// A block ends.
        const B_RETURN        = 0x0200;
        /// A thread starts.
        const THREAD_BEGIN    = 0x0400;
        /// A thread ends.
        const THREAD_END      = 0x0800;
        /// Control switches to another fiber.
        const FIBER_SWITCH    = 0x1000;
        /// Source code was compiled at runtime.
        const SCRIPT_COMPILED = 0x2000;
        /// An exception is rescued.
        const RESCUE          = 0x4000;

        /// An object was allocated.
        const NEWOBJ          = 0x0010_0000;
        /// An object was freed.
        const FREEOBJ         = 0x0020_0000;
        /// A GC cycle starts.
        const GC_START        = 0x0040_0000;
        /// A GC cycle finished marking.
        const GC_END_MARK     = 0x0080_0000;
        /// A GC cycle finished sweeping.
        const GC_END_SWEEP    = 0x0100_0000;
    }
}

impl EventFlags {
    /// Events seen by legacy trace functions.
    pub const ALL: EventFlags = EventFlags::from_bits_retain(0x00ff);

    /// Every regular event.
    pub const TRACEPOINT_ALL: EventFlags = EventFlags::from_bits_retain(0xffff);

    /// Every internal event bit.
    pub const INTERNAL: EventFlags = EventFlags::from_bits_retain(0xffff_0000);

    /// Any call.
    pub const A_CALL: EventFlags = EventFlags::CALL
        .union(EventFlags::B_CALL)
        .union(EventFlags::C_CALL);

    /// Any return.
    pub const A_RETURN: EventFlags = EventFlags::RETURN
        .union(EventFlags::B_RETURN)
        .union(EventFlags::C_RETURN);

    /// Events that require decorating compiled code units.
    pub const CODE_EVENTS: EventFlags = EventFlags::LINE
        .union(EventFlags::CLASS)
        .union(EventFlags::END)
        .union(EventFlags::CALL)
        .union(EventFlags::RETURN)
        .union(EventFlags::C_CALL)
        .union(EventFlags::C_RETURN)
        .union(EventFlags::B_CALL)
        .union(EventFlags::B_RETURN)
        .union(EventFlags::RESCUE);

    /// Parse a trace point event name.
    pub fn parse_name(name: &str) -> EmberResult<EventFlags> {
        let flags = match name {
            "line" => EventFlags::LINE,
            "class" => EventFlags::CLASS,
            "end" => EventFlags::END,
            "call" => EventFlags::CALL,
            "return" => EventFlags::RETURN,
            "c_call" => EventFlags::C_CALL,
            "c_return" => EventFlags::C_RETURN,
            "raise" => EventFlags::RAISE,
            "b_call" => EventFlags::B_CALL,
            "b_return" => EventFlags::B_RETURN,
            "thread_begin" => EventFlags::THREAD_BEGIN,
            "thread_end" => EventFlags::THREAD_END,
            "fiber_switch" => EventFlags::FIBER_SWITCH,
            "script_compiled" => EventFlags::SCRIPT_COMPILED,
            "rescue" => EventFlags::RESCUE,
            "a_call" => EventFlags::A_CALL,
            "a_return" => EventFlags::A_RETURN,
            _ => return Err(EmberError::UnknownEvent(name.to_owned())),
        };
        Ok(flags)
    }

    /// Name of a single event kind, as trace points report it.
    pub fn event_name(self) -> Option<&'static str> {
        EVENT_NAMES
            .iter()
            .find(|(flag, _)| *flag == self)
            .map(|(_, name)| *name)
    }

    /// Name passed to legacy trace functions.
    pub fn legacy_name(self) -> &'static str {
        if self.intersects(EventFlags::ALL) && self.bits().is_power_of_two() {
            if self == EventFlags::C_CALL {
                return "c-call";
            }
            if self == EventFlags::C_RETURN {
                return "c-return";
            }
            if let Some(name) = self.event_name() {
                return name;
            }
        }
        "unknown"
    }

    /// Whether any bit is an internal event.
    #[inline]
    pub const fn is_internal(self) -> bool {
        self.intersects(EventFlags::INTERNAL)
    }

    /// Whether the set mixes internal and regular events.
    #[inline]
    pub const fn mixes_internal(self) -> bool {
        self.is_internal() && self.intersects(EventFlags::INTERNAL.complement())
    }

    /// The part of the set that needs code-unit decoration.
    #[inline]
    pub const fn code_events(self) -> EventFlags {
        self.intersection(EventFlags::CODE_EVENTS)
    }
}

const EVENT_NAMES: &[(EventFlags, &str)] = &[
    (EventFlags::LINE, "line"),
    (EventFlags::CLASS, "class"),
    (EventFlags::END, "end"),
    (EventFlags::CALL, "call"),
    (EventFlags::RETURN, "return"),
    (EventFlags::C_CALL, "c_call"),
    (EventFlags::C_RETURN, "c_return"),
    (EventFlags::RAISE, "raise"),
    (EventFlags::B_CALL, "b_call"),
    (EventFlags::B_RETURN, "b_return"),
    (EventFlags::THREAD_BEGIN, "thread_begin"),
    (EventFlags::THREAD_END, "thread_end"),
    (EventFlags::FIBER_SWITCH, "fiber_switch"),
    (EventFlags::SCRIPT_COMPILED, "script_compiled"),
    (EventFlags::RESCUE, "rescue"),
    (EventFlags::NEWOBJ, "newobj"),
    (EventFlags::FREEOBJ, "freeobj"),
    (EventFlags::GC_START, "gc_start"),
    (EventFlags::GC_END_MARK, "gc_end_mark"),
    (EventFlags::GC_END_SWEEP, "gc_end_sweep"),
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bit_values() {
        assert_eq!(EventFlags::LINE.bits(), 0x01);
        assert_eq!(EventFlags::RAISE.bits(), 0x80);
        assert_eq!(EventFlags::RESCUE.bits(), 0x4000);
        assert_eq!(EventFlags::NEWOBJ.bits(), 0x10_0000);
        assert_eq!(EventFlags::ALL.bits(), 0xff);
    }

    #[test]
    fn test_parse_names() {
        assert_eq!(EventFlags::parse_name("c_call").ok(), Some(EventFlags::C_CALL));
        assert_eq!(
            EventFlags::parse_name("a_call").ok(),
            Some(EventFlags::CALL | EventFlags::B_CALL | EventFlags::C_CALL)
        );
        assert_eq!(
            EventFlags::parse_name("foo"),
            Err(EmberError::UnknownEvent("foo".to_owned()))
        );
    }

    #[test]
    fn test_names_round_trip_for_regular_events() {
        for (flag, name) in EVENT_NAMES.iter().filter(|(f, _)| !f.is_internal()) {
            assert_eq!(flag.event_name(), Some(*name));
            assert_eq!(EventFlags::parse_name(name).unwrap(), *flag);
        }
    }

    #[test]
    fn test_legacy_names() {
        assert_eq!(EventFlags::C_RETURN.legacy_name(), "c-return");
        assert_eq!(EventFlags::B_CALL.legacy_name(), "unknown");
    }

    #[test]
    fn test_mixing() {
        assert!(!EventFlags::LINE.mixes_internal());
        assert!(!EventFlags::NEWOBJ.mixes_internal());
        assert!((EventFlags::NEWOBJ | EventFlags::LINE).mixes_internal());
        assert!(EventFlags::FREEOBJ.is_internal());
        assert!(!EventFlags::TRACEPOINT_ALL.is_internal());
    }

    #[test]
    fn test_code_events() {
        let ev = EventFlags::LINE | EventFlags::RAISE | EventFlags::THREAD_BEGIN;
        assert_eq!(ev.code_events(), EventFlags::LINE);
        assert!(EventFlags::CODE_EVENTS.contains(EventFlags::RESCUE));
    }
}
