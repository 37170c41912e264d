//! Trace points and trace functions observing scripts run by the
//! interpreter.

use ember_core::{EmberResult, EventFlags, Value};
use ember_vm::{
    set_trace_func, CodeKind, CodeUnit, DispatchTarget, EnableOptions, ExecutionContext,
    Interpreter, MethodBody, MethodEntry, Op, Proc, Runtime, TracePoint, TraceTarget,
};
use std::cell::RefCell;
use std::rc::Rc;

type Log = Rc<RefCell<Vec<String>>>;

fn top_unit() -> Rc<CodeUnit> {
    CodeUnit::builder(CodeKind::Top, "<main>", "app.rb", 20)
        .site(20, EventFlags::LINE)
        .site(21, EventFlags::LINE)
        .build()
}

fn compiled(name: &str, first_line: u32) -> Rc<MethodEntry> {
    let code = CodeUnit::builder(CodeKind::Method, name, "app.rb", first_line)
        .site(first_line, EventFlags::CALL)
        .site(first_line + 1, EventFlags::LINE)
        .site(first_line + 2, EventFlags::RETURN)
        .build();
    MethodEntry::new(name, Value::symbol("App"), MethodBody::Compiled(code))
}

fn native(name: &str) -> Rc<MethodEntry> {
    MethodEntry::new(name, Value::symbol("Kernel"), MethodBody::Native { arity: 0 })
}

/// A trace point that logs `event method depth`.
fn logging_tp(ec: &ExecutionContext, events: EventFlags) -> (TracePoint, Log) {
    let log: Log = Rc::default();
    let inner = Rc::clone(&log);
    let tp = TracePoint::new(
        ec,
        events,
        DispatchTarget::closure(move |ec, tp| {
            let name = tp.event_name(ec)?.unwrap_or("?");
            let method = tp.method_id(ec)?.map(|m| m.to_string()).unwrap_or_default();
            inner
                .borrow_mut()
                .push(format!("{name} {method} {}", ec.stack_depth()));
            Ok(())
        }),
    )
    .unwrap();
    (tp, log)
}

#[test]
fn test_call_chain_order() {
    let _ = env_logger::builder().is_test(true).try_init();
    let rt = Runtime::new();
    let ec = rt.main_context();
    let a = compiled("a", 1);
    let b = compiled("b", 5);
    let (tp, log) = logging_tp(&ec, EventFlags::CALL | EventFlags::RETURN);
    tp.enable(&ec, EnableOptions::default()).unwrap();

    let script = [Op::send(
        &a,
        Value::Nil,
        vec![Op::Line(2), Op::send(&b, Value::Nil, vec![Op::Line(6), Op::Push(Value::Int(7))])],
    )];
    let value = Interpreter::new(&ec).run(&top_unit(), &script).unwrap();

    assert_eq!(value, Value::Int(7));
    assert_eq!(*log.borrow(), ["call a 2", "call b 3", "return b 3", "return a 2"]);
    assert_eq!(ec.stack_depth(), 0);
}

#[test]
fn test_return_value_reported() {
    let rt = Runtime::new();
    let ec = rt.main_context();
    let a = compiled("a", 1);
    let seen: Rc<RefCell<Vec<Value>>> = Rc::default();
    let inner = Rc::clone(&seen);
    let tp = TracePoint::new(
        &ec,
        EventFlags::RETURN,
        DispatchTarget::closure(move |ec, tp| {
            inner.borrow_mut().push(tp.return_value(ec)?);
            Ok(())
        }),
    )
    .unwrap();
    tp.enable(&ec, EnableOptions::default()).unwrap();
    Interpreter::new(&ec)
        .run(&top_unit(), &[Op::send(&a, Value::Nil, vec![Op::Push(Value::str("done"))])])
        .unwrap();
    assert_eq!(*seen.borrow(), [Value::str("done")]);
}

#[test]
fn test_targeted_line_filter() {
    let rt = Runtime::new();
    let ec = rt.main_context();
    let code = CodeUnit::builder(CodeKind::Top, "<main>", "lines.rb", 2)
        .site(2, EventFlags::LINE)
        .site(3, EventFlags::LINE)
        .site(4, EventFlags::LINE)
        .build();
    let lines: Rc<RefCell<Vec<u32>>> = Rc::default();
    let inner = Rc::clone(&lines);
    let tp = TracePoint::new(
        &ec,
        EventFlags::LINE,
        DispatchTarget::closure(move |ec, tp| {
            inner.borrow_mut().push(tp.lineno(ec)?);
            Ok(())
        }),
    )
    .unwrap();
    tp.enable(&ec, EnableOptions::target(TraceTarget::Code(Rc::clone(&code))).line(3))
        .unwrap();
    assert!(rt.event_flags().is_empty());
    assert_eq!(rt.local_tracepoint_count(), 1);

    let script = [Op::Line(2), Op::Line(3), Op::Line(4)];
    Interpreter::new(&ec).run(&code, &script).unwrap();
    assert_eq!(*lines.borrow(), [3]);

    assert!(tp.disable(&ec));
    assert!(code.local_trace_events().is_empty());
    assert!(!code.local_hooks().is_attached());
    Interpreter::new(&ec).run(&code, &script).unwrap();
    assert_eq!(*lines.borrow(), [3]);
    assert_eq!(rt.local_tracepoint_count(), 0);
}

#[test]
fn test_block_defined_method_target() {
    let rt = Runtime::new();
    let ec = rt.main_context();
    let body = CodeUnit::builder(CodeKind::Block, "block in <main>", "app.rb", 30)
        .site(30, EventFlags::B_CALL)
        .site(31, EventFlags::LINE)
        .site(32, EventFlags::B_RETURN)
        .build();
    let method = MethodEntry::new("greet", Value::symbol("App"), MethodBody::BlockDefined(body));
    let (tp, log) = logging_tp(&ec, EventFlags::CALL | EventFlags::RETURN);
    tp.enable(&ec, EnableOptions::target(TraceTarget::Method(Rc::clone(&method))))
        .unwrap();

    Interpreter::new(&ec)
        .run(&top_unit(), &[Op::send(&method, Value::Nil, vec![Op::Line(31)])])
        .unwrap();
    assert_eq!(*log.borrow(), ["call greet 2", "return greet 2"]);

    // Another method sharing nothing with the target stays silent.
    let other = compiled("other", 40);
    Interpreter::new(&ec)
        .run(&top_unit(), &[Op::send(&other, Value::Nil, vec![])])
        .unwrap();
    assert_eq!(log.borrow().len(), 2);

    tp.disable(&ec);
    assert!(!method.hooks().is_attached());
}

#[test]
fn test_events_inside_hooks_are_dropped() {
    let rt = Runtime::new();
    let ec = rt.main_context();
    let inner_method = native("inner");
    let log: Log = Rc::default();
    let hook_log = Rc::clone(&log);
    let nested = Rc::clone(&inner_method);
    let tp = TracePoint::new(
        &ec,
        EventFlags::C_CALL,
        DispatchTarget::closure(move |ec, tp| {
            let method = tp.method_id(ec)?.map(|m| m.to_string()).unwrap_or_default();
            hook_log.borrow_mut().push(method.clone());
            if method == "outer" {
                Interpreter::new(ec).run(&top_unit(), &[Op::send(&nested, Value::Nil, vec![])])?;
            }
            Ok(())
        }),
    )
    .unwrap();
    tp.enable(&ec, EnableOptions::default()).unwrap();

    let outer = native("outer");
    Interpreter::new(&ec)
        .run(&top_unit(), &[Op::send(&outer, Value::Nil, vec![])])
        .unwrap();
    assert_eq!(*log.borrow(), ["outer"]);
}

#[test]
fn test_allow_reentry_observes_nested_events() {
    let rt = Runtime::new();
    let ec = rt.main_context();
    let inner_method = native("inner");
    let log: Log = Rc::default();
    let hook_log = Rc::clone(&log);
    let nested = Rc::clone(&inner_method);
    let tp = TracePoint::new(
        &ec,
        EventFlags::C_CALL,
        DispatchTarget::closure(move |ec, tp| {
            let method = tp.method_id(ec)?.map(|m| m.to_string()).unwrap_or_default();
            hook_log.borrow_mut().push(method.clone());
            if method == "outer" {
                TracePoint::allow_reentry(ec, |ec| {
                    Interpreter::new(ec).run(&top_unit(), &[Op::send(&nested, Value::Nil, vec![])])
                })?;
                // The outer event is active again.
                assert_eq!(tp.method_id(ec)?.map(|m| m.to_string()).as_deref(), Some("outer"));
            }
            Ok(())
        }),
    )
    .unwrap();
    tp.enable(&ec, EnableOptions::default()).unwrap();

    let outer = native("outer");
    Interpreter::new(&ec)
        .run(&top_unit(), &[Op::send(&outer, Value::Nil, vec![])])
        .unwrap();
    assert_eq!(*log.borrow(), ["outer", "inner"]);
}

#[test]
fn test_hook_error_propagates_and_restores_context() {
    let rt = Runtime::new();
    let ec = rt.main_context();
    let tp = TracePoint::new(
        &ec,
        EventFlags::C_RETURN,
        DispatchTarget::closure(|_, _| {
            Err(ember_core::EmberError::raise("RuntimeError", "from hook"))
        }),
    )
    .unwrap();
    tp.enable(&ec, EnableOptions::default()).unwrap();

    let puts = native("puts");
    let err = Interpreter::new(&ec)
        .run(&top_unit(), &[Op::send(&puts, Value::Nil, vec![])])
        .unwrap_err();
    assert_eq!(err.exception().map(|e| e.message()), Some("from hook"));
    assert_eq!(ec.stack_depth(), 0);
    assert!(!ec.has_trace_arg());
}

#[test]
fn test_legacy_trace_func_sees_script() {
    let rt = Runtime::new();
    let ec = rt.main_context();
    let log: Log = Rc::default();
    let inner = Rc::clone(&log);
    let trace = Proc::new(move |_, args: &[Value]| -> EmberResult<Value> {
        let event = args[0].as_str().unwrap_or("?").to_string();
        let line = args[2].as_int().unwrap_or(-1);
        inner.borrow_mut().push(format!("{event}:{line}"));
        Ok(Value::Nil)
    })
    .into_value();
    set_trace_func(&ec, &trace).unwrap();

    let puts = native("puts");
    Interpreter::new(&ec)
        .run(&top_unit(), &[Op::Line(21), Op::send(&puts, Value::Nil, vec![])])
        .unwrap();
    assert_eq!(*log.borrow(), ["line:21", "c-call:21", "c-return:21"]);

    set_trace_func(&ec, &Value::Nil).unwrap();
    Interpreter::new(&ec).run(&top_unit(), &[Op::Line(21)]).unwrap();
    assert_eq!(log.borrow().len(), 3);
}
