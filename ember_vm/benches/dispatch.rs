//! Event Dispatch Benchmarks
//!
//! Measures what an event costs when nothing observes it, when one global
//! hook observes it, and when a trace point targets a single code unit.
//!
//! # Benchmark Categories
//!
//! 1. **Disabled**: emit with an empty global list
//! 2. **Global Hook**: one decoded hook on the global list
//! 3. **Hook Count**: dispatch cost as the global list grows
//! 4. **Targeted Trace Point**: line events through a code unit's local list

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use ember_core::{EventFlags, Value};
use ember_vm::{
    CodeKind, CodeUnit, DispatchTarget, EnableOptions, EventOccurrence, Frame, FrameKind, HookFn,
    Runtime, TracePoint, TraceTarget,
};
use std::cell::Cell;
use std::rc::Rc;

// =============================================================================
// Benchmark Helpers
// =============================================================================

fn line_unit() -> Rc<CodeUnit> {
    CodeUnit::builder(CodeKind::Method, "hot", "bench.rb", 1)
        .site(1, EventFlags::LINE)
        .site(2, EventFlags::LINE)
        .build()
}

fn counting_hook(counter: &Rc<Cell<u64>>) -> HookFn {
    let counter = Rc::clone(counter);
    HookFn::decoded(move |_, _| {
        counter.set(counter.get() + 1);
        Ok(())
    })
}

// =============================================================================
// Dispatch Benchmarks
// =============================================================================

fn bench_disabled(c: &mut Criterion) {
    let rt = Runtime::new();
    let ec = rt.main_context();
    c.bench_function("emit_disabled", |b| {
        b.iter(|| {
            rt.emit(&ec, EventOccurrence::new(black_box(EventFlags::LINE), Value::Nil))
                .unwrap()
        })
    });
}

fn bench_global_hook(c: &mut Criterion) {
    let rt = Runtime::new();
    let ec = rt.main_context();
    let counter = Rc::new(Cell::new(0));
    rt.add_event_hook(counting_hook(&counter), EventFlags::CALL, Value::Nil)
        .unwrap();
    c.bench_function("emit_global_hook", |b| {
        b.iter(|| {
            rt.emit(&ec, EventOccurrence::new(black_box(EventFlags::CALL), Value::Nil))
                .unwrap()
        })
    });
    black_box(counter.get());
}

fn bench_hook_count(c: &mut Criterion) {
    let mut group = c.benchmark_group("emit_hook_count");
    for count in [1usize, 4, 16, 64] {
        let rt = Runtime::new();
        let ec = rt.main_context();
        let counter = Rc::new(Cell::new(0));
        for _ in 0..count {
            rt.add_event_hook(counting_hook(&counter), EventFlags::LINE, Value::Nil)
                .unwrap();
        }
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, _| {
            b.iter(|| {
                rt.emit(&ec, EventOccurrence::new(EventFlags::LINE, Value::Nil))
                    .unwrap()
            })
        });
    }
    group.finish();
}

fn bench_targeted(c: &mut Criterion) {
    let rt = Runtime::new();
    let ec = rt.main_context();
    let code = line_unit();
    rt.register_code(&code);
    let frame = Frame::new(FrameKind::Method, Some(Rc::clone(&code)), None, Value::Nil, None);
    frame.set_line(2);
    ec.push_frame(frame);

    let target = DispatchTarget::closure(|_, _| Ok(()));
    let tp = TracePoint::new(&ec, EventFlags::LINE, target).unwrap();
    tp.enable(&ec, EnableOptions::target(TraceTarget::Code(code)).line(2))
        .unwrap();
    c.bench_function("emit_targeted_line", |b| {
        b.iter(|| {
            rt.emit(&ec, EventOccurrence::new(EventFlags::LINE, Value::Nil))
                .unwrap()
        })
    });
    tp.disable(&ec);
}

criterion_group!(benches, bench_disabled, bench_global_hook, bench_hook_count, bench_targeted);
criterion_main!(benches);
