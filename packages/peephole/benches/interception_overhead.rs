//! Benchmarks to measure the cost that instrumentation adds to method dispatch.
//!
//! The baseline is a plain call through a method handle with nothing attached. The other
//! benchmarks add one layer of instrumentation each.

#![allow(
    missing_docs,
    reason = "No need for API documentation in benchmark code"
)]

use std::hint::black_box;

use criterion::{Criterion, criterion_group, criterion_main};
use peephole::{
    CallInfo, InstrumentationContext, InterceptOptions, OnCall, Output, TraceFilter,
};

criterion_group!(benches, entrypoint);
criterion_main!(benches);

fn entrypoint(c: &mut Criterion) {
    let mut group = c.benchmark_group("peephole_dispatch");

    let context = InstrumentationContext::builder()
        .output(Output::capture())
        .build();
    let table = context.method_table("Math");
    let double = table.define("double", |_: &(), value: u64| value.wrapping_mul(2));

    group.bench_function("plain_call", |b| {
        b.iter(|| black_box(double.call(&(), black_box(21))));
    });

    {
        let interception = context
            .interceptor()
            .intercept::<(), u64, u64, _>(
                &table,
                "double",
                OnCall::new(|_: &CallInfo<'_>, _: &(), value: &u64| {
                    black_box(value);
                }),
                InterceptOptions::new(),
            )
            .unwrap();

        group.bench_function("intercepted_call", |b| {
            b.iter(|| black_box(double.call(&(), black_box(21))));
        });

        interception.restore().unwrap();
    }

    {
        // Matches nothing, so this measures only the event bookkeeping.
        let _session = context
            .tracer()
            .enable(TraceFilter::new().owner("Nobody"), |_, _| {});

        group.bench_function("traced_call", |b| {
            b.iter(|| black_box(double.call(&(), black_box(21))));
        });
    }

    group.bench_function("tracepoint_inactive", |b| {
        b.iter(|| context.tracepoint("Math", "checkpoint"));
    });

    group.finish();
}
