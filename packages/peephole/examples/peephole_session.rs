//! A short interactive debugging session against a toy order service.
//!
//! Run with `cargo run --example peephole_session` to see the instrumentation output on stdout
//! and the internal diagnostics of the package on stderr.

use std::io;
use std::num::NonZero;
use std::thread;
use std::time::Duration;

use peephole::{
    AllocationCategory, Allocator, Environment, InstrumentationContext, Payload, QUERY_CHANNEL,
    Scope, TraceFilter,
};

#[global_allocator]
static ALLOCATOR: Allocator<std::alloc::System> = Allocator::system();

#[derive(Debug)]
struct Order {
    id: u32,
    lines: Vec<u32>,
}

fn main() -> Result<(), peephole::Error> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_writer(io::stderr)
        .init();

    let context = InstrumentationContext::builder()
        .environment(Environment::Development)
        .stack_depth(NonZero::new(3).unwrap())
        .build();

    let notifications = context.notifications().clone();
    let orders = context.method_table("Order");

    let total = orders.define("total", |order: &Order, (): ()| order.lines.iter().sum::<u32>());
    let save = orders.define("save", move |order: &Order, (): ()| {
        if order.lines.is_empty() {
            return Err(format!("order {} has no lines", order.id));
        }

        notifications.instrument(
            QUERY_CHANNEL,
            Payload::new().with("sql", format!("INSERT INTO orders VALUES ({})", order.id)),
            || thread::sleep(Duration::from_millis(2)),
        );

        Ok(order.id)
    });

    println!("--- counting calls");
    let counting = context
        .interceptor()
        .count_method_calls::<Order, (), Result<u32, String>>(&orders, "save")?;
    let arguments = context
        .interceptor()
        .track_method_calls::<Order, (), Result<u32, String>>(&orders, "save")?;

    let queries = context.query_logger().log_queries();

    for order in [
        Order { id: 1, lines: vec![10, 20] },
        Order { id: 2, lines: vec![] },
    ] {
        if let Err(error) = save.call(&order, ()) {
            println!("save failed: {error}");
        }
    }

    println!("save was called {} times", counting.call_count());
    arguments.restore()?;
    counting.restore()?;
    queries.cancel();

    println!("--- tracing");
    {
        let _trace = context.tracer().print_trace(TraceFilter::new().owner("Order"));
        total.call(&Order { id: 3, lines: vec![1, 2, 3] }, ());
        context.tracepoint("Order", "after_total");
    }

    println!("--- allocations");
    let measurement = context
        .allocation_profiler()
        .measure(|| (0..1000).map(Box::new).collect::<Vec<_>>());
    println!(
        "{} allocations on this thread",
        measurement
            .report()
            .get(Scope::Thread, AllocationCategory::Allocations)
    );

    println!("--- benchmark");
    let large = Order {
        id: 4,
        lines: (0..1000).collect(),
    };
    let manual_total = orders.define("manual_total", |order: &Order, (): ()| {
        let mut sum = 0_u32;
        for line in &order.lines {
            sum = sum.wrapping_add(*line);
        }
        sum
    });
    let total = orders.method::<Order, (), u32>("total")?;

    context.benchmark_runner().compare_methods(
        NonZero::new(1000).unwrap(),
        &large,
        &(),
        &[&total, &manual_total],
    );

    Ok(())
}
