#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! Opt-in runtime instrumentation for interactive debugging of a live process.
//!
//! The package observes what a process does (method calls, structured events, allocations,
//! memory and timing) by wrapping and unwrapping behavior at runtime, without changing the
//! source of the observed code. Every change it makes returns a handle that reverses it.
//!
//! All state lives in an [`InstrumentationContext`]. The context hands out the individual
//! tools:
//!
//! - [`MethodTable`] - the runtime dispatch table that observed code routes its calls through.
//!   Each defined method is called through a typed [`MethodHandle`].
//! - [`MethodInterceptor`] - wraps a method so each call is observed before it is delegated to
//!   the original implementation.
//! - [`ExecutionTracer`] - reports call, return and line events that match a filter, with
//!   their source location and call stack, and watches values for changes.
//! - [`AllocationProfiler`] - reports the allocator activity and resident memory change of a
//!   block of code.
//! - [`QueryEventLogger`] - prints events published on named [`Notifications`] channels.
//! - [`BenchmarkRunner`] - compares the wall-clock cost of operations.
//! - [`DebugIoToggle`] - attaches transport tracing to newly created network clients.
//!
//! This package is a development tool. The operations that are unsafe to perform in a
//! production deployment refuse to run in [`Environment::Production`].
//!
//! # Intercepting a method
//!
//! ```
//! use peephole::{InstrumentationContext, Output};
//!
//! #[derive(Debug)]
//! struct Order {
//!     total: u32,
//! }
//!
//! let output = Output::capture();
//! let context = InstrumentationContext::builder().output(output.clone()).build();
//!
//! let orders = context.method_table("Order");
//! let save = orders.define("save", |order: &Order, (): ()| {
//!     if order.total == 0 {
//!         Err("empty order".to_string())
//!     } else {
//!         Ok(order.total)
//!     }
//! });
//!
//! let interception = context
//!     .interceptor()
//!     .count_method_calls::<Order, (), Result<u32, String>>(&orders, "save")?;
//!
//! assert_eq!(save.call(&Order { total: 10 }, ()), Ok(10));
//! assert!(save.call(&Order { total: 0 }, ()).is_err());
//!
//! assert_eq!(interception.call_count(), 2);
//! assert_eq!(output.lines().last().unwrap(), "Order#save called 2 times");
//!
//! interception.restore()?;
//! # Ok::<(), peephole::Error>(())
//! ```
//!
//! # Counting allocations
//!
//! Allocation counters are only fed when [`Allocator`] is the global allocator:
//!
//! ```
//! use peephole::{AllocationCategory, Allocator, InstrumentationContext, Scope};
//!
//! #[global_allocator]
//! static ALLOCATOR: Allocator<std::alloc::System> = Allocator::system();
//!
//! fn main() {
//!     let context = InstrumentationContext::new();
//!
//!     let measurement = context
//!         .allocation_profiler()
//!         .measure(|| (0..100).map(Box::new).collect::<Vec<_>>());
//!
//!     assert!(
//!         measurement
//!             .report()
//!             .get(Scope::Thread, AllocationCategory::Allocations)
//!             >= 100
//!     );
//! }
//! ```
//!
//! # Miri compatibility
//!
//! Miri replaces the global allocator with its own logic, so allocation counting does not work
//! under Miri.

mod allocator;
mod attribute_watch;
mod benchmark;
mod collector;
mod context;
mod context_builder;
mod debug_io;
mod environment;
mod error;
mod interceptor;
mod method;
mod notifications;
mod observers;
mod output;
mod pal;
mod profiler;
mod query_logger;
mod record;
mod registry;
mod shield;
mod target;
mod tracer;

pub use allocator::Allocator;
pub use benchmark::*;
pub use collector::*;
pub use context::*;
pub use context_builder::*;
pub use debug_io::*;
pub use environment::*;
pub use error::*;
pub use interceptor::*;
pub use method::{MethodHandle, MethodTable};
pub use notifications::*;
pub use output::*;
pub use profiler::*;
pub use query_logger::*;
pub use record::{CallLogEntry, InterceptionRecord};
pub use registry::InstrumentationToken;
pub use target::*;
pub use tracer::{
    CallStack, ExecutionTracer, Frame, TraceEvent, TraceEventKind, TraceFilter, TraceSession,
};

// A poisoned lock means the process is in an unrecoverable/unsafe state and must exit (we panic).
pub(crate) const ERR_POISONED_LOCK: &str = "encountered poisoned lock - continued execution \
    is not safe because we can no longer ensure that we uphold security and privacy guarantees";
