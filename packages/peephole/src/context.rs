use std::num::NonZero;
use std::sync::Arc;

use crate::pal::PlatformFacade;
use crate::registry::InstrumentationRegistry;
use crate::tracer::TraceHub;
use crate::{
    AllocationProfiler, BenchmarkRunner, Collector, ContextBuilder, DebugIoToggle, Environment,
    ExecutionTracer, InstrumentationToken, MethodInterceptor, MethodTable, Notifications, Output,
    QueryEventLogger, Result, SubscriptionId, Target,
};

/// Owns all instrumentation state of one debugging session.
///
/// Method tables, interceptions, trace sessions and subscriptions created through a context
/// only ever see the activity of that context. Two contexts never observe each other, which
/// allows independent sessions (for example in parallel tests) in the same process. The
/// allocation counters of [`Allocator`][crate::Allocator] are the one process-wide exception.
///
/// The context is a cheaply cloneable handle. Clones share the same state.
///
/// # Examples
///
/// ```
/// use peephole::{InstrumentationContext, Output};
///
/// let output = Output::capture();
/// let context = InstrumentationContext::builder().output(output.clone()).build();
///
/// let table = context.method_table("Greeter");
/// let greet = table.define("greet", |_: &(), name: &'static str| format!("hello {name}"));
///
/// let interception = context
///     .interceptor()
///     .count_method_calls::<(), &'static str, String>(&table, "greet")?;
///
/// assert_eq!(greet.call(&(), "world"), "hello world");
/// assert_eq!(output.lines(), vec!["Greeter#greet called 1 times"]);
///
/// context.unregister(interception.token())?;
/// assert!(!context.is_instrumented(greet.target()));
/// # Ok::<(), peephole::Error>(())
/// ```
#[derive(Clone, Debug)]
pub struct InstrumentationContext {
    inner: Arc<ContextInner>,
}

#[derive(Debug)]
struct ContextInner {
    environment: Environment,
    output: Output,
    stack_depth: NonZero<usize>,
    collector: Arc<dyn Collector>,
    platform: PlatformFacade,

    registry: Arc<InstrumentationRegistry>,
    hub: TraceHub,
    notifications: Notifications,
    debug_io: DebugIoToggle,
}

impl InstrumentationContext {
    /// Creates a context with default configuration.
    ///
    /// Use [`builder()`](Self::builder) to customize the configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Starts configuring a new context.
    pub fn builder() -> ContextBuilder {
        ContextBuilder::new()
    }

    pub(crate) fn from_parts(
        environment: Environment,
        output: Output,
        stack_depth: NonZero<usize>,
        collector: Arc<dyn Collector>,
        platform: PlatformFacade,
    ) -> Self {
        let debug_io = DebugIoToggle::new(environment, output.clone());

        Self {
            inner: Arc::new(ContextInner {
                environment,
                output,
                stack_depth,
                collector,
                platform,
                registry: Arc::new(InstrumentationRegistry::new()),
                hub: TraceHub::new(),
                notifications: Notifications::new(),
                debug_io,
            }),
        }
    }

    /// The deployment environment the context was configured with.
    #[must_use]
    pub fn environment(&self) -> Environment {
        self.inner.environment
    }

    /// Where the instrumentation of this context prints its reports.
    #[must_use]
    pub fn output(&self) -> &Output {
        &self.inner.output
    }

    /// How many innermost frames of a call stack are printed.
    #[must_use]
    pub fn stack_depth(&self) -> NonZero<usize> {
        self.inner.stack_depth
    }

    #[cfg(test)]
    pub(crate) fn collector(&self) -> &Arc<dyn Collector> {
        &self.inner.collector
    }

    /// Creates an empty method table for the named owner.
    ///
    /// Calls dispatched through the table are visible to the tracer of this context.
    #[must_use]
    pub fn method_table(&self, owner: &str) -> MethodTable {
        MethodTable::new(owner, self.inner.hub.clone())
    }

    /// Wraps methods to observe their calls.
    #[must_use]
    pub fn interceptor(&self) -> MethodInterceptor {
        MethodInterceptor::new(
            Arc::clone(&self.inner.registry),
            self.inner.output.clone(),
        )
    }

    /// Reports method calls, returns and tracepoints as they happen.
    #[must_use]
    pub fn tracer(&self) -> ExecutionTracer {
        ExecutionTracer::new(
            self.inner.hub.clone(),
            self.inner.output.clone(),
            self.inner.stack_depth,
        )
    }

    /// Measures allocator activity and resident memory of a block of code.
    #[must_use]
    pub fn allocation_profiler(&self) -> AllocationProfiler {
        AllocationProfiler::new(
            Arc::clone(&self.inner.collector),
            self.inner.output.clone(),
            self.inner.platform.clone(),
        )
    }

    /// The named event channels of this context.
    #[must_use]
    pub fn notifications(&self) -> &Notifications {
        &self.inner.notifications
    }

    /// Prints events published on the channels of this context.
    #[must_use]
    pub fn query_logger(&self) -> QueryEventLogger {
        QueryEventLogger::new(
            self.inner.notifications.clone(),
            self.inner.output.clone(),
        )
    }

    /// Compares the wall-clock cost of operations.
    #[must_use]
    pub fn benchmark_runner(&self) -> BenchmarkRunner {
        BenchmarkRunner::new(self.inner.output.clone())
    }

    /// Switches transport tracing of network client classes.
    #[must_use]
    pub fn debug_io(&self) -> &DebugIoToggle {
        &self.inner.debug_io
    }

    /// Detaches the observer identified by the token. When it was the last observer of its
    /// method, the original implementation is put back.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownToken`][crate::Error::UnknownToken] if the token was already
    /// used, belongs to another context or the method was redefined after it was wrapped.
    pub fn unregister(&self, token: &InstrumentationToken) -> Result<()> {
        self.inner.registry.unregister(token)
    }

    /// Cancels a subscription to the event channels. Returns whether it was still active.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.notifications.unsubscribe(id)
    }

    /// Reports a `Line` event attributed to the caller's source location.
    #[track_caller]
    pub fn tracepoint(&self, owner: &str, label: &str) {
        self.tracer().tracepoint(owner, label);
    }

    /// Whether the method is currently wrapped by an interception of this context.
    #[must_use]
    pub fn is_instrumented(&self, target: &Target) -> bool {
        self.inner.registry.is_instrumented(target)
    }

    /// All methods currently wrapped by interceptions of this context.
    #[must_use]
    pub fn instrumented_targets(&self) -> Vec<Target> {
        self.inner.registry.instrumented_targets()
    }
}

impl Default for InstrumentationContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;
    use crate::pal::MockPlatform;
    use crate::{Error, Payload, TraceEventKind, TraceFilter};

    static_assertions::assert_impl_all!(InstrumentationContext: Send, Sync, Clone);

    fn context() -> (InstrumentationContext, Output) {
        let output = Output::capture();
        let context = InstrumentationContext::builder()
            .environment(Environment::Test)
            .output(output.clone())
            .build();

        (context, output)
    }

    #[test]
    fn contexts_do_not_observe_each_other() {
        let (first, _) = context();
        let (second, second_output) = context();

        let table = first.method_table("Order");
        let save = table.define("save", |_: &(), (): ()| ());

        let _session = second.tracer().print_trace(TraceFilter::new());
        let _subscription = second.query_logger().log_queries();

        save.call(&(), ());
        first
            .notifications()
            .publish(crate::QUERY_CHANNEL, &Payload::new(), Duration::ZERO);

        assert!(second_output.lines().is_empty());
    }

    #[test]
    fn clones_share_state() {
        let (context, _) = context();
        let clone = context.clone();

        let table = context.method_table("Order");
        let save = table.define("save", |_: &(), (): ()| ());

        let interception = clone
            .interceptor()
            .track_time::<(), (), ()>(&table, "save")
            .unwrap();

        assert!(context.is_instrumented(save.target()));
        assert_eq!(context.instrumented_targets(), vec![save.target().clone()]);

        context.unregister(interception.token()).unwrap();

        assert!(!clone.is_instrumented(save.target()));
        assert!(matches!(
            clone.unregister(interception.token()),
            Err(Error::UnknownToken { .. })
        ));
    }

    #[test]
    fn tokens_of_another_context_are_rejected() {
        let (first, _) = context();
        let (second, _) = context();

        let orders = first.method_table("Order");
        let save = orders.define("save", |_: &(), (): ()| ());
        let invoices = second.method_table("Invoice");
        let total = invoices.define("total", |_: &(), (): ()| 0_u32);

        let first_interception = first
            .interceptor()
            .count_method_calls::<(), (), ()>(&orders, "save")
            .unwrap();
        let second_interception = second
            .interceptor()
            .count_method_calls::<(), (), u32>(&invoices, "total")
            .unwrap();

        assert!(matches!(
            second.unregister(first_interception.token()),
            Err(Error::UnknownToken { .. })
        ));

        assert!(second.is_instrumented(total.target()));
        assert!(first.is_instrumented(save.target()));

        total.call(&(), ());
        assert_eq!(second_interception.call_count(), 1);

        first.unregister(first_interception.token()).unwrap();
        assert!(!first.is_instrumented(save.target()));
    }

    #[test]
    fn tracepoint_reports_line_event_at_caller() {
        let (context, _) = context();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);

        let _session = context.tracer().enable(TraceFilter::new(), move |event, _| {
            seen_clone
                .lock()
                .unwrap()
                .push((event.kind(), event.file().to_owned()));
        });

        context.tracepoint("Checkout", "before_payment");

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, TraceEventKind::Line);
        assert_eq!(seen[0].1, file!());
    }

    #[test]
    fn unsubscribe_by_id() {
        let (context, output) = context();

        let subscription = context.query_logger().log_queries();

        assert!(context.unsubscribe(subscription.id()));
        assert!(!context.unsubscribe(subscription.id()));

        context.notifications().publish(
            crate::QUERY_CHANNEL,
            &Payload::new().with("sql", "SELECT 1"),
            Duration::ZERO,
        );

        assert!(output.lines().is_empty());
    }

    #[test]
    fn profiler_uses_configured_platform() {
        let mut platform = MockPlatform::new();
        platform
            .expect_process_status_contents()
            .returning(|| Some("VmRSS:\t    2048 kB\n".to_owned()));

        let context = InstrumentationContext::builder()
            .output(Output::capture())
            .platform(PlatformFacade::from_mock(platform))
            .build();

        assert_eq!(
            context.allocation_profiler().resident_memory_bytes().unwrap(),
            2048 * 1024
        );
    }

    #[test]
    fn debug_io_follows_environment() {
        let context = InstrumentationContext::builder()
            .environment(Environment::Production)
            .output(Output::capture())
            .build();

        assert!(context.debug_io().enable_debug("HttpClient").is_err());
    }
}
