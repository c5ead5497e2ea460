//! Observation of method calls by wrapping method implementations.

use std::any::Any;
use std::fmt::{self, Debug};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use tracing::debug;

use crate::method::{Implementation, MethodSlot, signature};
use crate::observers::{ArgumentLogger, CallCounter, CallTimer};
use crate::registry::{Instrumentation, InstrumentationRegistry};
use crate::shield::shielded;
use crate::{Error, InstrumentationToken, InterceptionRecord, MethodTable, Output, Result, Target};

/// Describes the intercepted call an observer is notified about.
#[derive(Clone, Copy, Debug)]
pub struct CallInfo<'a> {
    target: &'a Target,
    call_number: u64,
}

impl<'a> CallInfo<'a> {
    pub(crate) fn new(target: &'a Target, call_number: u64) -> Self {
        Self {
            target,
            call_number,
        }
    }

    /// The intercepted method.
    #[must_use]
    pub fn target(&self) -> &Target {
        self.target
    }

    /// The 1-based sequence number of this call since the method was wrapped.
    #[must_use]
    pub fn call_number(&self) -> u64 {
        self.call_number
    }
}

/// Receives notifications about calls of an intercepted method.
///
/// Observers run synchronously on the calling thread, possibly on several threads at once.
/// A panic in an observer is logged and does not affect the call.
pub trait CallObserver<S, A, R>: Send + Sync + 'static {
    /// Called before the original implementation runs.
    fn on_call(&self, call: &CallInfo<'_>, receiver: &S, args: &A) {
        _ = (call, receiver, args);
    }

    /// Called after the original implementation returned. Not called if it panicked.
    fn on_return(&self, call: &CallInfo<'_>, result: &R, elapsed: Duration) {
        _ = (call, result, elapsed);
    }
}

/// Adapts a closure into an observer that runs before each call.
#[derive(derive_more::Debug)]
pub struct OnCall<F>(#[debug(ignore)] F);

impl<F> OnCall<F> {
    /// Wraps the closure.
    #[must_use]
    pub fn new(callback: F) -> Self {
        Self(callback)
    }
}

impl<S, A, R, F> CallObserver<S, A, R> for OnCall<F>
where
    F: Fn(&CallInfo<'_>, &S, &A) + Send + Sync + 'static,
{
    fn on_call(&self, call: &CallInfo<'_>, receiver: &S, args: &A) {
        (self.0)(call, receiver, args);
    }
}

/// Adapts a closure into an observer that runs after each call.
#[derive(derive_more::Debug)]
pub struct OnReturn<F>(#[debug(ignore)] F);

impl<F> OnReturn<F> {
    /// Wraps the closure.
    #[must_use]
    pub fn new(callback: F) -> Self {
        Self(callback)
    }
}

impl<S, A, R, F> CallObserver<S, A, R> for OnReturn<F>
where
    F: Fn(&CallInfo<'_>, &R, Duration) + Send + Sync + 'static,
{
    fn on_return(&self, call: &CallInfo<'_>, result: &R, elapsed: Duration) {
        (self.0)(call, result, elapsed);
    }
}

/// Options for [`MethodInterceptor::intercept()`].
#[derive(Clone, Copy, Debug, Default)]
#[must_use]
pub struct InterceptOptions {
    compose: bool,
    log_calls: bool,
}

impl InterceptOptions {
    /// Default options: fail if the method is already wrapped, no call log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends the observer to the existing observers if the method is already wrapped,
    /// instead of failing with [`Error::AlreadyInstrumented`].
    pub fn compose(mut self) -> Self {
        self.compose = true;
        self
    }

    /// Keeps a per-call log of arguments and durations in the [`InterceptionRecord`].
    ///
    /// Only takes effect when the method is not wrapped yet. Composed observers share the
    /// record of the first one.
    pub fn log_calls(mut self) -> Self {
        self.log_calls = true;
        self
    }
}

struct ChainLink<S, A, R> {
    token: u64,
    observer: Arc<dyn CallObserver<S, A, R>>,
}

impl<S, A, R> Clone for ChainLink<S, A, R> {
    fn clone(&self) -> Self {
        Self {
            token: self.token,
            observer: Arc::clone(&self.observer),
        }
    }
}

type ObserverChain<S, A, R> = ArcSwap<Vec<ChainLink<S, A, R>>>;

/// A method slot whose implementation has been replaced by an observing wrapper.
struct WrappedMethod<S, A, R> {
    slot: Arc<MethodSlot<S, A, R>>,
    original: Arc<Implementation<S, A, R>>,
    wrapper: Arc<Implementation<S, A, R>>,
    generation: u64,
    observers: Arc<ObserverChain<S, A, R>>,
    record: Arc<InterceptionRecord>,
}

impl<S, A, R> WrappedMethod<S, A, R>
where
    S: 'static,
    A: Debug + 'static,
    R: 'static,
{
    fn wrap(slot: Arc<MethodSlot<S, A, R>>, first: ChainLink<S, A, R>, log_calls: bool) -> Self {
        let observers = Arc::new(ArcSwap::from_pointee(vec![first]));
        let record = Arc::new(InterceptionRecord::new(slot.target().clone(), log_calls));

        // A redefinition between the snapshot and the swap means the wrapper would call a
        // body that is no longer installed, so take a new snapshot and build it again.
        loop {
            let (original, generation) = slot.snapshot();
            let wrapper = Arc::new(Self::wrapper(
                Arc::clone(&original),
                Arc::clone(&observers),
                Arc::clone(&record),
            ));

            if slot.replace_if_current(generation, &original, Arc::clone(&wrapper)) {
                return Self {
                    slot,
                    original,
                    wrapper,
                    generation,
                    observers,
                    record,
                };
            }

            debug!(method = %slot.target(), "method changed while wrapping, retrying");
        }
    }

    fn wrapper(
        original: Arc<Implementation<S, A, R>>,
        observers: Arc<ObserverChain<S, A, R>>,
        record: Arc<InterceptionRecord>,
    ) -> Implementation<S, A, R> {
        Implementation::new(move |receiver: &S, args: A| {
            let call = record.begin_call(&args);
            let info = CallInfo::new(record.target(), call.call_number());

            let chain = observers.load_full();

            for link in chain.iter() {
                shielded("on_call", info.target, || {
                    link.observer.on_call(&info, receiver, &args);
                });
            }

            let started = Instant::now();
            let result = original.call(receiver, args);
            let elapsed = started.elapsed();

            call.finish(elapsed);

            for link in chain.iter() {
                shielded("on_return", info.target, || {
                    link.observer.on_return(&info, &result, elapsed);
                });
            }

            result
        })
    }

    fn push(&self, link: ChainLink<S, A, R>) {
        self.observers.rcu(|chain| {
            let mut next = Vec::clone(chain);
            next.push(link.clone());
            next
        });
    }
}

impl<S, A, R> Debug for WrappedMethod<S, A, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WrappedMethod")
            .field("target", self.slot.target())
            .field("generation", &self.generation)
            .field("observers", &self.observers.load().len())
            .field("calls", &self.record.call_count())
            .finish_non_exhaustive()
    }
}

impl<S, A, R> Instrumentation for WrappedMethod<S, A, R>
where
    S: 'static,
    A: 'static,
    R: 'static,
{
    fn is_current(&self) -> bool {
        self.slot.generation() == self.generation
    }

    fn remove_observer(&self, token: u64) -> usize {
        let previous = self.observers.rcu(|chain| {
            chain
                .iter()
                .filter(|link| link.token != token)
                .cloned()
                .collect::<Vec<_>>()
        });

        previous
            .iter()
            .filter(|link| link.token != token)
            .count()
    }

    fn restore(&self) {
        let restored = self.slot.replace_if_current(
            self.generation,
            &self.wrapper,
            Arc::clone(&self.original),
        );

        if !restored {
            debug!(
                method = %self.slot.target(),
                "method changed since wrapping, leaving it as is"
            );
        }
    }

    fn record(&self) -> Arc<InterceptionRecord> {
        Arc::clone(&self.record)
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// An observer attached to a wrapped method.
///
/// Dropping the interception leaves the observer in place. Use [`restore()`](Self::restore)
/// or [`InstrumentationContext::unregister()`](crate::InstrumentationContext::unregister) to
/// detach it.
#[derive(Debug)]
#[must_use = "the interception is needed to restore the method"]
pub struct Interception {
    token: InstrumentationToken,
    record: Arc<InterceptionRecord>,
    registry: Arc<InstrumentationRegistry>,
}

impl Interception {
    /// The token identifying this observer.
    #[must_use]
    pub fn token(&self) -> &InstrumentationToken {
        &self.token
    }

    /// The record of the wrapped method, shared by all observers composed on it.
    #[must_use]
    pub fn record(&self) -> &InterceptionRecord {
        &self.record
    }

    /// How many times the wrapped method has been called.
    #[must_use]
    pub fn call_count(&self) -> u64 {
        self.record.call_count()
    }

    /// Detaches the observer. The original implementation is reinstalled once no observers
    /// remain on the method.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownToken`] if the observer was already detached or if the owner
    /// redefined the method after it was wrapped.
    pub fn restore(self) -> Result<()> {
        self.registry.unregister(&self.token)
    }
}

/// Wraps methods of [`MethodTable`]s with observers.
///
/// # Examples
///
/// ```
/// use peephole::{InstrumentationContext, Output};
///
/// struct Order;
///
/// let output = Output::capture();
/// let context = InstrumentationContext::builder().output(output.clone()).build();
/// let table = context.method_table("Order");
/// let save = table.define("save", |_: &Order, (): ()| Ok::<_, String>(()));
///
/// let interception = context
///     .interceptor()
///     .count_method_calls::<Order, (), Result<(), String>>(&table, "save")?;
///
/// save.call(&Order, ()).unwrap();
/// save.call(&Order, ()).unwrap();
///
/// assert_eq!(interception.call_count(), 2);
/// assert_eq!(output.lines().last().unwrap(), "Order#save called 2 times");
///
/// interception.restore()?;
/// # Ok::<(), peephole::Error>(())
/// ```
#[derive(Clone, Debug)]
pub struct MethodInterceptor {
    registry: Arc<InstrumentationRegistry>,
    output: Output,
}

impl MethodInterceptor {
    pub(crate) fn new(registry: Arc<InstrumentationRegistry>, output: Output) -> Self {
        Self { registry, output }
    }

    /// Wraps a method so that the observer is notified of every call.
    ///
    /// The wrapper counts the call, notifies every observer of the method (in the order they
    /// were attached), runs the original implementation with the same receiver and arguments,
    /// notifies the observers of the result and returns the result unchanged. Panics of the
    /// original implementation propagate unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoSuchMethod`] if the table does not define the method,
    /// [`Error::SignatureMismatch`] if it is defined with other types and
    /// [`Error::AlreadyInstrumented`] if the method is already wrapped and the options do not
    /// ask for composition.
    pub fn intercept<S, A, R, O>(
        &self,
        table: &MethodTable,
        method: &str,
        observer: O,
        options: InterceptOptions,
    ) -> Result<Interception>
    where
        S: 'static,
        A: Debug + 'static,
        R: 'static,
        O: CallObserver<S, A, R>,
    {
        let slot = table.slot::<S, A, R>(method)?;
        let target = slot.target().clone();
        let observer: Arc<dyn CallObserver<S, A, R>> = Arc::new(observer);

        let (token, instrumentation) =
            self.registry
                .register(&target, options.compose, |token, existing| {
                    let link = ChainLink { token, observer };

                    let Some(existing) = existing else {
                        let wrapped = WrappedMethod::wrap(slot, link, options.log_calls);
                        return Ok(Arc::new(wrapped) as Arc<dyn Instrumentation>);
                    };

                    let wrapped = existing
                        .as_any_arc()
                        .downcast::<WrappedMethod<S, A, R>>()
                        .map_err(|_unexpected| Error::SignatureMismatch {
                            target: target.clone(),
                            expected: signature::<S, A, R>(),
                        })?;

                    wrapped.push(link);
                    Ok(wrapped as Arc<dyn Instrumentation>)
                })?;

        Ok(Interception {
            token,
            record: instrumentation.record(),
            registry: Arc::clone(&self.registry),
        })
    }

    /// Counts calls, printing `Owner#method called N times` on every call.
    ///
    /// # Errors
    ///
    /// See [`intercept()`](Self::intercept).
    pub fn count_method_calls<S, A, R>(
        &self,
        table: &MethodTable,
        method: &str,
    ) -> Result<Interception>
    where
        S: 'static,
        A: Debug + 'static,
        R: 'static,
    {
        self.intercept::<S, A, R, _>(
            table,
            method,
            CallCounter::new(self.output.clone()),
            InterceptOptions::new().compose(),
        )
    }

    /// Prints how long every call of the method took.
    ///
    /// # Errors
    ///
    /// See [`intercept()`](Self::intercept).
    pub fn track_time<S, A, R>(&self, table: &MethodTable, method: &str) -> Result<Interception>
    where
        S: 'static,
        A: Debug + 'static,
        R: 'static,
    {
        self.intercept::<S, A, R, _>(
            table,
            method,
            CallTimer::new(self.output.clone()),
            InterceptOptions::new().compose(),
        )
    }

    /// Prints the arguments of every call of the method and keeps them in the call log.
    ///
    /// # Errors
    ///
    /// See [`intercept()`](Self::intercept).
    pub fn track_method_calls<S, A, R>(
        &self,
        table: &MethodTable,
        method: &str,
    ) -> Result<Interception>
    where
        S: 'static,
        A: Debug + 'static,
        R: 'static,
    {
        self.intercept::<S, A, R, _>(
            table,
            method,
            ArgumentLogger::new(self.output.clone()),
            InterceptOptions::new().compose().log_calls(),
        )
    }

    /// Detaches the observer identified by the token.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownToken`] if the token is not registered or stale.
    pub fn restore(&self, token: &InstrumentationToken) -> Result<()> {
        self.registry.unregister(token)
    }

    /// Whether the method is currently wrapped.
    #[must_use]
    pub fn is_instrumented(&self, target: &Target) -> bool {
        self.registry.is_instrumented(target)
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{self, AtomicU64};
    use std::thread;

    use super::*;
    use crate::tracer::TraceHub;

    type SaveResult = std::result::Result<u32, String>;

    #[derive(Debug, PartialEq)]
    struct Order {
        id: u32,
    }

    fn setup() -> (MethodInterceptor, MethodTable, Output) {
        let output = Output::capture();
        let interceptor = MethodInterceptor::new(Arc::new(InstrumentationRegistry::new()), output.clone());
        let table = MethodTable::new("Order", TraceHub::new());
        (interceptor, table, output)
    }

    fn define_save(table: &MethodTable) -> crate::MethodHandle<Order, u32, SaveResult> {
        table.define("save", |order: &Order, amount: u32| {
            if amount == 0 {
                Err(format!("order {} has nothing to save", order.id))
            } else {
                Ok(order.id + amount)
            }
        })
    }

    static_assertions::assert_impl_all!(MethodInterceptor: Send, Sync);
    static_assertions::assert_impl_all!(Interception: Send, Sync);

    #[test]
    fn intercepted_method_is_transparent() {
        let (interceptor, table, _) = setup();
        let save = define_save(&table);
        let order = Order { id: 7 };

        let plain_ok = save.call(&order, 3);
        let plain_err = save.call(&order, 0);

        let interception = interceptor
            .intercept::<Order, u32, SaveResult, _>(
                &table,
                "save",
                OnCall::new(|_: &CallInfo<'_>, _: &Order, _: &u32| {}),
                InterceptOptions::new(),
            )
            .unwrap();

        assert_eq!(save.call(&order, 3), plain_ok);
        assert_eq!(save.call(&order, 0), plain_err);
        assert_eq!(interception.call_count(), 2);
    }

    #[test]
    fn observers_see_receiver_arguments_and_result() {
        let (interceptor, table, _) = setup();
        let save = define_save(&table);

        let seen = Arc::new(Mutex::new(Vec::new()));

        let seen_calls = Arc::clone(&seen);
        let _calls = interceptor
            .intercept::<Order, u32, SaveResult, _>(
                &table,
                "save",
                OnCall::new(move |call: &CallInfo<'_>, order: &Order, amount: &u32| {
                    seen_calls
                        .lock()
                        .unwrap()
                        .push(format!("call {} {} {amount}", call.call_number(), order.id));
                }),
                InterceptOptions::new(),
            )
            .unwrap();

        let seen_returns = Arc::clone(&seen);
        let _returns = interceptor
            .intercept::<Order, u32, SaveResult, _>(
                &table,
                "save",
                OnReturn::new(move |call: &CallInfo<'_>, result: &SaveResult, _| {
                    seen_returns
                        .lock()
                        .unwrap()
                        .push(format!("return {} {result:?}", call.call_number()));
                }),
                InterceptOptions::new().compose(),
            )
            .unwrap();

        save.call(&Order { id: 1 }, 2).unwrap();

        assert_eq!(*seen.lock().unwrap(), vec!["call 1 1 2", "return 1 Ok(3)"]);
    }

    #[test]
    fn second_interception_requires_compose() {
        let (interceptor, table, _) = setup();
        define_save(&table);

        let _first = interceptor
            .count_method_calls::<Order, u32, SaveResult>(&table, "save")
            .unwrap();

        let second = interceptor.intercept::<Order, u32, SaveResult, _>(
            &table,
            "save",
            OnCall::new(|_: &CallInfo<'_>, _: &Order, _: &u32| {}),
            InterceptOptions::new(),
        );

        assert!(matches!(second, Err(Error::AlreadyInstrumented { .. })));
    }

    #[test]
    fn missing_method_and_wrong_signature_are_reported() {
        let (interceptor, table, _) = setup();
        define_save(&table);

        let missing = interceptor.count_method_calls::<Order, u32, SaveResult>(&table, "destroy");
        assert!(matches!(missing, Err(Error::NoSuchMethod { .. })));

        let mismatched = interceptor.count_method_calls::<Order, u64, SaveResult>(&table, "save");
        assert!(matches!(mismatched, Err(Error::SignatureMismatch { .. })));
    }

    #[test]
    fn restore_reinstalls_original_after_last_observer() {
        let (interceptor, table, _) = setup();
        let save = define_save(&table);
        let original = save.slot().implementation();

        let first = interceptor
            .count_method_calls::<Order, u32, SaveResult>(&table, "save")
            .unwrap();
        let second = interceptor
            .track_time::<Order, u32, SaveResult>(&table, "save")
            .unwrap();

        first.restore().unwrap();
        assert!(interceptor.is_instrumented(save.target()));
        assert!(!Arc::ptr_eq(&save.slot().implementation(), &original));

        second.restore().unwrap();
        assert!(!interceptor.is_instrumented(save.target()));
        assert!(Arc::ptr_eq(&save.slot().implementation(), &original));
    }

    #[test]
    fn dropping_interception_keeps_observing() {
        let (interceptor, table, output) = setup();
        let save = define_save(&table);

        drop(
            interceptor
                .count_method_calls::<Order, u32, SaveResult>(&table, "save")
                .unwrap(),
        );

        save.call(&Order { id: 1 }, 1).unwrap();

        assert_eq!(output.lines(), vec!["Order#save called 1 times"]);
    }

    #[test]
    fn panicking_observer_does_not_break_call() {
        let (interceptor, table, _) = setup();
        let save = define_save(&table);

        let interception = interceptor
            .intercept::<Order, u32, SaveResult, _>(
                &table,
                "save",
                OnCall::new(|_: &CallInfo<'_>, _: &Order, _: &u32| panic!("observer bug")),
                InterceptOptions::new(),
            )
            .unwrap();

        assert_eq!(save.call(&Order { id: 1 }, 1), Ok(2));
        assert_eq!(interception.call_count(), 1);
    }

    #[test]
    fn redefinition_makes_token_stale() {
        let (interceptor, table, _) = setup();
        define_save(&table);

        let interception = interceptor
            .count_method_calls::<Order, u32, SaveResult>(&table, "save")
            .unwrap();

        let save = define_save(&table);
        let token = interception.token().clone();

        assert!(matches!(
            interceptor.restore(&token),
            Err(Error::UnknownToken { .. })
        ));

        // The redefined method is not wrapped and can be instrumented again.
        let again = interceptor
            .count_method_calls::<Order, u32, SaveResult>(&table, "save")
            .unwrap();
        save.call(&Order { id: 1 }, 1).unwrap();
        assert_eq!(again.call_count(), 1);
    }

    #[test]
    fn track_method_calls_logs_arguments() {
        let (interceptor, table, output) = setup();
        let save = define_save(&table);

        let interception = interceptor
            .track_method_calls::<Order, u32, SaveResult>(&table, "save")
            .unwrap();

        save.call(&Order { id: 1 }, 5).unwrap();

        assert_eq!(output.lines(), vec!["Order#save called with 5"]);
        assert_eq!(interception.record().call_log()[0].arguments(), "5");
    }

    #[test]
    fn concurrent_calls_are_all_counted() {
        let (interceptor, table, _) = setup();
        let save = define_save(&table);
        let observed = Arc::new(AtomicU64::new(0));
        let observed_clone = Arc::clone(&observed);

        let interception = interceptor
            .intercept::<Order, u32, SaveResult, _>(
                &table,
                "save",
                OnCall::new(move |_: &CallInfo<'_>, _: &Order, _: &u32| {
                    observed_clone.fetch_add(1, atomic::Ordering::Relaxed);
                }),
                InterceptOptions::new(),
            )
            .unwrap();

        thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    for _ in 0..100 {
                        save.call(&Order { id: 1 }, 1).unwrap();
                    }
                });
            }
        });

        assert_eq!(interception.call_count(), 400);
        assert_eq!(observed.load(atomic::Ordering::Relaxed), 400);
    }

    #[test]
    fn redefinition_racing_with_interception_is_never_undone() {
        const ROUNDS: u32 = 200;

        let (interceptor, table, _) = setup();
        let save = define_save(&table);

        thread::scope(|scope| {
            scope.spawn(|| {
                for round in 1..=ROUNDS {
                    table.define("save", move |order: &Order, amount: u32| -> SaveResult {
                        Ok(order.id + amount + round)
                    });
                }
            });

            scope.spawn(|| {
                for _ in 0..ROUNDS {
                    if let Ok(interception) =
                        interceptor.count_method_calls::<Order, u32, SaveResult>(&table, "save")
                    {
                        // Fails with UnknownToken when a redefinition won the race.
                        let restored = interception.restore();
                        assert!(matches!(restored, Ok(()) | Err(Error::UnknownToken { .. })));
                    }
                }
            });
        });

        // Whatever the interleaving, the last definition is the one that is installed.
        assert!(!interceptor.is_instrumented(save.target()));
        assert_eq!(save.call(&Order { id: 1 }, 1), Ok(2 + ROUNDS));
    }

    #[test]
    fn wrapping_uses_latest_definition() {
        let (interceptor, table, _) = setup();
        let save = define_save(&table);

        table.define("save", |order: &Order, amount: u32| -> SaveResult {
            Ok(order.id * amount)
        });

        let interception = interceptor
            .count_method_calls::<Order, u32, SaveResult>(&table, "save")
            .unwrap();

        assert_eq!(save.call(&Order { id: 3 }, 4), Ok(12));
        interception.restore().unwrap();
        assert_eq!(save.call(&Order { id: 3 }, 4), Ok(12));
    }
}
