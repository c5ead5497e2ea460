//! Runtime-replaceable method dispatch.

use std::any::{Any, type_name};
use std::fmt;
use std::panic::Location;
use std::sync::atomic::{self, AtomicU64};
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use foldhash::{HashMap, HashMapExt};
use tracing::debug;

use crate::tracer::TraceHub;
use crate::{ERR_POISONED_LOCK, Error, ReceiverId, Result, Target};

/// One callable implementation of a method, bound to a receiver at call time.
pub(crate) struct Implementation<S, A, R> {
    body: Box<dyn Fn(&S, A) -> R + Send + Sync>,
}

impl<S, A, R> Implementation<S, A, R> {
    pub(crate) fn new<F>(body: F) -> Self
    where
        F: Fn(&S, A) -> R + Send + Sync + 'static,
    {
        Self {
            body: Box::new(body),
        }
    }

    #[inline]
    pub(crate) fn call(&self, receiver: &S, args: A) -> R {
        (self.body)(receiver, args)
    }
}

impl<S, A, R> fmt::Debug for Implementation<S, A, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<fn(&{}, {}) -> {}>", type_name::<S>(), type_name::<A>(), type_name::<R>())
    }
}

/// The replaceable storage behind one method name.
///
/// The generation is bumped whenever the owner redefines the method. Instrumentation that
/// captured an older generation can no longer restore its original implementation.
///
/// Calls only ever load `current`. Every write goes through the `update` lock so that a
/// redefinition cannot interleave with instrumentation installing or removing a wrapper.
#[derive(Debug)]
pub(crate) struct MethodSlot<S, A, R> {
    target: Target,
    current: ArcSwap<Implementation<S, A, R>>,
    generation: AtomicU64,
    update: Mutex<()>,
}

impl<S, A, R> MethodSlot<S, A, R> {
    fn new(target: Target, implementation: Implementation<S, A, R>) -> Self {
        Self {
            target,
            current: ArcSwap::from_pointee(implementation),
            generation: AtomicU64::new(0),
            update: Mutex::new(()),
        }
    }

    pub(crate) fn target(&self) -> &Target {
        &self.target
    }

    pub(crate) fn implementation(&self) -> Arc<Implementation<S, A, R>> {
        self.current.load_full()
    }

    /// The installed implementation together with the generation it belongs to.
    pub(crate) fn snapshot(&self) -> (Arc<Implementation<S, A, R>>, u64) {
        let _update = self.update.lock().expect(ERR_POISONED_LOCK);
        (self.current.load_full(), self.generation())
    }

    /// Installs `replacement` without touching the generation, but only if the slot is still
    /// at `generation` and still holds `expected`. Used by instrumentation.
    pub(crate) fn replace_if_current(
        &self,
        generation: u64,
        expected: &Arc<Implementation<S, A, R>>,
        replacement: Arc<Implementation<S, A, R>>,
    ) -> bool {
        let _update = self.update.lock().expect(ERR_POISONED_LOCK);

        if self.generation() != generation || !Arc::ptr_eq(&self.current.load_full(), expected) {
            return false;
        }

        self.current.store(replacement);
        true
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(atomic::Ordering::Acquire)
    }

    fn redefine(&self, implementation: Implementation<S, A, R>) {
        let _update = self.update.lock().expect(ERR_POISONED_LOCK);
        self.current.store(Arc::new(implementation));
        self.generation.fetch_add(1, atomic::Ordering::AcqRel);
    }

    fn bump_generation(&self) {
        let _update = self.update.lock().expect(ERR_POISONED_LOCK);
        self.generation.fetch_add(1, atomic::Ordering::AcqRel);
    }
}

trait ErasedSlot: Any + Send + Sync {
    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;

    fn invalidate(&self);
}

impl<S, A, R> ErasedSlot for MethodSlot<S, A, R>
where
    S: 'static,
    A: 'static,
    R: 'static,
{
    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    fn invalidate(&self) {
        self.bump_generation();
    }
}

struct TableInner {
    owner: Arc<str>,
    methods: Mutex<HashMap<Arc<str>, Arc<dyn ErasedSlot>>>,
    hub: TraceHub,
}

impl fmt::Debug for TableInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TableInner")
            .field("owner", &self.owner)
            .field(
                "methods",
                &format_args!("<{} methods>", self.methods.lock().map_or(0, |m| m.len())),
            )
            .field("hub", &self.hub)
            .finish()
    }
}

/// A named set of runtime-replaceable methods, playing the role of a class.
///
/// Code that wants to be observable routes its calls through [`MethodHandle`]s obtained from
/// a table. Instrumentation can then wrap and unwrap those methods at runtime without the
/// calling code or the method bodies changing.
///
/// Clones refer to the same table.
///
/// # Examples
///
/// ```
/// use peephole::InstrumentationContext;
///
/// struct Counter {
///     step: u64,
/// }
///
/// let context = InstrumentationContext::new();
/// let table = context.method_table("Counter");
///
/// let advance = table.define("advance", |counter: &Counter, value: u64| value + counter.step);
///
/// assert_eq!(advance.call(&Counter { step: 2 }, 40), 42);
/// ```
#[derive(Clone, Debug)]
pub struct MethodTable {
    inner: Arc<TableInner>,
}

impl MethodTable {
    pub(crate) fn new(owner: impl Into<Arc<str>>, hub: TraceHub) -> Self {
        Self {
            inner: Arc::new(TableInner {
                owner: owner.into(),
                methods: Mutex::new(HashMap::new()),
                hub,
            }),
        }
    }

    /// The owner name of the table, as used in [`Target`]s.
    #[must_use]
    pub fn owner(&self) -> &str {
        &self.inner.owner
    }

    /// Defines a method, or redefines an existing one.
    ///
    /// Redefining a method with the same signature replaces its implementation in place, so
    /// existing handles call the new body. Redefining it with a different signature detaches
    /// existing handles, which keep calling the previous definition.
    ///
    /// Either way, any instrumentation of the previous definition becomes stale: its token
    /// can no longer be used to restore the method.
    pub fn define<S, A, R, F>(&self, method: &str, body: F) -> MethodHandle<S, A, R>
    where
        S: 'static,
        A: 'static,
        R: 'static,
        F: Fn(&S, A) -> R + Send + Sync + 'static,
    {
        let target = Target::new(Arc::clone(&self.inner.owner), method);
        let implementation = Implementation::new(body);

        let mut methods = self.inner.methods.lock().expect(ERR_POISONED_LOCK);

        if let Some(existing) = methods.get(target.method_arc()) {
            if let Ok(slot) = Arc::clone(existing)
                .as_any_arc()
                .downcast::<MethodSlot<S, A, R>>()
            {
                debug!(%target, "redefining method in place");
                slot.redefine(implementation);
                return MethodHandle::new(slot, self.inner.hub.clone());
            }

            debug!(%target, "redefining method with a new signature");
            existing.invalidate();
        }

        let slot = Arc::new(MethodSlot::new(target.clone(), implementation));
        methods.insert(
            Arc::clone(target.method_arc()),
            Arc::clone(&slot) as Arc<dyn ErasedSlot>,
        );

        MethodHandle::new(slot, self.inner.hub.clone())
    }

    /// Returns a handle to an existing method.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoSuchMethod`] if the method is not defined and
    /// [`Error::SignatureMismatch`] if it is defined with a different signature.
    pub fn method<S, A, R>(&self, method: &str) -> Result<MethodHandle<S, A, R>>
    where
        S: 'static,
        A: 'static,
        R: 'static,
    {
        Ok(MethodHandle::new(self.slot(method)?, self.inner.hub.clone()))
    }

    /// Whether a method with the given name is defined.
    #[must_use]
    pub fn has_method(&self, method: &str) -> bool {
        self.inner
            .methods
            .lock()
            .expect(ERR_POISONED_LOCK)
            .contains_key(method)
    }

    /// The names of all defined methods, in alphabetical order.
    #[must_use]
    pub fn method_names(&self) -> Vec<String> {
        let methods = self.inner.methods.lock().expect(ERR_POISONED_LOCK);

        let mut names: Vec<String> = methods.keys().map(ToString::to_string).collect();
        names.sort_unstable();
        names
    }

    pub(crate) fn slot<S, A, R>(&self, method: &str) -> Result<Arc<MethodSlot<S, A, R>>>
    where
        S: 'static,
        A: 'static,
        R: 'static,
    {
        let erased = self
            .inner
            .methods
            .lock()
            .expect(ERR_POISONED_LOCK)
            .get(method)
            .map(Arc::clone)
            .ok_or_else(|| Error::NoSuchMethod {
                owner: self.owner().to_owned(),
                method: method.to_owned(),
            })?;

        erased
            .as_any_arc()
            .downcast::<MethodSlot<S, A, R>>()
            .map_err(|_unexpected| Error::SignatureMismatch {
                target: Target::new(Arc::clone(&self.inner.owner), method),
                expected: signature::<S, A, R>(),
            })
    }
}

pub(crate) fn signature<S, A, R>() -> String {
    format!("fn(&{}, {}) -> {}", type_name::<S>(), type_name::<A>(), type_name::<R>())
}

/// A typed handle for calling one method of a [`MethodTable`].
///
/// Every call dispatches to whatever implementation is currently installed, so calls made
/// through a handle are observed by instrumentation installed after the handle was created.
///
/// `S` is the receiver type, `A` the argument type (use a tuple for several arguments) and
/// `R` the return type. Fallible methods simply return a `Result`.
pub struct MethodHandle<S, A, R> {
    slot: Arc<MethodSlot<S, A, R>>,
    hub: TraceHub,
}

impl<S, A, R> MethodHandle<S, A, R> {
    fn new(slot: Arc<MethodSlot<S, A, R>>, hub: TraceHub) -> Self {
        Self { slot, hub }
    }

    /// The method this handle calls.
    #[must_use]
    pub fn target(&self) -> &Target {
        self.slot.target()
    }

    /// Calls the method on the given receiver.
    ///
    /// While an execution trace is enabled on the owning context, the call is reported to the
    /// tracer as a `Call` event before and a `Return` event after the body runs, attributed to
    /// the source location of the caller.
    #[track_caller]
    pub fn call(&self, receiver: &S, args: A) -> R {
        let implementation = self.slot.implementation();

        if !self.hub.is_active() {
            return implementation.call(receiver, args);
        }

        let _frame = self.hub.enter(
            self.slot.target(),
            ReceiverId::of(receiver),
            Location::caller(),
        );

        implementation.call(receiver, args)
    }

    #[cfg(test)]
    pub(crate) fn slot(&self) -> &Arc<MethodSlot<S, A, R>> {
        &self.slot
    }
}

impl<S, A, R> Clone for MethodHandle<S, A, R> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
            hub: self.hub.clone(),
        }
    }
}

impl<S, A, R> fmt::Debug for MethodHandle<S, A, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodHandle")
            .field("target", self.slot.target())
            .field("generation", &self.slot.generation())
            .finish_non_exhaustive()
    }
}
