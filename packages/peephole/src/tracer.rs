//! Event-hook based execution tracing.

use std::cell::RefCell;
use std::fmt;
use std::num::NonZero;
use std::panic::Location;
use std::sync::Arc;
use std::sync::atomic::{self, AtomicU64, AtomicUsize};
use std::thread;

use arc_swap::ArcSwap;
use tracing::{debug, trace};

use crate::shield::shielded;
use crate::{Output, ReceiverId, Target};

static NEXT_HUB_ID: AtomicU64 = AtomicU64::new(0);

thread_local! {
    // Frames of all hubs active on this thread, outermost first. Each hub only ever sees
    // its own frames, so independent contexts do not leak stack entries into each other.
    static CALL_STACK: RefCell<Vec<StackEntry>> = const { RefCell::new(Vec::new()) };
}

#[derive(Debug)]
struct StackEntry {
    hub: u64,
    frame: Frame,
}

/// The granularity of a trace event.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum TraceEventKind {
    /// A method is about to execute.
    Call,

    /// A method has finished executing. Not reported for calls that unwind due to a panic.
    Return,

    /// An explicit tracepoint was passed.
    Line,
}

impl TraceEventKind {
    /// Lowercase name of the event kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Call => "call",
            Self::Return => "return",
            Self::Line => "line",
        }
    }
}

impl fmt::Display for TraceEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One observed execution event.
#[derive(Clone, Debug)]
pub struct TraceEvent {
    kind: TraceEventKind,
    target: Target,
    receiver: Option<ReceiverId>,
    location: &'static Location<'static>,
    depth: usize,
}

impl TraceEvent {
    /// The kind of event.
    #[must_use]
    pub fn kind(&self) -> TraceEventKind {
        self.kind
    }

    /// The method (or, for tracepoints, the owner and label) the event belongs to.
    #[must_use]
    pub fn target(&self) -> &Target {
        &self.target
    }

    /// The identity of the receiver of the call. `None` for tracepoints.
    #[must_use]
    pub fn receiver(&self) -> Option<ReceiverId> {
        self.receiver
    }

    /// The source file of the call site or tracepoint.
    #[must_use]
    pub fn file(&self) -> &'static str {
        self.location.file()
    }

    /// The source line of the call site or tracepoint.
    #[must_use]
    pub fn line(&self) -> u32 {
        self.location.line()
    }

    /// Number of traced calls on the current thread that are in progress, including
    /// the one this event belongs to.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.depth
    }
}

impl fmt::Display for TraceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} at {}:{}",
            self.kind,
            self.target,
            self.location.file(),
            self.location.line()
        )
    }
}

/// A method call in progress, as seen by the tracer.
#[derive(Clone, Debug)]
pub struct Frame {
    target: Target,
    location: &'static Location<'static>,
}

impl Frame {
    /// The method being executed.
    #[must_use]
    pub fn target(&self) -> &Target {
        &self.target
    }

    /// The source file the method was called from.
    #[must_use]
    pub fn file(&self) -> &'static str {
        self.location.file()
    }

    /// The source line the method was called from.
    #[must_use]
    pub fn line(&self) -> u32 {
        self.location.line()
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}:{})",
            self.target,
            self.location.file(),
            self.location.line()
        )
    }
}

/// The traced calls in progress on the current thread, innermost first.
#[derive(Clone, Debug, Default)]
pub struct CallStack {
    frames: Vec<Frame>,
}

impl CallStack {
    /// The frames, innermost first.
    #[must_use]
    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    /// The number of frames.
    #[must_use]
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Whether there are no frames.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Returns a copy holding at most the `depth` innermost frames.
    #[must_use]
    pub fn truncated(&self, depth: NonZero<usize>) -> Self {
        Self {
            frames: self.frames.iter().take(depth.get()).cloned().collect(),
        }
    }
}

impl fmt::Display for CallStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for frame in &self.frames {
            writeln!(f, "  from {frame}")?;
        }
        Ok(())
    }
}

/// Selects the trace events a session is interested in.
///
/// All configured criteria must match. An empty filter matches every event.
///
/// The filter runs for every event the tracer sees, not only the matching ones, so any
/// custom predicate must be cheap (identity or name comparisons).
///
/// # Examples
///
/// ```
/// use peephole::{TraceEventKind, TraceFilter};
///
/// let filter = TraceFilter::new()
///     .owner("Order")
///     .method("save")
///     .kind(TraceEventKind::Call);
/// # drop(filter);
/// ```
#[derive(Clone, Default, derive_more::Debug)]
#[must_use]
pub struct TraceFilter {
    kinds: Vec<TraceEventKind>,
    owner: Option<Arc<str>>,
    method: Option<Arc<str>>,
    receiver: Option<ReceiverId>,

    #[debug(ignore)]
    predicate: Option<Arc<dyn Fn(&TraceEvent) -> bool + Send + Sync>>,
}

impl TraceFilter {
    /// Creates a filter that matches every event.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an event kind to match. Without any kinds, all kinds match.
    pub fn kind(mut self, kind: TraceEventKind) -> Self {
        if !self.kinds.contains(&kind) {
            self.kinds.push(kind);
        }
        self
    }

    /// Matches only events of the named owner.
    pub fn owner(mut self, owner: impl Into<Arc<str>>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    /// Matches only events of the named method (or tracepoint label).
    pub fn method(mut self, method: impl Into<Arc<str>>) -> Self {
        self.method = Some(method.into());
        self
    }

    /// Matches only events of the given owner and method.
    pub fn target(self, target: &Target) -> Self {
        self.owner(Arc::clone(target.owner_arc()))
            .method(Arc::clone(target.method_arc()))
    }

    /// Matches only calls made on the given receiver.
    pub fn receiver<T>(mut self, receiver: &T) -> Self {
        self.receiver = Some(ReceiverId::of(receiver));
        self
    }

    /// Adds a custom predicate.
    pub fn predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&TraceEvent) -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    /// Whether the event passes every configured criterion.
    #[must_use]
    pub fn matches(&self, event: &TraceEvent) -> bool {
        (self.kinds.is_empty() || self.kinds.contains(&event.kind))
            && self
                .owner
                .as_deref()
                .is_none_or(|owner| owner == event.target.owner())
            && self
                .method
                .as_deref()
                .is_none_or(|method| method == event.target.method())
            && self
                .receiver
                .is_none_or(|receiver| event.receiver == Some(receiver))
            && self
                .predicate
                .as_ref()
                .is_none_or(|predicate| predicate(event))
    }
}

type MatchHandler = Box<dyn Fn(&TraceEvent, &CallStack) + Send + Sync>;

#[derive(derive_more::Debug)]
struct Hook {
    id: u64,
    filter: TraceFilter,

    #[debug(ignore)]
    on_match: MatchHandler,

    matches: Arc<AtomicU64>,
}

#[derive(Debug)]
struct HubInner {
    id: u64,
    hooks: ArcSwap<Vec<Arc<Hook>>>,
    active_hooks: AtomicUsize,
    next_hook_id: AtomicU64,
}

/// The event feed of one instrumentation context.
///
/// Method dispatch and tracepoints report events here; enabled trace sessions receive them.
#[derive(Clone, Debug)]
pub(crate) struct TraceHub {
    inner: Arc<HubInner>,
}

impl TraceHub {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(HubInner {
                id: NEXT_HUB_ID.fetch_add(1, atomic::Ordering::Relaxed),
                hooks: ArcSwap::from_pointee(Vec::new()),
                active_hooks: AtomicUsize::new(0),
                next_hook_id: AtomicU64::new(0),
            }),
        }
    }

    /// Whether any trace session is enabled. This is the only cost paid by method dispatch
    /// when nothing is being traced.
    #[inline]
    pub(crate) fn is_active(&self) -> bool {
        self.inner.active_hooks.load(atomic::Ordering::Acquire) != 0
    }

    fn register(&self, filter: TraceFilter, on_match: MatchHandler) -> (u64, Arc<AtomicU64>) {
        let id = self.inner.next_hook_id.fetch_add(1, atomic::Ordering::Relaxed);
        let matches = Arc::new(AtomicU64::new(0));

        let hook = Arc::new(Hook {
            id,
            filter,
            on_match,
            matches: Arc::clone(&matches),
        });

        self.inner.hooks.rcu(|hooks| {
            let mut next: Vec<_> = hooks.iter().map(Arc::clone).collect();
            next.push(Arc::clone(&hook));
            next
        });
        self.inner
            .active_hooks
            .fetch_add(1, atomic::Ordering::AcqRel);

        debug!(hub = self.inner.id, hook = id, filter = ?hook.filter, "trace hook registered");

        (id, matches)
    }

    fn deregister(&self, hook_id: u64) {
        let previous = self.inner.hooks.rcu(|hooks| {
            hooks
                .iter()
                .filter(|hook| hook.id != hook_id)
                .map(Arc::clone)
                .collect::<Vec<_>>()
        });

        if previous.iter().any(|hook| hook.id == hook_id) {
            self.inner
                .active_hooks
                .fetch_sub(1, atomic::Ordering::AcqRel);

            debug!(hub = self.inner.id, hook = hook_id, "trace hook deregistered");
        }
    }

    pub(crate) fn enter(
        &self,
        target: &Target,
        receiver: ReceiverId,
        location: &'static Location<'static>,
    ) -> ActiveFrame {
        let hub = self.inner.id;
        let frame = Frame {
            target: target.clone(),
            location,
        };

        CALL_STACK.with_borrow_mut(|stack| stack.push(StackEntry { hub, frame }));

        self.dispatch(&TraceEvent {
            kind: TraceEventKind::Call,
            target: target.clone(),
            receiver: Some(receiver),
            location,
            depth: self.depth(),
        });

        ActiveFrame {
            hub: self.clone(),
            target: target.clone(),
            receiver,
            location,
        }
    }

    fn line(&self, target: Target, location: &'static Location<'static>) {
        self.dispatch(&TraceEvent {
            kind: TraceEventKind::Line,
            target,
            receiver: None,
            location,
            depth: self.depth(),
        });
    }

    fn depth(&self) -> usize {
        let hub = self.inner.id;
        CALL_STACK.with_borrow(|stack| stack.iter().filter(|entry| entry.hub == hub).count())
    }

    fn call_stack(&self) -> CallStack {
        let hub = self.inner.id;
        CallStack {
            frames: CALL_STACK.with_borrow(|stack| {
                stack
                    .iter()
                    .rev()
                    .filter(|entry| entry.hub == hub)
                    .map(|entry| entry.frame.clone())
                    .collect()
            }),
        }
    }

    fn pop_frame(&self) {
        let hub = self.inner.id;
        CALL_STACK.with_borrow_mut(|stack| {
            if let Some(index) = stack.iter().rposition(|entry| entry.hub == hub) {
                stack.remove(index);
            }
        });
    }

    fn dispatch(&self, event: &TraceEvent) {
        let hooks = self.inner.hooks.load_full();

        trace!(hub = self.inner.id, %event, hooks = hooks.len(), "trace event");

        for hook in hooks.iter() {
            let mut matched = false;
            shielded("trace filter", event, || matched = hook.filter.matches(event));

            if !matched {
                continue;
            }

            hook.matches.fetch_add(1, atomic::Ordering::Relaxed);

            let stack = self.call_stack();
            shielded("trace hook", event, || (hook.on_match)(event, &stack));
        }
    }
}

/// Keeps a traced call on the call stack and reports its return when dropped.
#[derive(Debug)]
#[must_use = "the call is popped from the trace stack when this is dropped"]
pub(crate) struct ActiveFrame {
    hub: TraceHub,
    target: Target,
    receiver: ReceiverId,
    location: &'static Location<'static>,
}

impl Drop for ActiveFrame {
    fn drop(&mut self) {
        // Hooks must not run during unwinding: a second panic there would abort the process.
        if !thread::panicking() {
            self.hub.dispatch(&TraceEvent {
                kind: TraceEventKind::Return,
                target: self.target.clone(),
                receiver: Some(self.receiver),
                location: self.location,
                depth: self.hub.depth(),
            });
        }

        self.hub.pop_frame();
    }
}

/// One registration of a trace hook.
///
/// The session is enabled when created and stays enabled until [`disable()`](Self::disable)
/// is called or the session is dropped.
#[derive(Debug)]
#[must_use = "the trace is disabled when the session is dropped"]
pub struct TraceSession {
    hub: TraceHub,
    hook_id: u64,
    enabled: bool,
    matches: Arc<AtomicU64>,
}

impl TraceSession {
    /// Stops delivering events to this session. Does nothing if already disabled.
    pub fn disable(&mut self) {
        if self.enabled {
            self.hub.deregister(self.hook_id);
            self.enabled = false;
        }
    }

    /// Whether the session still receives events.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// How many events have matched the filter of this session so far.
    #[must_use]
    pub fn match_count(&self) -> u64 {
        self.matches.load(atomic::Ordering::Relaxed)
    }
}

impl Drop for TraceSession {
    fn drop(&mut self) {
        self.disable();
    }
}

/// Observes execution events of one instrumentation context, without modifying the code
/// being observed.
///
/// Events come from calls made through [`MethodHandle`](crate::MethodHandle)s of the context's
/// method tables and from explicit [`tracepoint()`](Self::tracepoint)s. Every enabled session
/// tests every event against its filter and receives the matching ones synchronously, in the
/// order they occur.
///
/// # Examples
///
/// ```
/// use peephole::{InstrumentationContext, Output, TraceFilter};
///
/// let output = Output::capture();
/// let context = InstrumentationContext::builder().output(output.clone()).build();
///
/// let table = context.method_table("Order");
/// let save = table.define("save", |_: &u32, (): ()| true);
///
/// let session = context.tracer().print_trace(TraceFilter::new().method("save"));
/// save.call(&7, ());
/// drop(session);
///
/// assert_eq!(output.lines().len(), 2); // call + return
/// ```
#[derive(Clone, Debug)]
pub struct ExecutionTracer {
    hub: TraceHub,
    output: Output,
    stack_depth: NonZero<usize>,
}

impl ExecutionTracer {
    pub(crate) fn new(hub: TraceHub, output: Output, stack_depth: NonZero<usize>) -> Self {
        Self {
            hub,
            output,
            stack_depth,
        }
    }

    /// Registers a hook that receives every event matching the filter, together with the
    /// call stack at the time of the event.
    ///
    /// A panic in the hook is logged and otherwise ignored.
    pub fn enable<F>(&self, filter: TraceFilter, on_match: F) -> TraceSession
    where
        F: Fn(&TraceEvent, &CallStack) + Send + Sync + 'static,
    {
        let (hook_id, matches) = self.hub.register(filter, Box::new(on_match));

        TraceSession {
            hub: self.hub.clone(),
            hook_id,
            enabled: true,
            matches,
        }
    }

    /// Prints every matching event to the context output.
    pub fn print_trace(&self, filter: TraceFilter) -> TraceSession {
        let output = self.output.clone();

        self.enable(filter, move |event, _| {
            output.write_line(format!("[trace] {event}"));
        })
    }

    /// Reports a `Line` event attributed to the caller's source location.
    ///
    /// Costs a single atomic load when no session is enabled.
    #[track_caller]
    pub fn tracepoint(&self, owner: &str, label: &str) {
        if self.hub.is_active() {
            self.hub.line(Target::new(owner, label), Location::caller());
        }
    }

    /// Whether any session is currently enabled.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.hub.is_active()
    }

    /// The traced calls in progress on the current thread, innermost first.
    #[must_use]
    pub fn call_stack(&self) -> CallStack {
        self.hub.call_stack()
    }

    pub(crate) fn output(&self) -> &Output {
        &self.output
    }

    pub(crate) fn stack_depth(&self) -> NonZero<usize> {
        self.stack_depth
    }
}
