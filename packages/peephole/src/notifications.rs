//! Named structured event channels.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{self, AtomicU64};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use tracing::{debug, trace};

use crate::shield::shielded;

/// Structured data attached to an event, as ordered name/value pairs.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
#[must_use]
pub struct Payload {
    fields: BTreeMap<String, String>,
}

impl Payload {
    /// Creates an empty payload.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a field, replacing any previous value of the same name.
    pub fn with(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.insert(name, value);
        self
    }

    /// Adds a field, replacing any previous value of the same name.
    pub fn insert(&mut self, name: impl Into<String>, value: impl ToString) {
        self.fields.insert(name.into(), value.to_string());
    }

    /// The value of a field.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    /// All fields, ordered by name.
    pub fn fields(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (name, value) in self.fields() {
            if !first {
                f.write_str(" ")?;
            }
            first = false;
            write!(f, "{name}={value}")?;
        }
        Ok(())
    }
}

/// One occurrence of an event on a channel.
#[derive(Clone, Copy, Debug)]
pub struct Notification<'a> {
    channel: &'a str,
    payload: &'a Payload,
    duration: Duration,
}

impl<'a> Notification<'a> {
    /// The channel the event was published on.
    #[must_use]
    pub fn channel(&self) -> &'a str {
        self.channel
    }

    /// The data of the event.
    #[must_use]
    pub fn payload(&self) -> &'a Payload {
        self.payload
    }

    /// How long the instrumented activity took.
    #[must_use]
    pub fn duration(&self) -> Duration {
        self.duration
    }
}

impl fmt::Display for Notification<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:?})", self.channel, self.duration)
    }
}

/// Which channels a subscription receives.
#[derive(Clone, Debug, Eq, PartialEq)]
enum ChannelPattern {
    Exact(String),
    Prefix(String),
}

impl ChannelPattern {
    /// A trailing `*` matches any suffix. Everything else must match exactly.
    fn parse(pattern: &str) -> Self {
        pattern.strip_suffix('*').map_or_else(
            || Self::Exact(pattern.to_owned()),
            |prefix| Self::Prefix(prefix.to_owned()),
        )
    }

    fn matches(&self, channel: &str) -> bool {
        match self {
            Self::Exact(name) => name == channel,
            Self::Prefix(prefix) => channel.starts_with(prefix.as_str()),
        }
    }
}

/// Identifies one subscription on an event bus.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

type Handler = Box<dyn Fn(&Notification<'_>) + Send + Sync>;

#[derive(derive_more::Debug)]
struct Subscriber {
    id: SubscriptionId,
    pattern: ChannelPattern,

    #[debug(ignore)]
    handler: Handler,
}

#[derive(Debug)]
struct BusInner {
    subscribers: ArcSwap<Vec<Arc<Subscriber>>>,
    next_id: AtomicU64,
}

/// A publish/subscribe bus of named event channels.
///
/// Publishing invokes every subscriber whose pattern matches the channel, synchronously on
/// the publishing thread, in subscription order. Subscriptions stand until cancelled.
///
/// Clones refer to the same bus.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicUsize, Ordering};
///
/// use peephole::{InstrumentationContext, Payload};
///
/// let context = InstrumentationContext::new();
/// let bus = context.notifications();
///
/// let seen = Arc::new(AtomicUsize::new(0));
/// let seen_clone = Arc::clone(&seen);
/// let subscription = bus.subscribe("cache.*", move |_| {
///     seen_clone.fetch_add(1, Ordering::Relaxed);
/// });
///
/// let value = bus.instrument("cache.read", Payload::new().with("key", "user:1"), || 42);
///
/// assert_eq!(value, 42);
/// assert_eq!(seen.load(Ordering::Relaxed), 1);
/// subscription.cancel();
/// ```
#[derive(Clone, Debug)]
pub struct Notifications {
    inner: Arc<BusInner>,
}

impl Notifications {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                subscribers: ArcSwap::from_pointee(Vec::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Registers a handler for every future event on the matching channels.
    ///
    /// The pattern is either an exact channel name or a prefix followed by `*`.
    /// Dropping the returned subscription does not cancel it.
    pub fn subscribe<F>(&self, pattern: &str, handler: F) -> Subscription
    where
        F: Fn(&Notification<'_>) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, atomic::Ordering::Relaxed));

        let subscriber = Arc::new(Subscriber {
            id,
            pattern: ChannelPattern::parse(pattern),
            handler: Box::new(handler),
        });

        self.inner.subscribers.rcu(|subscribers| {
            let mut next = Vec::clone(subscribers);
            next.push(Arc::clone(&subscriber));
            next
        });

        debug!(subscription = %id, pattern, "subscribed");

        Subscription {
            id,
            bus: self.clone(),
        }
    }

    /// Cancels a subscription. Returns whether it was still active.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let previous = self.inner.subscribers.rcu(|subscribers| {
            subscribers
                .iter()
                .filter(|subscriber| subscriber.id != id)
                .map(Arc::clone)
                .collect::<Vec<_>>()
        });

        let removed = previous.iter().any(|subscriber| subscriber.id == id);

        if removed {
            debug!(subscription = %id, "unsubscribed");
        }

        removed
    }

    /// Publishes an event whose duration was measured by the caller.
    pub fn publish(&self, channel: &str, payload: &Payload, duration: Duration) {
        let notification = Notification {
            channel,
            payload,
            duration,
        };

        let subscribers = self.inner.subscribers.load_full();

        trace!(channel, subscribers = subscribers.len(), "publishing");

        for subscriber in subscribers
            .iter()
            .filter(|subscriber| subscriber.pattern.matches(channel))
        {
            shielded("subscriber", &notification, || (subscriber.handler)(&notification));
        }
    }

    /// Runs the block and publishes an event carrying its duration. Returns the value of
    /// the block.
    ///
    /// Nothing is published if the block panics.
    pub fn instrument<T, F>(&self, channel: &str, payload: Payload, block: F) -> T
    where
        F: FnOnce() -> T,
    {
        let started = Instant::now();
        let value = block();
        self.publish(channel, &payload, started.elapsed());
        value
    }

    /// How many subscriptions are active.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.load().len()
    }
}

/// A standing registration on an event bus.
///
/// The subscription stays active when this value is dropped. Call
/// [`cancel()`](Self::cancel) to end it.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriptionId,
    bus: Notifications,
}

impl Subscription {
    /// The identity of the subscription, usable with
    /// [`Notifications::unsubscribe()`].
    #[must_use]
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Ends the subscription. Returns whether it was still active.
    pub fn cancel(self) -> bool {
        self.bus.unsubscribe(self.id)
    }
}
