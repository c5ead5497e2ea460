use std::any::Any;
use std::fmt::{self, Debug};
use std::sync::atomic::{self, AtomicU64};
use std::sync::{Arc, Mutex};

use foldhash::{HashMap, HashMapExt};
use tracing::{debug, warn};

use crate::{ERR_POISONED_LOCK, Error, InterceptionRecord, Result, Target};

// Shared by all registries so that a token is never valid in a context that did not issue it.
static NEXT_TOKEN_ID: AtomicU64 = AtomicU64::new(1);

/// The registry's view of one wrapped method, independent of the method signature.
pub(crate) trait Instrumentation: Any + Debug + Send + Sync {
    /// Whether the method still has the definition that was wrapped. False once the owner
    /// redefined the method, after which the original can no longer be restored.
    fn is_current(&self) -> bool;

    /// Detaches one observer. Returns how many observers remain.
    fn remove_observer(&self, token: u64) -> usize;

    /// Reinstalls the implementation that was in place before wrapping.
    fn restore(&self);

    fn record(&self) -> Arc<InterceptionRecord>;

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// Identifies one observer attached to one wrapped method.
///
/// Returned when instrumenting a method and consumed when removing the instrumentation again.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct InstrumentationToken {
    id: u64,
    target: Target,
}

impl InstrumentationToken {
    /// The numeric identity of the token, unique within the process.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The method the observer is attached to.
    #[must_use]
    pub fn target(&self) -> &Target {
        &self.target
    }
}

impl fmt::Display for InstrumentationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} ({})", self.id, self.target)
    }
}

#[derive(Debug)]
struct RegistryState {
    entries: HashMap<Target, Arc<dyn Instrumentation>>,
    tokens: HashMap<u64, Target>,
}

impl RegistryState {
    fn forget(&mut self, target: &Target) {
        self.entries.remove(target);
        self.tokens.retain(|_, token_target| token_target != target);
    }
}

/// Tracks which methods of a context are currently wrapped and by which observers.
#[derive(Debug)]
pub(crate) struct InstrumentationRegistry {
    state: Mutex<RegistryState>,
}

impl InstrumentationRegistry {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(RegistryState {
                entries: HashMap::new(),
                tokens: HashMap::new(),
            }),
        }
    }

    /// Records a new observer on a target.
    ///
    /// `attach` receives the new token id and the existing instrumentation of the target
    /// (only ever `Some` when `compose` is set) and performs the actual wrapping. It runs
    /// under the registry lock, so concurrent registrations of one target cannot both wrap it.
    pub(crate) fn register<F>(
        &self,
        target: &Target,
        compose: bool,
        attach: F,
    ) -> Result<(InstrumentationToken, Arc<dyn Instrumentation>)>
    where
        F: FnOnce(u64, Option<Arc<dyn Instrumentation>>) -> Result<Arc<dyn Instrumentation>>,
    {
        let mut state = self.state.lock().expect(ERR_POISONED_LOCK);

        if state
            .entries
            .get(target)
            .is_some_and(|existing| !existing.is_current())
        {
            warn!(%target, "discarding instrumentation of a method that was redefined");
            state.forget(target);
        }

        let existing = state.entries.get(target).map(Arc::clone);

        if existing.is_some() && !compose {
            return Err(Error::AlreadyInstrumented {
                target: target.clone(),
            });
        }

        let id = NEXT_TOKEN_ID.fetch_add(1, atomic::Ordering::Relaxed);
        let instrumentation = attach(id, existing)?;

        state
            .entries
            .insert(target.clone(), Arc::clone(&instrumentation));
        state.tokens.insert(id, target.clone());

        debug!(%target, token = id, compose, "instrumentation registered");

        Ok((
            InstrumentationToken {
                id,
                target: target.clone(),
            },
            instrumentation,
        ))
    }

    /// Detaches the observer identified by the token. Once the last observer of a target is
    /// detached, the original implementation is restored.
    pub(crate) fn unregister(&self, token: &InstrumentationToken) -> Result<()> {
        let mut state = self.state.lock().expect(ERR_POISONED_LOCK);

        let unknown = || Error::UnknownToken { token: token.id };

        if state.tokens.get(&token.id) != Some(&token.target) {
            return Err(unknown());
        }

        let target = state.tokens.remove(&token.id).ok_or_else(unknown)?;
        let entry = state
            .entries
            .get(&target)
            .map(Arc::clone)
            .ok_or_else(unknown)?;

        if !entry.is_current() {
            warn!(%target, token = token.id, "cannot restore a method that was redefined after wrapping");
            state.forget(&target);
            return Err(unknown());
        }

        let remaining = entry.remove_observer(token.id);

        if remaining == 0 {
            entry.restore();
            state.entries.remove(&target);
            debug!(%target, token = token.id, "original implementation restored");
        } else {
            debug!(%target, token = token.id, remaining, "observer detached");
        }

        Ok(())
    }

    pub(crate) fn is_instrumented(&self, target: &Target) -> bool {
        self.state
            .lock()
            .expect(ERR_POISONED_LOCK)
            .entries
            .get(target)
            .is_some_and(|entry| entry.is_current())
    }

    /// Currently wrapped targets, sorted.
    pub(crate) fn instrumented_targets(&self) -> Vec<Target> {
        let state = self.state.lock().expect(ERR_POISONED_LOCK);

        let mut targets: Vec<Target> = state
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_current())
            .map(|(target, _)| target.clone())
            .collect();
        targets.sort_unstable();
        targets
    }

    pub(crate) fn record(&self, target: &Target) -> Option<Arc<InterceptionRecord>> {
        self.state
            .lock()
            .expect(ERR_POISONED_LOCK)
            .entries
            .get(target)
            .filter(|entry| entry.is_current())
            .map(|entry| entry.record())
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    use super::*;

    #[derive(Debug)]
    struct FakeInstrumentation {
        current: AtomicBool,
        observers: AtomicUsize,
        restored: AtomicBool,
        record: Arc<InterceptionRecord>,
    }

    impl FakeInstrumentation {
        fn new(target: &Target) -> Arc<Self> {
            Arc::new(Self {
                current: AtomicBool::new(true),
                observers: AtomicUsize::new(1),
                restored: AtomicBool::new(false),
                record: Arc::new(InterceptionRecord::new(target.clone(), false)),
            })
        }
    }

    impl Instrumentation for FakeInstrumentation {
        fn is_current(&self) -> bool {
            self.current.load(atomic::Ordering::Relaxed)
        }

        fn remove_observer(&self, _token: u64) -> usize {
            self.observers.fetch_sub(1, atomic::Ordering::Relaxed) - 1
        }

        fn restore(&self) {
            self.restored.store(true, atomic::Ordering::Relaxed);
        }

        fn record(&self) -> Arc<InterceptionRecord> {
            Arc::clone(&self.record)
        }

        fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
            self
        }
    }

    fn register_fake(
        registry: &InstrumentationRegistry,
        target: &Target,
    ) -> Result<(InstrumentationToken, Arc<FakeInstrumentation>)> {
        let fake = FakeInstrumentation::new(target);
        let erased: Arc<dyn Instrumentation> = Arc::clone(&fake) as Arc<dyn Instrumentation>;
        let (token, _) = registry.register(target, false, move |_, _| Ok(erased))?;
        Ok((token, fake))
    }

    static_assertions::assert_impl_all!(InstrumentationRegistry: Send, Sync);
    static_assertions::assert_impl_all!(InstrumentationToken: Send, Sync);

    #[test]
    fn register_then_unregister_restores() {
        let registry = InstrumentationRegistry::new();
        let target = Target::new("Order", "save");

        let (token, fake) = register_fake(&registry, &target).unwrap();
        assert!(registry.is_instrumented(&target));
        assert_eq!(registry.instrumented_targets(), vec![target.clone()]);
        assert!(registry.record(&target).is_some());

        registry.unregister(&token).unwrap();

        assert!(fake.restored.load(atomic::Ordering::Relaxed));
        assert!(!registry.is_instrumented(&target));
        assert!(registry.instrumented_targets().is_empty());
    }

    #[test]
    fn second_registration_without_compose_fails() {
        let registry = InstrumentationRegistry::new();
        let target = Target::new("Order", "save");

        register_fake(&registry, &target).unwrap();
        let result = register_fake(&registry, &target);

        assert!(matches!(result, Err(Error::AlreadyInstrumented { .. })));
    }

    #[test]
    fn token_cannot_be_used_twice() {
        let registry = InstrumentationRegistry::new();
        let target = Target::new("Order", "save");

        let (token, _) = register_fake(&registry, &target).unwrap();
        registry.unregister(&token).unwrap();

        let result = registry.unregister(&token);
        assert!(matches!(result, Err(Error::UnknownToken { token: id }) if id == token.id()));
    }

    #[test]
    fn stale_entry_is_rejected_and_does_not_block() {
        let registry = InstrumentationRegistry::new();
        let target = Target::new("Order", "save");

        let (token, fake) = register_fake(&registry, &target).unwrap();
        fake.current.store(false, atomic::Ordering::Relaxed);

        assert!(!registry.is_instrumented(&target));

        let (new_token, _) = register_fake(&registry, &target).unwrap();
        assert_ne!(new_token.id(), token.id());

        assert!(matches!(
            registry.unregister(&token),
            Err(Error::UnknownToken { .. })
        ));
        assert!(!fake.restored.load(atomic::Ordering::Relaxed));
    }

    #[test]
    fn tokens_of_another_registry_are_rejected() {
        let first = InstrumentationRegistry::new();
        let second = InstrumentationRegistry::new();
        let save = Target::new("Order", "save");
        let total = Target::new("Invoice", "total");

        let (first_token, first_fake) = register_fake(&first, &save).unwrap();
        let (_, second_fake) = register_fake(&second, &total).unwrap();
        let (_, same_target_fake) = register_fake(&second, &save).unwrap();

        assert!(matches!(
            second.unregister(&first_token),
            Err(Error::UnknownToken { .. })
        ));

        assert!(second.is_instrumented(&total));
        assert!(second.is_instrumented(&save));
        assert!(!second_fake.restored.load(atomic::Ordering::Relaxed));
        assert!(!same_target_fake.restored.load(atomic::Ordering::Relaxed));

        first.unregister(&first_token).unwrap();
        assert!(first_fake.restored.load(atomic::Ordering::Relaxed));
    }

    #[test]
    fn token_with_mismatched_target_is_rejected() {
        let registry = InstrumentationRegistry::new();
        let save = Target::new("Order", "save");

        let (token, fake) = register_fake(&registry, &save).unwrap();
        let forged = InstrumentationToken {
            id: token.id(),
            target: Target::new("Invoice", "total"),
        };

        assert!(matches!(
            registry.unregister(&forged),
            Err(Error::UnknownToken { .. })
        ));
        assert!(registry.is_instrumented(&save));
        assert!(!fake.restored.load(atomic::Ordering::Relaxed));

        registry.unregister(&token).unwrap();
    }

    #[test]
    fn failed_attach_leaves_no_trace() {
        let registry = InstrumentationRegistry::new();
        let target = Target::new("Order", "save");

        let result = registry.register(&target, false, |_, _| {
            Err(Error::NoSuchMethod {
                owner: "Order".to_owned(),
                method: "save".to_owned(),
            })
        });

        assert!(result.is_err());
        assert!(!registry.is_instrumented(&target));
    }
}
