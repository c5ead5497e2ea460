use std::fmt::Debug;
use std::sync::atomic::{self, AtomicBool, AtomicU64};

/// Control over a garbage collector running alongside the instrumented code.
///
/// The allocation profiler suspends collection while it measures a block, so that
/// reclaimed memory does not distort the counters, and restores the previous state
/// afterwards. Native Rust code has no collector and uses [`NoCollector`]. Hosts that embed
/// a managed runtime supply their own implementation.
pub trait Collector: Debug + Send + Sync {
    /// Suspends collection. Returns whether collection was already suspended before the call.
    fn suspend(&self) -> bool;

    /// Resumes collection.
    fn resume(&self);

    /// Whether collection is currently suspended.
    fn is_suspended(&self) -> bool;
}

/// A collector that does not exist. Suspending and resuming it has no effect.
#[derive(Debug, Default)]
pub struct NoCollector;

impl Collector for NoCollector {
    fn suspend(&self) -> bool {
        false
    }

    fn resume(&self) {}

    fn is_suspended(&self) -> bool {
        false
    }
}

/// A collector that only tracks whether it is suspended.
///
/// Hosts can call [`try_collect()`](Self::try_collect) from their own collection points to
/// honor the suspension. Tests use it to verify that the profiler always resumes collection.
#[derive(Debug, Default)]
pub struct ToggleCollector {
    suspended: AtomicBool,
    collections: AtomicU64,
}

impl ToggleCollector {
    /// Creates a collector that is not suspended.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs a collection unless collection is suspended. Returns whether it ran.
    pub fn try_collect(&self) -> bool {
        if self.is_suspended() {
            return false;
        }

        self.collections.fetch_add(1, atomic::Ordering::Relaxed);
        true
    }

    /// How many collections have run.
    #[must_use]
    pub fn collections(&self) -> u64 {
        self.collections.load(atomic::Ordering::Relaxed)
    }
}

impl Collector for ToggleCollector {
    fn suspend(&self) -> bool {
        self.suspended.swap(true, atomic::Ordering::AcqRel)
    }

    fn resume(&self) {
        self.suspended.store(false, atomic::Ordering::Release);
    }

    fn is_suspended(&self) -> bool {
        self.suspended.load(atomic::Ordering::Acquire)
    }
}
