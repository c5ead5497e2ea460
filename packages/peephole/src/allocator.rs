//! Counting global allocator that feeds the allocation profiler.

use std::alloc::{GlobalAlloc, Layout, System};
use std::cell::{Cell, OnceCell};
use std::fmt;
use std::sync::atomic::{self, AtomicU64};
use std::sync::{Arc, LazyLock, Mutex};

use crate::{AllocationCounters, ERR_POISONED_LOCK};

/// Counters of one thread. Only the owning thread writes them; snapshots may read them
/// from any thread.
#[derive(Debug, Default)]
struct ThreadCounters {
    allocations: AtomicU64,
    allocated_bytes: AtomicU64,
    deallocations: AtomicU64,
    deallocated_bytes: AtomicU64,
}

impl ThreadCounters {
    #[inline]
    fn record_allocation(&self, bytes: u64) {
        self.allocations.fetch_add(1, atomic::Ordering::Relaxed);
        self.allocated_bytes
            .fetch_add(bytes, atomic::Ordering::Relaxed);
    }

    #[inline]
    fn record_deallocation(&self, bytes: u64) {
        self.deallocations.fetch_add(1, atomic::Ordering::Relaxed);
        self.deallocated_bytes
            .fetch_add(bytes, atomic::Ordering::Relaxed);
    }

    fn load(&self) -> AllocationCounters {
        AllocationCounters::new(
            self.allocations.load(atomic::Ordering::Relaxed),
            self.allocated_bytes.load(atomic::Ordering::Relaxed),
            self.deallocations.load(atomic::Ordering::Relaxed),
            self.deallocated_bytes.load(atomic::Ordering::Relaxed),
        )
    }
}

// Counters of every thread that ever allocated, kept after the thread exits so that
// process totals never go backwards.
static REGISTRY: LazyLock<Mutex<Vec<Arc<ThreadCounters>>>> =
    LazyLock::new(|| Mutex::new(Vec::new()));

thread_local! {
    // A raw pointer rather than an Arc: TLS values with destructors could run allocator code
    // during thread teardown. The pointee is owned by REGISTRY, which is never cleared.
    static THREAD_COUNTERS: OnceCell<*const ThreadCounters> = const { OnceCell::new() };

    // Set while this thread's counters are being created. Creation allocates, and those
    // allocations must not recurse into counter creation.
    static INITIALIZING: Cell<bool> = const { Cell::new(false) };
}

fn current_thread_counters() -> &'static ThreadCounters {
    THREAD_COUNTERS.with(|cell| {
        if let Some(ptr) = cell.get() {
            // SAFETY: The pointer comes from an Arc owned by REGISTRY for the rest of the process.
            return unsafe { &**ptr };
        }

        INITIALIZING.set(true);

        let counters = Arc::new(ThreadCounters::default());
        let ptr = Arc::as_ptr(&counters);
        REGISTRY.lock().expect(ERR_POISONED_LOCK).push(counters);
        _ = cell.set(ptr);

        INITIALIZING.set(false);

        // SAFETY: The pointer comes from an Arc owned by REGISTRY for the rest of the process.
        unsafe { &*ptr }
    })
}

fn with_counters(record: impl FnOnce(&ThreadCounters)) {
    if INITIALIZING.get() {
        return;
    }

    record(current_thread_counters());
}

fn size_as_u64(size: usize) -> u64 {
    size.try_into().expect("usize always fits into u64")
}

/// Counters of the calling thread since it first allocated through [`Allocator`].
pub(crate) fn thread_counters() -> AllocationCounters {
    if INITIALIZING.get() {
        return AllocationCounters::default();
    }

    current_thread_counters().load()
}

/// Sum of the counters of every thread, including threads that have exited.
pub(crate) fn process_counters() -> AllocationCounters {
    REGISTRY
        .lock()
        .expect(ERR_POISONED_LOCK)
        .iter()
        .map(|counters| counters.load())
        .fold(AllocationCounters::default(), |total, counters| {
            total.saturating_add(counters)
        })
}

// Unit tests cannot install a global allocator, so they inject activity directly.
#[cfg(test)]
pub(crate) fn register_fake_allocation(bytes: u64) {
    with_counters(|counters| counters.record_allocation(bytes));
}

#[cfg(test)]
pub(crate) fn register_fake_deallocation(bytes: u64) {
    with_counters(|counters| counters.record_deallocation(bytes));
}

/// A global allocator wrapper that counts allocations and deallocations per thread.
///
/// Install it as the `#[global_allocator]` of the binary (or test) to give the
/// [`AllocationProfiler`](crate::AllocationProfiler) something to measure. Without it, every
/// allocation delta is zero.
///
/// A reallocation counts as one deallocation of the old size plus one allocation of the new
/// size.
///
/// # Examples
///
/// ```
/// use peephole::Allocator;
///
/// #[global_allocator]
/// static ALLOCATOR: Allocator<std::alloc::System> = Allocator::system();
/// ```
pub struct Allocator<A: GlobalAlloc> {
    inner: A,
}

impl<A: GlobalAlloc> fmt::Debug for Allocator<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Allocator")
            .field("inner", &"<allocator>")
            .finish()
    }
}

impl Allocator<System> {
    /// Creates a counting allocator on top of the system allocator.
    #[must_use]
    #[inline]
    pub const fn system() -> Self {
        Self { inner: System }
    }
}

impl<A: GlobalAlloc> Allocator<A> {
    /// Creates a counting allocator on top of the given allocator.
    #[must_use]
    #[inline]
    pub const fn new(allocator: A) -> Self {
        Self { inner: allocator }
    }
}

// SAFETY: Every operation is forwarded to the wrapped allocator unchanged. Counting touches
// only thread-local and atomic state.
unsafe impl<A: GlobalAlloc> GlobalAlloc for Allocator<A> {
    #[inline]
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        with_counters(|counters| counters.record_allocation(size_as_u64(layout.size())));

        // SAFETY: Forwarding the caller's obligations to the wrapped allocator.
        unsafe { self.inner.alloc(layout) }
    }

    #[inline]
    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        with_counters(|counters| counters.record_deallocation(size_as_u64(layout.size())));

        // SAFETY: Forwarding the caller's obligations to the wrapped allocator.
        unsafe { self.inner.dealloc(ptr, layout) }
    }

    #[inline]
    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        with_counters(|counters| counters.record_allocation(size_as_u64(layout.size())));

        // SAFETY: Forwarding the caller's obligations to the wrapped allocator.
        unsafe { self.inner.alloc_zeroed(layout) }
    }

    #[inline]
    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        with_counters(|counters| {
            counters.record_deallocation(size_as_u64(layout.size()));
            counters.record_allocation(size_as_u64(new_size));
        });

        // SAFETY: Forwarding the caller's obligations to the wrapped allocator.
        unsafe { self.inner.realloc(ptr, layout, new_size) }
    }
}
