//! Integration tests for the allocation profiler with real memory allocations.
//!
//! These tests install the counting allocator as the global allocator, so the profiler
//! sees the allocator activity of the measured blocks.

#![cfg(not(miri))] // Miri replaces the global allocator, so cannot be used here.

use std::hint::black_box;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;

use peephole::{
    AllocationCategory, Allocator, Collector, InstrumentationContext, Output, Scope,
    ToggleCollector,
};

#[global_allocator]
static ALLOCATOR: Allocator<std::alloc::System> = Allocator::system();

fn context_with_collector() -> (InstrumentationContext, Arc<ToggleCollector>) {
    let collector = Arc::new(ToggleCollector::new());
    let context = InstrumentationContext::builder()
        .output(Output::capture())
        .collector(Arc::clone(&collector) as Arc<dyn Collector>)
        .build();

    (context, collector)
}

#[test]
fn thousand_objects_are_counted() {
    const OBJECTS: u64 = 1000;

    let (context, _) = context_with_collector();

    let measurement = context.allocation_profiler().measure(|| {
        (0..OBJECTS).map(|n| black_box(Box::new(n))).collect::<Vec<_>>()
    });

    let allocations = measurement
        .report()
        .get(Scope::Thread, AllocationCategory::Allocations);

    assert!(allocations >= OBJECTS, "only {allocations} allocations seen");
    assert!(
        allocations < OBJECTS * 2,
        "{allocations} allocations is far more than expected"
    );
    assert!(
        measurement
            .report()
            .get(Scope::Thread, AllocationCategory::AllocatedBytes)
            >= OBJECTS * 8
    );
    assert_eq!(measurement.value().len(), 1000);
}

#[test]
fn freed_memory_is_counted_as_deallocations() {
    let (context, _) = context_with_collector();

    let measurement = context.allocation_profiler().measure(|| {
        for _ in 0..10 {
            drop(black_box(vec![0_u8; 256]));
        }
    });

    let report = measurement.report();
    assert!(report.get(Scope::Thread, AllocationCategory::Allocations) >= 10);
    assert!(report.get(Scope::Thread, AllocationCategory::Deallocations) >= 10);
    assert!(report.get(Scope::Thread, AllocationCategory::DeallocatedBytes) >= 2560);
}

#[test]
fn other_threads_are_only_visible_at_process_scope() {
    let (context, _) = context_with_collector();

    let measurement = context.allocation_profiler().measure(|| {
        thread::spawn(|| {
            for n in 0..100_u64 {
                black_box(Box::new(n));
            }
        })
        .join()
        .unwrap();
    });

    let report = measurement.report();
    assert!(report.get(Scope::Process, AllocationCategory::Allocations) >= 100);
    assert!(
        report.get(Scope::Thread, AllocationCategory::Allocations)
            < report.get(Scope::Process, AllocationCategory::Allocations)
    );
}

#[test]
fn collector_is_resumed_after_panicking_block() {
    let (context, collector) = context_with_collector();
    let profiler = context.allocation_profiler();

    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        profiler.measure(|| {
            assert!(collector.is_suspended());
            panic!("block failed");
        })
    }));

    assert!(result.is_err());
    assert!(!collector.is_suspended());

    // Allocation-heavy work afterwards is collected normally again.
    let _data: Vec<Vec<u8>> = (0..100).map(|_| vec![0; 64]).collect();
    assert!(collector.try_collect());
}

#[test]
fn manual_snapshots_can_be_diffed() {
    let (context, _) = context_with_collector();
    let profiler = context.allocation_profiler();

    let before = profiler.snapshot();
    let data = black_box(vec![1_u64; 32]);
    let after = profiler.snapshot();
    drop(data);

    let delta = after.delta_since(&before);
    assert!(delta.get(Scope::Thread, AllocationCategory::Allocations) >= 1);
    assert!(delta.get(Scope::Thread, AllocationCategory::AllocatedBytes) >= 256);
}

#[cfg(target_os = "linux")]
#[test]
fn resident_memory_is_readable() {
    let (context, _) = context_with_collector();

    let measurement = context
        .allocation_profiler()
        .measure_memory(|| black_box(vec![1_u8; 4 * 1024 * 1024]))
        .unwrap();

    assert!(measurement.before_bytes() > 0);
    assert!(measurement.after_bytes() > 0);
    assert_eq!(measurement.value().len(), 4 * 1024 * 1024);
}
