//! Allocation and resident memory measurement of scoped blocks.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::allocator::{process_counters, thread_counters};
use crate::pal::{Platform, PlatformFacade};
use crate::{Collector, Error, Output, Result};

/// A kind of allocator activity that is counted.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum AllocationCategory {
    /// Number of allocations (including the allocation half of reallocations).
    Allocations,

    /// Bytes requested by allocations.
    AllocatedBytes,

    /// Number of deallocations (including the deallocation half of reallocations).
    Deallocations,

    /// Bytes released by deallocations.
    DeallocatedBytes,
}

impl AllocationCategory {
    /// Every category, in report order.
    pub const ALL: [Self; 4] = [
        Self::Allocations,
        Self::AllocatedBytes,
        Self::Deallocations,
        Self::DeallocatedBytes,
    ];

    /// Human-readable name of the category.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Allocations => "allocations",
            Self::AllocatedBytes => "allocated bytes",
            Self::Deallocations => "deallocations",
            Self::DeallocatedBytes => "deallocated bytes",
        }
    }
}

impl fmt::Display for AllocationCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Allocator activity counters, either absolute or as a difference between two snapshots.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct AllocationCounters {
    allocations: u64,
    allocated_bytes: u64,
    deallocations: u64,
    deallocated_bytes: u64,
}

impl AllocationCounters {
    pub(crate) const fn new(
        allocations: u64,
        allocated_bytes: u64,
        deallocations: u64,
        deallocated_bytes: u64,
    ) -> Self {
        Self {
            allocations,
            allocated_bytes,
            deallocations,
            deallocated_bytes,
        }
    }

    /// The value of one category.
    #[must_use]
    pub const fn get(&self, category: AllocationCategory) -> u64 {
        match category {
            AllocationCategory::Allocations => self.allocations,
            AllocationCategory::AllocatedBytes => self.allocated_bytes,
            AllocationCategory::Deallocations => self.deallocations,
            AllocationCategory::DeallocatedBytes => self.deallocated_bytes,
        }
    }

    /// Bytes allocated and not (yet) deallocated, or zero if more was released than requested.
    #[must_use]
    pub const fn retained_bytes(&self) -> u64 {
        self.allocated_bytes.saturating_sub(self.deallocated_bytes)
    }

    pub(crate) const fn saturating_add(self, other: Self) -> Self {
        Self {
            allocations: self.allocations.saturating_add(other.allocations),
            allocated_bytes: self.allocated_bytes.saturating_add(other.allocated_bytes),
            deallocations: self.deallocations.saturating_add(other.deallocations),
            deallocated_bytes: self
                .deallocated_bytes
                .saturating_add(other.deallocated_bytes),
        }
    }

    const fn saturating_sub(self, other: Self) -> Self {
        Self {
            allocations: self.allocations.saturating_sub(other.allocations),
            allocated_bytes: self.allocated_bytes.saturating_sub(other.allocated_bytes),
            deallocations: self.deallocations.saturating_sub(other.deallocations),
            deallocated_bytes: self
                .deallocated_bytes
                .saturating_sub(other.deallocated_bytes),
        }
    }
}

/// Which threads a counter covers.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum Scope {
    /// Only the thread that took the snapshot.
    Thread,

    /// Every thread of the process.
    Process,
}

/// Point-in-time allocator counters of the current thread and of the whole process.
///
/// Counters only move while [`Allocator`](crate::Allocator) is the global allocator.
#[derive(Clone, Copy, Debug)]
pub struct AllocationSnapshot {
    thread: AllocationCounters,
    process: AllocationCounters,
    taken_at: Instant,
}

impl AllocationSnapshot {
    /// Captures the counters as they are now.
    #[must_use]
    pub fn take() -> Self {
        Self {
            thread: thread_counters(),
            process: process_counters(),
            taken_at: Instant::now(),
        }
    }

    /// The counters at the given scope.
    #[must_use]
    pub fn counters(&self, scope: Scope) -> AllocationCounters {
        match scope {
            Scope::Thread => self.thread,
            Scope::Process => self.process,
        }
    }

    /// The activity between an earlier snapshot and this one.
    ///
    /// The thread scope is only meaningful when both snapshots were taken on the same thread.
    #[must_use]
    pub fn delta_since(&self, earlier: &Self) -> DeltaReport {
        DeltaReport {
            thread: self.thread.saturating_sub(earlier.thread),
            process: self.process.saturating_sub(earlier.process),
            elapsed: self.taken_at.saturating_duration_since(earlier.taken_at),
        }
    }
}

/// Per-category allocator activity between two snapshots.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DeltaReport {
    thread: AllocationCounters,
    process: AllocationCounters,
    elapsed: Duration,
}

impl DeltaReport {
    /// The change in one category at one scope.
    #[must_use]
    pub fn get(&self, scope: Scope, category: AllocationCategory) -> u64 {
        self.counters(scope).get(category)
    }

    /// The changes at one scope.
    #[must_use]
    pub fn counters(&self, scope: Scope) -> AllocationCounters {
        match scope {
            Scope::Thread => self.thread,
            Scope::Process => self.process,
        }
    }

    /// Every category with its thread and process change, in report order.
    pub fn iter(&self) -> impl Iterator<Item = (AllocationCategory, u64, u64)> + '_ {
        AllocationCategory::ALL
            .into_iter()
            .map(|category| (category, self.thread.get(category), self.process.get(category)))
    }

    /// Wall-clock time between the two snapshots.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }
}

impl fmt::Display for DeltaReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Allocation delta ({:?}):", self.elapsed)?;
        writeln!(f, "  {:<18} {:>14} {:>14}", "category", "thread", "process")?;

        for (category, thread, process) in self.iter() {
            writeln!(f, "  {:<18} {thread:>14} {process:>14}", category.name())?;
        }

        Ok(())
    }
}

/// The outcome of [`AllocationProfiler::measure()`].
#[derive(Debug)]
pub struct Measurement<T> {
    value: T,
    report: DeltaReport,
}

impl<T> Measurement<T> {
    /// The value returned by the measured block.
    #[must_use]
    pub fn value(&self) -> &T {
        &self.value
    }

    /// The allocator activity of the measured block.
    #[must_use]
    pub fn report(&self) -> &DeltaReport {
        &self.report
    }

    /// Discards the report and returns the value of the block.
    #[must_use]
    pub fn into_value(self) -> T {
        self.value
    }

    /// Returns the value of the block and the report.
    #[must_use]
    pub fn into_parts(self) -> (T, DeltaReport) {
        (self.value, self.report)
    }
}

/// The outcome of [`AllocationProfiler::measure_memory()`].
#[derive(Debug)]
pub struct MemoryMeasurement<T> {
    value: T,
    before_bytes: u64,
    after_bytes: u64,
}

impl<T> MemoryMeasurement<T> {
    /// The value returned by the measured block.
    #[must_use]
    pub fn value(&self) -> &T {
        &self.value
    }

    /// Resident memory of the process before the block ran.
    #[must_use]
    pub fn before_bytes(&self) -> u64 {
        self.before_bytes
    }

    /// Resident memory of the process after the block ran.
    #[must_use]
    pub fn after_bytes(&self) -> u64 {
        self.after_bytes
    }

    /// Change in resident memory. Negative if the process shrank.
    #[must_use]
    pub fn delta_bytes(&self) -> i128 {
        i128::from(self.after_bytes) - i128::from(self.before_bytes)
    }

    /// Discards the measurement and returns the value of the block.
    #[must_use]
    pub fn into_value(self) -> T {
        self.value
    }
}

impl<T> fmt::Display for MemoryMeasurement<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Resident memory: {} -> {} bytes ({:+} bytes)",
            self.before_bytes,
            self.after_bytes,
            self.delta_bytes()
        )
    }
}

/// Measures the allocator activity and memory growth of scoped blocks.
///
/// # Examples
///
/// ```
/// use peephole::{AllocationCategory, InstrumentationContext, Output, Scope};
///
/// let context = InstrumentationContext::builder().output(Output::capture()).build();
///
/// let measurement = context.allocation_profiler().measure(|| vec![0_u8; 1024]);
///
/// assert_eq!(measurement.value().len(), 1024);
/// // Without `peephole::Allocator` as the global allocator, nothing is counted.
/// assert_eq!(
///     measurement
///         .report()
///         .get(Scope::Thread, AllocationCategory::Allocations),
///     0
/// );
/// ```
#[derive(Clone, Debug)]
pub struct AllocationProfiler {
    collector: Arc<dyn Collector>,
    output: Output,
    platform: PlatformFacade,
}

impl AllocationProfiler {
    pub(crate) fn new(collector: Arc<dyn Collector>, output: Output, platform: PlatformFacade) -> Self {
        Self {
            collector,
            output,
            platform,
        }
    }

    /// Runs the block with garbage collection suspended and reports its allocator activity.
    ///
    /// The collector is returned to its previous state afterwards, even if the block panics.
    /// The report is printed to the context output and returned together with the value.
    pub fn measure<T, F>(&self, block: F) -> Measurement<T>
    where
        F: FnOnce() -> T,
    {
        let was_suspended = self.collector.suspend();

        let collector = Arc::clone(&self.collector);
        let restore_collector = scopeguard::guard((), move |()| {
            if !was_suspended {
                collector.resume();
            }
        });

        let before = AllocationSnapshot::take();
        let value = block();
        let after = AllocationSnapshot::take();

        drop(restore_collector);

        let report = after.delta_since(&before);

        debug!(
            allocations = report.get(Scope::Thread, AllocationCategory::Allocations),
            allocated_bytes = report.get(Scope::Thread, AllocationCategory::AllocatedBytes),
            elapsed = ?report.elapsed(),
            "measured block"
        );

        self.output.write_display(&report);

        Measurement { value, report }
    }

    /// Runs the block and reports the change of the resident memory size of the process.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MemoryUnavailable`] if the platform does not expose the resident
    /// memory size. The block is not run in that case.
    pub fn measure_memory<T, F>(&self, block: F) -> Result<MemoryMeasurement<T>>
    where
        F: FnOnce() -> T,
    {
        let before_bytes = self.resident_memory_bytes()?;
        let value = block();
        let after_bytes = self.resident_memory_bytes()?;

        let measurement = MemoryMeasurement {
            value,
            before_bytes,
            after_bytes,
        };

        self.output.write_display(&measurement);

        Ok(measurement)
    }

    /// Captures the allocator counters as they are now, for manual diffing.
    #[must_use]
    pub fn snapshot(&self) -> AllocationSnapshot {
        AllocationSnapshot::take()
    }

    /// The current resident memory size of the process.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MemoryUnavailable`] if the platform does not expose it.
    pub fn resident_memory_bytes(&self) -> Result<u64> {
        let status = self
            .platform
            .process_status_contents()
            .ok_or_else(|| Error::MemoryUnavailable {
                reason: "process status is not exposed on this platform".to_owned(),
            })?;

        parse_resident_bytes(&status)
    }
}

/// Extracts `VmRSS` from the contents of `/proc/self/status`. The kernel reports it in kB.
fn parse_resident_bytes(status: &str) -> Result<u64> {
    let line = status
        .lines()
        .find_map(|line| line.strip_prefix("VmRSS:"))
        .ok_or_else(|| Error::MemoryUnavailable {
            reason: "process status has no VmRSS entry".to_owned(),
        })?;

    let kilobytes = line
        .trim()
        .trim_end_matches("kB")
        .trim()
        .parse::<u64>()
        .map_err(|e| Error::MemoryUnavailable {
            reason: format!("VmRSS value '{}' is not a number: {e}", line.trim()),
        })?;

    Ok(kilobytes.saturating_mul(1024))
}
