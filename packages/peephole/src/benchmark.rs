//! Side-by-side timing of named operations.

use std::fmt;
use std::hint::black_box;
use std::num::NonZero;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::{MethodHandle, Output};

type Operation<'a> = Box<dyn FnMut() + 'a>;

/// The operations to compare and how often to run each of them.
///
/// # Examples
///
/// ```
/// use std::num::NonZero;
///
/// use peephole::{BenchmarkSpec, InstrumentationContext, Output};
///
/// let context = InstrumentationContext::builder().output(Output::capture()).build();
///
/// let spec = BenchmarkSpec::new(NonZero::new(100).unwrap())
///     .operation("format", || {
///         let _ = format!("{}-{}", 1, 2);
///     })
///     .operation("concat", || {
///         let _ = "1".to_owned() + "-" + "2";
///     });
///
/// let report = context.benchmark_runner().compare(spec);
///
/// assert_eq!(report.entries()[0].name(), "format");
/// assert_eq!(report.entries()[1].name(), "concat");
/// ```
#[must_use]
pub struct BenchmarkSpec<'a> {
    repetitions: NonZero<u64>,
    operations: Vec<(String, Operation<'a>)>,
}

impl<'a> BenchmarkSpec<'a> {
    /// Creates an empty benchmark that runs each operation `repetitions` times.
    pub fn new(repetitions: NonZero<u64>) -> Self {
        Self {
            repetitions,
            operations: Vec::new(),
        }
    }

    /// Adds an operation. Operations are run and reported in the order they were added.
    pub fn operation<F>(mut self, name: impl Into<String>, operation: F) -> Self
    where
        F: FnMut() + 'a,
    {
        self.operations.push((name.into(), Box::new(operation)));
        self
    }

    /// How many times each operation runs.
    #[must_use]
    pub fn repetitions(&self) -> NonZero<u64> {
        self.repetitions
    }
}

impl fmt::Debug for BenchmarkSpec<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BenchmarkSpec")
            .field("repetitions", &self.repetitions)
            .field(
                "operations",
                &self
                    .operations
                    .iter()
                    .map(|(name, _)| name)
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// The timing of one operation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BenchmarkEntry {
    name: String,
    total: Duration,
    mean: Duration,
}

impl BenchmarkEntry {
    /// The name of the operation.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wall-clock time of all repetitions together.
    #[must_use]
    pub fn total(&self) -> Duration {
        self.total
    }

    /// Average wall-clock time of one repetition.
    #[must_use]
    pub fn mean(&self) -> Duration {
        self.mean
    }
}

/// The timings of all operations of a benchmark, in the order they were specified.
#[derive(Clone, Debug)]
pub struct ComparisonReport {
    repetitions: NonZero<u64>,
    entries: Vec<BenchmarkEntry>,
}

impl ComparisonReport {
    /// How many times each operation ran.
    #[must_use]
    pub fn repetitions(&self) -> NonZero<u64> {
        self.repetitions
    }

    /// The timings, in specification order.
    #[must_use]
    pub fn entries(&self) -> &[BenchmarkEntry] {
        &self.entries
    }

    /// The entry with the lowest total time, if there are any entries.
    #[must_use]
    pub fn fastest(&self) -> Option<&BenchmarkEntry> {
        self.entries.iter().min_by_key(|entry| entry.total)
    }
}

impl fmt::Display for ComparisonReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name_width = self
            .entries
            .iter()
            .map(|entry| entry.name.len())
            .max()
            .unwrap_or(0)
            .max("operation".len());

        writeln!(f, "Comparison ({} repetitions each):", self.repetitions)?;
        writeln!(
            f,
            "  {:<name_width$} {:>14} {:>14}",
            "operation", "total", "per iteration"
        )?;

        for entry in &self.entries {
            writeln!(
                f,
                "  {:<name_width$} {:>14} {:>14}",
                entry.name,
                format!("{:?}", entry.total),
                format!("{:?}", entry.mean)
            )?;
        }

        Ok(())
    }
}

/// Runs operations repeatedly and compares their wall-clock timings.
#[derive(Clone, Debug)]
pub struct BenchmarkRunner {
    output: Output,
}

impl BenchmarkRunner {
    pub(crate) fn new(output: Output) -> Self {
        Self { output }
    }

    /// Runs every operation of the benchmark its configured number of times, one operation
    /// after the other, and prints the comparison table.
    pub fn compare(&self, spec: BenchmarkSpec<'_>) -> ComparisonReport {
        let repetitions = spec.repetitions;

        let entries = spec
            .operations
            .into_iter()
            .map(|(name, mut operation)| {
                let started = Instant::now();
                for _ in 0..repetitions.get() {
                    operation();
                }
                let total = started.elapsed();
                let mean = per_iteration(total, repetitions);

                debug!(operation = %name, ?total, ?mean, "benchmarked operation");

                BenchmarkEntry { name, total, mean }
            })
            .collect();

        let report = ComparisonReport {
            repetitions,
            entries,
        };

        self.output.write_display(&report);

        report
    }

    /// Compares methods of the same signature by calling each of them on the same receiver
    /// with the same arguments. Entries are named after the methods.
    pub fn compare_methods<S, A, R>(
        &self,
        repetitions: NonZero<u64>,
        receiver: &S,
        args: &A,
        methods: &[&MethodHandle<S, A, R>],
    ) -> ComparisonReport
    where
        A: Clone,
    {
        let spec = methods
            .iter()
            .fold(BenchmarkSpec::new(repetitions), |spec, method| {
                spec.operation(method.target().to_string(), move || {
                    black_box(method.call(receiver, args.clone()));
                })
            });

        self.compare(spec)
    }
}

fn per_iteration(total: Duration, repetitions: NonZero<u64>) -> Duration {
    let nanos = total.as_nanos() / u128::from(repetitions.get());
    Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
}
