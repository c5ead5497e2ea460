use std::num::NonZero;
use std::sync::Arc;

use crate::pal::PlatformFacade;
use crate::{Collector, Environment, InstrumentationContext, NoCollector, Output};

/// Call stacks printed by the tracer are truncated to this many innermost frames by default.
pub const DEFAULT_STACK_DEPTH: NonZero<usize> = NonZero::new(5).expect("5 is not zero");

/// Creates instances of [`InstrumentationContext`].
///
/// Every parameter is optional. Use `InstrumentationContext::builder()` to create a new
/// instance of this builder.
///
/// # Example
///
/// ```
/// use std::num::NonZero;
///
/// use peephole::{Environment, InstrumentationContext, Output};
///
/// let context = InstrumentationContext::builder()
///     .environment(Environment::Staging)
///     .output(Output::capture())
///     .stack_depth(NonZero::new(10).unwrap())
///     .build();
///
/// assert_eq!(context.environment(), Environment::Staging);
/// ```
#[derive(Debug)]
#[must_use]
pub struct ContextBuilder {
    /// Defaults to the value of the `PEEPHOLE_ENV` environment variable.
    environment: Option<Environment>,

    output: Output,

    stack_depth: NonZero<usize>,

    /// Defaults to [`NoCollector`].
    collector: Arc<dyn Collector>,

    platform: PlatformFacade,
}

impl ContextBuilder {
    pub(crate) fn new() -> Self {
        Self {
            environment: None,
            output: Output::stdout(),
            stack_depth: DEFAULT_STACK_DEPTH,
            collector: Arc::new(NoCollector),
            platform: PlatformFacade::real(),
        }
    }

    /// Sets the deployment environment, which decides whether debug-only operations are
    /// allowed.
    ///
    /// Defaults to [`Environment::from_env()`].
    pub fn environment(self, environment: Environment) -> Self {
        Self {
            environment: Some(environment),
            ..self
        }
    }

    /// Sets where instrumentation prints its reports. Defaults to standard output.
    pub fn output(self, output: Output) -> Self {
        Self { output, ..self }
    }

    /// Sets how many innermost frames of a call stack the tracer prints.
    ///
    /// Defaults to [`DEFAULT_STACK_DEPTH`].
    pub fn stack_depth(self, stack_depth: NonZero<usize>) -> Self {
        Self {
            stack_depth,
            ..self
        }
    }

    /// Sets the garbage collector that the allocation profiler suspends while measuring.
    pub fn collector(self, collector: Arc<dyn Collector>) -> Self {
        Self { collector, ..self }
    }

    #[cfg(test)]
    pub(crate) fn platform(self, platform: PlatformFacade) -> Self {
        Self { platform, ..self }
    }

    /// Creates the context.
    pub fn build(self) -> InstrumentationContext {
        InstrumentationContext::from_parts(
            self.environment.unwrap_or_else(Environment::from_env),
            self.output,
            self.stack_depth,
            self.collector,
            self.platform,
        )
    }
}
