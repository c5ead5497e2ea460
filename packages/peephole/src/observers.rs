//! Ready-made observers behind the convenience methods of [`MethodInterceptor`](crate::MethodInterceptor).

use std::fmt::Debug;
use std::time::Duration;

use crate::{CallInfo, CallObserver, Output};

/// Prints the running call count on every call.
#[derive(Debug)]
pub(crate) struct CallCounter {
    output: Output,
}

impl CallCounter {
    pub(crate) fn new(output: Output) -> Self {
        Self { output }
    }
}

impl<S, A, R> CallObserver<S, A, R> for CallCounter {
    fn on_call(&self, call: &CallInfo<'_>, _: &S, _: &A) {
        self.output.write_line(format!(
            "{} called {} times",
            call.target(),
            call.call_number()
        ));
    }
}

/// Prints how long each call took.
#[derive(Debug)]
pub(crate) struct CallTimer {
    output: Output,
}

impl CallTimer {
    pub(crate) fn new(output: Output) -> Self {
        Self { output }
    }
}

impl<S, A, R> CallObserver<S, A, R> for CallTimer {
    fn on_return(&self, call: &CallInfo<'_>, _: &R, elapsed: Duration) {
        self.output
            .write_line(format!("{} took {elapsed:?}", call.target()));
    }
}

/// Prints the arguments of each call.
#[derive(Debug)]
pub(crate) struct ArgumentLogger {
    output: Output,
}

impl ArgumentLogger {
    pub(crate) fn new(output: Output) -> Self {
        Self { output }
    }
}

impl<S, A: Debug, R> CallObserver<S, A, R> for ArgumentLogger {
    fn on_call(&self, call: &CallInfo<'_>, _: &S, args: &A) {
        self.output
            .write_line(format!("{} called with {args:?}", call.target()));
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::Target;

    fn info(target: &Target, call_number: u64) -> CallInfo<'_> {
        CallInfo::new(target, call_number)
    }

    #[test]
    fn counter_prints_running_total() {
        let output = Output::capture();
        let counter = CallCounter::new(output.clone());
        let target = Target::new("Order", "save");

        CallObserver::<(), (), ()>::on_call(&counter, &info(&target, 1), &(), &());
        CallObserver::<(), (), ()>::on_call(&counter, &info(&target, 2), &(), &());

        assert_eq!(
            output.lines(),
            vec!["Order#save called 1 times", "Order#save called 2 times"]
        );
    }

    #[test]
    fn timer_prints_elapsed() {
        let output = Output::capture();
        let timer = CallTimer::new(output.clone());
        let target = Target::new("Order", "save");

        CallObserver::<(), (), ()>::on_return(
            &timer,
            &info(&target, 1),
            &(),
            Duration::from_millis(3),
        );

        assert_eq!(output.lines(), vec!["Order#save took 3ms"]);
    }

    #[test]
    fn argument_logger_prints_debug_rendering() {
        let output = Output::capture();
        let logger = ArgumentLogger::new(output.clone());
        let target = Target::new("Mailer", "deliver");

        CallObserver::<(), (&str, u8), ()>::on_call(
            &logger,
            &info(&target, 1),
            &(),
            &("ops@example.com", 2),
        );

        assert_eq!(
            output.lines(),
            vec![r#"Mailer#deliver called with ("ops@example.com", 2)"#]
        );
    }
}
