use std::fmt::Debug;
use std::sync::Mutex;
use std::sync::atomic::{self, AtomicU64};
use std::time::{Duration, SystemTime};

use crate::{ERR_POISONED_LOCK, Target};

/// One logged invocation of an intercepted method.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CallLogEntry {
    call_number: u64,
    arguments: String,
    duration: Option<Duration>,
}

impl CallLogEntry {
    /// The 1-based sequence number of the call on its interception.
    #[must_use]
    pub fn call_number(&self) -> u64 {
        self.call_number
    }

    /// The `Debug` rendering of the arguments.
    #[must_use]
    pub fn arguments(&self) -> &str {
        &self.arguments
    }

    /// How long the original implementation ran. `None` if it panicked.
    #[must_use]
    pub fn duration(&self) -> Option<Duration> {
        self.duration
    }
}

/// The state kept for one wrapped method while it stays wrapped.
///
/// The call counter includes every invocation that reached the wrapper, also those where
/// the original implementation returned an error or panicked.
#[derive(Debug)]
pub struct InterceptionRecord {
    target: Target,
    wrapped_at: SystemTime,
    calls: AtomicU64,
    call_log: Option<Mutex<Vec<CallLogEntry>>>,
}

impl InterceptionRecord {
    pub(crate) fn new(target: Target, log_calls: bool) -> Self {
        Self {
            target,
            wrapped_at: SystemTime::now(),
            calls: AtomicU64::new(0),
            call_log: log_calls.then(|| Mutex::new(Vec::new())),
        }
    }

    /// The wrapped method.
    #[must_use]
    pub fn target(&self) -> &Target {
        &self.target
    }

    /// When the method was wrapped.
    #[must_use]
    pub fn wrapped_at(&self) -> SystemTime {
        self.wrapped_at
    }

    /// How many times the wrapped method has been called.
    #[must_use]
    pub fn call_count(&self) -> u64 {
        self.calls.load(atomic::Ordering::Relaxed)
    }

    /// A copy of the per-call log. Empty unless call logging was requested when wrapping.
    #[must_use]
    pub fn call_log(&self) -> Vec<CallLogEntry> {
        self.call_log
            .as_ref()
            .map(|log| log.lock().expect(ERR_POISONED_LOCK).clone())
            .unwrap_or_default()
    }

    /// Counts a call and, when call logging is enabled, starts its log entry.
    pub(crate) fn begin_call<A: Debug>(&self, arguments: &A) -> ActiveCall<'_> {
        let call_number = self
            .calls
            .fetch_add(1, atomic::Ordering::Relaxed)
            .wrapping_add(1);

        ActiveCall {
            record: self,
            call_number,
            arguments: self.call_log.as_ref().map(|_| format!("{arguments:?}")),
            duration: None,
        }
    }
}

/// A call in progress. The log entry is written when this is dropped, so calls that panic
/// are logged too (without a duration).
#[derive(Debug)]
pub(crate) struct ActiveCall<'a> {
    record: &'a InterceptionRecord,
    call_number: u64,
    arguments: Option<String>,
    duration: Option<Duration>,
}

impl ActiveCall<'_> {
    pub(crate) fn call_number(&self) -> u64 {
        self.call_number
    }

    pub(crate) fn finish(mut self, duration: Duration) {
        self.duration = Some(duration);
    }
}

impl Drop for ActiveCall<'_> {
    fn drop(&mut self) {
        let (Some(log), Some(arguments)) = (&self.record.call_log, self.arguments.take()) else {
            return;
        };

        // A poisoned log only loses entries; it must never turn into a second panic here.
        if let Ok(mut log) = log.lock() {
            log.push(CallLogEntry {
                call_number: self.call_number,
                arguments,
                duration: self.duration,
            });
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::panic::{self, AssertUnwindSafe};

    use super::*;

    static_assertions::assert_impl_all!(InterceptionRecord: Send, Sync);

    #[test]
    fn counts_calls_without_logging() {
        let record = InterceptionRecord::new(Target::new("Order", "save"), false);

        record.begin_call(&1).finish(Duration::ZERO);
        record.begin_call(&2).finish(Duration::ZERO);

        assert_eq!(record.call_count(), 2);
        assert!(record.call_log().is_empty());
    }

    #[test]
    fn logs_arguments_and_durations() {
        let record = InterceptionRecord::new(Target::new("Order", "save"), true);

        let call = record.begin_call(&("alice", 3));
        assert_eq!(call.call_number(), 1);
        call.finish(Duration::from_millis(5));

        let log = record.call_log();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].call_number(), 1);
        assert_eq!(log[0].arguments(), r#"("alice", 3)"#);
        assert_eq!(log[0].duration(), Some(Duration::from_millis(5)));
    }

    #[test]
    fn unfinished_call_is_logged_without_duration() {
        let record = InterceptionRecord::new(Target::new("Order", "save"), true);

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            let _call = record.begin_call(&"boom");
            panic!("original failed");
        }));

        assert!(result.is_err());
        assert_eq!(record.call_count(), 1);
        assert_eq!(record.call_log()[0].duration(), None);
    }
}
