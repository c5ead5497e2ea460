use std::time::Duration;

use crate::{Notifications, Output, Payload, Subscription};

/// The channel that database layers publish executed queries on.
pub const QUERY_CHANNEL: &str = "sql.query";

/// Prints structured events from named channels as they occur.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use peephole::{InstrumentationContext, Output, Payload, QUERY_CHANNEL};
///
/// let output = Output::capture();
/// let context = InstrumentationContext::builder().output(output.clone()).build();
///
/// let subscription = context.query_logger().log_queries();
///
/// context.notifications().publish(
///     QUERY_CHANNEL,
///     &Payload::new().with("sql", "SELECT * FROM orders"),
///     Duration::from_micros(1500),
/// );
///
/// assert_eq!(output.lines(), vec!["[query] SELECT * FROM orders (1.500 ms)"]);
/// subscription.cancel();
/// ```
#[derive(Clone, Debug)]
pub struct QueryEventLogger {
    notifications: Notifications,
    output: Output,
}

impl QueryEventLogger {
    pub(crate) fn new(notifications: Notifications, output: Output) -> Self {
        Self {
            notifications,
            output,
        }
    }

    /// Prints one line per event on the matching channels, as rendered by the formatter.
    ///
    /// The pattern is either an exact channel name or a prefix followed by `*`.
    pub fn subscribe<F>(&self, pattern: &str, formatter: F) -> Subscription
    where
        F: Fn(&Payload, Duration) -> String + Send + Sync + 'static,
    {
        let output = self.output.clone();

        self.notifications.subscribe(pattern, move |notification| {
            output.write_line(formatter(notification.payload(), notification.duration()));
        })
    }

    /// Prints every query published on [`QUERY_CHANNEL`] as `[query] <sql> (<ms> ms)`.
    pub fn log_queries(&self) -> Subscription {
        self.subscribe(QUERY_CHANNEL, format_query)
    }
}

/// The default rendering of a query event. The statement is taken from the `sql` field.
#[must_use]
pub fn format_query(payload: &Payload, duration: Duration) -> String {
    format!(
        "[query] {} ({:.3} ms)",
        payload.get("sql").unwrap_or("<unknown statement>"),
        duration.as_secs_f64() * 1000.0
    )
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    fn logger() -> (QueryEventLogger, Notifications, Output) {
        let notifications = Notifications::new();
        let output = Output::capture();
        (
            QueryEventLogger::new(notifications.clone(), output.clone()),
            notifications,
            output,
        )
    }

    #[test]
    fn default_format_names_statement_and_duration() {
        let payload = Payload::new().with("sql", "UPDATE orders SET state = 'paid'");

        assert_eq!(
            format_query(&payload, Duration::from_millis(12)),
            "[query] UPDATE orders SET state = 'paid' (12.000 ms)"
        );
        assert_eq!(
            format_query(&Payload::new(), Duration::ZERO),
            "[query] <unknown statement> (0.000 ms)"
        );
    }

    #[test]
    fn log_queries_ignores_other_channels() {
        let (logger, notifications, output) = logger();
        let _subscription = logger.log_queries();

        notifications.publish("sql.transaction", &Payload::new(), Duration::ZERO);
        notifications.publish(QUERY_CHANNEL, &Payload::new().with("sql", "SELECT 1"), Duration::ZERO);

        assert_eq!(output.lines(), vec!["[query] SELECT 1 (0.000 ms)"]);
    }

    #[test]
    fn custom_formatter_receives_payload() {
        let (logger, notifications, output) = logger();
        let subscription = logger.subscribe("cache.*", |payload, _| {
            format!("[cache] {payload}")
        });

        notifications.instrument("cache.write", Payload::new().with("key", "user:1"), || ());
        assert!(subscription.cancel());
        notifications.instrument("cache.write", Payload::new().with("key", "user:2"), || ());

        assert_eq!(output.lines(), vec!["[cache] key=user:1"]);
    }
}
