//! Isolation of user-supplied instrumentation callbacks.

use std::any::Any;
use std::fmt::Display;
use std::panic::{self, AssertUnwindSafe};

use tracing::warn;

/// Runs an observer, hook or subscriber callback, swallowing any panic it raises.
///
/// A bug in a debugging aid must not take down the code being debugged, so the panic is
/// logged and execution of the observed code continues.
pub(crate) fn shielded<F>(site: &'static str, subject: &dyn Display, callback: F)
where
    F: FnOnce(),
{
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(callback)) {
        warn!(
            site,
            subject = %subject,
            panic_message = panic_message(payload.as_ref()),
            "instrumentation callback panicked; observed code continues"
        );
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "<non-string panic payload>"
    }
}
