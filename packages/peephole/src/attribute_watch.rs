use std::cell::RefCell;
use std::fmt::Debug;
use std::sync::Mutex;
use std::sync::atomic::{self, AtomicU64};

use tracing::debug;

use crate::{ERR_POISONED_LOCK, ExecutionTracer, TraceFilter, TraceSession};

static NEXT_WATCH_ID: AtomicU64 = AtomicU64::new(0);

thread_local! {
    // Watches that are reading their value on this thread. A watch does not inspect events
    // raised by its own read, otherwise a read that calls traced methods would recurse
    // forever. Other watches still see those events.
    static READING: RefCell<Vec<u64>> = const { RefCell::new(Vec::new()) };
}

fn is_reading(watch_id: u64) -> bool {
    READING.with_borrow(|reading| reading.contains(&watch_id))
}

impl ExecutionTracer {
    /// Reports every change of a value observed between trace events.
    ///
    /// The value is read once immediately and then again on every event that matches the
    /// filter. Whenever the new value differs from the last observed one, the tracer prints
    /// `[watch] <name> changed: <old> -> <new>` followed by the call stack at the event,
    /// truncated to the configured stack depth.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::sync::Arc;
    /// use std::sync::atomic::{AtomicU32, Ordering};
    ///
    /// use peephole::{InstrumentationContext, Output, TraceFilter};
    ///
    /// struct Account {
    ///     balance: AtomicU32,
    /// }
    ///
    /// let output = Output::capture();
    /// let context = InstrumentationContext::builder().output(output.clone()).build();
    /// let table = context.method_table("Account");
    /// let deposit = table.define("deposit", |account: &Account, amount: u32| {
    ///     account.balance.fetch_add(amount, Ordering::Relaxed);
    /// });
    ///
    /// let account = Arc::new(Account { balance: AtomicU32::new(0) });
    /// let watched = Arc::clone(&account);
    /// let _session = context.tracer().watch_attribute("balance", TraceFilter::new(), move || {
    ///     watched.balance.load(Ordering::Relaxed)
    /// });
    ///
    /// deposit.call(&account, 10);
    ///
    /// assert_eq!(output.lines()[0], "[watch] balance changed: 0 -> 10");
    /// ```
    pub fn watch_attribute<T, F>(&self, name: &str, filter: TraceFilter, read: F) -> TraceSession
    where
        T: PartialEq + Debug + Send + 'static,
        F: Fn() -> T + Send + Sync + 'static,
    {
        let watch_id = NEXT_WATCH_ID.fetch_add(1, atomic::Ordering::Relaxed);
        let name = name.to_owned();
        let output = self.output().clone();
        let stack_depth = self.stack_depth();

        let initial = read();
        debug!(attribute = %name, ?initial, "watching attribute");
        let last = Mutex::new(initial);

        self.enable(filter, move |_, stack| {
            if is_reading(watch_id) {
                return;
            }

            let current = {
                READING.with_borrow_mut(|reading| reading.push(watch_id));
                let _reading = scopeguard::guard((), |()| {
                    READING.with_borrow_mut(|reading| reading.retain(|id| *id != watch_id));
                });
                read()
            };

            let mut last = last.lock().expect(ERR_POISONED_LOCK);
            if *last == current {
                return;
            }

            let message = format!("[watch] {name} changed: {:?} -> {current:?}", *last);
            *last = current;
            drop(last);

            output.write_line(message);
            output.write_display(&stack.truncated(stack_depth));
        })
    }
}
