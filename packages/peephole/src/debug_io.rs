//! Verbose transport tracing for newly created network clients.

use std::fmt;
use std::sync::{Arc, Mutex};

use foldhash::{HashSet, HashSetExt};
use tracing::{debug, warn};

use crate::{ERR_POISONED_LOCK, Environment, Error, Output, Result};

/// Implemented by client types that can report their wire traffic.
pub trait DebugOutput {
    /// Gives the client a stream to write its transport trace to.
    fn attach_debug_output(&mut self, stream: DebugStream);
}

/// Where a client writes its transport trace.
///
/// Every line is printed prefixed with the client class: `[debug-io <Class>] <line>`.
#[derive(Clone, Debug)]
pub struct DebugStream {
    class: Arc<str>,
    output: Output,
}

impl DebugStream {
    /// The client class the stream belongs to.
    #[must_use]
    pub fn class(&self) -> &str {
        &self.class
    }

    /// Writes one line of transport trace.
    pub fn write_line(&self, line: impl AsRef<str>) {
        self.output
            .write_line(format!("[debug-io {}] {}", self.class, line.as_ref()));
    }
}

/// Switches transport tracing on or off per client class.
///
/// The switch only affects clients created afterwards through a [`ClientClass`]. Clients
/// that already exist keep whatever they were created with.
#[derive(Clone, Debug)]
pub struct DebugIoToggle {
    environment: Environment,
    output: Output,
    enabled: Arc<Mutex<HashSet<String>>>,
}

impl DebugIoToggle {
    pub(crate) fn new(environment: Environment, output: Output) -> Self {
        Self {
            environment,
            output,
            enabled: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Turns on transport tracing for clients of the class created from now on.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnsafeContext`] in the [`Environment::Production`] environment.
    pub fn enable_debug(&self, class: &str) -> Result<()> {
        if !self.environment.allows_debugging() {
            warn!(class, environment = %self.environment, "refused to enable transport tracing");

            return Err(Error::UnsafeContext {
                operation: format!("enable debug output for {class}"),
                environment: self.environment,
            });
        }

        self.enabled
            .lock()
            .expect(ERR_POISONED_LOCK)
            .insert(class.to_owned());

        debug!(class, "transport tracing enabled");
        Ok(())
    }

    /// Turns off transport tracing for clients of the class created from now on. Allowed in
    /// every environment. Returns whether it was enabled.
    pub fn disable_debug(&self, class: &str) -> bool {
        let was_enabled = self
            .enabled
            .lock()
            .expect(ERR_POISONED_LOCK)
            .remove(class);

        if was_enabled {
            debug!(class, "transport tracing disabled");
        }

        was_enabled
    }

    /// Whether clients of the class are created with transport tracing.
    #[must_use]
    pub fn is_enabled(&self, class: &str) -> bool {
        self.enabled
            .lock()
            .expect(ERR_POISONED_LOCK)
            .contains(class)
    }

    /// Registers a client class whose instances are created through the given constructor.
    pub fn client_class<C, A, F>(&self, name: &str, constructor: F) -> ClientClass<C, A>
    where
        C: DebugOutput,
        F: Fn(A) -> C + Send + Sync + 'static,
    {
        ClientClass {
            name: Arc::from(name),
            constructor: Arc::new(constructor),
            toggle: self.clone(),
        }
    }
}

/// Creates clients of one class, attaching a [`DebugStream`] while tracing is enabled for it.
///
/// # Examples
///
/// ```
/// use peephole::{DebugOutput, DebugStream, Environment, InstrumentationContext, Output};
///
/// struct HttpClient {
///     host: String,
///     debug: Option<DebugStream>,
/// }
///
/// impl DebugOutput for HttpClient {
///     fn attach_debug_output(&mut self, stream: DebugStream) {
///         self.debug = Some(stream);
///     }
/// }
///
/// let output = Output::capture();
/// let context = InstrumentationContext::builder()
///     .environment(Environment::Development)
///     .output(output.clone())
///     .build();
///
/// let clients = context
///     .debug_io()
///     .client_class("HttpClient", |host: String| HttpClient { host, debug: None });
///
/// context.debug_io().enable_debug("HttpClient")?;
/// let client = clients.create("example.com".to_owned());
///
/// if let Some(debug) = &client.debug {
///     debug.write_line(format!("GET / HTTP/1.1 Host: {}", client.host));
/// }
///
/// assert_eq!(output.lines(), vec!["[debug-io HttpClient] GET / HTTP/1.1 Host: example.com"]);
/// # Ok::<(), peephole::Error>(())
/// ```
pub struct ClientClass<C, A> {
    name: Arc<str>,
    constructor: Arc<dyn Fn(A) -> C + Send + Sync>,
    toggle: DebugIoToggle,
}

impl<C: DebugOutput, A> ClientClass<C, A> {
    /// The class name that [`DebugIoToggle::enable_debug()`] refers to.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Creates a client, with a debug stream attached if tracing is enabled for the class.
    pub fn create(&self, args: A) -> C {
        let mut client = (self.constructor)(args);

        if self.toggle.is_enabled(&self.name) {
            client.attach_debug_output(DebugStream {
                class: Arc::clone(&self.name),
                output: self.toggle.output.clone(),
            });
        }

        client
    }
}

impl<C, A> Clone for ClientClass<C, A> {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            constructor: Arc::clone(&self.constructor),
            toggle: self.toggle.clone(),
        }
    }
}

impl<C, A> fmt::Debug for ClientClass<C, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientClass")
            .field("name", &self.name)
            .field("toggle", &self.toggle)
            .finish_non_exhaustive()
    }
}
