use std::fmt::Display;
use std::io::{self, Write};
use std::mem;
use std::sync::{Arc, Mutex};

use crate::ERR_POISONED_LOCK;

/// Destination for the text that instrumentation prints.
///
/// Every component reports by writing lines here. By default this is the standard output
/// stream of the process. Tests and embedding tools can use [`Output::capture()`] to collect
/// the lines in memory instead.
///
/// Clones share the same destination.
///
/// # Examples
///
/// ```
/// use peephole::Output;
///
/// let output = Output::capture();
/// output.write_line("hello");
///
/// assert_eq!(output.lines(), vec!["hello".to_string()]);
/// ```
#[derive(Clone, Debug)]
pub struct Output {
    destination: Destination,
}

#[derive(Clone, Debug)]
enum Destination {
    Stdout,
    Capture(Arc<Mutex<Vec<String>>>),
}

impl Output {
    /// Writes to the standard output stream of the process.
    #[must_use]
    pub fn stdout() -> Self {
        Self {
            destination: Destination::Stdout,
        }
    }

    /// Collects written lines in memory, retrievable via [`lines()`](Self::lines).
    #[must_use]
    pub fn capture() -> Self {
        Self {
            destination: Destination::Capture(Arc::new(Mutex::new(Vec::new()))),
        }
    }

    /// Writes one line of text.
    ///
    /// Write failures on the standard output stream are ignored, as a closed terminal must
    /// never break the code being observed.
    #[cfg_attr(test, mutants::skip)] // Stdout branch is not observable from tests.
    pub fn write_line(&self, line: impl AsRef<str>) {
        match &self.destination {
            Destination::Stdout => {
                let mut stdout = io::stdout().lock();
                _ = writeln!(stdout, "{}", line.as_ref());
            }
            Destination::Capture(lines) => lines
                .lock()
                .expect(ERR_POISONED_LOCK)
                .push(line.as_ref().to_owned()),
        }
    }

    /// Writes the `Display` rendering of a value, one output line per text line.
    pub fn write_display(&self, value: &impl Display) {
        for line in value.to_string().lines() {
            self.write_line(line);
        }
    }

    /// Returns a copy of the captured lines. Always empty when writing to stdout.
    #[must_use]
    pub fn lines(&self) -> Vec<String> {
        match &self.destination {
            Destination::Stdout => Vec::new(),
            Destination::Capture(lines) => lines.lock().expect(ERR_POISONED_LOCK).clone(),
        }
    }

    /// Removes and returns the captured lines. Always empty when writing to stdout.
    #[must_use]
    pub fn take_lines(&self) -> Vec<String> {
        match &self.destination {
            Destination::Stdout => Vec::new(),
            Destination::Capture(lines) => mem::take(&mut *lines.lock().expect(ERR_POISONED_LOCK)),
        }
    }
}

impl Default for Output {
    fn default() -> Self {
        Self::stdout()
    }
}
