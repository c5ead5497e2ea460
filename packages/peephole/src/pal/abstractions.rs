use std::fmt::Debug;

/// Exposes process information that the operating system publishes as text.
///
/// All reads are synchronous and expected to hit a fast in-memory path of the OS.
#[cfg_attr(test, mockall::automock)]
pub(crate) trait Platform: Debug + Send + Sync + 'static {
    /// Gets the contents of the `/proc/self/status` file or `None` if the platform does not
    /// provide it.
    ///
    /// This is a plaintext file with "key:     value" pairs, one per line.
    fn process_status_contents(&self) -> Option<String>;
}
