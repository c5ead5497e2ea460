use thiserror::Error;

use crate::{Environment, Target};

/// Errors returned by instrumentation control operations.
///
/// Errors raised by the observed code itself never pass through this type. An intercepted
/// method returns exactly what the original implementation returns.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The caller asked to instrument a method that the owner does not define.
    #[error("{owner} has no method named '{method}'")]
    NoSuchMethod {
        /// Name of the owner (the method table) that was searched.
        owner: String,

        /// The method name that could not be found.
        method: String,
    },

    /// The target is already wrapped and the caller did not ask for the new observer
    /// to be composed with the existing ones.
    #[error(
        "{target} is already instrumented - pass the compose option or unregister the existing instrumentation first"
    )]
    AlreadyInstrumented {
        /// The target that is already wrapped.
        target: Target,
    },

    /// Restoration was requested with a token that is not registered (any more).
    ///
    /// This happens when the token was already used, or when the owner redefined the method
    /// after it was wrapped, in which case the original implementation is unrecoverable.
    #[error("instrumentation token #{token} is unknown or stale")]
    UnknownToken {
        /// The numeric identity of the rejected token.
        token: u64,
    },

    /// An operation restricted to non-production use was attempted in production.
    #[error("refusing to {operation} in the {environment} environment")]
    UnsafeContext {
        /// Human-readable description of the refused operation.
        operation: String,

        /// The environment the context was configured with.
        environment: Environment,
    },

    /// The method exists but with a different receiver, argument or return type
    /// than the caller expected.
    #[error("{target} is not defined with the requested signature {expected}")]
    SignatureMismatch {
        /// The method whose signature did not match.
        target: Target,

        /// The signature the caller asked for.
        expected: String,
    },

    /// The resident memory size of the process could not be determined.
    #[error("resident memory size is not available: {reason}")]
    MemoryUnavailable {
        /// Human-readable description of why the value could not be read.
        reason: String,
    },
}

/// A specialized `Result` type for instrumentation operations, returning the crate's
/// [`Error`] type as the error value.
pub type Result<T> = std::result::Result<T, Error>;
