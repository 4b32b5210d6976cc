//! Engine error types.

use thiserror::Error;

/// Result alias used throughout the engine.
pub type Result<T, E = GravelError> = std::result::Result<T, E>;

/// Errors surfaced to callers of the engine entry points.
///
/// Pool starvation is deliberately absent: an empty dust pool is resolved
/// by waiting, never by failing the caller.
#[derive(Debug, Error)]
pub enum GravelError {
    /// The compute API returned a failure code.
    #[error("device error {code} during {operation}")]
    Device {
        /// Raw API error code (negative in the OpenCL convention).
        code: i32,
        /// The operation that failed, named after the API call site.
        operation: &'static str,
    },

    /// A compute program failed to build.
    #[error("program {key} failed to build:\n{log}")]
    Compile {
        /// Digest of the source text the program was built from.
        key: String,
        /// Build log reported by the compiler.
        log: String,
    },

    /// A caller-side contract was violated. These are programming errors,
    /// not runtime conditions.
    #[error("precondition violated: {0}")]
    Precondition(String),

    /// The completion side of an asynchronous result disappeared before
    /// delivering a value.
    #[error("asynchronous result was dropped before completion")]
    ResultDropped,

    /// No usable device backend, or the backend feature is disabled.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),
}

impl GravelError {
    /// Shorthand for a device failure at a named call site.
    #[must_use]
    pub fn device(code: i32, operation: &'static str) -> Self {
        Self::Device { code, operation }
    }

    /// Shorthand for a precondition violation.
    #[must_use]
    pub fn precondition(message: impl Into<String>) -> Self {
        Self::Precondition(message.into())
    }
}
