//! Sandbox errors.

/// Error type for sandbox operations.
pub type Result<T> = std::result::Result<T, SandboxError>;

/// Infrastructure failures of the sandbox itself.
///
/// A candidate that crashes, exits non-zero or times out is not an error:
/// those end up in [`evoloop_core::SandboxResult::status`].
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// The execution backend (container runtime, interpreter) is missing
    #[error("sandbox backend unavailable: {0}")]
    BackendUnavailable(String),

    /// The disposable execution context could not be created
    #[error("failed to create execution context: {0}")]
    ContextCreation(String),

    /// The candidate process could not be started
    #[error("failed to start candidate: {0}")]
    Spawn(String),

    /// Network isolation was requested from a backend that cannot provide it
    #[error("network isolation requested but backend '{backend}' cannot provide it")]
    IsolationUnavailable {
        /// Backend name
        backend: String,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
