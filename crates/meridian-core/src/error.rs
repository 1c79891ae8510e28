//! Error types for meridian-core.

use thiserror::Error;

/// Result type for meridian-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in meridian-core.
#[derive(Debug, Error)]
pub enum Error {
    /// Session bookkeeping failed.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// The kernel backend reported an error.
    #[error(transparent)]
    Kernel(#[from] KernelError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by [`SessionRegistry`](crate::SessionRegistry) operations.
#[derive(Debug, Error)]
pub enum SessionError {
    /// No kernel is running for the kernel spec.
    #[error("no session for kernel spec '{0}'")]
    NoSuchSession(String),

    /// The kernel manager could not start a kernel.
    #[error("kernel '{spec}' failed to start: {source}")]
    StartFailed {
        spec: String,
        #[source]
        source: KernelError,
    },

    /// The kernel manager could not shut a kernel down.
    #[error("kernel '{spec}' failed to shut down: {source}")]
    ShutdownFailed {
        spec: String,
        #[source]
        source: KernelError,
    },

    /// The kernel refused an execute request.
    #[error("execute on kernel '{spec}' failed: {source}")]
    ExecuteFailed {
        spec: String,
        #[source]
        source: KernelError,
    },
}

/// Errors reported by a [`KernelManager`](crate::KernelManager).
#[derive(Debug, Error)]
pub enum KernelError {
    /// The kernel process could not be spawned.
    #[error("failed to spawn kernel process: {0}")]
    Spawn(String),

    /// The session id is not known to the kernel manager.
    #[error("unknown kernel session: {0}")]
    UnknownSession(String),

    /// IO error while talking to the kernel.
    #[error("kernel IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Any other backend failure.
    #[error("{0}")]
    Other(String),
}
