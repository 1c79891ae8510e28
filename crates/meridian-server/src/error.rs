//! Error types for Meridian server.

use meridian_core::SessionError;

use crate::transport::TransportError;

/// Server error type.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Meridian core error.
    #[error("Core error: {0}")]
    Core(#[from] meridian_core::Error),

    /// Kernel session error.
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// WebSocket transport error.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// The client sent a command this channel does not handle.
    #[error("Command '{0}' is not supported")]
    UnsupportedCommand(String),

    /// The notebook manager rejected a request.
    #[error("Notebook error: {0}")]
    Notebook(String),

    /// The configured listen address does not parse.
    #[error("Invalid address: {0}")]
    InvalidAddress(String),
}

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;
