//! # Server Error Types
//!
//! Errors raised while starting or configuring a wrapped server.

use hearth_core::CoreError;
use thiserror::Error;

/// Errors that can occur in the server wrapper.
#[derive(Error, Debug)]
pub enum ServerError {
    /// The OS refused to spawn the server thread.
    #[error("failed to spawn server thread: {0}")]
    Spawn(#[source] std::io::Error),

    /// The server thread ended before reporting that it was up.
    #[error("server thread exited during startup")]
    ThreadExited,

    /// Error from the core runtime (queue construction, config).
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Invalid wrapper configuration.
    #[error("invalid server config: {0}")]
    InvalidConfig(String),
}

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;
