//! # Core Error Types
//!
//! Errors surfaced across the public boundary of the core runtime.
//!
//! Precondition violations (out-of-range indexing, an arena too small for a
//! single command) are programming bugs and panic instead.

use thiserror::Error;

/// Errors that can occur in the core runtime.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// A parameter was outside the range the operation accepts.
    #[error("invalid parameter for {operation}: {reason}")]
    InvalidParameter {
        /// The operation that rejected the parameter.
        operation: &'static str,
        /// Why it was rejected.
        reason: String,
    },

    /// The allocator refused the request, or its size overflowed.
    #[error("out of memory: requested {requested} elements")]
    OutOfMemory {
        /// Number of elements the failed allocation was sized for.
        requested: usize,
    },

    /// Invalid configuration value or file.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;
