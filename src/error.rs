//! Error types for the bridge.
//!
//! Every failure falls into one of three kinds (see [`ErrorKind`]):
//! submission errors are raised synchronously before any background work
//! starts, engine errors arrive through the same completion path as
//! successful results, and internal errors mean the bridge itself
//! misbehaved.

use std::fmt;

use thiserror::Error;

/// Broad classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Rejected before anything was handed to the engine.
    Submission,
    /// Reported by the engine through a completion.
    Engine,
    /// A defect in the bridge or in a user callback.
    Internal,
}

/// Which bridge-internal failure occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InternalKind {
    /// A completion was dropped by the engine without ever being set.
    CompletionDropped,
    /// A user-supplied callback returned an error.
    CallbackFailed,
    /// The I/O runtime could not be built.
    Runtime,
    /// The engine delivered something no result can be built from.
    UnableToBuildResult,
}

impl fmt::Display for InternalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InternalKind::CompletionDropped => "completion dropped",
            InternalKind::CallbackFailed => "callback failed",
            InternalKind::Runtime => "runtime",
            InternalKind::UnableToBuildResult => "unable to build result",
        };
        f.write_str(name)
    }
}

/// The main error type for bridge operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid argument supplied by the caller.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Malformed connection string.
    #[error("Connection string error at position {position}: {message}")]
    ConnectionString { position: usize, message: String },

    /// Operation attempted on a closed connection.
    #[error("Connection is closed")]
    Closed,

    /// Error reported by the engine.
    #[error("Engine error {code} during {operation}: {message}")]
    Engine {
        code: i32,
        message: String,
        operation: &'static str,
    },

    /// Bridge-internal failure.
    #[error("Internal error ({kind}): {message}")]
    Internal { kind: InternalKind, message: String },

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create an invalid argument error.
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    /// Create a connection string error at the given position.
    pub fn connstr(position: usize, message: impl Into<String>) -> Self {
        Self::ConnectionString {
            position,
            message: message.into(),
        }
    }

    /// Create an engine error for the named operation.
    pub fn engine(operation: &'static str, code: i32, message: impl Into<String>) -> Self {
        Self::Engine {
            code,
            message: message.into(),
            operation,
        }
    }

    /// Create a bridge-internal error.
    pub fn internal(kind: InternalKind, message: impl Into<String>) -> Self {
        Self::Internal {
            kind,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidArgument(_)
            | Error::ConnectionString { .. }
            | Error::Closed
            | Error::Config(_)
            | Error::Io(_) => ErrorKind::Submission,
            Error::Engine { .. } => ErrorKind::Engine,
            Error::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// The engine's native error code, if this came from the engine.
    pub fn code(&self) -> Option<i32> {
        match self {
            Error::Engine { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// The internal failure kind, if this is a bridge-internal error.
    pub fn internal_kind(&self) -> Option<InternalKind> {
        match self {
            Error::Internal { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

/// Result type alias for bridge operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::engine("open", 7001, "authentication failure");
        assert_eq!(
            err.to_string(),
            "Engine error 7001 during open: authentication failure"
        );

        let err = Error::connstr(11, "expected host");
        assert_eq!(
            err.to_string(),
            "Connection string error at position 11: expected host"
        );
    }

    #[test]
    fn test_error_kind() {
        assert_eq!(Error::invalid("x").kind(), ErrorKind::Submission);
        assert_eq!(Error::Closed.kind(), ErrorKind::Submission);
        assert_eq!(Error::engine("query", 1, "x").kind(), ErrorKind::Engine);
        assert_eq!(
            Error::internal(InternalKind::CallbackFailed, "boom").kind(),
            ErrorKind::Internal
        );
    }

    #[test]
    fn test_error_code() {
        assert_eq!(Error::engine("close", 42, "x").code(), Some(42));
        assert_eq!(Error::Closed.code(), None);
        assert_eq!(
            Error::internal(InternalKind::CompletionDropped, "gone").internal_kind(),
            Some(InternalKind::CompletionDropped)
        );
    }
}
