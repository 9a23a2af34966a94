//! Error Types
//!
//! Error taxonomy for operations and sessions.

use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::native::NativeError;

/// Errors an operation handle can settle with
#[derive(Error, Debug, Clone)]
pub enum OperationError {
    /// Native engine refused the call before doing any work
    #[error("Native engine rejected operation: {0}")]
    NativeAcceptance(NativeError),

    /// Native engine reported a failure through the event stream
    #[error("Operation failed: {0}")]
    NativeTerminal(NativeError),

    /// Payload delivered with OperationDone didn't pass the validator
    #[error("Invalid operation result: {0}")]
    Validation(String),

    /// Engine refused the abort request
    #[error("Fail to cancel operation: {0}")]
    Cancelation(NativeError),

    #[error("Operation with sequence {sequence} is already in flight ({alias})")]
    DuplicateSequence { sequence: u64, alias: String },

    #[error("Operation {0} already exists")]
    DuplicateOperation(Uuid),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Fail to parse {alias} results: {message}")]
    Parse { alias: String, message: String },

    #[error("Session is destroyed or not inited yet")]
    SessionUnavailable,

    /// Event stream ended before the operation settled
    #[error("Session was closed before operation {0} settled")]
    SessionClosed(Uuid),
}

/// Session lifecycle errors
#[derive(Error, Debug, Clone)]
pub enum SessionError {
    #[error("Fail to init session: {0}")]
    Init(NativeError),

    #[error("Fail to close session: {0}")]
    Stop(NativeError),

    #[error("Timeout error. Session wasn't closed in {0:?}")]
    TeardownTimeout(Duration),

    #[error("Session is destroyed or not inited yet")]
    Unavailable,

    #[error("Session not found: {0}")]
    NotFound(Uuid),

    #[error("Session already exists: {0}")]
    Exists(Uuid),

    #[error("Maximum sessions reached: {0}")]
    MaxSessionsReached(usize),

    #[error(transparent)]
    Operation(#[from] OperationError),
}

impl From<SessionError> for String {
    fn from(err: SessionError) -> String {
        err.to_string()
    }
}

/// Configuration loading errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid value for {key}: {value}")]
    InvalidEnv { key: String, value: String },
}

/// Result type alias for operation outcomes
pub type OperationResult<T> = Result<T, OperationError>;

/// Result type alias for session calls
pub type SessionResult<T> = Result<T, SessionError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::{NativeErrorKind, Severity};

    #[test]
    fn test_error_messages() {
        let err = OperationError::DuplicateSequence {
            sequence: 0,
            alias: "delayedSum".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Operation with sequence 0 is already in flight (delayedSum)"
        );

        let err = SessionError::TeardownTimeout(Duration::from_secs(5));
        assert_eq!(err.to_string(), "Timeout error. Session wasn't closed in 5s");
    }

    #[test]
    fn test_native_error_is_carried() {
        let native = NativeError::new(Severity::Error, NativeErrorKind::Io, Some("boom".into()));
        let err = OperationError::NativeTerminal(native);
        assert!(err.to_string().contains("boom"));
    }
}
