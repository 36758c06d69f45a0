//! Error types for the worker runtime.
//!
//! Script-thrown errors keep their engine-level exception shape so hosts can
//! surface name, message, and location; everything else collapses into the
//! runtime's own taxonomy.

use sable_engine::{EngineError, ScriptException};
use thiserror::Error;

/// Errors surfaced by runtime operations.
#[derive(Error, Debug)]
pub enum SwError {
    /// A URL or scope failed validation before any side effect ran.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// A script or resource download failed.
    #[error("Network error: {0}")]
    Network(String),

    /// Script code threw during evaluation or inside an event handler.
    #[error(transparent)]
    Script(#[from] ScriptException),

    /// The persistence collaborator failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// The operation is not permitted in the current lifecycle state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// The runtime was assembled with missing or unusable collaborators.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Runtime-internal failure.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SwError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::Network(message.into())
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage(message.into())
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState(message.into())
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }
}

impl From<EngineError> for SwError {
    fn from(error: EngineError) -> Self {
        match error {
            EngineError::Script(exception) => Self::Script(exception),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<url::ParseError> for SwError {
    fn from(error: url::ParseError) -> Self {
        Self::Validation(error.to_string())
    }
}

/// Result type for runtime operations.
pub type SwResult<T> = Result<T, SwError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_script_exception_stays_transparent() {
        let error = SwError::from(EngineError::Script(ScriptException::new(
            "TypeError",
            "x is not a function",
        )));
        assert_eq!(error.to_string(), "TypeError: x is not a function");
        assert!(matches!(error, SwError::Script(_)));
    }

    #[test]
    fn test_engine_infrastructure_errors_become_internal() {
        let error = SwError::from(EngineError::internal("context lost"));
        assert!(matches!(error, SwError::Internal(_)));
        assert!(error.to_string().contains("context lost"));
    }

    #[test]
    fn test_url_parse_errors_become_validation() {
        let parse_error = url::Url::parse("http://[invalid").unwrap_err();
        let error = SwError::from(parse_error);
        assert!(matches!(error, SwError::Validation(_)));
    }
}
