//! Error types shared by every engine implementation.

use thiserror::Error;

/// A script exception captured at the native boundary.
///
/// Carries whatever structure the engine could recover from the thrown
/// value: constructor name, message, source location, and stack trace.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{name}: {message}")]
pub struct ScriptException {
    /// Constructor name of the thrown value ("TypeError", "Error", ...).
    pub name: String,
    pub message: String,
    /// URL of the script the exception was raised in. Named to stay clear
    /// of the error-source convention: a location is not a cause.
    pub source_url: Option<String>,
    pub line: Option<u32>,
    pub column: Option<u32>,
    pub stack: Option<String>,
}

impl ScriptException {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            source_url: None,
            line: None,
            column: None,
            stack: None,
        }
    }

    pub fn with_location(mut self, source_url: impl Into<String>, line: u32, column: u32) -> Self {
        self.source_url = Some(source_url.into());
        self.line = Some(line);
        self.column = Some(column);
        self
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }
}

/// Errors surfaced by a script engine implementation.
#[derive(Error, Debug)]
pub enum EngineError {
    /// The engine could not allocate a context.
    #[error("Failed to create script context: {message}")]
    ContextCreation { message: String },

    /// Script code threw and the exception crossed the native boundary.
    #[error(transparent)]
    Script(#[from] ScriptException),

    /// A value has no JSON representation.
    #[error("Value is not JSON representable: {0}")]
    Json(#[from] serde_json::Error),

    /// Engine-internal failure.
    #[error("Internal engine error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Create a context creation error
    pub fn context_creation(message: impl Into<String>) -> Self {
        Self::ContextCreation {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Create a script error from error type and message
    pub fn script_error(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Script(ScriptException::new(name, message))
    }

    /// Collapse into an exception suitable for throwing back into script.
    pub fn into_exception(self) -> ScriptException {
        match self {
            Self::Script(exception) => exception,
            other => ScriptException::new("Error", other.to_string()),
        }
    }
}

/// Result type alias for engine operations
pub type EngineResult<T> = Result<T, EngineError>;
