//! Error definitions for the context-flow engine.

use thiserror::Error;

/// Errors raised directly by the engine.
///
/// Everything else the engine detects (anomalies, soft validation failures,
/// size warnings) is recorded through metrics or diagnostics, never raised.
#[derive(Debug, Error)]
pub enum ContextFlowError {
    /// A required call argument was missing or blank.
    #[error("Invalid argument: `{name}` must be provided")]
    InvalidArgument { name: &'static str },

    /// Required context fields were absent and the middleware fails closed.
    #[error("Context integrity violation for message {message_id}: missing {missing_fields:?}")]
    IntegrityViolation {
        message_id: String,
        missing_fields: Vec<String>,
    },

    /// Context size exceeded the configured maximum and the middleware fails closed.
    #[error("Context size {size_bytes} bytes exceeds maximum {max_bytes} bytes for message {message_id}")]
    SizeExceeded {
        message_id: String,
        size_bytes: usize,
        max_bytes: usize,
    },

    /// Diagnostic export could not be serialized.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for engine operations.
pub type ContextFlowResult<T> = Result<T, ContextFlowError>;

/// Reject a blank string argument.
pub(crate) fn require_arg<'a>(value: &'a str, name: &'static str) -> ContextFlowResult<&'a str> {
    if value.trim().is_empty() {
        Err(ContextFlowError::InvalidArgument { name })
    } else {
        Ok(value)
    }
}
