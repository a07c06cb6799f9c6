//! Error types for event and configuration handling.

use thiserror::Error;

/// Errors that can occur when decoding messages or configuration.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EventError {
    /// The event type is not one this system acts on.
    #[error("unsupported event type: {0}")]
    UnsupportedEventType(String),

    /// The message payload is structurally valid JSON but semantically wrong.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// A configuration document failed validation.
    #[error("invalid configuration '{document}': {reason}")]
    InvalidConfig { document: String, reason: String },

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for EventError {
    fn from(err: serde_json::Error) -> Self {
        EventError::Serialization(err.to_string())
    }
}
