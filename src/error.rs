//! Error types for homebot-bus

use thiserror::Error;

/// Errors that can occur in the messaging runtime
///
/// Per-message variants (`Decode`, `Validation`, `UnknownTopic`,
/// `QueueOverflow`, `HandlerTimeout`, `Handler`) are caught where they
/// originate and never stop the dispatch loop. Only `Connection` ends a
/// transport session.
#[derive(Debug, Error)]
pub enum BusError {
    /// Bytes on the wire are not valid JSON
    #[error("Decode error: {0}")]
    Decode(String),

    /// Well-formed JSON with the wrong shape for its target
    #[error("Validation failed for '{target}': {reason}")]
    Validation { target: String, reason: String },

    /// Registry miss for an event type or topic
    #[error("Unknown topic or event type: {0}")]
    UnknownTopic(String),

    /// Malformed topic or topic filter
    #[error("Invalid topic '{topic}': {reason}")]
    InvalidTopic { topic: String, reason: String },

    /// Dispatch queue full, entry dropped by the overflow policy
    #[error("Queue overflow ({strategy}) on topic '{topic}'")]
    QueueOverflow { strategy: String, topic: String },

    /// Handler exceeded the dispatch timeout
    #[error("Handler for topic '{topic}' timed out after {timeout_ms}ms")]
    HandlerTimeout { topic: String, timeout_ms: u64 },

    /// Any failure raised by domain handler code
    #[error("Handler error: {0}")]
    Handler(String),

    /// Transport connection failure or lost session
    #[error("Connection error: {0}")]
    Connection(String),

    /// Publish failure
    #[error("Failed to publish to topic '{topic}': {reason}")]
    Publish { topic: String, reason: String },

    /// Subscribe failure
    #[error("Failed to subscribe to topic '{topic}': {reason}")]
    Subscribe { topic: String, reason: String },

    /// Serialization/deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl BusError {
    /// Shorthand for a validation failure against a named target
    pub fn validation(target: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            target: target.into(),
            reason: reason.into(),
        }
    }

    /// Shorthand for a handler failure
    pub fn handler(reason: impl std::fmt::Display) -> Self {
        Self::Handler(reason.to_string())
    }

    /// Whether this error ends the active transport session
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection(_))
    }
}

/// Result type alias for bus operations
pub type Result<T> = std::result::Result<T, BusError>;
