//! Protocol error types

use thiserror::Error;

/// Errors that can occur during protocol operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Length prefix does not leave room for a topic and terminator
    #[error("Malformed frame: length {0} does not exceed the topic size")]
    MalformedFrame(usize),

    /// Frame exceeds maximum size
    #[error("Frame too large: {size} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge { size: usize, max: usize },

    /// Stream ended in the middle of a frame
    #[error("Truncated frame: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    /// Topic identifier could not be parsed
    #[error("Invalid topic id: {0}")]
    InvalidTopicId(String),

    /// JSON payload error
    #[error("Payload error: {0}")]
    Payload(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
