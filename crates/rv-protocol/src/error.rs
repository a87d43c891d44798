//! Protocol error types

use thiserror::Error;

/// Errors that can occur while encoding or decoding control events
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Event name is not part of the wire contract
    #[error("Unknown event: {0}")]
    UnknownEvent(String),

    /// Event name bytes are not valid UTF-8
    #[error("Event name is not valid UTF-8")]
    InvalidEventName,

    /// Event body exceeds maximum size
    #[error("Body too large: {size} bytes exceeds maximum of {max} bytes")]
    PayloadTooLarge { size: usize, max: usize },

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
