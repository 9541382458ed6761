//! Wire codec error types.

use crate::wire::MessagePrefix;
use thiserror::Error;

/// Errors raised while framing, encoding or decoding messages.
#[derive(Error, Debug)]
pub enum WireError {
    /// The body ended before a field could be read.
    #[error("Buffer underflow: needed {needed} bytes, {remaining} remaining")]
    BufferUnderflow { needed: usize, remaining: usize },

    /// The body was structurally invalid.
    #[error("Malformed message: {0}")]
    Malformed(String),

    /// A frame carried a prefix no message type is registered under.
    #[error("Unknown message prefix: {0}")]
    UnknownPrefix(MessagePrefix),

    /// Prefix bytes break the zero-padding or alphanumeric rules.
    #[error("Invalid message prefix: {0:?}")]
    InvalidPrefix([u8; 4]),

    /// A frame declared a length beyond the configured maximum.
    #[error("Message too large: {size} bytes, max {max} bytes")]
    MessageTooLarge { size: usize, max: usize },

    /// Two message types were registered under one prefix.
    #[error("Prefix {0} registered twice")]
    DuplicatePrefix(MessagePrefix),

    /// One message type was registered twice.
    #[error("Message type {0} registered twice")]
    DuplicateType(String),

    /// A message type has no prefix.
    #[error("Message type {0} not registered")]
    Unregistered(String),

    /// I/O error from the underlying stream.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for wire operations.
pub type WireResult<T> = Result<T, WireError>;
