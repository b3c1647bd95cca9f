//! Error types for the protocol crate.

use thiserror::Error;

/// Protocol error type covering all possible failure modes.
#[derive(Debug, Error)]
pub enum ProtocolError {
    // Serialization errors
    /// Failed to serialize data.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Failed to deserialize data.
    #[error("deserialization failed: {0}")]
    Deserialization(String),

    // Frame errors
    /// An inbound frame was not valid base64.
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    // Channel errors
    /// The server acknowledged a join request with an error.
    #[error("join failed for {topic}: {reason}")]
    JoinFailed {
        /// Topic that was being joined.
        topic: String,
        /// Reason reported by the server.
        reason: String,
    },

    /// A joined channel reported an error.
    #[error("channel error on {topic}: {reason}")]
    ChannelError {
        /// Topic of the failing channel.
        topic: String,
        /// Reason reported by the server or transport.
        reason: String,
    },

    /// A push was attempted on a channel that is not joined.
    #[error("channel not joined: {topic}")]
    NotJoined {
        /// Topic of the channel.
        topic: String,
    },

    /// The channel handle is unknown to the transport.
    #[error("unknown channel: {0}")]
    UnknownChannel(u64),

    // Connection errors
    /// Connection was closed unexpectedly.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// Operation timed out.
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// The socket endpoint could not be built.
    #[error("invalid url: {0}")]
    InvalidUrl(String),
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

// Conversions from underlying crate errors

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_eof() || err.is_syntax() {
            ProtocolError::Deserialization(err.to_string())
        } else {
            ProtocolError::Serialization(err.to_string())
        }
    }
}

impl From<base64::DecodeError> for ProtocolError {
    fn from(err: base64::DecodeError) -> Self {
        ProtocolError::InvalidFrame(err.to_string())
    }
}

impl From<std::io::Error> for ProtocolError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::TimedOut => ProtocolError::Timeout(err.to_string()),
            _ => ProtocolError::ConnectionClosed(err.to_string()),
        }
    }
}
