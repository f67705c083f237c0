//! Common error types for Shroud.

use thiserror::Error;

/// Result type alias using Shroud's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type shared by the relay and the producer.
#[derive(Debug, Error)]
pub enum Error {
    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Malformed or out-of-contract message
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl Error {
    /// Create a serialization error from any displayable type.
    pub fn serialization(msg: impl std::fmt::Display) -> Self {
        Self::Serialization(msg.to_string())
    }

    /// Create a config error from any displayable type.
    pub fn config(msg: impl std::fmt::Display) -> Self {
        Self::Config(msg.to_string())
    }

    /// Create a protocol error from any displayable type.
    pub fn protocol(msg: impl std::fmt::Display) -> Self {
        Self::Protocol(msg.to_string())
    }

    /// True for errors caused by the peer's input rather than local state.
    pub fn is_protocol(&self) -> bool {
        matches!(self, Self::Protocol(_) | Self::Serialization(_))
    }
}
