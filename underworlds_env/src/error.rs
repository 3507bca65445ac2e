//! Error types for the Underworlds environment abstraction.

use thiserror::Error;

/// Errors that can occur in the environment abstraction layer.
#[derive(Debug, Error)]
pub enum EnvError {
    /// Network send failed (buffer full, connection closed, etc.)
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Target client is unreachable (receiver gone or link partitioned)
    #[error("Client unreachable: {0}")]
    ClientUnreachable(String),

    /// Record serialization/deserialization failed
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Context operation failed
    #[error("Context error: {0}")]
    ContextError(String),

    /// Operation timed out
    #[error("Timeout after {0}ms")]
    Timeout(u64),
}

impl EnvError {
    /// Creates a network error.
    pub fn network(msg: impl Into<String>) -> Self {
        Self::NetworkError(msg.into())
    }

    /// Creates an unreachable error.
    pub fn unreachable(client: impl std::fmt::Display) -> Self {
        Self::ClientUnreachable(client.to_string())
    }

    /// Returns true if the error means the remote end will never answer again.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, Self::ClientUnreachable(_) | Self::Timeout(_))
    }
}
