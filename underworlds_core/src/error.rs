//! Error taxonomy for the replication engine.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use underworlds_env::{ClientId, EnvError};

pub type Result<T> = std::result::Result<T, UwdsError>;

/// Errors returned by stores, the server and client proxies.
#[derive(Debug, Error)]
pub enum UwdsError {
    /// Unknown node, situation, mesh or world entry
    #[error("Not found: {0}")]
    NotFound(String),

    /// Missing/empty id or a request that would break the hierarchy
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The session was never opened, has been closed, or was evicted
    #[error("Unknown client {0}")]
    UnknownClient(ClientId),

    /// The remote end did not answer within its deadline
    #[error("Unreachable: {0}")]
    Unreachable(String),

    /// Expected change notifications did not arrive within the propagation window
    #[error("Inconsistency detected: {0}")]
    Inconsistency(String),

    #[error("Index {index} out of range (length {len})")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("Unimplemented: {0}")]
    Unimplemented(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error(transparent)]
    Env(#[from] EnvError),
}

/// Error codes surfaced at the RPC boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    NotFound,
    InvalidArgument,
    Unavailable,
    Inconsistency,
    Unimplemented,
}

impl UwdsError {
    pub fn not_found(what: impl std::fmt::Display) -> Self {
        Self::NotFound(what.to_string())
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Maps the error to its RPC status code.
    pub fn code(&self) -> ErrorCode {
        match self {
            UwdsError::NotFound(_) => ErrorCode::NotFound,
            UwdsError::InvalidArgument(_) | UwdsError::IndexOutOfRange { .. } => {
                ErrorCode::InvalidArgument
            }
            UwdsError::UnknownClient(_)
            | UwdsError::Unreachable(_)
            | UwdsError::Storage(_)
            | UwdsError::Env(_) => ErrorCode::Unavailable,
            UwdsError::Inconsistency(_) => ErrorCode::Inconsistency,
            UwdsError::Unimplemented(_) => ErrorCode::Unimplemented,
        }
    }

    /// Returns true for transient conditions a reader may retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, UwdsError::Inconsistency(_) | UwdsError::Unreachable(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(UwdsError::not_found("node x").code(), ErrorCode::NotFound);
        assert_eq!(
            UwdsError::IndexOutOfRange { index: 3, len: 2 }.code(),
            ErrorCode::InvalidArgument
        );
        assert_eq!(
            UwdsError::UnknownClient(ClientId::from_seed(1)).code(),
            ErrorCode::Unavailable
        );
        assert_eq!(
            UwdsError::from(EnvError::Timeout(1000)).code(),
            ErrorCode::Unavailable
        );
    }

    #[test]
    fn test_inconsistency_is_retryable() {
        assert!(UwdsError::Inconsistency("lag".into()).is_retryable());
        assert!(!UwdsError::invalid("empty id").is_retryable());
    }
}
