//! Session errors

use crate::engine::EngineError;

/// Errors returned synchronously at the session boundary.
///
/// Failures of an attempt that is already in flight never come back
/// through these; they show up as the `Error` state on the status stream.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("VPN session already active")]
    AlreadyActive,

    #[error("No tunnel engine available")]
    EngineUnavailable,

    #[error("Engine connect failed: {0}")]
    EngineConnectFailed(String),

    #[error("VPN permission denied")]
    PermissionDenied,

    #[error("Internal fault: {0}")]
    InternalFault(String),

    #[error("VPN session not initialized")]
    NotInitialized,

    #[error("VPN session disposed")]
    Disposed,
}

impl From<EngineError> for SessionError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::Unavailable => SessionError::EngineUnavailable,
            other => SessionError::EngineConnectFailed(other.to_string()),
        }
    }
}
