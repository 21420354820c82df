use thiserror::Error;

/// Errors surfaced by engines, the coordinator and transports.
///
/// Cloneable so the same error can be returned to a caller and broadcast to
/// every notification subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("subscription rejected for market {market}")]
    SubscriptionRejected { market: String },
    #[error("market discovery failed: {0}")]
    Discovery(String),
    #[error("transport is not connected")]
    NotConnected,
}

impl SyncError {
    pub fn transport(err: impl std::fmt::Display) -> Self {
        SyncError::Transport(err.to_string())
    }

    pub fn protocol(err: impl std::fmt::Display) -> Self {
        SyncError::Protocol(err.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Protocol(err.to_string())
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
