use thiserror::Error;

/// Failures of the underlying duplex stream. These never reach callers as
/// errors: the connection manager turns them into status changes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connection refused: {0}")]
    Refused(String),

    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Transport closed")]
    Closed,
}

/// Returned by [`crate::ConnectionHandle::send`].
#[derive(Error, Debug)]
pub enum SendError {
    #[error("Not connected")]
    NotConnected,

    #[error("Connection manager has shut down")]
    ManagerGone,

    #[error("Failed to encode frame: {0}")]
    Encode(#[from] murmur_shared::EncodeError),
}
