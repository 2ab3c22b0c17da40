use thiserror::Error;

use murmur_net::TransportError;
use murmur_store::StoreError;

/// A command was rejected before anything was sent.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UserError {
    #[error("Message is empty")]
    EmptyContent,

    #[error("No recipient selected")]
    NoPeer,

    #[error("Cannot message yourself")]
    SelfPeer,

    #[error("Not connected")]
    NotConnected,

    #[error("Not logged in")]
    NotLoggedIn,
}

impl From<StoreError> for UserError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NoIdentity => Self::NotLoggedIn,
            StoreError::SelfConversation => Self::SelfPeer,
            StoreError::InvalidPeer(_) | StoreError::ForeignMessage { .. } => Self::NoPeer,
        }
    }
}

/// Peer directory fetch failure. Logged, never fatal.
#[derive(Error, Debug)]
pub enum DirectoryError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Directory responded {0}")]
    Status(reqwest::StatusCode),
}

/// Session provider failure. Logged, never fatal.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Session endpoint responded {0}")]
    Status(reqwest::StatusCode),
}

/// Errors surfaced by [`crate::ChatHandle`] and client setup.
#[derive(Error, Debug)]
pub enum ChatError {
    #[error(transparent)]
    User(#[from] UserError),

    /// The engine task has stopped.
    #[error("Chat engine is not running")]
    EngineGone,

    #[error("Invalid server URL: {0}")]
    InvalidUrl(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}
