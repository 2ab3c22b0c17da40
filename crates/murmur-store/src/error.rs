use thiserror::Error;

use murmur_shared::UserId;

/// Errors produced by the store layer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// No session identity has been bound yet.
    #[error("No local identity")]
    NoIdentity,

    #[error("Invalid peer id: {0}")]
    InvalidPeer(UserId),

    /// The local user cannot hold a conversation with itself.
    #[error("Cannot open a conversation with yourself")]
    SelfConversation,

    /// A message whose sender and receiver are both someone else.
    #[error("Message from {sender} to {receiver} does not involve this session")]
    ForeignMessage { sender: UserId, receiver: UserId },
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;
