use thiserror::Error;

/// A frame that could not be turned into a known inbound message.
///
/// These never close the stream: the dispatcher drops the frame and reports
/// the error to subscribers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Malformed frame: {0}")]
    Malformed(String),

    #[error("Frame has no type discriminator")]
    MissingType,

    #[error("Unknown frame type: {0}")]
    UnknownType(String),

    #[error("Invalid {kind} frame: {reason}")]
    InvalidPayload { kind: String, reason: String },

    #[error("Message between {sender} and {receiver} does not involve this session")]
    ForeignMessage { sender: i64, receiver: i64 },
}

/// Failure to serialize an outbound frame.
#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
