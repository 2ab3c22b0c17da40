//! Wire types shared by every Murmur crate: identifiers, connection status,
//! the JSON frame catalog, and protocol errors.

pub mod constants;
pub mod error;
pub mod protocol;
pub mod types;

pub use error::{EncodeError, ProtocolError};
pub use protocol::{
    decode_batch, format_cursor, InboundFrame, OutboundFrame, PresenceEntry, WireMessage,
};
pub use types::{ConnectionStatus, LocalKey, MessageId, UserId};
