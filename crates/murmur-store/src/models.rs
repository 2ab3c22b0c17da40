//! Domain model structs held in the in-memory conversation store.
//!
//! Every struct derives `Serialize` so it can be handed directly to a UI
//! layer as-is.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use murmur_shared::{format_cursor, LocalKey, MessageId, UserId, WireMessage};

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageState {
    /// Rendered optimistically, awaiting the server echo.
    Pending,
    Confirmed,
}

/// A single direct message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    /// Client-generated key, stable across confirmation.
    pub local_key: LocalKey,
    /// Server id, set once confirmed (if the server reports one).
    pub server_id: Option<MessageId>,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub content: String,
    /// Local clock while pending, server clock once confirmed.
    pub timestamp: DateTime<Utc>,
    pub state: MessageState,
    /// Sender display name as reported on the wire.
    pub sender_name: Option<String>,
    /// Server timestamp string, kept verbatim for pagination cursors.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wire_timestamp: Option<String>,
}

impl Message {
    /// A message we are about to send, stamped with the local clock.
    pub fn pending(sender_id: UserId, receiver_id: UserId, content: impl Into<String>) -> Self {
        Self {
            local_key: LocalKey::new(),
            server_id: None,
            sender_id,
            receiver_id,
            content: content.into(),
            timestamp: Utc::now(),
            state: MessageState::Pending,
            sender_name: None,
            wire_timestamp: None,
        }
    }

    /// A message the server has persisted.
    pub fn confirmed(wire: &WireMessage) -> Self {
        Self {
            local_key: wire.local_key.unwrap_or_default(),
            server_id: wire.id,
            sender_id: wire.sender_id,
            receiver_id: wire.receiver_id,
            content: wire.content.clone(),
            timestamp: wire.timestamp,
            state: MessageState::Confirmed,
            sender_name: wire.username.clone(),
            wire_timestamp: wire.raw_timestamp.clone(),
        }
    }

    pub fn is_pending(&self) -> bool {
        self.state == MessageState::Pending
    }

    /// The pagination cursor pointing just before this message.
    pub fn cursor(&self) -> String {
        self.wire_timestamp
            .clone()
            .unwrap_or_else(|| format_cursor(self.timestamp))
    }
}

// ---------------------------------------------------------------------------
// Peer
// ---------------------------------------------------------------------------

/// Another user reachable for direct messaging.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Peer {
    pub id: UserId,
    pub display_name: String,
    pub online: bool,
}

// ---------------------------------------------------------------------------
// Conversation list entry
// ---------------------------------------------------------------------------

/// One row of the ordered conversation list.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ConversationSummary {
    pub peer_id: UserId,
    pub display_name: String,
    pub online: bool,
    pub has_unread: bool,
    pub last_activity: Option<DateTime<Utc>>,
    /// Content of the newest loaded message, if any.
    pub preview: Option<String>,
}
