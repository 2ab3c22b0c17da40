use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast;

use murmur_shared::{ConnectionStatus, LocalKey, ProtocolError, UserId};
use murmur_store::Message;

/// Notifications fanned out to every UI subscriber.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatEvent {
    // --- session / connection ---
    LoggedIn { user_id: UserId, username: Option<String> },
    LoggedOut,
    StatusChanged { status: ConnectionStatus, attempt_count: u32 },
    Connected,
    ReconnectScheduled { attempt: u32, delay: Duration },
    TransportError { reason: String },
    /// A frame was dropped.
    ProtocolError(ProtocolError),

    // --- peers ---
    PresenceUpdated { online: usize },
    DirectoryUpdated { known: usize },

    // --- conversations ---
    ConversationOpened { peer_id: UserId },
    ConversationClosed { peer_id: UserId },
    UnreadChanged { peer_id: UserId, has_unread: bool },
    MessageAdded { peer_id: UserId, message: Message },
    MessageConfirmed { peer_id: UserId, local_key: LocalKey, message: Message },

    // --- history ---
    HistoryLoaded { peer_id: UserId, count: usize },
    /// The initial backfill never came; reopening the conversation or
    /// asking for older messages requests it again.
    HistoryTimedOut { peer_id: UserId },
    OlderPageRequested { peer_id: UserId },
    /// `count` older messages were added at the front; the UI keeps its
    /// scroll offset by the height delta.
    HistoryPrepended { peer_id: UserId, count: usize },
    HistoryExhausted { peer_id: UserId },
    /// The older-page request timed out; a new one may be issued.
    PageTimedOut { peer_id: UserId },

    // --- typing ---
    TypingStarted { peer_id: UserId, username: String },
    TypingStopped { peer_id: UserId },
}

impl ChatEvent {
    /// The conversation this event concerns, if any.
    pub fn peer_id(&self) -> Option<UserId> {
        match self {
            Self::ConversationOpened { peer_id }
            | Self::ConversationClosed { peer_id }
            | Self::UnreadChanged { peer_id, .. }
            | Self::MessageAdded { peer_id, .. }
            | Self::MessageConfirmed { peer_id, .. }
            | Self::HistoryLoaded { peer_id, .. }
            | Self::HistoryTimedOut { peer_id }
            | Self::OlderPageRequested { peer_id }
            | Self::HistoryPrepended { peer_id, .. }
            | Self::HistoryExhausted { peer_id }
            | Self::PageTimedOut { peer_id }
            | Self::TypingStarted { peer_id, .. }
            | Self::TypingStopped { peer_id } => Some(*peer_id),
            _ => None,
        }
    }
}

/// Payload handed to a [`crate::notify::Notifier`].
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct NotificationPayload {
    pub peer_id: UserId,
    pub title: String,
    pub body: String,
}

pub fn emit_event(events: &broadcast::Sender<ChatEvent>, event: ChatEvent) {
    // No subscribers is not an error.
    if events.send(event).is_err() {
        tracing::trace!("No event subscribers");
    }
}
