//! Plain-text rendering of engine events for the terminal.

use murmur_client::ChatEvent;
use murmur_shared::UserId;
use murmur_store::{ConversationSummary, Message};

/// One printable line for `event`, or `None` for events not worth showing.
pub fn render_event(event: &ChatEvent) -> Option<String> {
    let line = match event {
        ChatEvent::LoggedIn { user_id, username } => match username {
            Some(name) => format!("* logged in as {name} ({user_id})"),
            None => format!("* logged in as {user_id}"),
        },
        ChatEvent::LoggedOut => "* logged out".to_string(),
        ChatEvent::StatusChanged {
            status,
            attempt_count,
        } => format!("* {status} (attempts: {attempt_count})"),
        ChatEvent::ReconnectScheduled { attempt, delay } => {
            format!("* reconnecting in {}ms (attempt {attempt})", delay.as_millis())
        }
        ChatEvent::TransportError { reason } => format!("! transport: {reason}"),
        ChatEvent::ProtocolError(e) => format!("! dropped frame: {e}"),
        ChatEvent::ConversationOpened { peer_id } => format!("* talking to {peer_id}"),
        ChatEvent::ConversationClosed { peer_id } => format!("* left {peer_id}"),
        ChatEvent::UnreadChanged {
            peer_id,
            has_unread: true,
        } => format!("* new message from {peer_id}"),
        ChatEvent::MessageAdded { peer_id, message } => render_message(*peer_id, message),
        ChatEvent::MessageConfirmed { peer_id, message, .. } => {
            format!("{} (delivered)", render_message(*peer_id, message))
        }
        ChatEvent::HistoryLoaded { peer_id, count } => {
            format!("* {count} messages with {peer_id}")
        }
        ChatEvent::HistoryTimedOut { peer_id } => {
            format!("! loading messages with {peer_id} timed out, try /more")
        }
        ChatEvent::HistoryPrepended { peer_id, count } => {
            format!("* {count} older messages with {peer_id}")
        }
        ChatEvent::HistoryExhausted { peer_id } => format!("* start of history with {peer_id}"),
        ChatEvent::PageTimedOut { peer_id } => {
            format!("! loading older messages with {peer_id} timed out, try /more again")
        }
        ChatEvent::TypingStarted { username, .. } => format!("* {username} is typing..."),
        _ => return None,
    };
    Some(line)
}

pub fn render_message(peer_id: UserId, message: &Message) -> String {
    let who = if message.sender_id == peer_id {
        message
            .sender_name
            .clone()
            .unwrap_or_else(|| format!("user {peer_id}"))
    } else {
        "you".to_string()
    };
    let marker = if message.is_pending() { " (sending)" } else { "" };
    format!(
        "[{}] {who}: {}{marker}",
        message.timestamp.format("%H:%M"),
        message.content
    )
}

pub fn render_summary(summary: &ConversationSummary) -> String {
    format!(
        "{}{} {} ({}){}",
        if summary.has_unread { "*" } else { " " },
        if summary.online { "+" } else { " " },
        summary.display_name,
        summary.peer_id,
        summary
            .preview
            .as_deref()
            .map(|p| format!(": {p}"))
            .unwrap_or_default()
    )
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use murmur_shared::{LocalKey, MessageId};
    use murmur_store::MessageState;

    use super::*;

    fn message(sender: i64, state: MessageState) -> Message {
        Message {
            local_key: LocalKey::new(),
            server_id: Some(MessageId(1)),
            sender_id: UserId(sender),
            receiver_id: UserId(if sender == 1 { 2 } else { 1 }),
            content: "hi".into(),
            timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 9, 30, 0).unwrap(),
            state,
            sender_name: Some("bob".into()),
            wire_timestamp: None,
        }
    }

    #[test]
    fn test_own_pending_message() {
        let line = render_message(UserId(2), &message(1, MessageState::Pending));
        assert_eq!(line, "[09:30] you: hi (sending)");
    }

    #[test]
    fn test_peer_message_uses_sender_name() {
        let line = render_message(UserId(2), &message(2, MessageState::Confirmed));
        assert_eq!(line, "[09:30] bob: hi");
    }

    #[test]
    fn test_quiet_events_are_skipped() {
        assert_eq!(render_event(&ChatEvent::Connected), None);
        assert_eq!(
            render_event(&ChatEvent::HistoryExhausted { peer_id: UserId(2) }).as_deref(),
            Some("* start of history with 2")
        );
    }

    #[test]
    fn test_summary_line() {
        let summary = ConversationSummary {
            peer_id: UserId(2),
            display_name: "bob".into(),
            online: true,
            has_unread: true,
            last_activity: None,
            preview: Some("hey".into()),
        };
        assert_eq!(render_summary(&summary), "*+ bob (2): hey");
    }
}
