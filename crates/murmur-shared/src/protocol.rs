use std::collections::HashMap;

use chrono::{DateTime, FixedOffset, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{EncodeError, ProtocolError};
use crate::types::{LocalKey, MessageId, UserId};

/// Discriminators the client understands on inbound frames.
const INBOUND_TYPES: &[&str] = &[
    "user_list",
    "message",
    "history",
    "more_history",
    "typing",
    "typing_stopped",
];

/// A direct message as it travels over the wire, both as a live `message`
/// frame and as an entry of a history page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawWireMessage")]
pub struct WireMessage {
    pub sender_id: UserId,
    #[serde(rename = "receiverID")]
    pub receiver_id: UserId,
    #[serde(default)]
    pub content: String,
    pub timestamp: DateTime<Utc>,
    /// Server id, present once persisted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<MessageId>,
    /// Sender display name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Echo of the correlation key attached to our own send
    #[serde(default, rename = "localKey", skip_serializing_if = "Option::is_none")]
    pub local_key: Option<LocalKey>,
    /// `timestamp` exactly as the server wrote it, offset included. Echoed
    /// back as the pagination cursor.
    #[serde(skip_serializing)]
    pub raw_timestamp: Option<String>,
}

/// Inbound shape of [`WireMessage`] before the timestamp is parsed.
#[derive(Deserialize)]
struct RawWireMessage {
    sender_id: UserId,
    #[serde(rename = "receiverID")]
    receiver_id: UserId,
    #[serde(default)]
    content: String,
    timestamp: String,
    #[serde(default)]
    id: Option<MessageId>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default, rename = "localKey")]
    local_key: Option<LocalKey>,
}

impl TryFrom<RawWireMessage> for WireMessage {
    type Error = String;

    fn try_from(raw: RawWireMessage) -> Result<Self, Self::Error> {
        let parsed: DateTime<FixedOffset> = raw
            .timestamp
            .parse()
            .map_err(|e| format!("invalid timestamp {:?}: {e}", raw.timestamp))?;
        Ok(Self {
            sender_id: raw.sender_id,
            receiver_id: raw.receiver_id,
            content: raw.content,
            timestamp: parsed.with_timezone(&Utc),
            id: raw.id,
            username: raw.username,
            local_key: raw.local_key,
            raw_timestamp: Some(raw.timestamp),
        })
    }
}

impl WireMessage {
    /// Cursor naming this message's position in history: the server's own
    /// timestamp string when known.
    pub fn cursor(&self) -> String {
        self.raw_timestamp
            .clone()
            .unwrap_or_else(|| format_cursor(self.timestamp))
    }

    /// The other party of this message from `me`'s point of view, or `None`
    /// when `me` is neither sender nor receiver.
    pub fn counterpart(&self, me: UserId) -> Option<UserId> {
        if self.sender_id == me {
            Some(self.receiver_id)
        } else if self.receiver_id == me {
            Some(self.sender_id)
        } else {
            None
        }
    }
}

/// One entry of a `user_list` presence snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PresenceEntry {
    pub id: UserId,
    #[serde(default)]
    pub username: String,
    #[serde(default, rename = "lastMessages")]
    pub last_messages: Option<LastMessages>,
}

/// Recent-message hints attached to a presence entry. Servers send either an
/// object keyed by the other party's user id or a plain list.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum LastMessages {
    Keyed(HashMap<String, LastMessageHint>),
    List(Vec<LastMessageHint>),
}

impl LastMessages {
    pub fn latest(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Keyed(map) => map.values().map(|h| h.timestamp).max(),
            Self::List(list) => list.iter().map(|h| h.timestamp).max(),
        }
    }

    /// Latest hint for the conversation with `other`. Plain lists carry no
    /// counterpart, so every entry is considered.
    pub fn latest_with(&self, other: UserId) -> Option<DateTime<Utc>> {
        match self {
            Self::Keyed(map) => map.get(&other.to_string()).map(|h| h.timestamp),
            Self::List(_) => self.latest(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LastMessageHint {
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub sender_id: Option<UserId>,
}

/// Frames pushed by the server.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundFrame {
    /// Presence snapshot; replaces the known online set wholesale.
    UserList {
        #[serde(default, deserialize_with = "null_as_empty")]
        users: Vec<PresenceEntry>,
    },
    /// A single direct message, new or an echo of our own send.
    Message(WireMessage),
    /// Initial backfill for a conversation (may be empty).
    History {
        #[serde(default, deserialize_with = "null_as_empty")]
        messages: Vec<WireMessage>,
    },
    /// One older page; empty means history is exhausted.
    MoreHistory {
        #[serde(default, deserialize_with = "null_as_empty")]
        messages: Vec<WireMessage>,
    },
    Typing {
        #[serde(default)]
        sender_id: Option<UserId>,
        #[serde(default)]
        username: Option<String>,
    },
    TypingStopped {
        #[serde(default)]
        sender_id: Option<UserId>,
    },
}

impl InboundFrame {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UserList { .. } => "user_list",
            Self::Message(_) => "message",
            Self::History { .. } => "history",
            Self::MoreHistory { .. } => "more_history",
            Self::Typing { .. } => "typing",
            Self::TypingStopped { .. } => "typing_stopped",
        }
    }

    /// Decode a single JSON frame.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let value: serde_json::Value =
            serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;

        let kind = match value.as_object() {
            Some(obj) => match obj.get("type").and_then(|t| t.as_str()) {
                Some(kind) => kind.to_string(),
                None => return Err(ProtocolError::MissingType),
            },
            None => return Err(ProtocolError::Malformed("frame is not an object".into())),
        };

        if !INBOUND_TYPES.contains(&kind.as_str()) {
            return Err(ProtocolError::UnknownType(kind));
        }

        serde_json::from_value(value).map_err(|e| ProtocolError::InvalidPayload {
            kind,
            reason: e.to_string(),
        })
    }
}

/// Decode one transport text frame. The server coalesces queued writes into
/// a single frame separated by newlines, so a frame may hold several
/// messages; they are returned in order.
pub fn decode_batch(text: &str) -> Vec<Result<InboundFrame, ProtocolError>> {
    text.split('\n')
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(InboundFrame::decode)
        .collect()
}

/// Frames sent by the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundFrame {
    GetHistory {
        #[serde(rename = "receiverID")]
        receiver_id: UserId,
    },
    GetMoreHistory {
        #[serde(rename = "receiverID")]
        receiver_id: UserId,
        /// Timestamp of the oldest loaded message, as the server wrote it.
        timestamp: String,
    },
    Message {
        #[serde(rename = "receiverID")]
        receiver_id: UserId,
        content: String,
        #[serde(rename = "localKey")]
        local_key: LocalKey,
    },
    Typing {
        #[serde(rename = "receiverID")]
        receiver_id: UserId,
    },
    TypingStopped {
        #[serde(rename = "receiverID")]
        receiver_id: UserId,
    },
}

impl OutboundFrame {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::GetHistory { .. } => "get_history",
            Self::GetMoreHistory { .. } => "get_more_history",
            Self::Message { .. } => "message",
            Self::Typing { .. } => "typing",
            Self::TypingStopped { .. } => "typing_stopped",
        }
    }

    /// Serialize to a UTF-8 JSON text frame.
    pub fn encode(&self) -> Result<String, EncodeError> {
        Ok(serde_json::to_string(self)?)
    }
}

fn null_as_empty<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<Vec<T>>::deserialize(deserializer)?.unwrap_or_default())
}

/// RFC 3339 rendering used when no server string is at hand.
pub fn format_cursor(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_decode_live_message_with_offset_timestamp() {
        let frame = InboundFrame::decode(
            r#"{"type":"message","sender_id":3,"receiverID":7,"content":"hi",
                "timestamp":"2024-05-01T12:00:00+02:00","username":"ann"}"#,
        )
        .unwrap();

        match frame {
            InboundFrame::Message(msg) => {
                assert_eq!(msg.sender_id, UserId(3));
                assert_eq!(msg.receiver_id, UserId(7));
                assert_eq!(msg.timestamp, Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap());
                assert_eq!(msg.id, None);
                assert_eq!(msg.username.as_deref(), Some("ann"));
                assert_eq!(msg.cursor(), "2024-05-01T12:00:00+02:00");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_cursor_falls_back_to_utc_rendering() {
        let msg = WireMessage {
            sender_id: UserId(1),
            receiver_id: UserId(2),
            content: String::new(),
            timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap(),
            id: None,
            username: None,
            local_key: None,
            raw_timestamp: None,
        };
        assert_eq!(msg.cursor(), "2024-05-01T10:00:00Z");
    }

    #[test]
    fn test_unparseable_timestamp_is_invalid_payload() {
        assert!(matches!(
            InboundFrame::decode(
                r#"{"type":"message","sender_id":1,"receiverID":2,"timestamp":"yesterday"}"#
            ),
            Err(ProtocolError::InvalidPayload { kind, reason })
                if kind == "message" && reason.contains("yesterday")
        ));
    }

    #[test]
    fn test_null_history_is_empty() {
        let frame = InboundFrame::decode(r#"{"type":"history","messages":null}"#).unwrap();
        assert_eq!(frame, InboundFrame::History { messages: vec![] });

        let frame = InboundFrame::decode(r#"{"type":"more_history"}"#).unwrap();
        assert_eq!(frame, InboundFrame::MoreHistory { messages: vec![] });
    }

    #[test]
    fn test_user_list_with_keyed_last_messages() {
        let frame = InboundFrame::decode(
            r#"{"type":"user_list","users":[
                {"id":1,"username":"ann","lastMessages":{
                    "10":{"timestamp":"2024-01-01T00:00:00Z","content":"a","sender_id":1},
                    "11":{"timestamp":"2024-01-02T00:00:00Z","content":"b","sender_id":2}}},
                {"id":2,"username":"bob"}]}"#,
        )
        .unwrap();

        let InboundFrame::UserList { users } = frame else {
            panic!("expected user_list");
        };
        assert_eq!(users.len(), 2);
        let latest = users[0].last_messages.as_ref().and_then(LastMessages::latest);
        assert_eq!(latest, Some(Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap()));
        assert!(users[1].last_messages.is_none());
    }

    #[test]
    fn test_error_taxonomy() {
        assert!(matches!(
            InboundFrame::decode("not json"),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            InboundFrame::decode("[1,2]"),
            Err(ProtocolError::Malformed(_))
        ));
        assert_eq!(
            InboundFrame::decode(r#"{"users":[]}"#),
            Err(ProtocolError::MissingType)
        );
        assert_eq!(
            InboundFrame::decode(r#"{"type":"reaction"}"#),
            Err(ProtocolError::UnknownType("reaction".into()))
        );
        assert!(matches!(
            InboundFrame::decode(r#"{"type":"message","content":"x"}"#),
            Err(ProtocolError::InvalidPayload { kind, .. }) if kind == "message"
        ));
    }

    #[test]
    fn test_decode_batch_keeps_order_and_isolates_errors() {
        let text = concat!(
            r#"{"type":"typing","sender_id":4,"username":"dee"}"#,
            "\n",
            "garbage\n",
            r#"{"type":"typing_stopped","sender_id":4}"#,
        );
        let frames = decode_batch(text);
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].as_ref().unwrap().kind(), "typing");
        assert!(frames[1].is_err());
        assert_eq!(frames[2].as_ref().unwrap().kind(), "typing_stopped");
    }

    #[test]
    fn test_encode_outbound_shapes() {
        let cursor = format_cursor(Utc.with_ymd_and_hms(2024, 3, 4, 5, 6, 7).unwrap());
        let json: serde_json::Value = serde_json::from_str(
            &OutboundFrame::GetMoreHistory {
                receiver_id: UserId(9),
                timestamp: cursor,
            }
            .encode()
            .unwrap(),
        )
        .unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "type": "get_more_history",
                "receiverID": 9,
                "timestamp": "2024-03-04T05:06:07Z",
            })
        );

        let key = LocalKey::new();
        let json: serde_json::Value = serde_json::from_str(
            &OutboundFrame::Message {
                receiver_id: UserId(9),
                content: "hello".into(),
                local_key: key,
            }
            .encode()
            .unwrap(),
        )
        .unwrap();
        assert_eq!(json["type"], "message");
        assert_eq!(json["receiverID"], 9);
        assert_eq!(json["content"], "hello");
        assert_eq!(json["localKey"], key.0.to_string());
    }

    #[test]
    fn test_counterpart() {
        let msg = WireMessage {
            sender_id: UserId(1),
            receiver_id: UserId(2),
            content: String::new(),
            timestamp: Utc::now(),
            id: None,
            username: None,
            local_key: None,
            raw_timestamp: None,
        };
        assert_eq!(msg.counterpart(UserId(1)), Some(UserId(2)));
        assert_eq!(msg.counterpart(UserId(2)), Some(UserId(1)));
        assert_eq!(msg.counterpart(UserId(3)), None);
    }
}
