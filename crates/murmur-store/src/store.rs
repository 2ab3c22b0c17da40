//! Session-wide conversation state: identity, peers, conversations and the
//! active conversation.

use std::cmp::Ordering;
use std::collections::HashMap;

use tracing::{debug, info};

use murmur_shared::{PresenceEntry, UserId, WireMessage};

use crate::conversation::{Applied, Conversation};
use crate::error::{Result, StoreError};
use crate::models::{ConversationSummary, Message, Peer};

/// What the caller should surface after an inbound message was stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingOutcome {
    pub peer_id: UserId,
    pub applied: Applied,
    /// The message is from the peer and its conversation is not active.
    pub notify: bool,
}

#[derive(Debug, Default)]
pub struct ConversationStore {
    self_id: Option<UserId>,
    self_name: Option<String>,
    active: Option<UserId>,
    peers: HashMap<UserId, Peer>,
    conversations: HashMap<UserId, Conversation>,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    // --- identity ---

    pub fn self_id(&self) -> Option<UserId> {
        self.self_id
    }

    pub fn self_name(&self) -> Option<&str> {
        self.self_name.as_deref()
    }

    /// Bind the store to a session. A different identity discards everything
    /// learnt under the previous one.
    pub fn set_identity(&mut self, id: UserId, name: Option<String>) {
        if self.self_id.is_some_and(|current| current != id) {
            info!(previous = ?self.self_id, new = %id, "Identity changed, discarding conversations");
            self.clear();
        }
        self.self_id = Some(id);
        self.self_name = name;
        self.peers.remove(&id);
        self.conversations.remove(&id);
    }

    /// Drop all conversation content, peers and the identity.
    pub fn clear(&mut self) {
        self.self_id = None;
        self.self_name = None;
        self.active = None;
        self.peers.clear();
        self.conversations.clear();
    }

    // --- peers ---

    pub fn peer(&self, id: UserId) -> Option<&Peer> {
        self.peers.get(&id)
    }

    pub fn peers(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    pub fn display_name(&self, id: UserId) -> String {
        self.peers
            .get(&id)
            .map(|p| p.display_name.clone())
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| format!("user {id}"))
    }

    /// Apply a `user_list` snapshot. Listed users are online, everyone else
    /// offline; the local user is never stored as a peer.
    pub fn apply_presence(&mut self, users: &[PresenceEntry]) {
        for peer in self.peers.values_mut() {
            peer.online = false;
        }

        for entry in users {
            if Some(entry.id) == self.self_id {
                // Our own entry carries hints keyed by the other party.
                if let Some(hints) = &entry.last_messages {
                    for (peer_id, conv) in self.conversations.iter_mut() {
                        if let Some(ts) = hints.latest_with(*peer_id) {
                            conv.set_activity_hint(Some(ts));
                        }
                    }
                }
                continue;
            }

            let peer = self.peers.entry(entry.id).or_insert_with(|| Peer {
                id: entry.id,
                display_name: String::new(),
                online: false,
            });
            peer.online = true;
            if !entry.username.is_empty() {
                peer.display_name = entry.username.clone();
            }

            if let (Some(me), Some(hints)) = (self.self_id, &entry.last_messages) {
                if let Some(ts) = hints.latest_with(me) {
                    self.conversations
                        .entry(entry.id)
                        .or_insert_with(|| Conversation::new(entry.id))
                        .set_activity_hint(Some(ts));
                }
            }
        }

        debug!(online = users.len(), known = self.peers.len(), "Presence snapshot applied");
    }

    /// Merge directory results: names are refreshed, online flags kept.
    pub fn merge_directory(&mut self, users: &[(UserId, String)]) {
        for (id, name) in users {
            if Some(*id) == self.self_id {
                continue;
            }
            let peer = self.peers.entry(*id).or_insert_with(|| Peer {
                id: *id,
                display_name: String::new(),
                online: false,
            });
            if !name.is_empty() {
                peer.display_name = name.clone();
            }
        }
    }

    /// Patch a peer online after a live message from it. The next snapshot
    /// is authoritative.
    pub fn mark_online(&mut self, id: UserId, name: Option<&str>) {
        if Some(id) == self.self_id {
            return;
        }
        let peer = self.peers.entry(id).or_insert_with(|| Peer {
            id,
            display_name: String::new(),
            online: false,
        });
        peer.online = true;
        if let Some(name) = name.filter(|n| !n.is_empty()) {
            if peer.display_name.is_empty() {
                peer.display_name = name.to_string();
            }
        }
    }

    // --- conversations ---

    pub fn conversation(&self, peer_id: UserId) -> Option<&Conversation> {
        self.conversations.get(&peer_id)
    }

    /// The conversation with `peer_id`, created on first use.
    pub fn conversation_mut(&mut self, peer_id: UserId) -> &mut Conversation {
        self.conversations
            .entry(peer_id)
            .or_insert_with(|| Conversation::new(peer_id))
    }

    pub fn conversations_mut(&mut self) -> impl Iterator<Item = &mut Conversation> {
        self.conversations.values_mut()
    }

    pub fn active(&self) -> Option<UserId> {
        self.active
    }

    /// Make `peer_id` the active conversation and clear its unread flag.
    /// Returns `true` when the initial history should be requested now.
    pub fn open(&mut self, peer_id: UserId) -> Result<bool> {
        self.validate_peer(peer_id)?;
        self.active = Some(peer_id);
        let conv = self.conversation_mut(peer_id);
        conv.mark_read();
        Ok(conv.needs_history())
    }

    pub fn close_active(&mut self) -> Option<UserId> {
        self.active.take()
    }

    /// Record a locally composed message as pending.
    pub fn push_pending(&mut self, peer_id: UserId, content: &str) -> Result<Message> {
        let me = self.validate_peer(peer_id)?;
        let message = Message::pending(me, peer_id, content);
        self.conversation_mut(peer_id).push_pending(message.clone());
        Ok(message)
    }

    /// Store a live `message` frame in the conversation it belongs to.
    pub fn apply_incoming(&mut self, wire: &WireMessage) -> Result<IncomingOutcome> {
        let me = self.self_id.ok_or(StoreError::NoIdentity)?;
        let peer_id = wire
            .counterpart(me)
            .ok_or(StoreError::ForeignMessage {
                sender: wire.sender_id,
                receiver: wire.receiver_id,
            })?;
        if peer_id == me {
            return Err(StoreError::SelfConversation);
        }

        let from_self = wire.sender_id == me;
        if !from_self {
            self.mark_online(peer_id, wire.username.as_deref());
        }

        let is_active = self.active == Some(peer_id);
        let conv = self.conversation_mut(peer_id);
        let applied = conv.apply_incoming(wire, from_self);

        let fresh = applied != Applied::Duplicate;
        let notify = fresh && !from_self && !is_active;
        if notify {
            conv.mark_unread();
        }

        Ok(IncomingOutcome {
            peer_id,
            applied,
            notify,
        })
    }

    /// Conversation list: unread first, then online, then most recent
    /// activity (any activity before none), then display name, then id.
    pub fn summaries(&self) -> Vec<ConversationSummary> {
        let mut ids: Vec<UserId> = self
            .peers
            .keys()
            .chain(self.conversations.keys())
            .copied()
            .filter(|id| Some(*id) != self.self_id)
            .collect();
        ids.sort();
        ids.dedup();

        let mut rows: Vec<ConversationSummary> = ids
            .into_iter()
            .map(|id| {
                let conv = self.conversations.get(&id);
                ConversationSummary {
                    peer_id: id,
                    display_name: self.display_name(id),
                    online: self.peers.get(&id).is_some_and(|p| p.online),
                    has_unread: conv.is_some_and(Conversation::has_unread),
                    last_activity: conv.and_then(Conversation::last_activity),
                    preview: conv
                        .and_then(|c| c.messages().last())
                        .map(|m| m.content.clone()),
                }
            })
            .collect();

        rows.sort_by(compare_summaries);
        rows
    }

    /// Check that `peer_id` can be messaged by the local user, returning the
    /// local user's id.
    pub fn validate_peer(&self, peer_id: UserId) -> Result<UserId> {
        let me = self.self_id.ok_or(StoreError::NoIdentity)?;
        if !peer_id.is_valid() {
            return Err(StoreError::InvalidPeer(peer_id));
        }
        if peer_id == me {
            return Err(StoreError::SelfConversation);
        }
        Ok(me)
    }
}

fn compare_summaries(a: &ConversationSummary, b: &ConversationSummary) -> Ordering {
    b.has_unread
        .cmp(&a.has_unread)
        .then_with(|| b.online.cmp(&a.online))
        // `Some` sorts above `None`, and later timestamps first.
        .then_with(|| b.last_activity.cmp(&a.last_activity))
        .then_with(|| a.display_name.cmp(&b.display_name))
        .then_with(|| a.peer_id.cmp(&b.peer_id))
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use murmur_shared::MessageId;

    use super::*;
    use crate::models::MessageState;

    const ME: UserId = UserId(1);
    const BOB: UserId = UserId(2);
    const CAROL: UserId = UserId(3);

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap() + Duration::seconds(secs)
    }

    fn wire(id: i64, sender: UserId, receiver: UserId, secs: i64) -> WireMessage {
        WireMessage {
            sender_id: sender,
            receiver_id: receiver,
            content: format!("m{id}"),
            timestamp: at(secs),
            id: Some(MessageId(id)),
            username: None,
            local_key: None,
            raw_timestamp: None,
        }
    }

    fn presence(id: UserId, name: &str) -> PresenceEntry {
        PresenceEntry {
            id,
            username: name.into(),
            last_messages: None,
        }
    }

    fn store() -> ConversationStore {
        let mut store = ConversationStore::new();
        store.set_identity(ME, Some("me".into()));
        store
    }

    #[test]
    fn test_open_clears_unread_and_requests_history_once() {
        let mut store = store();
        store.apply_incoming(&wire(1, BOB, ME, 1)).unwrap();
        assert!(store.conversation(BOB).unwrap().has_unread());

        assert!(store.open(BOB).unwrap());
        assert!(!store.conversation(BOB).unwrap().has_unread());
        store.conversation_mut(BOB).mark_history_requested();
        assert!(!store.open(BOB).unwrap());
    }

    #[test]
    fn test_message_for_active_conversation_is_not_unread() {
        let mut store = store();
        store.open(BOB).unwrap();
        let outcome = store.apply_incoming(&wire(1, BOB, ME, 1)).unwrap();
        assert!(!outcome.notify);
        assert!(!store.conversation(BOB).unwrap().has_unread());
    }

    #[test]
    fn test_background_message_notifies_and_marks_unread() {
        let mut store = store();
        store.open(CAROL).unwrap();
        let outcome = store.apply_incoming(&wire(1, BOB, ME, 1)).unwrap();
        assert!(outcome.notify);
        assert_eq!(outcome.peer_id, BOB);
        assert!(store.conversation(BOB).unwrap().has_unread());
        // Sender is inferred online.
        assert!(store.peer(BOB).unwrap().online);
    }

    #[test]
    fn test_own_echo_in_background_is_not_unread() {
        let mut store = store();
        let outcome = store.apply_incoming(&wire(1, ME, BOB, 1)).unwrap();
        assert!(!outcome.notify);
        assert!(!store.conversation(BOB).unwrap().has_unread());
    }

    #[test]
    fn test_foreign_message_is_rejected() {
        let mut store = store();
        let err = store.apply_incoming(&wire(1, BOB, CAROL, 1)).unwrap_err();
        assert!(matches!(err, StoreError::ForeignMessage { .. }));
    }

    #[test]
    fn test_hi_send_then_echo_yields_one_confirmed_entry() {
        let mut store = store();
        store.open(BOB).unwrap();
        let pending = store.push_pending(BOB, "hi").unwrap();
        assert_eq!(pending.state, MessageState::Pending);
        assert_eq!(store.conversation(BOB).unwrap().messages().len(), 1);

        let mut echo = wire(77, ME, BOB, 0);
        echo.content = "hi".into();
        echo.timestamp = Utc::now();
        store.apply_incoming(&echo).unwrap();

        let msgs = store.conversation(BOB).unwrap().messages();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].state, MessageState::Confirmed);
        assert_eq!(msgs[0].local_key, pending.local_key);
        assert_eq!(msgs[0].server_id, Some(MessageId(77)));
    }

    #[test]
    fn test_push_pending_rejects_self_and_missing_identity() {
        let mut store = store();
        assert!(matches!(
            store.push_pending(ME, "x"),
            Err(StoreError::SelfConversation)
        ));
        assert!(matches!(
            store.push_pending(UserId(0), "x"),
            Err(StoreError::InvalidPeer(_))
        ));

        let mut anonymous = ConversationStore::new();
        assert!(matches!(
            anonymous.push_pending(BOB, "x"),
            Err(StoreError::NoIdentity)
        ));
    }

    #[test]
    fn test_presence_snapshot_is_authoritative() {
        let mut store = store();
        store.apply_presence(&[presence(BOB, "bob"), presence(CAROL, "carol")]);
        assert!(store.peer(BOB).unwrap().online);

        store.apply_presence(&[presence(CAROL, "carol"), presence(ME, "me")]);
        assert!(!store.peer(BOB).unwrap().online);
        assert!(store.peer(CAROL).unwrap().online);
        assert!(store.peer(ME).is_none());
    }

    #[test]
    fn test_directory_merge_keeps_online_flags() {
        let mut store = store();
        store.apply_presence(&[presence(BOB, "bob")]);
        store.merge_directory(&[(BOB, "robert".into()), (CAROL, "carol".into()), (ME, "me".into())]);

        let bob = store.peer(BOB).unwrap();
        assert!(bob.online);
        assert_eq!(bob.display_name, "robert");
        assert!(!store.peer(CAROL).unwrap().online);
        assert!(store.peer(ME).is_none());
    }

    #[test]
    fn test_summary_ordering() {
        let mut store = store();
        let dave = UserId(4);
        let erin = UserId(5);
        store.merge_directory(&[
            (BOB, "bob".into()),
            (CAROL, "carol".into()),
            (dave, "dave".into()),
            (erin, "anna".into()),
        ]);
        store.apply_presence(&[presence(CAROL, "carol"), presence(dave, "dave")]);
        store.open(BOB).unwrap();
        store.apply_incoming(&wire(1, ME, CAROL, 5)).unwrap();
        store.apply_incoming(&wire(2, dave, ME, 1)).unwrap();
        store.apply_incoming(&wire(3, erin, ME, 9)).unwrap();

        let order: Vec<UserId> = store.summaries().iter().map(|s| s.peer_id).collect();
        // erin and dave are unread (erin marked online by her message, newer);
        // carol online with activity; bob offline with nothing.
        assert_eq!(order, vec![erin, dave, CAROL, BOB]);
        assert!(!order.contains(&ME));
    }

    #[test]
    fn test_summary_breaks_ties_by_name_then_id() {
        let mut store = store();
        store.merge_directory(&[(UserId(9), "zed".into()), (UserId(8), "amy".into()), (UserId(7), "amy".into())]);
        let order: Vec<i64> = store.summaries().iter().map(|s| s.peer_id.0).collect();
        assert_eq!(order, vec![7, 8, 9]);
    }

    #[test]
    fn test_new_identity_discards_content() {
        let mut store = store();
        store.apply_incoming(&wire(1, BOB, ME, 1)).unwrap();
        store.set_identity(ME, Some("me".into()));
        assert!(store.conversation(BOB).is_some());

        store.set_identity(CAROL, Some("carol".into()));
        assert!(store.conversation(BOB).is_none());
        assert_eq!(store.self_id(), Some(CAROL));
    }
}
