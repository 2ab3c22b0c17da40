//! Per-peer conversation log: optimistic sends, reconciliation and backward
//! pagination bookkeeping.
//!
//! `messages` is kept sorted by timestamp (oldest first) after every
//! mutation. A confirmed message with a given server id appears at most once.

use chrono::{DateTime, Utc};
use tracing::debug;

use murmur_shared::{LocalKey, MessageId, UserId, WireMessage};

use crate::models::{Message, MessageState};

/// How an inbound message was applied to the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// A pending entry was promoted in place.
    Confirmed { local_key: LocalKey },
    /// A new confirmed entry was added.
    Appended { local_key: LocalKey },
    /// The server id is already in the log.
    Duplicate,
}

/// Result of merging an older page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageOutcome {
    /// The server had nothing older; no further requests will be made.
    Exhausted,
    /// `count` messages were added at the front.
    Prepended { count: usize },
}

/// An older-page request that has been issued and not yet answered or timed
/// out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub seq: u64,
    pub cursor: String,
}

#[derive(Debug, Clone)]
pub struct Conversation {
    peer_id: UserId,
    messages: Vec<Message>,
    has_unread: bool,
    history_loaded: bool,
    history_requested: bool,
    history_exhausted: bool,
    in_flight: Option<PageRequest>,
    last_activity_hint: Option<DateTime<Utc>>,
}

impl Conversation {
    pub fn new(peer_id: UserId) -> Self {
        Self {
            peer_id,
            messages: Vec::new(),
            has_unread: false,
            history_loaded: false,
            history_requested: false,
            history_exhausted: false,
            in_flight: None,
            last_activity_hint: None,
        }
    }

    pub fn peer_id(&self) -> UserId {
        self.peer_id
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn has_unread(&self) -> bool {
        self.has_unread
    }

    pub fn mark_unread(&mut self) {
        self.has_unread = true;
    }

    pub fn mark_read(&mut self) {
        self.has_unread = false;
    }

    pub fn is_history_loaded(&self) -> bool {
        self.history_loaded
    }

    pub fn is_exhausted(&self) -> bool {
        self.history_exhausted
    }

    pub fn is_page_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn page_request(&self) -> Option<&PageRequest> {
        self.in_flight.as_ref()
    }

    /// Timestamp of the oldest loaded message.
    pub fn oldest(&self) -> Option<DateTime<Utc>> {
        self.messages.first().map(|m| m.timestamp)
    }

    /// Cursor of the next older page: the oldest message's timestamp as the
    /// server wrote it.
    pub fn cursor(&self) -> Option<String> {
        self.messages.first().map(Message::cursor)
    }

    /// Newest loaded message, falling back to the presence hint.
    pub fn last_activity(&self) -> Option<DateTime<Utc>> {
        self.messages
            .last()
            .map(|m| m.timestamp)
            .or(self.last_activity_hint)
    }

    pub fn set_activity_hint(&mut self, hint: Option<DateTime<Utc>>) {
        self.last_activity_hint = hint;
    }

    // --- initial history ---

    /// Whether opening this conversation should request the initial backfill.
    pub fn needs_history(&self) -> bool {
        !self.history_loaded && !self.history_requested
    }

    pub fn mark_history_requested(&mut self) {
        self.history_requested = true;
    }

    /// The backfill request went unanswered. Returns whether one was
    /// outstanding; `needs_history` is true again afterwards.
    pub fn expire_history_request(&mut self) -> bool {
        let outstanding = self.history_requested && !self.history_loaded;
        self.history_requested = false;
        outstanding
    }

    /// Merge the initial backfill. Entries already present (by server id)
    /// are skipped, pending sends are kept. Returns the number added.
    pub fn apply_history(&mut self, page: &[WireMessage]) -> usize {
        self.history_loaded = true;
        self.history_requested = false;

        let before = self.messages.len();
        for wire in page {
            if !self.contains_server_id(wire.id) {
                self.messages.push(Message::confirmed(wire));
            }
        }
        self.messages.sort_by_key(|m| m.timestamp);
        self.messages.len() - before
    }

    // --- live messages ---

    /// Append a locally composed pending message.
    pub fn push_pending(&mut self, message: Message) {
        debug_assert!(message.is_pending());
        self.insert_ordered(message);
    }

    /// Apply a live `message` frame.
    ///
    /// Our own echoes reconcile against pending entries: an exact `localKey`
    /// match first, then the oldest pending entry, else a plain append.
    pub fn apply_incoming(&mut self, wire: &WireMessage, from_self: bool) -> Applied {
        if self.contains_server_id(wire.id) {
            return Applied::Duplicate;
        }

        if from_self {
            let by_key = wire.local_key.and_then(|key| {
                self.messages
                    .iter()
                    .position(|m| m.is_pending() && m.local_key == key)
            });
            let target = by_key.or_else(|| self.messages.iter().position(Message::is_pending));

            if let Some(idx) = target {
                let local_key = self.confirm_at(idx, wire);
                debug!(
                    peer = %self.peer_id,
                    key = %local_key.short(),
                    exact = by_key.is_some(),
                    "Pending message confirmed"
                );
                return Applied::Confirmed { local_key };
            }
        }

        let message = Message::confirmed(wire);
        let local_key = message.local_key;
        self.insert_ordered(message);
        Applied::Appended { local_key }
    }

    fn confirm_at(&mut self, idx: usize, wire: &WireMessage) -> LocalKey {
        let entry = &mut self.messages[idx];
        entry.state = MessageState::Confirmed;
        entry.timestamp = wire.timestamp;
        entry.wire_timestamp = wire.raw_timestamp.clone();
        if wire.id.is_some() {
            entry.server_id = wire.id;
        }
        if wire.username.is_some() {
            entry.sender_name = wire.username.clone();
        }
        let local_key = entry.local_key;

        // The server clock may move the entry relative to its neighbours.
        let ordered = self
            .messages
            .windows(2)
            .all(|w| w[0].timestamp <= w[1].timestamp);
        if !ordered {
            self.messages.sort_by_key(|m| m.timestamp);
        }
        local_key
    }

    // --- pagination ---

    /// Start an older-page request tagged `seq`. Returns the cursor to send,
    /// or `None` when a request is in flight, history is exhausted, or
    /// nothing is loaded yet.
    pub fn begin_load_older(&mut self, seq: u64) -> Option<String> {
        if self.in_flight.is_some() || self.history_exhausted {
            return None;
        }
        let cursor = self.cursor()?;
        self.in_flight = Some(PageRequest {
            seq,
            cursor: cursor.clone(),
        });
        Some(cursor)
    }

    /// Merge the answer to request `seq`.
    ///
    /// Only messages strictly older than everything loaded are prepended, so
    /// a late page for a timed-out request cannot break ordering. The
    /// in-flight flag is cleared only if it still belongs to `seq`.
    pub fn apply_older_page(&mut self, seq: u64, page: &[WireMessage]) -> PageOutcome {
        if self.in_flight.as_ref().map(|r| r.seq) == Some(seq) {
            self.in_flight = None;
        }

        if page.is_empty() {
            self.history_exhausted = true;
            return PageOutcome::Exhausted;
        }

        let boundary = self.oldest();
        let mut older: Vec<Message> = page
            .iter()
            .filter(|w| boundary.map_or(true, |b| w.timestamp < b))
            .filter(|w| !self.contains_server_id(w.id))
            .map(Message::confirmed)
            .collect();
        older.sort_by_key(|m| m.timestamp);

        let count = older.len();
        if count > 0 {
            older.append(&mut self.messages);
            self.messages = older;
        }
        PageOutcome::Prepended { count }
    }

    /// Clear the in-flight flag if it still belongs to `seq`. Returns whether
    /// it did.
    pub fn expire_page_request(&mut self, seq: u64) -> bool {
        if self.in_flight.as_ref().map(|r| r.seq) == Some(seq) {
            self.in_flight = None;
            return true;
        }
        false
    }

    /// Forget outstanding requests; their answers will never arrive on a new
    /// connection.
    pub fn reset_requests(&mut self) {
        self.history_requested = false;
        self.in_flight = None;
    }

    // --- helpers ---

    fn contains_server_id(&self, id: Option<MessageId>) -> bool {
        match id {
            Some(id) => self.messages.iter().any(|m| m.server_id == Some(id)),
            None => false,
        }
    }

    fn insert_ordered(&mut self, message: Message) {
        let idx = self
            .messages
            .partition_point(|m| m.timestamp <= message.timestamp);
        self.messages.insert(idx, message);
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};

    use super::*;

    const ME: UserId = UserId(1);
    const BOB: UserId = UserId(2);

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

    fn assert_sorted(conv: &Conversation) {
        assert!(conv
            .messages()
            .windows(2)
            .all(|w| w[0].timestamp <= w[1].timestamp));
    }

    #[test]
    fn test_echo_replaces_pending_in_place() {
        let mut conv = Conversation::new(BOB);
        let pending = Message::pending(ME, BOB, "hi");
        let key = pending.local_key;
        conv.push_pending(pending);

        let mut echo = wire(10, ME, BOB, 0);
        echo.content = "hi".into();
        echo.timestamp = Utc::now() + Duration::seconds(1);
        assert_eq!(
            conv.apply_incoming(&echo, true),
            Applied::Confirmed { local_key: key }
        );

        assert_eq!(conv.messages().len(), 1);
        let msg = &conv.messages()[0];
        assert_eq!(msg.state, MessageState::Confirmed);
        assert_eq!(msg.server_id, Some(MessageId(10)));
        assert_eq!(msg.timestamp, echo.timestamp);
    }

    #[test]
    fn test_echo_with_key_matches_exact_pending() {
        let mut conv = Conversation::new(BOB);
        let first = Message::pending(ME, BOB, "one");
        let second = Message::pending(ME, BOB, "two");
        let second_key = second.local_key;
        let first_key = first.local_key;
        conv.push_pending(first);
        conv.push_pending(second);

        let mut echo = wire(11, ME, BOB, 0);
        echo.timestamp = Utc::now() + Duration::seconds(5);
        echo.local_key = Some(second_key);
        conv.apply_incoming(&echo, true);

        let first = conv
            .messages()
            .iter()
            .find(|m| m.local_key == first_key)
            .unwrap();
        assert!(first.is_pending());
        let second = conv
            .messages()
            .iter()
            .find(|m| m.local_key == second_key)
            .unwrap();
        assert_eq!(second.state, MessageState::Confirmed);
    }

    #[test]
    fn test_echo_without_key_confirms_oldest_pending() {
        let mut conv = Conversation::new(BOB);
        let first = Message::pending(ME, BOB, "one");
        let first_key = first.local_key;
        conv.push_pending(first);
        conv.push_pending(Message::pending(ME, BOB, "two"));

        let mut echo = wire(12, ME, BOB, 0);
        echo.timestamp = Utc::now() + Duration::seconds(5);
        assert_eq!(
            conv.apply_incoming(&echo, true),
            Applied::Confirmed {
                local_key: first_key
            }
        );
        assert_eq!(conv.messages().iter().filter(|m| m.is_pending()).count(), 1);
        assert_sorted(&conv);
    }

    #[test]
    fn test_own_message_without_pending_is_appended_once() {
        let mut conv = Conversation::new(BOB);
        let msg = wire(13, ME, BOB, 1);
        assert!(matches!(
            conv.apply_incoming(&msg, true),
            Applied::Appended { .. }
        ));
        assert_eq!(conv.apply_incoming(&msg, true), Applied::Duplicate);
        assert_eq!(conv.messages().len(), 1);
    }

    #[test]
    fn test_out_of_order_arrival_stays_sorted() {
        let mut conv = Conversation::new(BOB);
        conv.apply_incoming(&wire(1, BOB, ME, 10), false);
        conv.apply_incoming(&wire(2, BOB, ME, 5), false);
        conv.apply_incoming(&wire(3, BOB, ME, 7), false);
        assert_sorted(&conv);
        assert_eq!(conv.oldest(), Some(at(5)));
    }

    #[test]
    fn test_history_merge_skips_known_and_keeps_pending() {
        let mut conv = Conversation::new(BOB);
        assert!(conv.needs_history());
        conv.mark_history_requested();
        assert!(!conv.needs_history());

        conv.apply_incoming(&wire(5, BOB, ME, 50), false);
        conv.push_pending(Message::pending(ME, BOB, "draft"));

        let page: Vec<_> = (1..=5).map(|i| wire(i, BOB, ME, i * 10)).collect();
        assert_eq!(conv.apply_history(&page), 4);
        assert!(conv.is_history_loaded());
        assert!(!conv.needs_history());
        assert_eq!(conv.messages().len(), 6);
        assert_sorted(&conv);
    }

    #[test]
    fn test_expired_history_request_can_be_repeated() {
        let mut conv = Conversation::new(BOB);
        assert!(!conv.expire_history_request());

        conv.mark_history_requested();
        assert!(conv.expire_history_request());
        assert!(conv.needs_history());

        conv.mark_history_requested();
        conv.apply_history(&[wire(1, BOB, ME, 1)]);
        assert!(!conv.expire_history_request());
        assert!(!conv.needs_history());
    }

    #[test]
    fn test_paging_twenty_then_twenty_more() {
        let mut conv = Conversation::new(BOB);
        let newest: Vec<_> = (21..=40).map(|i| wire(i, BOB, ME, i)).collect();
        conv.apply_history(&newest);

        let cursor = conv.begin_load_older(1).unwrap();
        assert_eq!(cursor, "2024-03-01T12:00:21Z");
        assert!(conv.is_page_in_flight());
        // One request at a time.
        assert_eq!(conv.begin_load_older(2), None);

        let older: Vec<_> = (1..=20).rev().map(|i| wire(i, BOB, ME, i)).collect();
        assert_eq!(
            conv.apply_older_page(1, &older),
            PageOutcome::Prepended { count: 20 }
        );
        assert!(!conv.is_page_in_flight());
        assert_eq!(conv.messages().len(), 40);
        assert_eq!(conv.messages()[0].server_id, Some(MessageId(1)));
        assert_eq!(conv.messages()[39].server_id, Some(MessageId(40)));
        assert_sorted(&conv);
    }

    #[test]
    fn test_cursor_echoes_server_timestamp_string() {
        let mut conv = Conversation::new(BOB);
        let mut oldest = wire(1, BOB, ME, 0);
        oldest.raw_timestamp = Some("2024-03-01T14:00:00+02:00".into());
        conv.apply_history(&[oldest, wire(2, BOB, ME, 60)]);

        assert_eq!(conv.oldest(), Some(at(0)));
        assert_eq!(
            conv.begin_load_older(1).as_deref(),
            Some("2024-03-01T14:00:00+02:00")
        );
        assert_eq!(
            conv.page_request().map(|r| r.cursor.as_str()),
            Some("2024-03-01T14:00:00+02:00")
        );
    }

    #[test]
    fn test_confirmed_echo_takes_server_timestamp_string() {
        let mut conv = Conversation::new(BOB);
        conv.push_pending(Message::pending(ME, BOB, "hi"));

        let mut echo = wire(7, ME, BOB, 30);
        echo.raw_timestamp = Some("2024-03-01T07:00:30-05:00".into());
        conv.apply_incoming(&echo, true);

        assert_eq!(conv.cursor().as_deref(), Some("2024-03-01T07:00:30-05:00"));
    }

    #[test]
    fn test_empty_page_exhausts_permanently() {
        let mut conv = Conversation::new(BOB);
        conv.apply_history(&[wire(1, BOB, ME, 1)]);

        conv.begin_load_older(1).unwrap();
        assert_eq!(conv.apply_older_page(1, &[]), PageOutcome::Exhausted);
        assert!(conv.is_exhausted());
        assert!(!conv.is_page_in_flight());
        assert_eq!(conv.begin_load_older(2), None);

        // A later non-empty page does not revert the flag.
        conv.apply_older_page(3, &[wire(0, BOB, ME, 0)]);
        assert!(conv.is_exhausted());
    }

    #[test]
    fn test_load_older_needs_messages() {
        let mut conv = Conversation::new(BOB);
        assert_eq!(conv.begin_load_older(1), None);
        assert!(!conv.is_page_in_flight());
    }

    #[test]
    fn test_stale_timeout_keeps_newer_request() {
        let mut conv = Conversation::new(BOB);
        conv.apply_history(&[wire(10, BOB, ME, 10)]);

        conv.begin_load_older(1).unwrap();
        assert!(conv.expire_page_request(1));
        conv.begin_load_older(2).unwrap();
        assert!(!conv.expire_page_request(1));
        assert!(conv.is_page_in_flight());
    }

    #[test]
    fn test_late_page_filters_to_older_than_loaded() {
        let mut conv = Conversation::new(BOB);
        conv.apply_history(&[wire(10, BOB, ME, 10), wire(11, BOB, ME, 11)]);
        conv.begin_load_older(1).unwrap();
        conv.expire_page_request(1);
        conv.begin_load_older(2).unwrap();

        // Late answer to request 1 includes an entry that is not older.
        let page = vec![wire(9, BOB, ME, 9), wire(12, BOB, ME, 12)];
        assert_eq!(
            conv.apply_older_page(1, &page),
            PageOutcome::Prepended { count: 1 }
        );
        // Request 2 is still outstanding.
        assert!(conv.is_page_in_flight());
        assert_sorted(&conv);
    }

    #[test]
    fn test_last_activity_falls_back_to_hint() {
        let mut conv = Conversation::new(BOB);
        assert_eq!(conv.last_activity(), None);
        conv.set_activity_hint(Some(at(3)));
        assert_eq!(conv.last_activity(), Some(at(3)));
        conv.apply_incoming(&wire(1, BOB, ME, 8), false);
        assert_eq!(conv.last_activity(), Some(at(8)));
    }

    #[test]
    fn test_reset_requests_allows_rerequest() {
        let mut conv = Conversation::new(BOB);
        conv.mark_history_requested();
        conv.reset_requests();
        assert!(conv.needs_history());
    }
}
