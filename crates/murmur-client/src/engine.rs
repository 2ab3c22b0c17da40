//! Chat engine task.
//!
//! One task owns the [`ConversationStore`] and consumes, in a single
//! `select!` loop, UI commands, connection notifications, directory results
//! and its own timers (page timeouts, the trailing scroll call, typing
//! expiry). Inbound frames are therefore handled strictly in arrival order
//! and nothing else touches conversation state.

use std::collections::{HashMap, VecDeque};
use std::future::pending;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep_until, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use murmur_net::{
    spawn_connection_manager, ConnectionConfig, ConnectionHandle, ConnectionNotification,
    ConnectionSnapshot, Connector,
};
use murmur_shared::constants::{
    COMMAND_BUFFER, DEFAULT_DIRECTORY_REFRESH_SECS, DEFAULT_PAGE_TIMEOUT_MS,
    DEFAULT_SCROLL_THROTTLE_MS, DEFAULT_TYPING_TIMEOUT_MS, EVENT_BUFFER,
};
use murmur_shared::{
    ConnectionStatus, LocalKey, OutboundFrame, PresenceEntry, ProtocolError, UserId, WireMessage,
};
use murmur_store::{
    Applied, ConversationStore, ConversationSummary, Message, PageOutcome, StoreError,
};

use crate::directory::{DirectoryUser, PeerDirectory};
use crate::dispatcher::{dispatch, FrameHandler};
use crate::error::{ChatError, DirectoryError, UserError};
use crate::events::{emit_event, ChatEvent, NotificationPayload};
use crate::notify::{preview, Notifier};
use crate::throttle::{Throttle, ThrottleDecision};

/// Timing knobs of the engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub page_timeout: Duration,
    pub scroll_throttle: Duration,
    pub typing_timeout: Duration,
    /// Directory refresh period while logged in. Zero disables it.
    pub directory_refresh: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            page_timeout: Duration::from_millis(DEFAULT_PAGE_TIMEOUT_MS),
            scroll_throttle: Duration::from_millis(DEFAULT_SCROLL_THROTTLE_MS),
            typing_timeout: Duration::from_millis(DEFAULT_TYPING_TIMEOUT_MS),
            directory_refresh: Duration::from_secs(DEFAULT_DIRECTORY_REFRESH_SECS),
        }
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum ChatCommand {
    Login {
        user_id: UserId,
        username: Option<String>,
    },
    Logout,
    Open {
        peer_id: UserId,
        reply: oneshot::Sender<Result<(), UserError>>,
    },
    Close,
    Send {
        peer_id: UserId,
        content: String,
        reply: oneshot::Sender<Result<LocalKey, UserError>>,
    },
    LoadOlder(UserId),
    ScrollNearTop(UserId),
    SetTyping {
        peer_id: UserId,
        typing: bool,
    },
    Messages {
        peer_id: UserId,
        reply: oneshot::Sender<Vec<Message>>,
    },
    Summaries {
        reply: oneshot::Sender<Vec<ConversationSummary>>,
    },
    Shutdown,
}

/// Cloneable handle used by UI layers to drive the engine.
#[derive(Debug, Clone)]
pub struct ChatHandle {
    cmd_tx: mpsc::Sender<ChatCommand>,
    events: broadcast::Sender<ChatEvent>,
    connection: ConnectionHandle,
}

impl ChatHandle {
    /// Receive every [`ChatEvent`] emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.events.subscribe()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.connection.status()
    }

    /// Whether the engine task is still accepting commands.
    pub fn is_running(&self) -> bool {
        !self.cmd_tx.is_closed()
    }

    pub fn connection(&self) -> watch::Receiver<ConnectionSnapshot> {
        self.connection.subscribe()
    }

    /// Bind a session and start connecting. Logging in as a different user
    /// closes the current connection and discards all conversation content.
    pub async fn login(&self, user_id: UserId, username: Option<String>) -> Result<(), ChatError> {
        self.command(ChatCommand::Login { user_id, username }).await
    }

    /// Close the connection and stop all timers. Conversation state is kept
    /// until the next login.
    pub async fn logout(&self) -> Result<(), ChatError> {
        self.command(ChatCommand::Logout).await
    }

    pub async fn open_conversation(&self, peer_id: UserId) -> Result<(), ChatError> {
        let (reply, rx) = oneshot::channel();
        self.command(ChatCommand::Open { peer_id, reply }).await?;
        Ok(rx.await.map_err(|_| ChatError::EngineGone)??)
    }

    pub async fn close_conversation(&self) -> Result<(), ChatError> {
        self.command(ChatCommand::Close).await
    }

    /// Send `content` (trimmed) to `peer_id`. The message is shown as
    /// pending immediately; the returned key identifies it until the server
    /// confirms it.
    pub async fn send_message(
        &self,
        peer_id: UserId,
        content: impl Into<String>,
    ) -> Result<LocalKey, ChatError> {
        let (reply, rx) = oneshot::channel();
        self.command(ChatCommand::Send {
            peer_id,
            content: content.into(),
            reply,
        })
        .await?;
        Ok(rx.await.map_err(|_| ChatError::EngineGone)??)
    }

    pub async fn load_older(&self, peer_id: UserId) -> Result<(), ChatError> {
        self.command(ChatCommand::LoadOlder(peer_id)).await
    }

    /// The view was scrolled near its top. Throttled before paging.
    pub async fn scroll_near_top(&self, peer_id: UserId) -> Result<(), ChatError> {
        self.command(ChatCommand::ScrollNearTop(peer_id)).await
    }

    pub async fn set_typing(&self, peer_id: UserId, typing: bool) -> Result<(), ChatError> {
        self.command(ChatCommand::SetTyping { peer_id, typing }).await
    }

    /// Snapshot of one conversation's log, oldest first.
    pub async fn messages(&self, peer_id: UserId) -> Result<Vec<Message>, ChatError> {
        let (reply, rx) = oneshot::channel();
        self.command(ChatCommand::Messages { peer_id, reply }).await?;
        rx.await.map_err(|_| ChatError::EngineGone)
    }

    /// The ordered conversation list.
    pub async fn conversations(&self) -> Result<Vec<ConversationSummary>, ChatError> {
        let (reply, rx) = oneshot::channel();
        self.command(ChatCommand::Summaries { reply }).await?;
        rx.await.map_err(|_| ChatError::EngineGone)
    }

    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(ChatCommand::Shutdown).await;
    }

    async fn command(&self, cmd: ChatCommand) -> Result<(), ChatError> {
        self.cmd_tx.send(cmd).await.map_err(|_| ChatError::EngineGone)
    }
}

/// Spawn the connection manager and the chat engine on top of it.
///
/// # Returns
///
/// `(handle, engine_task)`
pub fn spawn_chat_engine<C, D, N>(
    connector: C,
    directory: D,
    notifier: N,
    connection_config: ConnectionConfig,
    config: EngineConfig,
) -> (ChatHandle, JoinHandle<()>)
where
    C: Connector,
    D: PeerDirectory,
    N: Notifier,
{
    let (connection, conn_rx, _manager_task) = spawn_connection_manager(connector, connection_config);
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
    let (events, _) = broadcast::channel(EVENT_BUFFER);
    let (directory_tx, directory_rx) = mpsc::unbounded_channel();

    let engine = ChatEngine {
        store: ConversationStore::new(),
        connection: connection.clone(),
        directory: Arc::new(directory),
        directory_tx,
        directory_refresh: None,
        notifier,
        notify_permission: None,
        scroll: Throttle::new(config.scroll_throttle),
        config,
        events: events.clone(),
        authenticated: false,
        history_requests: VecDeque::new(),
        page_requests: VecDeque::new(),
        next_seq: 1,
        scroll_peer: None,
        typing: HashMap::new(),
    };

    let task = tokio::spawn(engine.run(cmd_rx, conn_rx, directory_rx));

    (
        ChatHandle {
            cmd_tx,
            events,
            connection,
        },
        task,
    )
}

type DirectoryResult = Result<Vec<DirectoryUser>, DirectoryError>;

/// A `get_history` or `get_more_history` sent on the current connection and
/// not yet answered.
#[derive(Debug, Clone, Copy)]
struct PendingRequest {
    peer_id: UserId,
    /// Page sequence number, zero for the initial backfill.
    seq: u64,
    deadline: Instant,
}

struct ChatEngine<D, N> {
    store: ConversationStore,
    connection: ConnectionHandle,
    directory: Arc<D>,
    directory_tx: mpsc::UnboundedSender<DirectoryResult>,
    directory_refresh: Option<Interval>,
    notifier: N,
    /// Asked once, on the first notification.
    notify_permission: Option<bool>,
    config: EngineConfig,
    events: broadcast::Sender<ChatEvent>,
    authenticated: bool,
    /// Outstanding `get_history` requests, oldest first. Replies carry no
    /// peer id; a non-empty page is matched by its messages, an empty one
    /// by order.
    history_requests: VecDeque<PendingRequest>,
    /// Same for `get_more_history`.
    page_requests: VecDeque<PendingRequest>,
    next_seq: u64,
    scroll: Throttle,
    scroll_peer: Option<UserId>,
    /// Typing flags and their expiry.
    typing: HashMap<UserId, Instant>,
}

impl<D: PeerDirectory, N: Notifier> ChatEngine<D, N> {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<ChatCommand>,
        mut conn_rx: mpsc::Receiver<ConnectionNotification>,
        mut directory_rx: mpsc::UnboundedReceiver<DirectoryResult>,
    ) {
        info!("Chat engine started");

        loop {
            let deadline = self.next_deadline();

            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(ChatCommand::Shutdown) | None => break,
                        Some(cmd) => self.handle_command(cmd),
                    }
                }

                notification = conn_rx.recv() => {
                    match notification {
                        Some(n) => self.handle_connection(n),
                        None => {
                            warn!("Connection manager stopped");
                            break;
                        }
                    }
                }

                Some(result) = directory_rx.recv() => {
                    self.handle_directory(result);
                }

                _ = wait_until(deadline) => {
                    self.fire_timers(Instant::now());
                }

                _ = wait_tick(&mut self.directory_refresh) => {
                    self.refresh_directory();
                }
            }
        }

        self.connection.shutdown();
        info!("Chat engine terminated");
    }

    fn emit(&self, event: ChatEvent) {
        emit_event(&self.events, event);
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    fn handle_command(&mut self, cmd: ChatCommand) {
        match cmd {
            ChatCommand::Login { user_id, username } => self.login(user_id, username),
            ChatCommand::Logout => self.logout(),
            ChatCommand::Open { peer_id, reply } => {
                let _ = reply.send(self.open_conversation(peer_id));
            }
            ChatCommand::Close => {
                if let Some(peer_id) = self.store.close_active() {
                    debug!(peer = %peer_id, "Conversation closed");
                    self.emit(ChatEvent::ConversationClosed { peer_id });
                }
            }
            ChatCommand::Send {
                peer_id,
                content,
                reply,
            } => {
                let _ = reply.send(self.send_message(peer_id, &content));
            }
            ChatCommand::LoadOlder(peer_id) => self.load_older(peer_id),
            ChatCommand::ScrollNearTop(peer_id) => match self.scroll.call(Instant::now()) {
                ThrottleDecision::Run => self.load_older(peer_id),
                ThrottleDecision::Defer(_) => self.scroll_peer = Some(peer_id),
            },
            ChatCommand::SetTyping { peer_id, typing } => self.set_typing(peer_id, typing),
            ChatCommand::Messages { peer_id, reply } => {
                let messages = self
                    .store
                    .conversation(peer_id)
                    .map(|c| c.messages().to_vec())
                    .unwrap_or_default();
                let _ = reply.send(messages);
            }
            ChatCommand::Summaries { reply } => {
                let _ = reply.send(self.store.summaries());
            }
            ChatCommand::Shutdown => {}
        }
    }

    fn login(&mut self, user_id: UserId, username: Option<String>) {
        if !user_id.is_valid() {
            warn!(user = %user_id, "Ignoring login with invalid session id");
            return;
        }
        let previous = self.store.self_id().filter(|_| self.authenticated);
        if let Some(previous) = previous.filter(|id| *id != user_id) {
            // The open socket is authenticated as `previous`.
            info!(from = %previous, to = %user_id, "Switching user");
            self.end_session();
        }
        info!(user = %user_id, "Logged in");
        self.store.set_identity(user_id, username.clone());
        self.authenticated = true;

        let period = self.config.directory_refresh;
        self.directory_refresh = (!period.is_zero()).then(|| {
            let mut refresh = interval_at(Instant::now() + period, period);
            refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);
            refresh
        });

        if let Err(e) = self.connection.login() {
            warn!(error = %e, "Connection manager unavailable");
        }
        self.emit(ChatEvent::LoggedIn { user_id, username });
    }

    fn logout(&mut self) {
        info!("Logged out");
        self.end_session();
        self.emit(ChatEvent::LoggedOut);
    }

    /// Drop the connection and everything tied to it.
    fn end_session(&mut self) {
        self.authenticated = false;
        self.directory_refresh = None;
        self.forget_requests();
        self.scroll.reset();
        self.scroll_peer = None;
        self.typing.clear();

        if let Err(e) = self.connection.logout() {
            warn!(error = %e, "Connection manager unavailable");
        }
    }

    fn open_conversation(&mut self, peer_id: UserId) -> Result<(), UserError> {
        let was_unread = self
            .store
            .conversation(peer_id)
            .is_some_and(|c| c.has_unread());
        let needs_history = self.store.open(peer_id)?;

        info!(peer = %peer_id, "Conversation opened");
        self.emit(ChatEvent::ConversationOpened { peer_id });
        if was_unread {
            self.emit(ChatEvent::UnreadChanged {
                peer_id,
                has_unread: false,
            });
        }
        if needs_history {
            self.request_history(peer_id);
        }
        Ok(())
    }

    fn send_message(&mut self, peer_id: UserId, content: &str) -> Result<LocalKey, UserError> {
        let content = content.trim();
        if content.is_empty() {
            return Err(UserError::EmptyContent);
        }
        self.store.validate_peer(peer_id)?;
        if !self.connection.is_connected() {
            return Err(UserError::NotConnected);
        }

        let message = self.store.push_pending(peer_id, content)?;
        let local_key = message.local_key;
        self.emit(ChatEvent::MessageAdded { peer_id, message });

        let frame = OutboundFrame::Message {
            receiver_id: peer_id,
            content: content.to_string(),
            local_key,
        };
        match self.connection.send(&frame) {
            Ok(()) => debug!(peer = %peer_id, key = %local_key.short(), "Message sent"),
            Err(e) => warn!(peer = %peer_id, error = %e, "Message left pending"),
        }
        Ok(local_key)
    }

    fn request_history(&mut self, peer_id: UserId) {
        match self
            .connection
            .send(&OutboundFrame::GetHistory { receiver_id: peer_id })
        {
            Ok(()) => {
                self.store.conversation_mut(peer_id).mark_history_requested();
                self.history_requests.push_back(PendingRequest {
                    peer_id,
                    seq: 0,
                    deadline: Instant::now() + self.config.page_timeout,
                });
                debug!(peer = %peer_id, "History requested");
            }
            Err(e) => debug!(peer = %peer_id, error = %e, "History request deferred"),
        }
    }

    fn load_older(&mut self, peer_id: UserId) {
        if !self.connection.is_connected() || self.store.conversation(peer_id).is_none() {
            return;
        }
        if self.store.conversation_mut(peer_id).needs_history() {
            // The backfill timed out or was never sent; nothing to page from.
            self.request_history(peer_id);
            return;
        }

        let seq = self.next_seq;
        let Some(cursor) = self.store.conversation_mut(peer_id).begin_load_older(seq) else {
            return;
        };
        self.next_seq += 1;

        let frame = OutboundFrame::GetMoreHistory {
            receiver_id: peer_id,
            timestamp: cursor.clone(),
        };
        match self.connection.send(&frame) {
            Ok(()) => {
                self.page_requests.push_back(PendingRequest {
                    peer_id,
                    seq,
                    deadline: Instant::now() + self.config.page_timeout,
                });
                debug!(peer = %peer_id, seq, cursor = %cursor, "Older page requested");
                self.emit(ChatEvent::OlderPageRequested { peer_id });
            }
            Err(e) => {
                self.store
                    .conversation_mut(peer_id)
                    .expire_page_request(seq);
                warn!(peer = %peer_id, error = %e, "Older page request failed");
            }
        }
    }

    fn set_typing(&mut self, peer_id: UserId, typing: bool) {
        if !peer_id.is_valid() || !self.connection.is_connected() {
            return;
        }
        let frame = if typing {
            OutboundFrame::Typing {
                receiver_id: peer_id,
            }
        } else {
            OutboundFrame::TypingStopped {
                receiver_id: peer_id,
            }
        };
        if let Err(e) = self.connection.send(&frame) {
            debug!(error = %e, "Typing state not sent");
        }
    }

    // -----------------------------------------------------------------------
    // Connection notifications
    // -----------------------------------------------------------------------

    fn handle_connection(&mut self, notification: ConnectionNotification) {
        match notification {
            ConnectionNotification::StatusChanged(status) => {
                self.emit(ChatEvent::StatusChanged {
                    status,
                    attempt_count: self.connection.attempt_count(),
                });
            }
            ConnectionNotification::Connected => self.on_connected(),
            ConnectionNotification::Frame(text) => {
                dispatch(&text, self);
            }
            ConnectionNotification::TransportError(reason) => {
                self.emit(ChatEvent::TransportError { reason });
            }
            ConnectionNotification::ReconnectScheduled { attempt, delay } => {
                self.emit(ChatEvent::ReconnectScheduled { attempt, delay });
            }
        }
    }

    fn on_connected(&mut self) {
        // Answers to requests made on an earlier connection will not come.
        self.forget_requests();
        self.emit(ChatEvent::Connected);
        self.refresh_directory();

        if let Some(active) = self.store.active() {
            if self.store.conversation_mut(active).needs_history() {
                self.request_history(active);
            }
        }
    }

    fn forget_requests(&mut self) {
        self.history_requests.clear();
        self.page_requests.clear();
        for conv in self.store.conversations_mut() {
            conv.reset_requests();
        }
    }

    // -----------------------------------------------------------------------
    // Directory
    // -----------------------------------------------------------------------

    fn refresh_directory(&self) {
        if !self.authenticated {
            return;
        }
        let directory = self.directory.clone();
        let tx = self.directory_tx.clone();
        tokio::spawn(async move {
            let _ = tx.send(directory.fetch_all().await);
        });
    }

    fn handle_directory(&mut self, result: DirectoryResult) {
        if !self.authenticated {
            return;
        }
        match result {
            Ok(users) => {
                let entries: Vec<(UserId, String)> =
                    users.into_iter().map(|u| (u.id, u.username)).collect();
                self.store.merge_directory(&entries);
                let known = self.store.peers().count();
                debug!(known, "Peer directory merged");
                self.emit(ChatEvent::DirectoryUpdated { known });
            }
            Err(e) => warn!(error = %e, "Peer directory fetch failed"),
        }
    }

    // -----------------------------------------------------------------------
    // Timers
    // -----------------------------------------------------------------------

    fn next_deadline(&self) -> Option<Instant> {
        self.history_requests
            .iter()
            .chain(&self.page_requests)
            .map(|r| r.deadline)
            .chain(self.scroll.trailing_deadline())
            .chain(self.typing.values().copied())
            .min()
    }

    fn fire_timers(&mut self, now: Instant) {
        for r in take_due(&mut self.history_requests, now) {
            if self.store.conversation_mut(r.peer_id).expire_history_request() {
                info!(peer = %r.peer_id, "History request timed out");
                self.emit(ChatEvent::HistoryTimedOut { peer_id: r.peer_id });
            }
        }
        for r in take_due(&mut self.page_requests, now) {
            if self
                .store
                .conversation_mut(r.peer_id)
                .expire_page_request(r.seq)
            {
                info!(peer = %r.peer_id, seq = r.seq, "Older page request timed out");
                self.emit(ChatEvent::PageTimedOut { peer_id: r.peer_id });
            }
        }

        if self.scroll.fire(now) {
            if let Some(peer_id) = self.scroll_peer.take() {
                self.load_older(peer_id);
            }
        }

        let expired: Vec<UserId> = self
            .typing
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(id, _)| *id)
            .collect();
        for peer_id in expired {
            self.typing.remove(&peer_id);
            self.emit(ChatEvent::TypingStopped { peer_id });
        }
    }

    // -----------------------------------------------------------------------
    // Notifications
    // -----------------------------------------------------------------------

    fn notify(&mut self, peer_id: UserId, wire: &WireMessage) {
        let notifier = &mut self.notifier;
        let granted = *self
            .notify_permission
            .get_or_insert_with(|| notifier.request_permission());
        if !granted {
            return;
        }

        let title = wire
            .username
            .clone()
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| self.store.display_name(peer_id));
        self.notifier.show(&NotificationPayload {
            peer_id,
            title,
            body: preview(&wire.content),
        });
    }

    fn find_message(&self, peer_id: UserId, key: LocalKey) -> Option<Message> {
        self.store
            .conversation(peer_id)?
            .messages()
            .iter()
            .find(|m| m.local_key == key)
            .cloned()
    }
}

impl<D: PeerDirectory, N: Notifier> FrameHandler for ChatEngine<D, N> {
    fn on_user_list(&mut self, users: Vec<PresenceEntry>) {
        self.store.apply_presence(&users);
        let me = self.store.self_id();
        let online = users.iter().filter(|u| Some(u.id) != me).count();
        self.emit(ChatEvent::PresenceUpdated { online });
    }

    fn on_message(&mut self, wire: WireMessage) {
        let outcome = match self.store.apply_incoming(&wire) {
            Ok(outcome) => outcome,
            Err(StoreError::ForeignMessage { sender, receiver }) => {
                self.on_protocol_error(ProtocolError::ForeignMessage {
                    sender: sender.0,
                    receiver: receiver.0,
                });
                return;
            }
            Err(e) => {
                debug!(error = %e, "Dropping message");
                return;
            }
        };

        let peer_id = outcome.peer_id;
        match outcome.applied {
            Applied::Confirmed { local_key } => {
                if let Some(message) = self.find_message(peer_id, local_key) {
                    self.emit(ChatEvent::MessageConfirmed {
                        peer_id,
                        local_key,
                        message,
                    });
                }
            }
            Applied::Appended { local_key } => {
                if let Some(message) = self.find_message(peer_id, local_key) {
                    self.emit(ChatEvent::MessageAdded { peer_id, message });
                }
            }
            Applied::Duplicate => {
                debug!(peer = %peer_id, id = ?wire.id, "Duplicate message ignored");
            }
        }

        if outcome.notify {
            self.emit(ChatEvent::UnreadChanged {
                peer_id,
                has_unread: true,
            });
            self.notify(peer_id, &wire);
        }
    }

    fn on_history(&mut self, messages: Vec<WireMessage>) {
        let me = self.store.self_id();
        let (peer_id, request, messages) =
            match claim_page(me, "history", &mut self.history_requests, messages) {
                Ok(claimed) => claimed,
                Err(e) => {
                    self.on_protocol_error(e);
                    return;
                }
            };
        if request.is_none() {
            debug!(peer = %peer_id, "Late history reply merged");
        }

        let count = self.store.conversation_mut(peer_id).apply_history(&messages);
        debug!(peer = %peer_id, count, "History loaded");
        self.emit(ChatEvent::HistoryLoaded { peer_id, count });
    }

    fn on_more_history(&mut self, messages: Vec<WireMessage>) {
        let me = self.store.self_id();
        let (peer_id, request, messages) =
            match claim_page(me, "more_history", &mut self.page_requests, messages) {
                Ok(claimed) => claimed,
                Err(e) => {
                    self.on_protocol_error(e);
                    return;
                }
            };
        // A late page for a timed-out request is merged under seq 0, which
        // never matches a live request.
        let seq = request.map_or(0, |r| r.seq);

        match self
            .store
            .conversation_mut(peer_id)
            .apply_older_page(seq, &messages)
        {
            PageOutcome::Exhausted => {
                info!(peer = %peer_id, "History exhausted");
                self.emit(ChatEvent::HistoryExhausted { peer_id });
            }
            PageOutcome::Prepended { count } => {
                debug!(peer = %peer_id, seq, count, "Older page merged");
                self.emit(ChatEvent::HistoryPrepended { peer_id, count });
            }
        }
    }

    fn on_typing(&mut self, sender_id: Option<UserId>, username: Option<String>) {
        let Some(peer_id) = sender_id.or(self.store.active()) else {
            return;
        };
        if Some(peer_id) == self.store.self_id() {
            return;
        }

        let expires = Instant::now() + self.config.typing_timeout;
        if self.typing.insert(peer_id, expires).is_none() {
            let username = username
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| self.store.display_name(peer_id));
            self.emit(ChatEvent::TypingStarted { peer_id, username });
        }
    }

    fn on_typing_stopped(&mut self, sender_id: Option<UserId>) {
        let Some(peer_id) = sender_id.or(self.store.active()) else {
            return;
        };
        if self.typing.remove(&peer_id).is_some() {
            self.emit(ChatEvent::TypingStopped { peer_id });
        }
    }

    fn on_protocol_error(&mut self, error: ProtocolError) {
        warn!(error = %error, "Dropping frame");
        self.emit(ChatEvent::ProtocolError(error));
    }
}

/// Work out which outstanding request a history page answers.
///
/// A non-empty page belongs to the conversation its messages name; the
/// oldest request for that peer is taken if there is one (there is none for
/// a late reply). An empty page can only be matched by order. Returns the
/// conversation, the request and the page reduced to that conversation.
fn claim_page(
    me: Option<UserId>,
    kind: &str,
    outstanding: &mut VecDeque<PendingRequest>,
    mut messages: Vec<WireMessage>,
) -> Result<(UserId, Option<PendingRequest>, Vec<WireMessage>), ProtocolError> {
    let no_request = || ProtocolError::InvalidPayload {
        kind: kind.into(),
        reason: "no outstanding request".into(),
    };

    if messages.is_empty() {
        let request = outstanding.pop_front().ok_or_else(no_request)?;
        return Ok((request.peer_id, Some(request), messages));
    }

    let me = me.ok_or_else(no_request)?;
    let peer_id = messages
        .iter()
        .find_map(|m| m.counterpart(me))
        .ok_or_else(|| ProtocolError::InvalidPayload {
            kind: kind.into(),
            reason: "page belongs to no conversation of ours".into(),
        })?;

    let before = messages.len();
    messages.retain(|m| m.counterpart(me) == Some(peer_id));
    if messages.len() < before {
        let dropped = before - messages.len();
        debug!(peer = %peer_id, dropped, "Foreign entries removed from page");
    }

    let request = outstanding
        .iter()
        .position(|r| r.peer_id == peer_id)
        .and_then(|idx| outstanding.remove(idx));
    Ok((peer_id, request, messages))
}

/// Remove and return the requests whose deadline has passed.
fn take_due(queue: &mut VecDeque<PendingRequest>, now: Instant) -> VecDeque<PendingRequest> {
    let (due, waiting): (VecDeque<_>, VecDeque<_>) = std::mem::take(queue)
        .into_iter()
        .partition(|r| r.deadline <= now);
    *queue = waiting;
    due
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}

async fn wait_tick(interval: &mut Option<Interval>) {
    match interval.as_mut() {
        Some(interval) => {
            interval.tick().await;
        }
        None => pending().await,
    }
}
