//! Connection manager task with tokio mpsc command/notification pattern.
//!
//! The manager owns the single transport link. Other components only request
//! sends and observe status through a [`ConnectionHandle`]; everything the
//! link produces comes back as [`ConnectionNotification`]s on one ordered
//! queue.

use std::future::pending;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep_until, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use murmur_shared::constants::{COMMAND_BUFFER, DEFAULT_LIVENESS_INTERVAL_SECS};
use murmur_shared::{ConnectionStatus, OutboundFrame};

use crate::backoff::ReconnectPolicy;
use crate::error::{SendError, TransportError};
use crate::lifecycle::{CloseOutcome, ConnectionLifecycle};
use crate::transport::{Connector, TransportEvent, TransportLink};

// ---------------------------------------------------------------------------
// Command / notification types
// ---------------------------------------------------------------------------

/// Commands sent *into* the manager task.
#[derive(Debug)]
pub enum ConnectionCommand {
    /// Open the transport unless connected, connecting or capped.
    Connect,
    /// Write one encoded frame.
    Send(String),
    /// A session became available: arm the liveness check and connect.
    Login,
    /// The session ended: close the link and cancel every timer.
    Logout,
    /// Stop the task.
    Shutdown,
}

/// Notifications sent *from* the manager task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionNotification {
    StatusChanged(ConnectionStatus),
    /// The transport opened; emitted after the `Connected` status change.
    Connected,
    /// One raw text frame, in arrival order.
    Frame(String),
    /// A transport error. Does not by itself change status or attempts.
    TransportError(String),
    ReconnectScheduled { attempt: u32, delay: Duration },
}

/// Status plus attempt counter, published through a `watch` channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionSnapshot {
    pub status: ConnectionStatus,
    pub attempt_count: u32,
}

/// Configuration for spawning the manager.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub policy: ReconnectPolicy,
    /// Period of the defensive `connect()` while a session is active.
    pub liveness_interval: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            policy: ReconnectPolicy::default(),
            liveness_interval: Duration::from_secs(DEFAULT_LIVENESS_INTERVAL_SECS),
        }
    }
}

/// Cloneable handle to the manager task.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    cmd_tx: mpsc::UnboundedSender<ConnectionCommand>,
    snapshot_rx: watch::Receiver<ConnectionSnapshot>,
}

impl ConnectionHandle {
    pub fn status(&self) -> ConnectionStatus {
        self.snapshot_rx.borrow().status
    }

    pub fn attempt_count(&self) -> u32 {
        self.snapshot_rx.borrow().attempt_count
    }

    pub fn is_connected(&self) -> bool {
        self.status().is_connected()
    }

    /// Watch status and attempt count.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionSnapshot> {
        self.snapshot_rx.clone()
    }

    /// Encode and send a frame. Fails with [`SendError::NotConnected`] unless
    /// the stream is `Connected`.
    pub fn send(&self, frame: &OutboundFrame) -> Result<(), SendError> {
        if !self.is_connected() {
            return Err(SendError::NotConnected);
        }
        let text = frame.encode()?;
        self.command(ConnectionCommand::Send(text))
    }

    pub fn connect(&self) -> Result<(), SendError> {
        self.command(ConnectionCommand::Connect)
    }

    pub fn login(&self) -> Result<(), SendError> {
        self.command(ConnectionCommand::Login)
    }

    pub fn logout(&self) -> Result<(), SendError> {
        self.command(ConnectionCommand::Logout)
    }

    pub fn shutdown(&self) {
        let _ = self.cmd_tx.send(ConnectionCommand::Shutdown);
    }

    fn command(&self, cmd: ConnectionCommand) -> Result<(), SendError> {
        self.cmd_tx.send(cmd).map_err(|_| SendError::ManagerGone)
    }
}

/// Spawn the connection manager in a background tokio task.
///
/// The manager starts logged out and idle; call [`ConnectionHandle::login`]
/// to start connecting.
///
/// # Returns
///
/// `(handle, notification_rx, task)`
pub fn spawn_connection_manager<C: Connector>(
    connector: C,
    config: ConnectionConfig,
) -> (
    ConnectionHandle,
    mpsc::Receiver<ConnectionNotification>,
    JoinHandle<()>,
) {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (notif_tx, notif_rx) = mpsc::channel(COMMAND_BUFFER);
    let initial = ConnectionSnapshot {
        status: ConnectionStatus::Disconnected,
        attempt_count: 0,
    };
    let (snapshot_tx, snapshot_rx) = watch::channel(initial);

    let manager = ConnectionManager {
        connector: Arc::new(connector),
        lifecycle: ConnectionLifecycle::new(config.policy),
        liveness_period: config.liveness_interval,
        link: None,
        pending_connect: None,
        reconnect_at: None,
        liveness: None,
        notif_tx,
        snapshot_tx,
        published: initial,
    };

    let task = tokio::spawn(manager.run(cmd_rx));

    (
        ConnectionHandle {
            cmd_tx,
            snapshot_rx,
        },
        notif_rx,
        task,
    )
}

struct ConnectionManager<C: Connector> {
    connector: Arc<C>,
    lifecycle: ConnectionLifecycle,
    liveness_period: Duration,
    link: Option<TransportLink>,
    pending_connect: Option<JoinHandle<Result<TransportLink, TransportError>>>,
    reconnect_at: Option<Instant>,
    liveness: Option<Interval>,
    notif_tx: mpsc::Sender<ConnectionNotification>,
    snapshot_tx: watch::Sender<ConnectionSnapshot>,
    published: ConnectionSnapshot,
}

impl<C: Connector> ConnectionManager<C> {
    async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<ConnectionCommand>) {
        info!("Connection manager started");

        loop {
            tokio::select! {
                // --- Incoming commands ---
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(ConnectionCommand::Shutdown) | None => break,
                        Some(cmd) => self.handle_command(cmd).await,
                    }
                }

                // --- Connect attempt finished ---
                result = wait_connect(&mut self.pending_connect) => {
                    self.pending_connect = None;
                    self.handle_connect_result(result).await;
                }

                // --- Link events ---
                event = next_link_event(&mut self.link) => {
                    self.handle_link_event(event).await;
                }

                // --- Reconnect timer ---
                _ = wait_until(self.reconnect_at) => {
                    self.reconnect_at = None;
                    debug!(attempt = self.lifecycle.attempt_count(), "Reconnect timer fired");
                    self.try_connect().await;
                }

                // --- Liveness check ---
                _ = wait_tick(&mut self.liveness) => {
                    self.try_connect().await;
                }
            }
        }

        self.teardown();
        info!("Connection manager terminated");
    }

    async fn handle_command(&mut self, cmd: ConnectionCommand) {
        match cmd {
            ConnectionCommand::Connect => self.try_connect().await,
            ConnectionCommand::Send(text) => match &self.link {
                Some(link) if self.lifecycle.status().is_connected() => {
                    if let Err(e) = link.send(text) {
                        warn!(error = %e, "Dropping frame, link is closing");
                    }
                }
                _ => warn!("Dropping frame, not connected"),
            },
            ConnectionCommand::Login => {
                info!("Session active, arming connection");
                self.lifecycle.login();
                self.liveness = (!self.liveness_period.is_zero()).then(|| {
                    let mut liveness = interval_at(
                        Instant::now() + self.liveness_period,
                        self.liveness_period,
                    );
                    liveness.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    liveness
                });
                self.publish().await;
                self.try_connect().await;
            }
            ConnectionCommand::Logout => {
                info!("Session ended, closing connection");
                self.teardown();
                self.lifecycle.logout();
                self.publish().await;
            }
            ConnectionCommand::Shutdown => {}
        }
    }

    async fn try_connect(&mut self) {
        if self.pending_connect.is_some() || !self.lifecycle.begin_connect() {
            return;
        }
        self.reconnect_at = None;
        self.publish().await;

        let connector = self.connector.clone();
        self.pending_connect = Some(tokio::spawn(async move { connector.connect().await }));
    }

    async fn handle_connect_result(&mut self, result: Result<TransportLink, TransportError>) {
        match result {
            Ok(link) => {
                self.link = Some(link);
                self.lifecycle.on_open();
                info!("Connected");
                self.publish().await;
                self.notify(ConnectionNotification::Connected).await;
            }
            Err(e) => {
                warn!(error = %e, "Connect attempt failed");
                self.notify(ConnectionNotification::TransportError(e.to_string()))
                    .await;
                self.handle_close().await;
            }
        }
    }

    async fn handle_link_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Text(text) => {
                self.notify(ConnectionNotification::Frame(text)).await;
            }
            TransportEvent::Error(e) => {
                warn!(error = %e, "Transport error");
                self.notify(ConnectionNotification::TransportError(e)).await;
            }
            TransportEvent::Closed => {
                if let Some(mut link) = self.link.take() {
                    link.close();
                }
                info!("Transport closed");
                self.handle_close().await;
            }
        }
    }

    async fn handle_close(&mut self) {
        let outcome = self.lifecycle.on_close();
        self.publish().await;

        match outcome {
            CloseOutcome::Reconnect { attempt, .. } => {
                let delay = self.lifecycle.policy().jittered_delay(attempt);
                self.reconnect_at = Some(Instant::now() + delay);
                info!(attempt, delay_ms = delay.as_millis() as u64, "Reconnect scheduled");
                self.notify(ConnectionNotification::ReconnectScheduled { attempt, delay })
                    .await;
            }
            CloseOutcome::Failed => {
                warn!(
                    attempts = self.lifecycle.attempt_count(),
                    "Reconnect attempts exhausted"
                );
            }
            CloseOutcome::Idle => {}
        }
    }

    /// Close the link and cancel every pending timer and connect attempt.
    fn teardown(&mut self) {
        if let Some(mut link) = self.link.take() {
            link.close();
        }
        if let Some(pending) = self.pending_connect.take() {
            pending.abort();
        }
        self.reconnect_at = None;
        self.liveness = None;
    }

    async fn publish(&mut self) {
        let snapshot = ConnectionSnapshot {
            status: self.lifecycle.status(),
            attempt_count: self.lifecycle.attempt_count(),
        };
        if snapshot == self.published {
            return;
        }
        let status_changed = snapshot.status != self.published.status;
        self.published = snapshot;
        self.snapshot_tx.send_replace(snapshot);

        if status_changed {
            debug!(status = %snapshot.status, attempts = snapshot.attempt_count, "Status changed");
            self.notify(ConnectionNotification::StatusChanged(snapshot.status))
                .await;
        }
    }

    async fn notify(&self, notification: ConnectionNotification) {
        let _ = self.notif_tx.send(notification).await;
    }
}

async fn wait_connect(
    pending_connect: &mut Option<JoinHandle<Result<TransportLink, TransportError>>>,
) -> Result<TransportLink, TransportError> {
    match pending_connect.as_mut() {
        Some(handle) => match handle.await {
            Ok(result) => result,
            Err(e) => Err(TransportError::Stream(format!("connect task failed: {e}"))),
        },
        None => pending().await,
    }
}

async fn next_link_event(link: &mut Option<TransportLink>) -> TransportEvent {
    match link.as_mut() {
        Some(link) => link.next_event().await,
        None => pending().await,
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}

async fn wait_tick(liveness: &mut Option<Interval>) {
    match liveness.as_mut() {
        Some(interval) => {
            interval.tick().await;
        }
        None => pending().await,
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use murmur_shared::UserId;

    use super::*;
    use crate::transport::memory::{MemoryConnector, RemoteEnd};

    fn test_config(max_attempts: u32) -> ConnectionConfig {
        ConnectionConfig {
            policy: ReconnectPolicy::new(Duration::from_millis(1_000), max_attempts, Duration::ZERO),
            liveness_interval: Duration::from_secs(10),
        }
    }

    async fn next_status(rx: &mut mpsc::Receiver<ConnectionNotification>) -> ConnectionStatus {
        loop {
            match rx.recv().await.expect("manager alive") {
                ConnectionNotification::StatusChanged(status) => return status,
                _ => continue,
            }
        }
    }

    async fn accept(remotes: &mut mpsc::UnboundedReceiver<RemoteEnd>) -> RemoteEnd {
        remotes.recv().await.expect("connect attempt")
    }

    #[tokio::test(start_paused = true)]
    async fn test_login_connects_and_relays_frames() {
        let (connector, mut remotes) = MemoryConnector::new();
        let (handle, mut notifs, _task) = spawn_connection_manager(connector, test_config(5));

        assert!(matches!(
            handle.send(&OutboundFrame::GetHistory { receiver_id: UserId(2) }),
            Err(SendError::NotConnected)
        ));

        handle.login().unwrap();
        assert_eq!(next_status(&mut notifs).await, ConnectionStatus::Connecting);
        let mut remote = accept(&mut remotes).await;
        assert_eq!(next_status(&mut notifs).await, ConnectionStatus::Connected);
        assert_eq!(notifs.recv().await, Some(ConnectionNotification::Connected));
        assert!(handle.is_connected());

        handle
            .send(&OutboundFrame::GetHistory { receiver_id: UserId(2) })
            .unwrap();
        let written = remote.written.recv().await.unwrap();
        assert!(written.contains("\"get_history\""));

        remote.push_text(r#"{"type":"typing_stopped"}"#);
        assert_eq!(
            notifs.recv().await,
            Some(ConnectionNotification::Frame(r#"{"type":"typing_stopped"}"#.into()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_huge_base_delay_is_capped() {
        let (connector, mut remotes) = MemoryConnector::new();
        let config = ConnectionConfig {
            policy: ReconnectPolicy::new(Duration::from_millis(u64::MAX), 3, Duration::ZERO),
            liveness_interval: Duration::ZERO,
        };
        let (handle, mut notifs, task) = spawn_connection_manager(connector, config);

        handle.login().unwrap();
        let remote = accept(&mut remotes).await;
        while next_status(&mut notifs).await != ConnectionStatus::Connected {}

        remote.close();
        loop {
            match notifs.recv().await.expect("manager alive") {
                ConnectionNotification::ReconnectScheduled { delay, .. } => {
                    assert_eq!(delay, crate::backoff::MAX_RECONNECT_DELAY);
                    break;
                }
                _ => continue,
            }
        }
        assert!(!task.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn test_closure_schedules_backoff_and_open_resets_attempts() {
        let (connector, mut remotes) = MemoryConnector::new();
        let (handle, mut notifs, _task) = spawn_connection_manager(connector, test_config(3));

        handle.login().unwrap();
        let remote = accept(&mut remotes).await;
        while next_status(&mut notifs).await != ConnectionStatus::Connected {}

        remote.close();
        assert_eq!(next_status(&mut notifs).await, ConnectionStatus::Disconnected);
        assert_eq!(
            notifs.recv().await,
            Some(ConnectionNotification::ReconnectScheduled {
                attempt: 1,
                delay: Duration::from_millis(1_000),
            })
        );
        assert_eq!(handle.attempt_count(), 1);

        let start = Instant::now();
        let remote = accept(&mut remotes).await;
        assert!(Instant::now() - start >= Duration::from_millis(1_000));
        assert_eq!(next_status(&mut notifs).await, ConnectionStatus::Connecting);
        assert_eq!(next_status(&mut notifs).await, ConnectionStatus::Connected);
        assert_eq!(handle.attempt_count(), 0);

        // A second drop starts the sequence over at attempt 1.
        remote.close();
        assert_eq!(next_status(&mut notifs).await, ConnectionStatus::Disconnected);
        assert_eq!(handle.attempt_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refused_attempts_reach_failed_and_stop() {
        let (connector, mut remotes) = MemoryConnector::new();
        connector.set_refuse_all(true);
        let (handle, mut notifs, _task) = spawn_connection_manager(connector.clone(), test_config(3));

        handle.login().unwrap();
        loop {
            if next_status(&mut notifs).await == ConnectionStatus::Failed {
                break;
            }
        }
        assert_eq!(handle.attempt_count(), 3);

        // Liveness checks do nothing once capped.
        connector.set_refuse_all(false);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(remotes.try_recv().is_err());
        assert_eq!(handle.status(), ConnectionStatus::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_logout_closes_link_and_login_starts_fresh() {
        let (connector, mut remotes) = MemoryConnector::new();
        connector.refuse_next(TransportError::Refused("down".into()));
        let (handle, mut notifs, _task) = spawn_connection_manager(connector, test_config(5));

        handle.login().unwrap();
        while handle.attempt_count() != 1 {
            notifs.recv().await.unwrap();
        }
        let remote = accept(&mut remotes).await;
        while next_status(&mut notifs).await != ConnectionStatus::Connected {}

        handle.logout().unwrap();
        assert_eq!(next_status(&mut notifs).await, ConnectionStatus::Disconnected);
        tokio::task::yield_now().await;
        assert!(remote.is_closed());
        assert_eq!(handle.attempt_count(), 0);

        // No reconnect while logged out, even across liveness periods.
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(remotes.try_recv().is_err());

        handle.login().unwrap();
        assert_eq!(next_status(&mut notifs).await, ConnectionStatus::Connecting);
        let _remote = accept(&mut remotes).await;
        assert_eq!(next_status(&mut notifs).await, ConnectionStatus::Connected);
        assert_eq!(handle.attempt_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_error_does_not_change_attempts() {
        let (connector, mut remotes) = MemoryConnector::new();
        let (handle, mut notifs, _task) = spawn_connection_manager(connector, test_config(5));

        handle.login().unwrap();
        let remote = accept(&mut remotes).await;
        while next_status(&mut notifs).await != ConnectionStatus::Connected {}
        let _ = notifs.recv().await;

        remote.push_error("reset by peer");
        assert_eq!(
            notifs.recv().await,
            Some(ConnectionNotification::TransportError("reset by peer".into()))
        );
        assert_eq!(handle.status(), ConnectionStatus::Connected);
        assert_eq!(handle.attempt_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cursor_frame_goes_out_verbatim() {
        let (connector, mut remotes) = MemoryConnector::new();
        let (handle, mut notifs, _task) = spawn_connection_manager(connector, test_config(5));
        handle.login().unwrap();
        let mut remote = accept(&mut remotes).await;
        while next_status(&mut notifs).await != ConnectionStatus::Connected {}

        let frame = OutboundFrame::GetMoreHistory {
            receiver_id: UserId(4),
            timestamp: Utc::now().to_string(),
        };
        handle.send(&frame).unwrap();
        assert_eq!(remote.written.recv().await, Some(frame.encode().unwrap()));
    }
}
