//! Transport seam between the connection manager and a concrete duplex
//! stream.
//!
//! A [`Connector`] opens one [`TransportLink`] per attempt. The link is a
//! pair of channels fed by a pump task that owns the actual socket, so the
//! manager never touches the socket directly.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::TransportError;

/// Events surfaced by a live link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// One UTF-8 text frame.
    Text(String),
    /// A non-fatal error reported by the stream.
    Error(String),
    /// The stream is gone. Always the last event of a link.
    Closed,
}

#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Open a new link. Called once per connect attempt.
    async fn connect(&self) -> Result<TransportLink, TransportError>;
}

/// Handle to one open duplex stream.
pub struct TransportLink {
    outbound: mpsc::UnboundedSender<String>,
    inbound: mpsc::UnboundedReceiver<TransportEvent>,
    pump: Option<JoinHandle<()>>,
}

impl TransportLink {
    pub fn new(
        outbound: mpsc::UnboundedSender<String>,
        inbound: mpsc::UnboundedReceiver<TransportEvent>,
        pump: Option<JoinHandle<()>>,
    ) -> Self {
        Self {
            outbound,
            inbound,
            pump,
        }
    }

    /// Queue a text frame for writing.
    pub fn send(&self, text: String) -> Result<(), TransportError> {
        self.outbound.send(text).map_err(|_| TransportError::Closed)
    }

    /// Next event from the stream. A dropped pump reads as `Closed`.
    pub async fn next_event(&mut self) -> TransportEvent {
        self.inbound.recv().await.unwrap_or(TransportEvent::Closed)
    }

    /// Tear the stream down.
    pub fn close(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        self.inbound.close();
    }
}

impl Drop for TransportLink {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

/// In-memory links, used by the loopback connector and by tests that play the
/// server side of the stream.
pub mod memory {
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use super::*;

    /// The far end of an in-memory link.
    pub struct RemoteEnd {
        /// Frames the client wrote.
        pub written: mpsc::UnboundedReceiver<String>,
        events: mpsc::UnboundedSender<TransportEvent>,
    }

    impl RemoteEnd {
        /// Deliver a text frame to the client.
        pub fn push_text(&self, text: impl Into<String>) -> bool {
            self.events.send(TransportEvent::Text(text.into())).is_ok()
        }

        pub fn push_error(&self, error: impl Into<String>) -> bool {
            self.events.send(TransportEvent::Error(error.into())).is_ok()
        }

        /// Close the stream from the server side.
        pub fn close(&self) {
            let _ = self.events.send(TransportEvent::Closed);
        }

        /// Whether the client side dropped or closed the link.
        pub fn is_closed(&self) -> bool {
            self.events.is_closed()
        }

        /// Drain frames written so far without waiting.
        pub fn drain_written(&mut self) -> Vec<String> {
            let mut frames = Vec::new();
            while let Ok(frame) = self.written.try_recv() {
                frames.push(frame);
            }
            frames
        }
    }

    /// Create a connected link/remote pair.
    pub fn link_pair() -> (TransportLink, RemoteEnd) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        (
            TransportLink::new(out_tx, in_rx, None),
            RemoteEnd {
                written: out_rx,
                events: in_tx,
            },
        )
    }

    /// Connector that hands every accepted link's remote end to a channel.
    /// Attempts can be scripted to fail.
    #[derive(Clone)]
    pub struct MemoryConnector {
        remotes: mpsc::UnboundedSender<RemoteEnd>,
        refusals: Arc<Mutex<VecDeque<TransportError>>>,
        refuse_all: Arc<Mutex<bool>>,
    }

    impl MemoryConnector {
        pub fn new() -> (Self, mpsc::UnboundedReceiver<RemoteEnd>) {
            let (tx, rx) = mpsc::unbounded_channel();
            (
                Self {
                    remotes: tx,
                    refusals: Arc::new(Mutex::new(VecDeque::new())),
                    refuse_all: Arc::new(Mutex::new(false)),
                },
                rx,
            )
        }

        /// Make the next attempt fail with `error`.
        pub fn refuse_next(&self, error: TransportError) {
            if let Ok(mut queue) = self.refusals.lock() {
                queue.push_back(error);
            }
        }

        /// Make every attempt fail until switched off.
        pub fn set_refuse_all(&self, refuse: bool) {
            if let Ok(mut flag) = self.refuse_all.lock() {
                *flag = refuse;
            }
        }
    }

    #[async_trait]
    impl Connector for MemoryConnector {
        async fn connect(&self) -> Result<TransportLink, TransportError> {
            if let Some(error) = self.refusals.lock().ok().and_then(|mut q| q.pop_front()) {
                return Err(error);
            }
            if self.refuse_all.lock().map(|f| *f).unwrap_or(false) {
                return Err(TransportError::Refused("refusing all attempts".into()));
            }

            let (link, remote) = link_pair();
            self.remotes
                .send(remote)
                .map_err(|_| TransportError::Refused("no remote listener".into()))?;
            Ok(link)
        }
    }
}
