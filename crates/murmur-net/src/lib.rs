// Connection layer: WebSocket transport, lifecycle and reconnect backoff.

pub mod backoff;
pub mod error;
pub mod lifecycle;
pub mod manager;
pub mod transport;
pub mod websocket;

pub use backoff::{ReconnectPolicy, MAX_RECONNECT_DELAY};
pub use error::{SendError, TransportError};
pub use lifecycle::{CloseOutcome, ConnectionLifecycle};
pub use manager::{
    spawn_connection_manager, ConnectionCommand, ConnectionConfig, ConnectionHandle,
    ConnectionNotification, ConnectionSnapshot,
};
pub use transport::{Connector, TransportEvent, TransportLink};
pub use websocket::WsConnector;
