//! Real-time direct-message sync engine.
//!
//! [`spawn_chat_engine`] starts the connection manager and the engine task
//! that owns every conversation; UI layers drive it through a
//! [`ChatHandle`] and observe it through [`ChatEvent`]s.

pub mod config;
pub mod directory;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod events;
pub mod notify;
pub mod session;
pub mod throttle;

pub use config::ClientConfig;
pub use directory::{DirectoryUser, HttpDirectory, PeerDirectory};
pub use dispatcher::{dispatch, FrameHandler};
pub use engine::{spawn_chat_engine, ChatHandle, EngineConfig};
pub use error::{ChatError, DirectoryError, SessionError, UserError};
pub use events::{ChatEvent, NotificationPayload};
pub use notify::{LogNotifier, NoopNotifier, Notifier};
pub use session::{spawn_session_monitor, HttpSessionProvider, SessionInfo, SessionProvider};
