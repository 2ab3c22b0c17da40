/// Application name
pub const APP_NAME: &str = "Murmur";

/// WebSocket endpoint path on the forum server
pub const WS_PATH: &str = "/ws";

/// Peer directory endpoint (all registered users)
pub const USERS_PATH: &str = "/user/all";

/// Session status endpoint
pub const SESSION_STATUS_PATH: &str = "/user/status";

/// Default forum server base URL
pub const DEFAULT_SERVER_URL: &str = "http://localhost:8080";

/// Reconnect attempts before the stream settles in `Failed`
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// Base reconnect delay in milliseconds (doubled per attempt)
pub const DEFAULT_RECONNECT_BASE_DELAY_MS: u64 = 1_000;

/// Upper bound of the random jitter added to each reconnect delay
pub const DEFAULT_RECONNECT_JITTER_MS: u64 = 250;

/// Liveness check interval in seconds
pub const DEFAULT_LIVENESS_INTERVAL_SECS: u64 = 10;

/// How long a history page request may stay unanswered
pub const DEFAULT_PAGE_TIMEOUT_MS: u64 = 3_000;

/// Minimum spacing of scroll-triggered page loads
pub const DEFAULT_SCROLL_THROTTLE_MS: u64 = 300;

/// How long a peer's typing flag survives without a refresh
pub const DEFAULT_TYPING_TIMEOUT_MS: u64 = 5_000;

/// Peer directory refresh interval in seconds
pub const DEFAULT_DIRECTORY_REFRESH_SECS: u64 = 30;

/// Characters of message content shown in a desktop notification
pub const NOTIFICATION_PREVIEW_CHARS: usize = 50;

/// Buffer sizes for the engine's command and event channels
pub const COMMAND_BUFFER: usize = 256;
pub const EVENT_BUFFER: usize = 1_024;
