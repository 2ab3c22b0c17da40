//! Client configuration loaded from environment variables.
//!
//! Every setting has a default so the client can start with zero
//! configuration against a local development server.

use std::time::Duration;

use url::Url;

use murmur_net::{ConnectionConfig, ReconnectPolicy};
use murmur_shared::constants::{
    DEFAULT_DIRECTORY_REFRESH_SECS, DEFAULT_LIVENESS_INTERVAL_SECS, DEFAULT_MAX_RECONNECT_ATTEMPTS,
    DEFAULT_PAGE_TIMEOUT_MS, DEFAULT_RECONNECT_BASE_DELAY_MS, DEFAULT_RECONNECT_JITTER_MS,
    DEFAULT_SCROLL_THROTTLE_MS, DEFAULT_SERVER_URL, DEFAULT_TYPING_TIMEOUT_MS,
    SESSION_STATUS_PATH, USERS_PATH, WS_PATH,
};

use crate::engine::EngineConfig;
use crate::error::ChatError;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base HTTP(S) URL of the forum server.
    /// Env: `MURMUR_SERVER_URL`
    /// Default: `http://localhost:8080`
    pub server_url: String,

    /// Raw `Cookie` header value carrying the session.
    /// Env: `MURMUR_SESSION_COOKIE`
    pub session_cookie: Option<String>,

    /// Must be at least 1.
    /// Env: `MURMUR_MAX_RECONNECT_ATTEMPTS`
    /// Default: `5`
    pub max_reconnect_attempts: u32,

    /// Env: `MURMUR_RECONNECT_BASE_DELAY_MS`
    /// Default: `1000`
    pub reconnect_base_delay: Duration,

    /// Upper bound of the random delay added to each reconnect backoff.
    /// Env: `MURMUR_RECONNECT_JITTER_MS`
    /// Default: `250`
    pub reconnect_jitter: Duration,

    /// Env: `MURMUR_LIVENESS_INTERVAL_SECS`
    /// Default: `10`
    pub liveness_interval: Duration,

    /// Env: `MURMUR_PAGE_TIMEOUT_MS`
    /// Default: `3000`
    pub page_timeout: Duration,

    /// Env: `MURMUR_SCROLL_THROTTLE_MS`
    /// Default: `300`
    pub scroll_throttle: Duration,

    /// Env: `MURMUR_TYPING_TIMEOUT_MS`
    /// Default: `5000`
    pub typing_timeout: Duration,

    /// Env: `MURMUR_DIRECTORY_REFRESH_SECS`
    /// Default: `30`
    pub directory_refresh: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            session_cookie: None,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            reconnect_base_delay: Duration::from_millis(DEFAULT_RECONNECT_BASE_DELAY_MS),
            reconnect_jitter: Duration::from_millis(DEFAULT_RECONNECT_JITTER_MS),
            liveness_interval: Duration::from_secs(DEFAULT_LIVENESS_INTERVAL_SECS),
            page_timeout: Duration::from_millis(DEFAULT_PAGE_TIMEOUT_MS),
            scroll_throttle: Duration::from_millis(DEFAULT_SCROLL_THROTTLE_MS),
            typing_timeout: Duration::from_millis(DEFAULT_TYPING_TIMEOUT_MS),
            directory_refresh: Duration::from_secs(DEFAULT_DIRECTORY_REFRESH_SECS),
        }
    }
}

impl ClientConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(raw) = lookup("MURMUR_SERVER_URL") {
            match Url::parse(raw.trim()) {
                Ok(url) if matches!(url.scheme(), "http" | "https") => {
                    config.server_url = url.to_string();
                }
                _ => {
                    tracing::warn!(value = %raw, "Invalid MURMUR_SERVER_URL, using default");
                }
            }
        }

        if let Some(cookie) = lookup("MURMUR_SESSION_COOKIE") {
            if !cookie.trim().is_empty() {
                config.session_cookie = Some(cookie.trim().to_string());
            }
        }

        if let Some(n) = parse_var(&lookup, "MURMUR_MAX_RECONNECT_ATTEMPTS") {
            if n > 0 {
                config.max_reconnect_attempts = n;
            } else {
                tracing::warn!(
                    key = "MURMUR_MAX_RECONNECT_ATTEMPTS",
                    value = n,
                    "Invalid value, using default"
                );
            }
        }
        if let Some(ms) = parse_var(&lookup, "MURMUR_RECONNECT_BASE_DELAY_MS") {
            config.reconnect_base_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var(&lookup, "MURMUR_RECONNECT_JITTER_MS") {
            config.reconnect_jitter = Duration::from_millis(ms);
        }
        if let Some(secs) = parse_var(&lookup, "MURMUR_LIVENESS_INTERVAL_SECS") {
            config.liveness_interval = Duration::from_secs(secs);
        }
        if let Some(ms) = parse_var(&lookup, "MURMUR_PAGE_TIMEOUT_MS") {
            config.page_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var(&lookup, "MURMUR_SCROLL_THROTTLE_MS") {
            config.scroll_throttle = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var(&lookup, "MURMUR_TYPING_TIMEOUT_MS") {
            config.typing_timeout = Duration::from_millis(ms);
        }
        if let Some(secs) = parse_var(&lookup, "MURMUR_DIRECTORY_REFRESH_SECS") {
            config.directory_refresh = Duration::from_secs(secs);
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter.

        config
    }

    /// WebSocket endpoint: `http→ws`, `https→wss`, path `/ws`.
    pub fn ws_url(&self) -> Result<Url, ChatError> {
        let mut url = self.base_url()?;
        let scheme = match url.scheme() {
            "https" => "wss",
            "http" => "ws",
            other => return Err(ChatError::InvalidUrl(format!("unsupported scheme '{other}'"))),
        };
        url.set_scheme(scheme)
            .map_err(|_| ChatError::InvalidUrl(self.server_url.clone()))?;
        url.set_path(WS_PATH);
        url.set_query(None);
        Ok(url)
    }

    pub fn users_url(&self) -> Result<Url, ChatError> {
        self.endpoint(USERS_PATH)
    }

    pub fn session_url(&self) -> Result<Url, ChatError> {
        self.endpoint(SESSION_STATUS_PATH)
    }

    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            policy: ReconnectPolicy::new(
                self.reconnect_base_delay,
                self.max_reconnect_attempts,
                self.reconnect_jitter,
            ),
            liveness_interval: self.liveness_interval,
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            page_timeout: self.page_timeout,
            scroll_throttle: self.scroll_throttle,
            typing_timeout: self.typing_timeout,
            directory_refresh: self.directory_refresh,
        }
    }

    fn base_url(&self) -> Result<Url, ChatError> {
        Url::parse(&self.server_url).map_err(|e| ChatError::InvalidUrl(format!("{}: {e}", self.server_url)))
    }

    fn endpoint(&self, path: &str) -> Result<Url, ChatError> {
        self.base_url()?
            .join(path)
            .map_err(|e| ChatError::InvalidUrl(e.to_string()))
    }
}

fn parse_var<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Invalid value, using default");
            None
        }
    }
}
