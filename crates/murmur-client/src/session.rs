//! Session provider and the monitor that keeps the engine logged in.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};
use url::Url;

use murmur_shared::UserId;

use crate::engine::ChatHandle;
use crate::error::{ChatError, SessionError};

/// Answer of `GET /user/status`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SessionInfo {
    #[serde(rename = "sessionID", default)]
    pub session_id: UserId,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(rename = "loggedIn", default)]
    pub logged_in: bool,
}

impl SessionInfo {
    /// The session user, if this describes a usable session.
    pub fn user(&self) -> Option<UserId> {
        (self.logged_in && self.session_id.is_valid()).then_some(self.session_id)
    }
}

#[async_trait]
pub trait SessionProvider: Send + Sync + 'static {
    async fn current(&self) -> Result<SessionInfo, SessionError>;
}

#[derive(Debug, Clone)]
pub struct HttpSessionProvider {
    client: reqwest::Client,
    url: Url,
    cookie: Option<String>,
}

impl HttpSessionProvider {
    pub fn new(client: reqwest::Client, url: Url, cookie: Option<String>) -> Self {
        Self {
            client,
            url,
            cookie,
        }
    }
}

#[async_trait]
impl SessionProvider for HttpSessionProvider {
    async fn current(&self) -> Result<SessionInfo, SessionError> {
        let mut request = self.client.get(self.url.clone());
        if let Some(cookie) = &self.cookie {
            request = request.header(reqwest::header::COOKIE, cookie);
        }

        let resp = request.send().await?;
        if !resp.status().is_success() {
            return Err(SessionError::Status(resp.status()));
        }
        Ok(resp.json().await?)
    }
}

/// Poll `provider` every `period` and log the engine in or out when the
/// session changes. The first poll happens immediately. The task ends when
/// the engine stops.
pub fn spawn_session_monitor<P: SessionProvider>(
    provider: P,
    chat: ChatHandle,
    period: Duration,
) -> JoinHandle<()> {
    let provider = Arc::new(provider);
    tokio::spawn(async move {
        // Zero would make `interval` panic.
        let mut ticker = interval(period.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut current: Option<UserId> = None;

        loop {
            ticker.tick().await;
            if !chat.is_running() {
                debug!("Chat engine gone, stopping session monitor");
                break;
            }

            let session = match provider.current().await {
                Ok(session) => session,
                Err(e) => {
                    warn!(error = %e, "Session check failed");
                    continue;
                }
            };

            let result = match (current, session.user()) {
                (previous, Some(user)) if previous != Some(user) => {
                    info!(user = %user, "Session started");
                    current = Some(user);
                    chat.login(user, session.username).await
                }
                (Some(_), None) => {
                    info!("Session ended");
                    current = None;
                    chat.logout().await
                }
                _ => Ok(()),
            };

            if let Err(ChatError::EngineGone) = result {
                debug!("Chat engine gone, stopping session monitor");
                break;
            }
        }
    })
}
