//! Peer directory: every registered user, fetched over HTTP.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;
use url::Url;

use murmur_shared::UserId;

use crate::error::DirectoryError;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DirectoryUser {
    pub id: UserId,
    #[serde(default)]
    pub username: String,
}

#[async_trait]
pub trait PeerDirectory: Send + Sync + 'static {
    async fn fetch_all(&self) -> Result<Vec<DirectoryUser>, DirectoryError>;
}

#[derive(Debug, Deserialize)]
struct UsersResponse {
    #[serde(default)]
    users: Option<Vec<DirectoryUser>>,
}

/// `GET {server}/user/all`, answered with `{"users": [...]}`.
#[derive(Debug, Clone)]
pub struct HttpDirectory {
    client: reqwest::Client,
    url: Url,
    cookie: Option<String>,
}

impl HttpDirectory {
    pub fn new(client: reqwest::Client, url: Url, cookie: Option<String>) -> Self {
        Self {
            client,
            url,
            cookie,
        }
    }
}

#[async_trait]
impl PeerDirectory for HttpDirectory {
    async fn fetch_all(&self) -> Result<Vec<DirectoryUser>, DirectoryError> {
        let mut request = self.client.get(self.url.clone());
        if let Some(cookie) = &self.cookie {
            request = request.header(reqwest::header::COOKIE, cookie);
        }

        let resp = request.send().await?;
        if !resp.status().is_success() {
            return Err(DirectoryError::Status(resp.status()));
        }

        let body: UsersResponse = resp.json().await?;
        let users = body.users.unwrap_or_default();
        debug!(count = users.len(), "Fetched peer directory");
        Ok(users)
    }
}
