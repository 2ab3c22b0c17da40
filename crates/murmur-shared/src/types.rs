use serde::{Deserialize, Serialize};
use uuid::Uuid;

// Forum account id as issued by the server's session layer.
#[derive(Debug, Default, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct UserId(pub i64);

impl UserId {
    /// Session ids `<= 0` mean "not logged in" on the wire.
    pub fn is_valid(&self) -> bool {
        self.0 > 0
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for UserId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<i64>().map(Self)
    }
}

/// Server-assigned message id, present once a message is persisted.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct MessageId(pub i64);

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Client-generated correlation key for an optimistic send.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct LocalKey(pub Uuid);

impl LocalKey {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn short(&self) -> String {
        self.0.simple().to_string()[..8].to_string()
    }
}

impl Default for LocalKey {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for LocalKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Observable state of the single duplex stream.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    /// Reconnect attempts exhausted; only a fresh login re-arms the stream.
    Failed,
}

impl ConnectionStatus {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Failed => "failed",
        };
        f.write_str(label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_id_parse_and_validity() {
        let id: UserId = " 42 ".parse().unwrap();
        assert_eq!(id, UserId(42));
        assert!(id.is_valid());
        assert!(!UserId(0).is_valid());
        assert!("abc".parse::<UserId>().is_err());
    }

    #[test]
    fn test_user_id_is_plain_number_on_the_wire() {
        let json = serde_json::to_string(&UserId(7)).unwrap();
        assert_eq!(json, "7");
    }

    #[test]
    fn test_local_keys_are_unique() {
        let a = LocalKey::new();
        let b = LocalKey::new();
        assert_ne!(a, b);
        assert_eq!(a.short().len(), 8);
    }
}
