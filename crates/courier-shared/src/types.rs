use serde::{Deserialize, Serialize};

use crate::constants::{DIRECT_CHAT_PREFIX, MESSAGE_ID_BYTES};
use crate::crypto::generate_secure_id;
use crate::error::IdentityError;

// User identity = Ed25519 public key (32 bytes), hex on the wire
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(into = "String", try_from = "String")]
pub struct UserId(pub [u8; 32]);

impl UserId {
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, IdentityError> {
        let bytes = hex::decode(s).map_err(|_| IdentityError::InvalidUserId(s.to_string()))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| IdentityError::InvalidUserId(s.to_string()))?;
        Ok(Self(arr))
    }

    pub fn short(&self) -> String {
        self.to_hex()[..8].to_string()
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<UserId> for String {
    fn from(id: UserId) -> Self {
        id.to_hex()
    }
}

impl TryFrom<String> for UserId {
    type Error = IdentityError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_hex(&value)
    }
}

/// Chat identifier. Direct chats use `direct_<lo>_<hi>` where `lo`/`hi` are
/// the participants' hex ids in ascending order, so both ends derive the
/// same id without coordinating.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct ChatId(pub String);

impl ChatId {
    pub fn direct(a: &UserId, b: &UserId) -> Self {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        Self(format!("{DIRECT_CHAT_PREFIX}_{lo}_{hi}"))
    }

    /// Both participants of a direct chat id, or `None` for any other id.
    pub fn direct_participants(&self) -> Option<(UserId, UserId)> {
        let rest = self.0.strip_prefix(DIRECT_CHAT_PREFIX)?.strip_prefix('_')?;
        let (lo, hi) = rest.split_once('_')?;
        Some((UserId::from_hex(lo).ok()?, UserId::from_hex(hi).ok()?))
    }

    /// The participant of a direct chat that is not `me`.
    pub fn direct_peer(&self, me: &UserId) -> Option<UserId> {
        let (lo, hi) = self.direct_participants()?;
        if &lo == me {
            Some(hi)
        } else if &hi == me {
            Some(lo)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ChatId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Globally unique message / envelope identifier.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct MessageId(pub String);

impl MessageId {
    pub fn generate() -> Self {
        Self(generate_secure_id(MESSAGE_ID_BYTES))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Connection state of the relay transport.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Online,
    Away,
    Offline,
}
