//! Domain model structs held by the chat state store.
//!
//! Everything except [`SessionKeys`] derives `Serialize`/`Deserialize` so it
//! can be handed to the UI layer or written into a [`Snapshot`].

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use courier_shared::crypto::SymmetricKey;
use courier_shared::{ChatId, MessageId, MessageType, PresenceStatus, PublicKeyBundle, UserId};

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// Delivery status of a message.
///
/// `Sending → Sent → Delivered → Read`, or `Sending → Failed`. Transitions
/// only move forward.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Sending,
    Sent,
    Delivered,
    Read,
    Failed,
}

impl MessageStatus {
    fn rank(self) -> u8 {
        match self {
            Self::Sending => 0,
            Self::Sent => 1,
            Self::Delivered => 2,
            Self::Read => 3,
            Self::Failed => 1,
        }
    }

    /// Whether a message in `self` may move to `next`.
    ///
    /// `Failed` is reachable only from `Sending`, and a failed message can
    /// only go back to `Sending` through an explicit retry (see
    /// [`MessageStatus::can_retry`]), never through this transition.
    pub fn can_advance_to(self, next: MessageStatus) -> bool {
        match (self, next) {
            (Self::Failed, _) => false,
            (Self::Sending, Self::Failed) => true,
            (_, Self::Failed) => false,
            (current, next) => next.rank() > current.rank(),
        }
    }

    pub fn can_retry(self) -> bool {
        self == Self::Failed
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sending => "sending",
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Read => "read",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "sending" => Self::Sending,
            "sent" => Self::Sent,
            "delivered" => Self::Delivered,
            "read" => Self::Read,
            "failed" => Self::Failed,
            _ => return None,
        })
    }
}

/// A single chat message.
///
/// `content` is the local plaintext; `ciphertext`/`nonce` keep the wire
/// form for outgoing messages so a retry or an audit can refer to it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub chat_id: ChatId,
    pub sender: UserId,
    pub recipient: UserId,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ciphertext: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<Vec<u8>>,
    /// Send-order key. Stored sequences are ascending on `(timestamp, id)`.
    pub timestamp: DateTime<Utc>,
    pub status: MessageStatus,
    pub message_type: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<MessageId>,
    /// Emoji to the users who reacted with it.
    #[serde(default)]
    pub reactions: BTreeMap<String, BTreeSet<UserId>>,
    #[serde(default)]
    pub edited: bool,
    /// Sent by the local user.
    pub outgoing: bool,
}

impl Message {
    /// A message composed locally, in the `Sending` state.
    pub fn outgoing(
        id: MessageId,
        chat_id: ChatId,
        sender: UserId,
        recipient: UserId,
        content: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            chat_id,
            sender,
            recipient,
            content: content.into(),
            ciphertext: None,
            nonce: None,
            timestamp,
            status: MessageStatus::Sending,
            message_type: MessageType::Text,
            reply_to: None,
            reactions: BTreeMap::new(),
            edited: false,
            outgoing: true,
        }
    }

    /// A message received from `sender`. Its chat id is assigned on routing.
    pub fn incoming(
        id: MessageId,
        sender: UserId,
        recipient: UserId,
        content: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            chat_id: ChatId::direct(&sender, &recipient),
            sender,
            recipient,
            content: content.into(),
            ciphertext: None,
            nonce: None,
            timestamp,
            status: MessageStatus::Delivered,
            message_type: MessageType::Text,
            reply_to: None,
            reactions: BTreeMap::new(),
            edited: false,
            outgoing: false,
        }
    }

    pub(crate) fn order_key(&self) -> (DateTime<Utc>, &MessageId) {
        (self.timestamp, &self.id)
    }
}

// ---------------------------------------------------------------------------
// Chat
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Chat {
    pub id: ChatId,
    /// Fixed for direct chats: both participants, ascending.
    pub participants: Vec<UserId>,
    /// Newest message in the chat's ordered sequence.
    pub last_message: Option<MessageId>,
    pub last_activity: DateTime<Utc>,
    pub unread_count: u32,
    pub created_at: DateTime<Utc>,
}

impl Chat {
    pub fn direct(a: UserId, b: UserId, now: DateTime<Utc>) -> Self {
        let mut participants = vec![a, b];
        participants.sort();
        participants.dedup();
        Self {
            id: ChatId::direct(&a, &b),
            participants,
            last_message: None,
            last_activity: now,
            unread_count: 0,
            created_at: now,
        }
    }
}

// ---------------------------------------------------------------------------
// Peer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Peer {
    pub id: UserId,
    pub display_name: Option<String>,
    pub nickname: Option<String>,
    pub presence: PresenceStatus,
    pub last_seen: Option<DateTime<Utc>>,
}

impl Peer {
    /// A peer seen for the first time. Offline until a presence event says
    /// otherwise.
    pub fn new(id: UserId) -> Self {
        Self {
            id,
            display_name: None,
            nickname: None,
            presence: PresenceStatus::Offline,
            last_seen: None,
        }
    }

    /// Nickname, then display name, then the short id.
    pub fn label(&self) -> String {
        self.nickname
            .clone()
            .or_else(|| self.display_name.clone())
            .unwrap_or_else(|| self.id.short())
    }
}

// ---------------------------------------------------------------------------
// Profile / keys
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserProfile {
    pub user_id: UserId,
    pub display_name: Option<String>,
}

/// Per-peer key material. Memory only; never part of a snapshot.
#[derive(Clone)]
pub struct SessionKeys {
    pub session_key: SymmetricKey,
    /// The peer's verified bundle.
    pub bundle: PublicKeyBundle,
    /// Key-confirmation tag both sides must agree on.
    pub confirmation: String,
    pub established_at: DateTime<Utc>,
}

impl std::fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionKeys")
            .field("peer", &self.bundle.user_id.short())
            .field("confirmation", &self.confirmation)
            .field("established_at", &self.established_at)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Persistable state. Excludes session keys, selections, typing indicators
/// and the active chat.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Snapshot {
    pub profile: Option<UserProfile>,
    pub chats: Vec<Chat>,
    pub messages: Vec<Message>,
    pub peers: Vec<Peer>,
    pub drafts: BTreeMap<ChatId, String>,
    pub blocked: Vec<UserId>,
    pub last_sync: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_moves_forward_only() {
        use MessageStatus::*;
        assert!(Sending.can_advance_to(Sent));
        assert!(Sending.can_advance_to(Delivered));
        assert!(Sent.can_advance_to(Read));
        assert!(Delivered.can_advance_to(Read));
        assert!(Sending.can_advance_to(Failed));

        assert!(!Read.can_advance_to(Delivered));
        assert!(!Delivered.can_advance_to(Sent));
        assert!(!Sent.can_advance_to(Sent));
        assert!(!Sent.can_advance_to(Failed));
        assert!(!Failed.can_advance_to(Sent));
        assert!(Failed.can_retry());
    }

    #[test]
    fn test_status_string_roundtrip() {
        for status in [
            MessageStatus::Sending,
            MessageStatus::Sent,
            MessageStatus::Delivered,
            MessageStatus::Read,
            MessageStatus::Failed,
        ] {
            assert_eq!(MessageStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(MessageStatus::parse("bogus"), None);
    }

    #[test]
    fn test_peer_label_preference() {
        let mut peer = Peer::new(UserId([0xab; 32]));
        assert_eq!(peer.label(), "abababab");
        peer.display_name = Some("Bob".into());
        assert_eq!(peer.label(), "Bob");
        peer.nickname = Some("Bobby".into());
        assert_eq!(peer.label(), "Bobby");
    }
}
