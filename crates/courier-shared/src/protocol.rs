use chrono::{DateTime, SubsecRound, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::constants::{NONCE_SIZE, SIGN_CONTEXT_MESSAGE};
use crate::crypto::SealedMessage;
use crate::error::{CryptoError, ProtocolError};
use crate::identity::PublicKeyBundle;
use crate::types::{ChatId, MessageId, PresenceStatus, UserId};

/// Wire-level wrapper carrying routing metadata around a payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    pub id: MessageId,
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    pub from: UserId,
    pub to: UserId,
    pub data: serde_json::Value,
    /// Unix milliseconds on the wire.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    Message,
    Typing,
    Presence,
    DeliveryReceipt,
    ReadReceipt,
    /// Any type this client does not understand.
    #[serde(other)]
    Unknown,
}

impl EnvelopeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::Typing => "typing",
            Self::Presence => "presence",
            Self::DeliveryReceipt => "delivery_receipt",
            Self::ReadReceipt => "read_receipt",
            Self::Unknown => "unknown",
        }
    }
}

/// Frames exchanged with the relay over the persistent connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Frame {
    /// Join the delivery channel keyed by `user_id`.
    Register { user_id: UserId, protocol: String },
    /// Relay accepted the registration.
    Registered { user_id: UserId },
    /// Relay refused the registration, or the envelope named by `id`.
    Rejected {
        reason: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<MessageId>,
    },
    /// An envelope, in either direction.
    Envelope(Envelope),
    /// Relay accepted an outbound envelope for fan-out.
    Ack { id: MessageId },
}

impl Frame {
    pub fn to_text(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_text(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    #[default]
    Text,
    Image,
    File,
    System,
}

impl MessageType {
    /// Stable byte used when the type is signed.
    fn tag(self) -> u8 {
        match self {
            MessageType::Text => 0,
            MessageType::Image => 1,
            MessageType::File => 2,
            MessageType::System => 3,
        }
    }
}

/// Payload of a `message` envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatPayload {
    #[serde(with = "b64")]
    pub ciphertext: Vec<u8>,
    #[serde(with = "b64")]
    pub nonce: Vec<u8>,
    #[serde(with = "b64")]
    pub ephemeral_key: Vec<u8>,
    pub sender_bundle: PublicKeyBundle,
    pub key_confirmation: String,
    /// Detached Ed25519 signature over [`ChatPayload::signing_bytes`].
    #[serde(with = "b64")]
    pub signature: Vec<u8>,
    #[serde(default)]
    pub message_type: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<MessageId>,
}

impl ChatPayload {
    /// Canonical bytes covered by the sender's signature. Binds the
    /// ciphertext, its presentation fields and its routing metadata so none
    /// can be altered or replayed under a different id, sender, recipient
    /// or timestamp. `signature` itself is not covered.
    pub fn signing_bytes(
        &self,
        id: &MessageId,
        from: &UserId,
        to: &UserId,
        timestamp: &DateTime<Utc>,
    ) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(256 + self.ciphertext.len());
        bytes.extend_from_slice(SIGN_CONTEXT_MESSAGE);
        bytes.extend_from_slice(id.as_str().as_bytes());
        bytes.extend_from_slice(&from.0);
        bytes.extend_from_slice(&to.0);
        bytes.extend_from_slice(&timestamp.timestamp_millis().to_be_bytes());
        bytes.extend_from_slice(&self.ephemeral_key);
        bytes.extend_from_slice(&self.nonce);
        bytes.extend_from_slice(&(self.ciphertext.len() as u64).to_be_bytes());
        bytes.extend_from_slice(&self.ciphertext);
        bytes.extend_from_slice(self.key_confirmation.as_bytes());
        bytes.push(self.message_type.tag());
        match &self.reply_to {
            Some(reply_to) => {
                bytes.push(1);
                bytes.extend_from_slice(reply_to.as_str().as_bytes());
            }
            None => bytes.push(0),
        }
        bytes
    }

    pub fn sealed(&self) -> Result<SealedMessage, CryptoError> {
        let ephemeral_public: [u8; 32] = self
            .ephemeral_key
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::InvalidKeyLength)?;
        let nonce: [u8; NONCE_SIZE] = self
            .nonce
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::DecryptionFailed)?;
        Ok(SealedMessage {
            ephemeral_public,
            nonce,
            ciphertext: self.ciphertext.clone(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TypingPayload {
    pub chat_id: ChatId,
    pub is_typing: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PresencePayload {
    pub status: PresenceStatus,
}

/// Payload of both delivery and read receipts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReceiptPayload {
    pub message_ids: Vec<MessageId>,
}

/// Current time truncated to the wire's millisecond precision, so the
/// sender's local copy and every receiver sort on the same key.
pub fn wire_now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

impl Envelope {
    pub fn new<T: Serialize>(
        kind: EnvelopeKind,
        from: UserId,
        to: UserId,
        payload: &T,
    ) -> Result<Self, ProtocolError> {
        Self::with_id(MessageId::generate(), kind, from, to, wire_now(), payload)
    }

    pub fn with_id<T: Serialize>(
        id: MessageId,
        kind: EnvelopeKind,
        from: UserId,
        to: UserId,
        timestamp: DateTime<Utc>,
        payload: &T,
    ) -> Result<Self, ProtocolError> {
        Ok(Self {
            id,
            kind,
            from,
            to,
            data: serde_json::to_value(payload)?,
            timestamp,
        })
    }

    /// Decode `data` into the payload type for this envelope.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        Ok(serde_json::from_value(self.data.clone())?)
    }
}

mod b64 {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}
