//! # courier-shared
//!
//! Types, wire protocol and cryptography shared by every Courier crate:
//! identities and signed key bundles, authenticated session keys, the
//! relay envelope format and the frames that carry it.

pub mod constants;
pub mod crypto;
pub mod error;
pub mod identity;
pub mod protocol;
pub mod types;

pub use error::{CryptoError, IdentityError, ProtocolError};
pub use identity::{Identity, PublicKeyBundle};
pub use protocol::{
    ChatPayload, Envelope, EnvelopeKind, Frame, MessageType, PresencePayload, ReceiptPayload,
    TypingPayload,
};
pub use types::{ChatId, ConnectionState, MessageId, PresenceStatus, UserId};
