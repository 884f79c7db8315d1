use courier_net::TransportError;
use courier_shared::{ChatId, CryptoError, IdentityError, MessageId, ProtocolError, UserId};
use courier_store::StoreError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Unknown chat: {0}")]
    UnknownChat(ChatId),

    #[error("Unknown message: {0}")]
    UnknownMessage(MessageId),

    /// No verified key material for the peer yet.
    #[error("No session with {0}")]
    NoSession(UserId),

    /// Only failed outgoing messages can be retried.
    #[error("Message {0} cannot be retried")]
    NotRetryable(MessageId),

    #[error("User {0} is blocked")]
    Blocked(UserId),

    /// The messenger task has stopped.
    #[error("Messenger closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, ClientError>;
