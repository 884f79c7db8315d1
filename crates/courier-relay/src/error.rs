use thiserror::Error;

use courier_shared::{ProtocolError, UserId};

/// Why the relay refused a client frame. The display text is sent back to
/// the client in a `rejected` frame.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] ProtocolError),

    #[error("unsupported protocol: {0}")]
    UnsupportedProtocol(String),

    #[error("register before sending envelopes")]
    NotRegistered,

    #[error("sender {from} does not match registration {registered}")]
    SenderMismatch { from: String, registered: String },

    #[error("rate limit exceeded")]
    RateLimited,

    #[error("unexpected frame: {0}")]
    UnexpectedFrame(&'static str),
}

impl RelayError {
    pub fn sender_mismatch(from: &UserId, registered: &UserId) -> Self {
        Self::SenderMismatch {
            from: from.short(),
            registered: registered.short(),
        }
    }
}
