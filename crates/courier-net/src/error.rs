use courier_shared::ProtocolError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    /// The link dropped while a frame was being written or awaited.
    #[error("Connection lost")]
    ConnectionLost,

    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Connection attempt timed out")]
    Timeout,

    /// The relay refused to register this user.
    #[error("Registration rejected: {0}")]
    Registration(String),

    #[error("Offline queue is full ({capacity} envelopes)")]
    QueueFull { capacity: usize },

    #[error("Malformed frame: {0}")]
    Frame(#[from] ProtocolError),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// The transport task has stopped and no longer accepts commands.
    #[error("Transport task closed")]
    Closed,
}
