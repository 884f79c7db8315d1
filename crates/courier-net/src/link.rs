//! Link abstraction over the relay connection.
//!
//! A [`Connector`] opens a fresh [`Link`] per connection attempt. The
//! transport task only ever talks to the relay through these traits, so
//! the WebSocket implementation below and the in-process
//! [`MemoryRelay`](crate::memory::MemoryRelay) are interchangeable.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::debug;

use courier_shared::Frame;

use crate::error::TransportError;

#[async_trait]
pub trait Link: Send {
    async fn send(&mut self, frame: &Frame) -> Result<(), TransportError>;

    /// Next frame from the relay. `None` once the link is closed.
    ///
    /// Must be cancel safe: the transport polls it inside `select!`.
    async fn recv(&mut self) -> Option<Result<Frame, TransportError>>;

    async fn close(&mut self);
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn Link>, TransportError>;
}

// ---------------------------------------------------------------------------
// WebSocket
// ---------------------------------------------------------------------------

/// Opens JSON-over-WebSocket links to a relay URL.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url: String,
}

impl WebSocketConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self) -> Result<Box<dyn Link>, TransportError> {
        let (stream, _response) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        debug!(url = %self.url, "WebSocket link opened");
        Ok(Box::new(WebSocketLink { stream }))
    }
}

pub struct WebSocketLink {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Link for WebSocketLink {
    async fn send(&mut self, frame: &Frame) -> Result<(), TransportError> {
        let text = frame.to_text()?;
        self.stream.send(Message::Text(text)).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<Frame, TransportError>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => {
                    return Some(Frame::from_text(&text).map_err(TransportError::from));
                }
                Ok(Message::Close(_)) => return None,
                // Pings are answered by tungstenite itself
                Ok(_) => continue,
                Err(e) => return Some(Err(e.into())),
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.stream.close(None).await;
    }
}
