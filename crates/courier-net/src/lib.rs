// Relay transport: persistent link, offline queue, reconnect backoff and
// inbound dispatch.

pub mod backoff;
pub mod client;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod link;
#[cfg(any(test, feature = "test-util"))]
pub mod memory;
pub mod queue;

pub use backoff::ReconnectPolicy;
pub use client::{spawn_transport, SendOutcome, TransportCommand, TransportEvent, TransportHandle};
pub use config::TransportConfig;
pub use dispatch::{dispatch, InboundHandler};
pub use error::TransportError;
pub use link::{Connector, Link, WebSocketConnector};
#[cfg(any(test, feature = "test-util"))]
pub use memory::{MemoryConnector, MemoryRelay};
pub use queue::OutboundQueue;
