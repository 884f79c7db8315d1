//! # courier-client
//!
//! The messaging context: an explicitly constructed [`Messenger`] that ties
//! the identity, the chat state store, the relay transport and the local
//! database together, plus a task wrapper ([`MessengerHandle`]) for UI code.

pub mod config;
pub mod events;
pub mod keys;
pub mod messenger;
pub mod service;

mod error;

pub use config::ClientConfig;
pub use error::{ClientError, Result};
pub use events::ClientEvent;
pub use messenger::Messenger;
pub use service::{MessengerCommand, MessengerHandle};

use tracing_subscriber::{fmt, EnvFilter};

/// Install the global tracing subscriber. `RUST_LOG` overrides the default
/// filter.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("courier_client=debug,courier_net=debug,courier_store=info,warn")
    });

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .try_init();
}
