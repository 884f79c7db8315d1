//! Transport configuration.
//!
//! Defaults connect to a relay on localhost; every field can be overridden
//! from the environment.

use std::time::Duration;

use courier_shared::constants::{DEFAULT_RELAY_URL, MAX_FRAME_SIZE};

use crate::backoff::ReconnectPolicy;

#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// WebSocket endpoint of the relay.
    /// Env: `COURIER_RELAY_URL`
    pub relay_url: String,

    /// Upper bound on opening the link plus the registration handshake.
    /// Env: `COURIER_CONNECT_TIMEOUT_SECS`
    pub connect_timeout: Duration,

    /// Interval of the `presence: online` heartbeat while connected.
    /// Env: `COURIER_HEARTBEAT_SECS`
    pub heartbeat_interval: Duration,

    /// Maximum number of envelopes held while offline.
    /// Env: `COURIER_MAX_QUEUE_LEN`
    pub max_queue_len: usize,

    /// Largest serialized envelope frame accepted for sending. Must not
    /// exceed the relay's own frame limit.
    /// Env: `COURIER_MAX_FRAME_BYTES`
    pub max_frame_bytes: usize,

    /// Env: `COURIER_RECONNECT_MAX_ATTEMPTS`
    pub reconnect: ReconnectPolicy,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            relay_url: DEFAULT_RELAY_URL.to_string(),
            connect_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(30),
            max_queue_len: 1000,
            max_frame_bytes: MAX_FRAME_SIZE,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl TransportConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("COURIER_RELAY_URL") {
            if !url.is_empty() {
                config.relay_url = url;
            }
        }

        if let Some(secs) = env_parse::<u64>("COURIER_CONNECT_TIMEOUT_SECS") {
            config.connect_timeout = Duration::from_secs(secs);
        }

        if let Some(secs) = env_parse::<u64>("COURIER_HEARTBEAT_SECS") {
            config.heartbeat_interval = Duration::from_secs(secs.max(1));
        }

        if let Some(len) = env_parse::<usize>("COURIER_MAX_QUEUE_LEN") {
            config.max_queue_len = len;
        }

        if let Some(bytes) = env_parse::<usize>("COURIER_MAX_FRAME_BYTES") {
            config.max_frame_bytes = bytes;
        }

        if let Some(attempts) = env_parse::<u32>("COURIER_RECONNECT_MAX_ATTEMPTS") {
            config.reconnect.max_attempts = attempts;
        }

        config
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let value = std::env::var(key).ok()?;
    match value.parse::<T>() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            tracing::warn!(key, value = %value, "Invalid value, using default");
            None
        }
    }
}
