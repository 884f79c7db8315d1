//! Relay configuration loaded from environment variables.
//!
//! Every setting has a default so the relay starts with zero configuration
//! for local development.

use std::net::SocketAddr;
use std::str::FromStr;

use courier_shared::constants::{DEFAULT_RELAY_PORT, MAX_FRAME_SIZE};

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Socket address for the HTTP + WebSocket server.
    /// Env: `RELAY_ADDR`
    /// Default: `0.0.0.0:8787`
    pub http_addr: SocketAddr,

    /// Sustained envelopes per second allowed for one user.
    /// Env: `RELAY_RATE_PER_SEC`
    pub rate_per_sec: f64,

    /// Burst size of the per-user bucket.
    /// Env: `RELAY_RATE_BURST`
    pub rate_burst: f64,

    /// Connection upgrades per second allowed from one IP address.
    /// Env: `RELAY_CONNECT_RATE_PER_SEC`
    pub connect_rate_per_sec: f64,

    /// Largest text frame accepted from a client, in bytes.
    /// Env: `RELAY_MAX_FRAME_BYTES`
    pub max_frame_bytes: usize,

    /// Human-readable name reported by `/health`.
    /// Env: `RELAY_NAME`
    pub instance_name: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], DEFAULT_RELAY_PORT).into(),
            rate_per_sec: 20.0,
            rate_burst: 60.0,
            connect_rate_per_sec: 5.0,
            // Envelope JSON around a maximum-size payload, base64 included
            max_frame_bytes: MAX_FRAME_SIZE,
            instance_name: "courier-relay".to_string(),
        }
    }
}

impl RelayConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(addr) = env_parse::<SocketAddr>("RELAY_ADDR") {
            config.http_addr = addr;
        }
        if let Some(rate) = env_parse::<f64>("RELAY_RATE_PER_SEC") {
            config.rate_per_sec = rate;
        }
        if let Some(burst) = env_parse::<f64>("RELAY_RATE_BURST") {
            config.rate_burst = burst;
        }
        if let Some(rate) = env_parse::<f64>("RELAY_CONNECT_RATE_PER_SEC") {
            config.connect_rate_per_sec = rate;
        }
        if let Some(bytes) = env_parse::<usize>("RELAY_MAX_FRAME_BYTES") {
            config.max_frame_bytes = bytes;
        }
        if let Ok(name) = std::env::var("RELAY_NAME") {
            if !name.is_empty() {
                config.instance_name = name;
            }
        }

        config
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    let value = std::env::var(key).ok()?;
    match value.trim().parse::<T>() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            tracing::warn!(key, value = %value, "Invalid value, using default");
            None
        }
    }
}
