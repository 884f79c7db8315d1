//! Client configuration.

use std::path::PathBuf;
use std::time::Duration;

use courier_net::TransportConfig;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub transport: TransportConfig,

    /// An outgoing message still unacknowledged after this long is marked
    /// failed and removed from the offline queue.
    /// Env: `COURIER_SEND_TIMEOUT_SECS`
    pub send_timeout: Duration,

    /// Typing indicators without a refresh expire after this long.
    /// Env: `COURIER_TYPING_TTL_SECS`
    pub typing_ttl: Duration,

    /// A peer with no heartbeat for this long is shown offline.
    /// Env: `COURIER_PRESENCE_TIMEOUT_SECS`
    pub presence_timeout: Duration,

    /// Period of the housekeeping tick in [`Messenger::run`].
    ///
    /// [`Messenger::run`]: crate::Messenger::run
    pub tick_interval: Duration,

    /// Database file. `None` uses the platform data directory.
    /// Env: `COURIER_DB_PATH`
    pub db_path: Option<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        let transport = TransportConfig::default();
        Self {
            presence_timeout: transport.heartbeat_interval * 3,
            transport,
            send_timeout: Duration::from_secs(30),
            typing_ttl: Duration::from_secs(5),
            tick_interval: Duration::from_secs(1),
            db_path: None,
        }
    }
}

impl ClientConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let transport = TransportConfig::from_env();
        let mut config = Self {
            presence_timeout: transport.heartbeat_interval * 3,
            transport,
            ..Self::default()
        };

        if let Some(secs) = env_secs("COURIER_SEND_TIMEOUT_SECS") {
            config.send_timeout = secs;
        }
        if let Some(secs) = env_secs("COURIER_TYPING_TTL_SECS") {
            config.typing_ttl = secs;
        }
        if let Some(secs) = env_secs("COURIER_PRESENCE_TIMEOUT_SECS") {
            config.presence_timeout = secs;
        }
        if let Ok(path) = std::env::var("COURIER_DB_PATH") {
            if !path.is_empty() {
                config.db_path = Some(PathBuf::from(path));
            }
        }

        config
    }
}

fn env_secs(key: &str) -> Option<Duration> {
    let value = std::env::var(key).ok()?;
    match value.parse::<u64>() {
        Ok(secs) if secs > 0 => Some(Duration::from_secs(secs)),
        _ => {
            tracing::warn!(key, value = %value, "Invalid value, using default");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presence_timeout_spans_three_heartbeats() {
        let config = ClientConfig::default();
        assert_eq!(
            config.presence_timeout,
            config.transport.heartbeat_interval * 3
        );
        assert_eq!(config.send_timeout, Duration::from_secs(30));
        assert!(config.db_path.is_none());
    }
}
