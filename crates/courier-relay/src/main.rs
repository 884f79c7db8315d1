//! # courier-relay
//!
//! Stateless WebSocket relay for Courier clients.
//!
//! - **`/ws`**: clients register under their user id; each envelope is
//!   acknowledged and copied to every live session of its recipient
//! - **`/health`**: liveness plus session counts
//! - **Rate limiting**: per-user for envelopes, per-IP for connection
//!   upgrades
//!
//! Nothing is persisted. Offline delivery is the client's job.

mod api;
mod config;
mod error;
mod rate_limit;
mod relay;

use std::time::Duration;

use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::api::AppState;
use crate::config::RelayConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,courier_relay=debug")),
        )
        .init();

    info!("Starting Courier relay v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = RelayConfig::from_env();
    info!(?config, "Loaded configuration");
    let http_addr = config.http_addr;
    let state = AppState::new(config);

    // -----------------------------------------------------------------------
    // 3. Background maintenance
    // -----------------------------------------------------------------------

    // Evict rate-limit buckets idle for more than 10 minutes
    let users = state.user_limiter.clone();
    let ips = state.ip_limiter.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(300));
        loop {
            interval.tick().await;
            users.purge_stale(600.0).await;
            ips.purge_stale(600.0).await;
        }
    });

    // -----------------------------------------------------------------------
    // 4. Serve until Ctrl+C
    // -----------------------------------------------------------------------
    tokio::select! {
        result = api::serve(state, http_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Relay server failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
