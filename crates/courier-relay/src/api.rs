use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, State, WebSocketUpgrade},
    http::{Method, StatusCode},
    middleware,
    response::Response,
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use courier_shared::UserId;

use crate::config::RelayConfig;
use crate::rate_limit::{connect_rate_middleware, IpLimiter, UserLimiter};
use crate::relay::{self, Hub};

#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<Hub>,
    pub user_limiter: UserLimiter,
    pub ip_limiter: IpLimiter,
    pub config: Arc<RelayConfig>,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            hub: Arc::new(Hub::new()),
            user_limiter: UserLimiter::new(config.rate_per_sec, config.rate_burst),
            // A reconnect storm from one address gets a small burst
            ip_limiter: IpLimiter::new(
                config.connect_rate_per_sec,
                config.connect_rate_per_sec * 2.0,
            ),
            config: Arc::new(config),
            started_at: Utc::now(),
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers(Any);

    let ws = Router::new()
        .route("/ws", get(ws_upgrade))
        .route_layer(middleware::from_fn_with_state(
            state.ip_limiter.clone(),
            connect_rate_middleware,
        ));

    Router::new()
        .route("/health", get(health_check))
        .route("/online/:user_id", get(online_check))
        .merge(ws)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    name: String,
    users: usize,
    sessions: usize,
    uptime_secs: i64,
}

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        name: state.config.instance_name.clone(),
        users: state.hub.user_count().await,
        sessions: state.hub.session_count().await,
        uptime_secs: (Utc::now() - state.started_at).num_seconds(),
    })
}

#[derive(Debug, Serialize)]
struct OnlineResponse {
    online: bool,
}

async fn online_check(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<OnlineResponse>, (StatusCode, String)> {
    let user = UserId::from_hex(&user_id)
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
    Ok(Json(OnlineResponse {
        online: state.hub.is_online(&user).await,
    }))
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let max = state.config.max_frame_bytes;
    ws.max_message_size(max)
        .max_frame_size(max)
        .on_upgrade(move |socket| relay::handle_socket(socket, state))
}

pub async fn serve(state: AppState, addr: SocketAddr) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    serve_on(listener, state).await
}

pub async fn serve_on(listener: TcpListener, state: AppState) -> anyhow::Result<()> {
    info!(addr = %listener.local_addr()?, "Relay listening");

    let app = build_router(state);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
