//! Web server module: axum HTTP + WebSocket for operator clients.
//!
//! - `WS /ws` — JSON event stream and command intake
//! - `GET /api/status` — uptime and session counters
//! - `GET /api/state` — current vehicle state
//! - `GET /api/logs` — retained operator log
//! - `GET /` — static UI files, if a UI directory is configured

pub mod ws;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tracing::{info, warn};

use crate::server::Relay;

/// Shared state for the web server
struct WebState {
    relay: Relay,
    send_timeout: Duration,
    cancel: CancellationToken,
}

/// Build the router.
///
/// `ui_path` — directory with the operator UI. If None or missing, only the
/// API and WebSocket endpoints are served.
pub fn app(
    relay: Relay,
    ui_path: Option<&Path>,
    send_timeout: Duration,
    cancel: CancellationToken,
) -> Router {
    let state = Arc::new(WebState {
        relay,
        send_timeout,
        cancel,
    });

    let mut app = Router::new()
        .route("/ws", get(ws_upgrade))
        .route("/api/status", get(api_status))
        .route("/api/state", get(api_state))
        .route("/api/logs", get(api_logs))
        .layer(CorsLayer::permissive())
        .with_state(state);

    if let Some(path) = ui_path {
        if path.exists() {
            info!("Serving UI from {:?}", path);
            app = app.fallback_service(ServeDir::new(path).append_index_html_on_directories(true));
        } else {
            warn!("UI path {:?} does not exist, skipping static file serving", path);
        }
    }

    app
}

/// Serve `app` on an already bound listener until `cancel` fires
pub async fn serve(listener: TcpListener, app: Router, cancel: CancellationToken) -> Result<()> {
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .context("Web server error")?;
    Ok(())
}

/// WebSocket upgrade handler
async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<Arc<WebState>>) -> impl IntoResponse {
    let relay = state.relay.clone();
    let send_timeout = state.send_timeout;
    let cancel = state.cancel.clone();
    ws.on_upgrade(move |socket| ws::handle_ws(socket, relay, send_timeout, cancel))
}

/// GET /api/status — uptime and session counters
async fn api_status(State(state): State<Arc<WebState>>) -> Json<serde_json::Value> {
    let stats = state.relay.stats();
    Json(serde_json::json!({
        "uptime_secs": state.relay.uptime().as_secs(),
        "sessions": stats.sessions_connected,
        "sessions_opened": stats.sessions_opened,
        "sessions_evicted": stats.sessions_evicted,
        "events_sent": stats.events_sent,
        "events_dropped": stats.events_dropped,
        "logs": state.relay.log_sink().len(),
    }))
}

/// GET /api/state — current vehicle state
async fn api_state(State(state): State<Arc<WebState>>) -> Json<serde_json::Value> {
    let vehicle = state.relay.state();
    Json(serde_json::json!({
        "depth": vehicle.depth,
        "light_on": vehicle.light_on,
        "wifi_strength": vehicle.last_telemetry.wifi_strength,
        "battery": vehicle.last_telemetry.battery,
    }))
}

/// GET /api/logs — retained log entries, oldest first
async fn api_logs(State(state): State<Arc<WebState>>) -> impl IntoResponse {
    Json(state.relay.logs())
}
