//! Tether Server — headless vehicle relay with WebSocket control
//!
//! Streams camera frames and telemetry to operator clients over WebSocket,
//! accepts joystick / depth / light / photo commands, and keeps a shared
//! operator log.
//!
//! ## Usage
//!
//! ```bash
//! # Start server with synthetic video (port 5000)
//! tether-server
//!
//! # Pi camera, custom port
//! TETHER_VIDEO_SOURCE=camera TETHER_BIND=0.0.0.0:8080 tether-server
//!
//! # Relay a network stream and serve a UI build
//! TETHER_VIDEO_SOURCE=url TETHER_STREAM_URL=rtsp://10.0.0.2/live \
//!     TETHER_UI_PATH=./ui/build tether-server
//! ```

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::time::{interval, Duration};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use tether::capture::{FrameSource, TelemetrySource};
use tether::{LoggingActuator, Relay, RelayConfig};

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let config = RelayConfig::from_env()?;

    info!("Tether Server starting");
    info!("  Bind: {}", config.bind);
    info!("  Stream: {} fps", config.stream_fps);
    info!("  Telemetry every {:?}", config.telemetry_interval);
    info!(
        "  Depth: {}..={} (initial {})",
        config.depth_bounds.min(),
        config.depth_bounds.max(),
        config.initial_depth
    );
    if let Some(ref ui_path) = config.ui_path {
        info!("  UI path: {:?}", ui_path);
    }

    let relay = Relay::new(&config, Arc::new(LoggingActuator));
    let frames = FrameSource::new(&config.video);
    let telemetry = TelemetrySource::new(config.telemetry.clone());

    relay.log_sink().info("Starting server...");
    relay.log_sink().info(format!(
        "Configuration loaded: Video={}, Port={}",
        frames.describe(),
        config.bind.port()
    ));

    // Graceful shutdown
    let cancel = CancellationToken::new();
    let tracker = TaskTracker::new();

    relay.spawn_scheduler(frames, telemetry, cancel.clone(), &tracker);
    relay.log_sink().info("System monitor started");

    // Bind up front so a taken port is fatal
    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("Failed to bind to {}", config.bind))?;
    relay
        .log_sink()
        .info(format!("Server started at http://{}", config.bind));

    let app = tether::web::app(
        relay.clone(),
        config.ui_path.as_deref(),
        config.send_timeout,
        cancel.clone(),
    );
    let web_cancel = cancel.clone();
    tracker.spawn(async move {
        if let Err(e) = tether::web::serve(listener, app, web_cancel).await {
            error!("Web server error: {:#}", e);
        }
        info!("Web server: shut down");
    });

    tracker.close();

    run_headless(relay, cancel, tracker).await
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tether=info".parse().unwrap()),
        )
        .init();
}

/// Headless mode: log stats periodically, shut down on SIGINT
async fn run_headless(relay: Relay, cancel: CancellationToken, tracker: TaskTracker) -> Result<()> {
    info!("Waiting for connections...");
    let mut stats_interval = interval(Duration::from_secs(30));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal");
                break;
            }
            _ = stats_interval.tick() => {
                let stats = relay.stats();
                let state = relay.state();
                info!(
                    "Stats: {} sessions ({} opened, {} evicted), {} sent, {} dropped, depth {}, light {}",
                    stats.sessions_connected, stats.sessions_opened, stats.sessions_evicted,
                    stats.events_sent, stats.events_dropped,
                    state.depth, if state.light_on { "on" } else { "off" }
                );
            }
        }
    }

    // Sessions end first so clients get the closing entry
    relay.shutdown();
    cancel.cancel();
    if tokio::time::timeout(Duration::from_secs(5), tracker.wait()).await.is_err() {
        warn!("Shutdown timed out after 5s");
    }
    Ok(())
}
