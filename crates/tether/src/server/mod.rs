//! Relay core: session registry, command handling and periodic broadcasts
//!
//! [`Relay`] owns the vehicle state, the operator log and the session set,
//! and is what transports talk to. It is cheap to clone.

mod registry;
mod router;
mod scheduler;

pub use registry::{ConnectionRegistry, RegistryStats, Session, SessionId};
pub use router::{CommandRouter, LatestFrame};
pub use scheduler::{BroadcastScheduler, FaultTracker};

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;

use crate::actuation::Actuator;
use crate::capture::{FrameSource, TelemetrySource};
use crate::config::RelayConfig;
use crate::event_log::{LogEntry, LogSink};
use crate::protocol::{ProtocolError, ServerEvent, SystemStatus};
use crate::state::{TelemetrySample, VehicleState, VehicleStateStore};

/// Shared handle to the relay
#[derive(Clone)]
pub struct Relay {
    inner: Arc<RelayInner>,
}

struct RelayInner {
    state: Arc<VehicleStateStore>,
    logs: Arc<LogSink>,
    registry: ConnectionRegistry,
    router: CommandRouter,
    latest_frame: Arc<watch::Sender<Option<Arc<str>>>>,
    frame_period: Duration,
    telemetry_period: Duration,
    started_at: Instant,
}

impl Relay {
    pub fn new(config: &RelayConfig, actuator: Arc<dyn Actuator>) -> Self {
        let registry = ConnectionRegistry::new(config.session_buffer, config.max_consecutive_drops);
        let logs = Arc::new(LogSink::new(config.max_logs, registry.clone()));
        let state = Arc::new(VehicleStateStore::new(
            config.depth_bounds,
            VehicleState {
                depth: config.initial_depth,
                light_on: config.initial_light,
                last_telemetry: TelemetrySample::new(
                    config.telemetry.initial_wifi,
                    config.telemetry.initial_battery,
                ),
            },
        ));
        let (frame_tx, frame_rx) = watch::channel(None);
        let router = CommandRouter::new(
            Arc::clone(&state),
            Arc::clone(&logs),
            registry.clone(),
            actuator,
            frame_rx,
        );

        Self {
            inner: Arc::new(RelayInner {
                state,
                logs,
                registry,
                router,
                latest_frame: Arc::new(frame_tx),
                frame_period: config.frame_period(),
                telemetry_period: config.telemetry_interval,
                started_at: Instant::now(),
            }),
        }
    }

    /// Register a new client.
    ///
    /// The session first receives `system_status` (with depth),
    /// `light_status` and the log history, all taken from one consistent
    /// view of the state.
    pub fn open_session(&self) -> Session {
        let session = self.inner.state.with(|s| {
            self.inner.logs.attach(vec![
                ServerEvent::SystemStatus(SystemStatus::full(s)),
                ServerEvent::LightStatus { status: s.light_on },
            ])
        });
        debug!(session = session.id(), "Session opened");
        self.inner.logs.info("Client connected");
        session
    }

    /// Remove a client; safe to call more than once
    pub fn close_session(&self, id: SessionId) {
        if self.inner.registry.unregister(id) {
            self.inner.logs.info("Client disconnected");
        }
    }

    /// Decode and apply one text message from `id`
    pub async fn handle_message(&self, id: SessionId, text: &str) {
        self.inner.router.handle_text(id, text).await;
    }

    /// Record a message rejected by the transport before decoding
    pub fn reject(&self, id: SessionId, error: &ProtocolError) {
        self.inner.router.reject(id, error);
    }

    /// Start the frame and telemetry cycles
    pub fn spawn_scheduler(
        &self,
        frames: FrameSource,
        telemetry: TelemetrySource,
        cancel: CancellationToken,
        tracker: &TaskTracker,
    ) {
        BroadcastScheduler::new(
            Arc::clone(&self.inner.state),
            Arc::clone(&self.inner.logs),
            self.inner.registry.clone(),
            Arc::clone(&self.inner.latest_frame),
            self.inner.frame_period,
            self.inner.telemetry_period,
        )
        .spawn(frames, telemetry, cancel, tracker);
    }

    pub fn state(&self) -> VehicleState {
        self.inner.state.snapshot()
    }

    pub fn logs(&self) -> Vec<LogEntry> {
        self.inner.logs.history()
    }

    pub fn log_sink(&self) -> &LogSink {
        &self.inner.logs
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.inner.registry
    }

    pub fn stats(&self) -> RegistryStats {
        self.inner.registry.stats()
    }

    pub fn uptime(&self) -> Duration {
        self.inner.started_at.elapsed()
    }

    /// Log the shutdown, then drop every session; transports drain what
    /// is queued and see their queues end
    pub fn shutdown(&self) {
        self.inner.logs.info("Closing server...");
        self.inner.registry.close_all();
    }
}
