//! Periodic frame and telemetry broadcasts

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::capture::{FrameSource, TelemetrySource};
use crate::event_log::LogSink;
use crate::protocol::{ServerEvent, SystemStatus};
use crate::state::VehicleStateStore;

use super::registry::ConnectionRegistry;

/// Turns repeated source failures into one log entry per streak
#[derive(Debug)]
pub struct FaultTracker {
    what: &'static str,
    failures: u64,
}

impl FaultTracker {
    pub fn new(what: &'static str) -> Self {
        Self { what, failures: 0 }
    }

    /// Ticks failed in the current streak
    pub fn failures(&self) -> u64 {
        self.failures
    }

    pub fn failure(&mut self, logs: &LogSink, error: &anyhow::Error) {
        self.failures += 1;
        if self.failures == 1 {
            logs.error(format!("{} failed: {:#}", self.what, error));
        } else {
            warn!("{} failed ({} in a row): {:#}", self.what, self.failures, error);
        }
    }

    pub fn success(&mut self, logs: &LogSink) {
        if self.failures > 0 {
            logs.info(format!(
                "{} recovered after {} failed attempts",
                self.what, self.failures
            ));
            self.failures = 0;
        }
    }
}

/// Drives the frame and telemetry cycles.
///
/// Both cycles only `try_send` into session queues, so a slow client never
/// delays a tick for anyone else.
#[derive(Clone)]
pub struct BroadcastScheduler {
    state: Arc<VehicleStateStore>,
    logs: Arc<LogSink>,
    registry: ConnectionRegistry,
    latest_frame: Arc<watch::Sender<Option<Arc<str>>>>,
    frame_period: Duration,
    telemetry_period: Duration,
}

impl BroadcastScheduler {
    pub fn new(
        state: Arc<VehicleStateStore>,
        logs: Arc<LogSink>,
        registry: ConnectionRegistry,
        latest_frame: Arc<watch::Sender<Option<Arc<str>>>>,
        frame_period: Duration,
        telemetry_period: Duration,
    ) -> Self {
        Self {
            state,
            logs,
            registry,
            latest_frame,
            frame_period,
            telemetry_period,
        }
    }

    /// Start both cycles on `tracker`; they stop when `cancel` fires
    pub fn spawn(
        self,
        frames: FrameSource,
        telemetry: TelemetrySource,
        cancel: CancellationToken,
        tracker: &TaskTracker,
    ) {
        info!(
            "Broadcast scheduler: frames every {:?} from {}, telemetry every {:?}",
            self.frame_period,
            frames.describe(),
            self.telemetry_period
        );
        tracker.spawn(self.clone().run_frames(frames, cancel.clone()));
        tracker.spawn(self.run_telemetry(telemetry, cancel));
    }

    async fn run_frames(self, mut source: FrameSource, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.frame_period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut faults = FaultTracker::new("Frame capture");
        let mut ticks = 0u64;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    self.frame_tick(&mut source, &mut faults);
                    ticks += 1;
                    if ticks % 900 == 0 {
                        debug!("Frame cycle: {} ticks, {} sessions", ticks, self.registry.len());
                    }
                }
            }
        }

        source.stop();
        debug!("Frame cycle stopped after {} ticks", ticks);
    }

    async fn run_telemetry(self, mut source: TelemetrySource, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.telemetry_period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut faults = FaultTracker::new("Telemetry");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => self.telemetry_tick(&mut source, &mut faults).await,
            }
        }

        debug!("Telemetry cycle stopped");
    }

    /// One frame cycle: capture, publish as latest, broadcast
    pub fn frame_tick(&self, source: &mut FrameSource, faults: &mut FaultTracker) {
        match source.produce() {
            Ok(frame) => {
                faults.success(&self.logs);
                let url: Arc<str> = Arc::from(frame.to_data_url());
                self.latest_frame.send_replace(Some(Arc::clone(&url)));
                self.registry
                    .broadcast(ServerEvent::VideoFrame { frame: url });
            }
            Err(e) => faults.failure(&self.logs, &e),
        }
    }

    /// One telemetry cycle: sample, store, broadcast under the state lock
    pub async fn telemetry_tick(&self, source: &mut TelemetrySource, faults: &mut FaultTracker) {
        match source.produce().await {
            Ok(sample) => {
                faults.success(&self.logs);
                self.state.update(|s| {
                    s.last_telemetry = sample;
                    self.registry
                        .broadcast(ServerEvent::SystemStatus(SystemStatus::telemetry(sample)));
                });
            }
            Err(e) => faults.failure(&self.logs, &e),
        }
    }
}
