//! Command intake: validates client commands and applies them

use std::sync::Arc;

use chrono::{Local, SecondsFormat};
use tokio::sync::{watch, Mutex};
use tracing::debug;

use crate::actuation::Actuator;
use crate::event_log::LogSink;
use crate::protocol::{ClientEvent, ProtocolError, ServerEvent, SystemStatus};
use crate::state::VehicleStateStore;

use super::registry::{ConnectionRegistry, SessionId};

/// Shared slot holding the most recent encoded frame
pub type LatestFrame = watch::Receiver<Option<Arc<str>>>;

/// Applies client commands to the vehicle state and the actuators.
///
/// No command fails back to the client: actuator errors become `error` log
/// entries (and a negative `photo_taken` for photos), malformed input becomes
/// a `warning` entry.
pub struct CommandRouter {
    state: Arc<VehicleStateStore>,
    logs: Arc<LogSink>,
    registry: ConnectionRegistry,
    actuator: Arc<dyn Actuator>,
    latest_frame: LatestFrame,
    /// Held across a whole light toggle so the fixture follows the state
    light: Mutex<()>,
}

impl CommandRouter {
    pub fn new(
        state: Arc<VehicleStateStore>,
        logs: Arc<LogSink>,
        registry: ConnectionRegistry,
        actuator: Arc<dyn Actuator>,
        latest_frame: LatestFrame,
    ) -> Self {
        Self {
            state,
            logs,
            registry,
            actuator,
            latest_frame,
            light: Mutex::new(()),
        }
    }

    /// Decode one text message from `session` and apply it
    pub async fn handle_text(&self, session: SessionId, text: &str) {
        match ClientEvent::decode(text) {
            Ok(command) => self.dispatch(session, command).await,
            Err(e) => self.reject(session, &e),
        }
    }

    /// Log a message that failed validation; state is left untouched
    pub fn reject(&self, session: SessionId, error: &ProtocolError) {
        self.logs
            .warning(format!("Rejected command from session {session}: {error}"));
    }

    /// Apply a validated command
    pub async fn dispatch(&self, session: SessionId, command: ClientEvent) {
        debug!(session, command = command.name(), "Dispatching command");

        match command {
            ClientEvent::JoystickMove(vector) => {
                let vector = vector.clamped();
                if let Err(e) = self.actuator.set_joystick(vector.x, vector.y).await {
                    self.logs.error(format!("Joystick actuation failed: {e:#}"));
                }
            }
            ClientEvent::DepthChange { value } => {
                let depth = self.state.set_depth(value, |s| {
                    self.registry
                        .broadcast(ServerEvent::SystemStatus(SystemStatus::full(s)));
                });
                if i64::from(depth) == value {
                    self.logs.info(format!("Depth changed to: {depth}"));
                } else {
                    self.logs
                        .info(format!("Depth changed to: {depth} (requested {value})"));
                }
            }
            ClientEvent::LightToggle => {
                let _toggle = self.light.lock().await;
                let on = self.state.update(|s| {
                    s.light_on = !s.light_on;
                    self.registry
                        .broadcast(ServerEvent::LightStatus { status: s.light_on });
                    s.light_on
                });
                self.logs
                    .info(format!("Light {}", if on { "ON" } else { "OFF" }));
                if let Err(e) = self.actuator.set_light(on).await {
                    self.logs.error(format!("Light actuation failed: {e:#}"));
                }
            }
            ClientEvent::TakePhoto => {
                let status = match self.actuator.capture_photo().await {
                    Ok(()) => {
                        self.logs.info("Photo captured");
                        true
                    }
                    Err(e) => {
                        self.logs.error(format!("Photo capture failed: {e:#}"));
                        false
                    }
                };
                self.registry.send_to(
                    session,
                    ServerEvent::PhotoTaken {
                        status,
                        timestamp: Local::now().to_rfc3339_opts(SecondsFormat::Millis, false),
                    },
                );
            }
            ClientEvent::GetFrame => {
                let frame = self.latest_frame.borrow().clone();
                match frame {
                    Some(frame) => {
                        self.registry
                            .send_to(session, ServerEvent::VideoFrame { frame });
                    }
                    None => debug!(session, "No frame captured yet"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_log::LogLevel;
    use crate::protocol::JoystickVector;
    use crate::server::Session;
    use crate::state::{DepthBounds, TelemetrySample, VehicleState};
    use anyhow::{bail, Result};
    use async_trait::async_trait;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingActuator {
        fail: bool,
        /// Switching the light on takes this long
        light_on_delay: Option<std::time::Duration>,
        joystick: Mutex<Vec<(f64, f64)>>,
        light: Mutex<Vec<bool>>,
        photos: Mutex<u32>,
    }

    #[async_trait]
    impl Actuator for RecordingActuator {
        async fn set_joystick(&self, x: f64, y: f64) -> Result<()> {
            self.joystick.lock().push((x, y));
            if self.fail {
                bail!("motor controller offline");
            }
            Ok(())
        }

        async fn set_light(&self, on: bool) -> Result<()> {
            if let (true, Some(delay)) = (on, self.light_on_delay) {
                tokio::time::sleep(delay).await;
            }
            self.light.lock().push(on);
            if self.fail {
                bail!("relay stuck");
            }
            Ok(())
        }

        async fn capture_photo(&self) -> Result<()> {
            *self.photos.lock() += 1;
            if self.fail {
                bail!("no storage");
            }
            Ok(())
        }
    }

    struct Fixture {
        router: CommandRouter,
        state: Arc<VehicleStateStore>,
        logs: Arc<LogSink>,
        registry: ConnectionRegistry,
        actuator: Arc<RecordingActuator>,
        frame_tx: watch::Sender<Option<Arc<str>>>,
    }

    fn fixture(fail: bool) -> Fixture {
        fixture_with(RecordingActuator {
            fail,
            ..Default::default()
        })
    }

    fn fixture_with(actuator: RecordingActuator) -> Fixture {
        let registry = ConnectionRegistry::new(64, 8);
        let logs = Arc::new(LogSink::new(100, registry.clone()));
        let state = Arc::new(VehicleStateStore::new(
            DepthBounds::new(0, 50).unwrap(),
            VehicleState {
                depth: 0,
                light_on: false,
                last_telemetry: TelemetrySample::new(85, 67),
            },
        ));
        let actuator = Arc::new(actuator);
        let (frame_tx, frame_rx) = watch::channel(None);
        let router = CommandRouter::new(
            Arc::clone(&state),
            Arc::clone(&logs),
            registry.clone(),
            actuator.clone(),
            frame_rx,
        );
        Fixture {
            router,
            state,
            logs,
            registry,
            actuator,
            frame_tx,
        }
    }

    fn drain(session: &mut Session) -> Vec<ServerEvent> {
        std::iter::from_fn(|| session.try_recv())
            .map(|e| (*e).clone())
            .collect()
    }

    fn errors(logs: &LogSink) -> usize {
        logs.history()
            .iter()
            .filter(|e| e.level == LogLevel::Error)
            .count()
    }

    #[tokio::test]
    async fn depth_change_clamps_and_echoes_state() {
        let f = fixture(false);
        let mut session = f.registry.register(Vec::new());

        for (requested, expected) in [(25, 25), (500, 50), (-4, 0)] {
            f.router
                .dispatch(session.id(), ClientEvent::DepthChange { value: requested })
                .await;
            assert_eq!(f.state.snapshot().depth, expected);

            let events = drain(&mut session);
            assert_eq!(
                events[0],
                ServerEvent::SystemStatus(SystemStatus {
                    wifi_strength: 85,
                    battery: 67,
                    depth: Some(expected),
                })
            );
            assert!(matches!(&events[1], ServerEvent::NewLog(e) if e.level == LogLevel::Info));
        }
    }

    #[tokio::test]
    async fn light_toggle_is_self_inverse() {
        let f = fixture(false);
        let mut session = f.registry.register(Vec::new());

        f.router.dispatch(session.id(), ClientEvent::LightToggle).await;
        f.router.dispatch(session.id(), ClientEvent::LightToggle).await;

        assert!(!f.state.snapshot().light_on);
        let statuses: Vec<bool> = drain(&mut session)
            .into_iter()
            .filter_map(|e| match e {
                ServerEvent::LightStatus { status } => Some(status),
                _ => None,
            })
            .collect();
        assert_eq!(statuses, vec![true, false]);
        assert_eq!(*f.actuator.light.lock(), vec![true, false]);
        let messages: Vec<String> = f.logs.history().into_iter().map(|e| e.message).collect();
        assert_eq!(messages, ["Light ON", "Light OFF"]);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_light_toggles_reach_actuator_in_state_order() {
        let f = fixture_with(RecordingActuator {
            light_on_delay: Some(std::time::Duration::from_millis(200)),
            ..Default::default()
        });
        let mut a = f.registry.register(Vec::new());
        let b = f.registry.register(Vec::new());

        let first = f.router.dispatch(a.id(), ClientEvent::LightToggle);
        let second = async {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            f.router.dispatch(b.id(), ClientEvent::LightToggle).await;
        };
        tokio::join!(first, second);

        assert!(!f.state.snapshot().light_on);
        assert_eq!(*f.actuator.light.lock(), vec![true, false]);
        let statuses: Vec<bool> = drain(&mut a)
            .into_iter()
            .filter_map(|e| match e {
                ServerEvent::LightStatus { status } => Some(status),
                _ => None,
            })
            .collect();
        assert_eq!(statuses, vec![true, false]);
        let messages: Vec<String> = f.logs.history().into_iter().map(|e| e.message).collect();
        assert_eq!(messages, ["Light ON", "Light OFF"]);
    }

    #[tokio::test]
    async fn depth_beyond_integer_range_clamps_to_max() {
        let f = fixture(false);
        let session = f.registry.register(Vec::new());
        f.router
            .handle_text(
                session.id(),
                r#"{"event":"depth_change","data":{"value":100000000000000000000}}"#,
            )
            .await;
        assert_eq!(f.state.snapshot().depth, 50);
        assert_eq!(f.logs.history()[0].level, LogLevel::Info);
    }

    #[tokio::test]
    async fn light_actuator_failure_is_logged_but_state_flips() {
        let f = fixture(true);
        let session = f.registry.register(Vec::new());
        f.router.dispatch(session.id(), ClientEvent::LightToggle).await;
        assert!(f.state.snapshot().light_on);
        assert_eq!(errors(&f.logs), 1);
    }

    #[tokio::test]
    async fn photo_success_acks_requester_only() {
        let f = fixture(false);
        let mut requester = f.registry.register(Vec::new());
        let mut other = f.registry.register(Vec::new());

        f.router.dispatch(requester.id(), ClientEvent::TakePhoto).await;

        let acks: Vec<bool> = drain(&mut requester)
            .into_iter()
            .filter_map(|e| match e {
                ServerEvent::PhotoTaken { status, .. } => Some(status),
                _ => None,
            })
            .collect();
        assert_eq!(acks, vec![true]);
        assert!(drain(&mut other)
            .iter()
            .all(|e| !matches!(e, ServerEvent::PhotoTaken { .. })));
        assert_eq!(errors(&f.logs), 0);
    }

    #[tokio::test]
    async fn photo_failure_acks_false_with_one_error() {
        let f = fixture(true);
        let mut requester = f.registry.register(Vec::new());

        f.router.dispatch(requester.id(), ClientEvent::TakePhoto).await;

        let events = drain(&mut requester);
        assert!(events
            .iter()
            .any(|e| matches!(e, ServerEvent::PhotoTaken { status: false, .. })));
        assert_eq!(errors(&f.logs), 1);
        assert!(f.logs.history()[0].message.contains("no storage"));
    }

    #[tokio::test]
    async fn joystick_is_clamped_and_not_logged_on_success() {
        let f = fixture(false);
        let session = f.registry.register(Vec::new());

        f.router
            .dispatch(
                session.id(),
                ClientEvent::JoystickMove(JoystickVector { x: 2.0, y: -0.5 }),
            )
            .await;

        assert_eq!(*f.actuator.joystick.lock(), vec![(1.0, -0.5)]);
        assert!(f.logs.is_empty());
        assert_eq!(f.state.snapshot().depth, 0);
    }

    #[tokio::test]
    async fn joystick_actuator_failure_logs_error() {
        let f = fixture(true);
        let session = f.registry.register(Vec::new());
        f.router
            .dispatch(
                session.id(),
                ClientEvent::JoystickMove(JoystickVector { x: 0.1, y: 0.1 }),
            )
            .await;
        assert_eq!(errors(&f.logs), 1);
    }

    #[tokio::test]
    async fn invalid_payload_logs_warning_and_keeps_state() {
        let f = fixture(false);
        let session = f.registry.register(Vec::new());
        let before = f.state.snapshot();

        f.router
            .handle_text(session.id(), r#"{"event":"depth_change","data":{"value":"ten"}}"#)
            .await;
        f.router.handle_text(session.id(), "{{{").await;

        assert_eq!(f.state.snapshot(), before);
        let history = f.logs.history();
        assert_eq!(history.len(), 2);
        assert!(history.iter().all(|e| e.level == LogLevel::Warning));
    }

    #[tokio::test]
    async fn get_frame_unicasts_latest_frame() {
        let f = fixture(false);
        let mut session = f.registry.register(Vec::new());

        f.router.dispatch(session.id(), ClientEvent::GetFrame).await;
        assert!(drain(&mut session).is_empty());

        let frame: Arc<str> = Arc::from("data:image/jpeg;base64,AAAA");
        f.frame_tx.send_replace(Some(Arc::clone(&frame)));
        f.router.dispatch(session.id(), ClientEvent::GetFrame).await;
        assert_eq!(drain(&mut session), vec![ServerEvent::VideoFrame { frame }]);
    }
}
