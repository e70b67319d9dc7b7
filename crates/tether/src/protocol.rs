//! Wire protocol between operator clients and the relay
//!
//! Every message is a JSON text frame with an event name and a payload:
//!
//! ```text
//! {"event": "depth_change", "data": {"value": 12}}
//! ```
//!
//! `data` may be omitted for events without a payload (`light_toggle`,
//! `take_photo`, `get_frame`). Client events are decoded by hand rather than
//! through a tagged enum so that unknown events and bad payloads produce
//! distinct errors.

use std::sync::Arc;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::event_log::LogEntry;
use crate::state::{TelemetrySample, VehicleState};

pub const JOYSTICK_MOVE: &str = "joystick_move";
pub const DEPTH_CHANGE: &str = "depth_change";
pub const LIGHT_TOGGLE: &str = "light_toggle";
pub const TAKE_PHOTO: &str = "take_photo";
pub const GET_FRAME: &str = "get_frame";

/// Errors raised while decoding a client message
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("unknown event '{0}'")]
    UnknownEvent(String),
    #[error("invalid payload for '{event}': {source}")]
    InvalidPayload {
        event: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("unexpected payload for '{event}': expected an object or nothing")]
    UnexpectedPayload { event: &'static str },
    #[error("binary messages are not supported")]
    Binary,
}

/// Joystick deflection. Each axis is nominally in [-1, 1].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct JoystickVector {
    pub x: f64,
    pub y: f64,
}

impl JoystickVector {
    /// Clamp both axes into [-1, 1]
    pub fn clamped(self) -> Self {
        Self {
            x: self.x.clamp(-1.0, 1.0),
            y: self.y.clamp(-1.0, 1.0),
        }
    }
}

#[derive(Deserialize)]
struct DepthPayload {
    #[serde(deserialize_with = "saturating_integer")]
    value: i64,
}

/// Any JSON integer, saturated to the `i64` range. Fractions are rejected.
fn saturating_integer<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    let number = serde_json::Number::deserialize(deserializer)?;
    if let Some(value) = number.as_i64() {
        return Ok(value);
    }
    if number.as_u64().is_some() {
        return Ok(i64::MAX);
    }
    // Literals past u64 arrive as floats; `as` saturates
    match number.as_f64() {
        Some(value) if value.is_finite() && value.fract() == 0.0 => Ok(value as i64),
        _ => Err(D::Error::custom(format!("expected an integer, got {number}"))),
    }
}

#[derive(Deserialize)]
struct Envelope {
    event: String,
    #[serde(default)]
    data: Value,
}

/// Commands sent by a client
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    JoystickMove(JoystickVector),
    DepthChange { value: i64 },
    LightToggle,
    TakePhoto,
    /// Ask for the most recent frame outside the periodic cycle
    GetFrame,
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::JoystickMove(_) => JOYSTICK_MOVE,
            ClientEvent::DepthChange { .. } => DEPTH_CHANGE,
            ClientEvent::LightToggle => LIGHT_TOGGLE,
            ClientEvent::TakePhoto => TAKE_PHOTO,
            ClientEvent::GetFrame => GET_FRAME,
        }
    }

    /// Decode and validate one text message
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let envelope: Envelope = serde_json::from_str(text).map_err(ProtocolError::Malformed)?;

        match envelope.event.as_str() {
            JOYSTICK_MOVE => payload(JOYSTICK_MOVE, envelope.data).map(ClientEvent::JoystickMove),
            DEPTH_CHANGE => payload::<DepthPayload>(DEPTH_CHANGE, envelope.data)
                .map(|p| ClientEvent::DepthChange { value: p.value }),
            LIGHT_TOGGLE => no_payload(LIGHT_TOGGLE, &envelope.data).map(|_| ClientEvent::LightToggle),
            TAKE_PHOTO => no_payload(TAKE_PHOTO, &envelope.data).map(|_| ClientEvent::TakePhoto),
            GET_FRAME => no_payload(GET_FRAME, &envelope.data).map(|_| ClientEvent::GetFrame),
            _ => Err(ProtocolError::UnknownEvent(envelope.event)),
        }
    }

    /// Encode as a client would send it
    pub fn to_json(&self) -> String {
        let data = match self {
            ClientEvent::JoystickMove(v) => serde_json::json!({ "x": v.x, "y": v.y }),
            ClientEvent::DepthChange { value } => serde_json::json!({ "value": value }),
            _ => serde_json::json!({}),
        };
        serde_json::json!({ "event": self.name(), "data": data }).to_string()
    }
}

fn payload<T: for<'de> Deserialize<'de>>(event: &'static str, data: Value) -> Result<T, ProtocolError> {
    serde_json::from_value(data).map_err(|source| ProtocolError::InvalidPayload { event, source })
}

fn no_payload(event: &'static str, data: &Value) -> Result<(), ProtocolError> {
    match data {
        Value::Null | Value::Object(_) => Ok(()),
        _ => Err(ProtocolError::UnexpectedPayload { event }),
    }
}

/// `system_status` payload. `depth` is only present on replay and depth echoes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemStatus {
    pub wifi_strength: u8,
    pub battery: u8,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub depth: Option<i32>,
}

impl SystemStatus {
    pub fn telemetry(sample: TelemetrySample) -> Self {
        Self {
            wifi_strength: sample.wifi_strength,
            battery: sample.battery,
            depth: None,
        }
    }

    pub fn full(state: &VehicleState) -> Self {
        Self {
            depth: Some(state.depth),
            ..Self::telemetry(state.last_telemetry)
        }
    }
}

/// Events pushed to clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    SystemStatus(SystemStatus),
    LightStatus { status: bool },
    /// `frame` is a `data:image/jpeg;base64,...` URL, shared across sessions
    VideoFrame { frame: Arc<str> },
    NewLog(LogEntry),
    Logs(Vec<LogEntry>),
    PhotoTaken { status: bool, timestamp: String },
}

impl ServerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::SystemStatus(_) => "system_status",
            ServerEvent::LightStatus { .. } => "light_status",
            ServerEvent::VideoFrame { .. } => "video_frame",
            ServerEvent::NewLog(_) => "new_log",
            ServerEvent::Logs(_) => "logs",
            ServerEvent::PhotoTaken { .. } => "photo_taken",
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}
