//! Tether - control and telemetry relay for a tethered camera vehicle
//!
//! The relay sits between the vehicle hardware and any number of operator
//! clients. It streams camera frames and telemetry out, accepts joystick,
//! depth, light and photo commands in, and keeps an operator log that every
//! client sees.
//!
//! - **Core types** (always available): Frame, wire protocol, vehicle state, event log, actuation
//! - **`capture`**: camera / network stream / synthetic frames, WiFi and battery telemetry
//! - **`server`**: session registry, command router, broadcast scheduler, [`Relay`]
//! - **`web`** (default feature): axum HTTP server and WebSocket transport

// Core modules (always compiled)
mod actuation;
mod event_log;
mod frame;
mod protocol;
mod state;

pub use actuation::{Actuator, LoggingActuator};
pub use event_log::{LogEntry, LogLevel, LogSink, DEFAULT_LOG_CAPACITY};
pub use frame::{Frame, JPEG_EOI, JPEG_SOI};
pub use protocol::*;
pub use state::{DepthBounds, TelemetrySample, VehicleState, VehicleStateStore};

// Capture: video frames and telemetry
pub mod capture;

// Configuration from TETHER_* variables
pub mod config;

// Server: sessions, commands, periodic broadcasts
pub mod server;

// Web: axum HTTP server, WebSocket bridge
#[cfg(feature = "web")]
pub mod web;

pub use config::RelayConfig;
pub use server::Relay;
