//! Capture module for video frames and telemetry
//!
//! - Video frames from libcamera-vid, ffmpeg, or a synthetic generator
//! - MJPEG stream splitting for the child-process backends
//! - WiFi and battery telemetry, measured or simulated

pub mod mjpeg;
pub mod telemetry;
pub mod video;

pub use mjpeg::{JpegSplitter, MjpegSource};
pub use telemetry::{parse_iwconfig_signal, parse_proc_wireless, TelemetryConfig, TelemetrySource, WifiProbe};
pub use video::{FrameSource, SyntheticSource, VideoSourceConfig, VideoSourceKind};
