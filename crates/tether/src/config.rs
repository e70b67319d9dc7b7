//! Relay configuration from `TETHER_*` environment variables

use std::fmt::Display;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::capture::{TelemetryConfig, VideoSourceConfig, VideoSourceKind};
use crate::event_log::DEFAULT_LOG_CAPACITY;
use crate::state::DepthBounds;

/// Shortest telemetry period accepted
const MIN_TELEMETRY_INTERVAL: Duration = Duration::from_millis(1);

/// Everything the relay and its transport need at startup
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// HTTP/WebSocket listen address
    pub bind: SocketAddr,
    /// Static UI directory served as fallback
    pub ui_path: Option<PathBuf>,
    /// Broadcast rate of the frame cycle
    pub stream_fps: u32,
    pub telemetry_interval: Duration,
    pub depth_bounds: DepthBounds,
    pub initial_depth: i32,
    pub initial_light: bool,
    pub max_logs: usize,
    /// Per-session outbound queue depth
    pub session_buffer: usize,
    /// Limit for a single socket write
    pub send_timeout: Duration,
    /// Full-queue drops in a row before a session is evicted
    pub max_consecutive_drops: u32,
    pub video: VideoSourceConfig,
    pub telemetry: TelemetryConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 5000)),
            ui_path: None,
            stream_fps: 15,
            telemetry_interval: Duration::from_secs(5),
            depth_bounds: DepthBounds::default(),
            initial_depth: 0,
            initial_light: false,
            max_logs: DEFAULT_LOG_CAPACITY,
            session_buffer: 64,
            send_timeout: Duration::from_millis(2000),
            max_consecutive_drops: 30,
            video: VideoSourceConfig::default(),
            telemetry: TelemetryConfig::default(),
        }
    }
}

impl RelayConfig {
    /// Read the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset keys keep their defaults
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let depth_min = parse(&get, "TETHER_DEPTH_MIN", defaults.depth_bounds.min())?;
        let depth_max = parse(&get, "TETHER_DEPTH_MAX", defaults.depth_bounds.max())?;
        let depth_bounds = DepthBounds::new(depth_min, depth_max)?;

        let (width, height) = match get("TETHER_RESOLUTION") {
            Some(value) => parse_resolution(&value)
                .with_context(|| format!("Invalid TETHER_RESOLUTION '{value}'"))?,
            None => (defaults.video.width, defaults.video.height),
        };

        let telemetry_secs: f64 = parse(
            &get,
            "TETHER_TELEMETRY_INTERVAL_SECS",
            defaults.telemetry_interval.as_secs_f64(),
        )?;
        if telemetry_secs.is_nan() || telemetry_secs <= 0.0 {
            bail!("TETHER_TELEMETRY_INTERVAL_SECS must be positive, got {telemetry_secs}");
        }
        let telemetry_interval = Duration::try_from_secs_f64(telemetry_secs)
            .context("Invalid TETHER_TELEMETRY_INTERVAL_SECS")?;

        let config = Self {
            bind: parse(&get, "TETHER_BIND", defaults.bind)?,
            ui_path: get("TETHER_UI_PATH").map(PathBuf::from),
            stream_fps: parse(&get, "TETHER_STREAM_FPS", defaults.stream_fps)?,
            telemetry_interval,
            depth_bounds,
            initial_depth: parse(&get, "TETHER_DEPTH_INITIAL", defaults.initial_depth)?,
            initial_light: parse_flag(&get, "TETHER_LIGHT_INITIAL", defaults.initial_light)?,
            max_logs: parse(&get, "TETHER_MAX_LOGS", defaults.max_logs)?,
            session_buffer: parse(&get, "TETHER_SESSION_BUFFER", defaults.session_buffer)?,
            send_timeout: Duration::from_millis(parse(
                &get,
                "TETHER_SEND_TIMEOUT_MS",
                defaults.send_timeout.as_millis() as u64,
            )?),
            max_consecutive_drops: parse(
                &get,
                "TETHER_MAX_CONSECUTIVE_DROPS",
                defaults.max_consecutive_drops,
            )?,
            video: VideoSourceConfig {
                kind: parse(&get, "TETHER_VIDEO_SOURCE", defaults.video.kind)?,
                camera_index: parse(&get, "TETHER_CAMERA_INDEX", defaults.video.camera_index)?,
                stream_url: get("TETHER_STREAM_URL"),
                fps: parse(&get, "TETHER_CAMERA_FPS", defaults.video.fps)?,
                quality: parse(&get, "TETHER_JPEG_QUALITY", defaults.video.quality)?,
                width,
                height,
            },
            telemetry: TelemetryConfig {
                simulate: parse_flag(&get, "TETHER_SIMULATE_SENSORS", defaults.telemetry.simulate)?,
                detect_real_wifi: parse_flag(
                    &get,
                    "TETHER_DETECT_REAL_WIFI",
                    defaults.telemetry.detect_real_wifi,
                )?,
                initial_wifi: parse(&get, "TETHER_INITIAL_WIFI", defaults.telemetry.initial_wifi)?,
                initial_battery: parse(
                    &get,
                    "TETHER_INITIAL_BATTERY",
                    defaults.telemetry.initial_battery,
                )?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject combinations the relay can't run with
    pub fn validate(&self) -> Result<()> {
        if !(1..=120).contains(&self.stream_fps) {
            bail!("Stream fps must be 1-120, got {}", self.stream_fps);
        }
        if !(1..=120).contains(&self.video.fps) {
            bail!("Camera fps must be 1-120, got {}", self.video.fps);
        }
        if !(1..=100).contains(&self.video.quality) {
            bail!("JPEG quality must be 1-100, got {}", self.video.quality);
        }
        if self.video.width < 16 || self.video.height < 16 {
            bail!(
                "Resolution {}x{} is too small",
                self.video.width,
                self.video.height
            );
        }
        if self.video.kind == VideoSourceKind::Url && self.video.stream_url.is_none() {
            bail!("TETHER_VIDEO_SOURCE=url requires TETHER_STREAM_URL");
        }
        if self.initial_depth < self.depth_bounds.min() || self.initial_depth > self.depth_bounds.max() {
            bail!(
                "Initial depth {} is outside {}..={}",
                self.initial_depth,
                self.depth_bounds.min(),
                self.depth_bounds.max()
            );
        }
        if self.telemetry.initial_wifi > 100 || self.telemetry.initial_battery > 100 {
            bail!("Initial telemetry values are percentages (0-100)");
        }
        if self.telemetry_interval < MIN_TELEMETRY_INTERVAL {
            bail!(
                "Telemetry interval must be at least {:?}, got {:?}",
                MIN_TELEMETRY_INTERVAL,
                self.telemetry_interval
            );
        }
        if self.max_logs == 0 {
            bail!("TETHER_MAX_LOGS must be at least 1");
        }
        if self.session_buffer == 0 {
            bail!("TETHER_SESSION_BUFFER must be at least 1");
        }
        if self.send_timeout.is_zero() {
            bail!("TETHER_SEND_TIMEOUT_MS must be positive");
        }
        if self.max_consecutive_drops == 0 {
            bail!("TETHER_MAX_CONSECUTIVE_DROPS must be at least 1");
        }
        Ok(())
    }

    /// Period of the frame cycle
    pub fn frame_period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.stream_fps.max(1)))
    }
}

fn parse<T>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match get(key) {
        Some(value) => value
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid {key} '{value}': {e}")),
        None => Ok(default),
    }
}

fn parse_flag(get: &impl Fn(&str) -> Option<String>, key: &str, default: bool) -> Result<bool> {
    match get(key).map(|v| v.to_ascii_lowercase()) {
        None => Ok(default),
        Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => Ok(true),
        Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => Ok(false),
        Some(v) => bail!("Invalid {key} '{v}': expected true or false"),
    }
}

/// `WIDTHxHEIGHT`, e.g. `640x480`
pub fn parse_resolution(value: &str) -> Result<(u32, u32)> {
    let (w, h) = value
        .split_once(['x', 'X'])
        .context("Expected WIDTHxHEIGHT")?;
    Ok((
        w.trim().parse().context("Invalid width")?,
        h.trim().parse().context("Invalid height")?,
    ))
}
