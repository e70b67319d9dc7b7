//! Video frame sources
//!
//! Provides frames from a Pi camera (libcamera-vid), a network stream
//! (ffmpeg), or a synthetic generator for development without hardware.

use anyhow::{bail, Result};
use image::codecs::jpeg::JpegEncoder;
use image::{Rgb, RgbImage};
use std::str::FromStr;
use tracing::{info, warn};

use super::mjpeg::MjpegSource;
use crate::frame::Frame;

/// Which backend feeds the frame cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoSourceKind {
    Camera,
    Url,
    Dummy,
}

impl FromStr for VideoSourceKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "camera" => Ok(Self::Camera),
            "url" | "stream" => Ok(Self::Url),
            "dummy" | "synthetic" => Ok(Self::Dummy),
            other => bail!("Unknown video source '{}' (expected camera, url or dummy)", other),
        }
    }
}

impl std::fmt::Display for VideoSourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Camera => "camera",
            Self::Url => "url",
            Self::Dummy => "dummy",
        })
    }
}

/// Video source configuration
#[derive(Debug, Clone)]
pub struct VideoSourceConfig {
    pub kind: VideoSourceKind,
    /// Camera index passed to libcamera-vid
    pub camera_index: u32,
    /// Source URL for [`VideoSourceKind::Url`]
    pub stream_url: Option<String>,
    /// Capture frame rate
    pub fps: u32,
    /// JPEG quality (1-100)
    pub quality: u8,
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
}

impl Default for VideoSourceConfig {
    fn default() -> Self {
        Self {
            kind: VideoSourceKind::Dummy,
            camera_index: 0,
            stream_url: None,
            fps: 30,
            quality: 70,
            width: 640,
            height: 480,
        }
    }
}

/// Producer of JPEG frames, selected once at startup
pub enum FrameSource {
    Camera(MjpegSource),
    Stream(MjpegSource),
    Synthetic(SyntheticSource),
}

impl FrameSource {
    /// Build the configured source. Processes are started on first use.
    pub fn new(config: &VideoSourceConfig) -> Self {
        match config.kind {
            VideoSourceKind::Camera => Self::Camera(MjpegSource::new("libcamera-vid", camera_args(config))),
            VideoSourceKind::Url => match config.stream_url.as_deref() {
                Some(url) => Self::Stream(MjpegSource::new("ffmpeg", stream_args(config, url))),
                None => {
                    warn!("Video source 'url' has no stream URL, using synthetic frames");
                    Self::Synthetic(SyntheticSource::new(config))
                }
            },
            VideoSourceKind::Dummy => Self::Synthetic(SyntheticSource::new(config)),
        }
    }

    /// Latest frame, or an error if the backend has nothing fresh
    pub fn produce(&mut self) -> Result<Frame> {
        match self {
            Self::Camera(source) | Self::Stream(source) => source.produce(),
            Self::Synthetic(source) => source.produce(),
        }
    }

    /// Short label for logs
    pub fn describe(&self) -> String {
        match self {
            Self::Camera(_) => "camera (libcamera-vid)".to_string(),
            Self::Stream(source) => match source.args().iter().position(|a| a == "-i") {
                Some(i) => format!("stream {}", source.args()[i + 1]),
                None => "stream".to_string(),
            },
            Self::Synthetic(source) => format!("synthetic {}x{}", source.width, source.height),
        }
    }

    pub fn stop(&mut self) {
        match self {
            Self::Camera(source) | Self::Stream(source) => source.stop(),
            Self::Synthetic(_) => {}
        }
    }
}

fn camera_args(config: &VideoSourceConfig) -> Vec<String> {
    let args = vec![
        "-t".to_string(),
        "0".to_string(), // Run indefinitely
        "-n".to_string(), // No preview window
        "--camera".to_string(),
        config.camera_index.to_string(),
        "--width".to_string(),
        config.width.to_string(),
        "--height".to_string(),
        config.height.to_string(),
        "--framerate".to_string(),
        config.fps.to_string(),
        "--codec".to_string(),
        "mjpeg".to_string(),
        "--quality".to_string(),
        config.quality.to_string(),
        "--flush".to_string(),
        "-o".to_string(),
        "-".to_string(), // Output to stdout
    ];
    info!(
        "libcamera-vid: camera {} {}x{} @ {}fps, quality {}",
        config.camera_index, config.width, config.height, config.fps, config.quality
    );
    args
}

fn stream_args(config: &VideoSourceConfig, url: &str) -> Vec<String> {
    // Map JPEG quality (1-100, higher is better) onto ffmpeg's qscale (2-31, lower is better)
    let qscale = 2 + (100 - u32::from(config.quality.clamp(1, 100))) * 29 / 99;
    vec![
        "-loglevel".to_string(),
        "error".to_string(),
        "-i".to_string(),
        url.to_string(),
        "-an".to_string(),
        "-r".to_string(),
        config.fps.to_string(),
        "-s".to_string(),
        format!("{}x{}", config.width, config.height),
        "-f".to_string(),
        "image2pipe".to_string(),
        "-vcodec".to_string(),
        "mjpeg".to_string(),
        "-q:v".to_string(),
        qscale.to_string(),
        "-".to_string(),
    ]
}

/// In-process placeholder frames with a moving marker
pub struct SyntheticSource {
    width: u32,
    height: u32,
    quality: u8,
    frame_num: u64,
}

impl SyntheticSource {
    pub fn new(config: &VideoSourceConfig) -> Self {
        Self {
            width: config.width.max(16),
            height: config.height.max(16),
            quality: config.quality.clamp(1, 100),
            frame_num: 0,
        }
    }

    pub fn produce(&mut self) -> Result<Frame> {
        let (w, h) = (self.width, self.height);
        let mut img = RgbImage::from_fn(w, h, |x, y| {
            Rgb([(x * 60 / w) as u8, 30 + (y * 40 / h) as u8, 70 + (y * 90 / h) as u8])
        });

        // Marker bounces left to right so a viewer can see frames arriving
        let size = (w.min(h) / 8).max(4);
        let span = u64::from(w - size).max(1);
        let pos = self.frame_num * 6 % (2 * span);
        let x0 = (if pos < span { pos } else { 2 * span - pos }) as u32;
        let y0 = (h - size) / 2;
        for y in y0..y0 + size {
            for x in x0..(x0 + size).min(w) {
                img.put_pixel(x, y, Rgb([255, 196, 0]));
            }
        }
        self.frame_num = self.frame_num.wrapping_add(1);

        let mut jpeg = Vec::with_capacity((w * h / 8) as usize);
        img.write_with_encoder(JpegEncoder::new_with_quality(&mut jpeg, self.quality))?;
        Ok(Frame::jpeg(jpeg))
    }

    pub fn frames_generated(&self) -> u64 {
        self.frame_num
    }
}
