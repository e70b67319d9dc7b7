//! MJPEG child-process capture
//!
//! Both the camera and the network stream backends run an external encoder
//! that writes concatenated JPEG images to stdout. A blocking reader splits
//! the byte stream on SOI/EOI markers and keeps only the newest frame.

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::frame::{Frame, JPEG_EOI, JPEG_SOI};

/// Frames older than this are treated as a stalled capture
pub const STALE_AFTER: Duration = Duration::from_secs(2);

/// Minimum delay between two spawns of the capture process
pub const RESPAWN_BACKOFF: Duration = Duration::from_secs(5);

/// Partial data beyond this is discarded (no real frame is this large)
const MAX_PENDING_BYTES: usize = 8 * 1024 * 1024;

/// Splits a concatenated JPEG byte stream into whole images
#[derive(Debug, Default)]
pub struct JpegSplitter {
    buf: Vec<u8>,
}

impl JpegSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return every image it completes, oldest first
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();

        loop {
            let Some(start) = find(&self.buf, &JPEG_SOI) else {
                // Keep a trailing 0xFF, it may be the first half of the next SOI
                let keep_marker = self.buf.last() == Some(&0xFF);
                self.buf.clear();
                if keep_marker {
                    self.buf.push(0xFF);
                }
                break;
            };
            let Some(end) = find(&self.buf[start + 2..], &JPEG_EOI).map(|i| start + 2 + i + 2) else {
                self.buf.drain(..start);
                break;
            };
            frames.push(Bytes::copy_from_slice(&self.buf[start..end]));
            self.buf.drain(..end);
        }

        if self.buf.len() > MAX_PENDING_BYTES {
            warn!("Discarding {} bytes of unterminated JPEG data", self.buf.len());
            self.buf.clear();
        }
        frames
    }

    /// Bytes held while waiting for the end of an image
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

fn find(haystack: &[u8], needle: &[u8; 2]) -> Option<usize> {
    haystack.windows(2).position(|w| w == needle)
}

type LatestJpeg = Option<(Instant, Bytes)>;

/// A running encoder process and the newest frame it produced
struct MjpegProcess {
    child: Child,
    latest: watch::Receiver<LatestJpeg>,
}

impl MjpegProcess {
    fn spawn(program: &str, args: &[String]) -> Result<Self> {
        debug!("{} args: {:?}", program, args);

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("Failed to spawn {program}. Is it installed?"))?;

        let stdout = child
            .stdout
            .take()
            .with_context(|| format!("Failed to capture stdout from {program}"))?;

        let (tx, latest) = watch::channel(None);
        let name = program.to_string();
        tokio::task::spawn_blocking(move || read_mjpeg_stream(stdout, tx, &name));

        Ok(Self { child, latest })
    }

    fn stop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

impl Drop for MjpegProcess {
    fn drop(&mut self) {
        self.stop();
    }
}

fn read_mjpeg_stream<R: Read>(mut reader: R, tx: watch::Sender<LatestJpeg>, name: &str) {
    let mut splitter = JpegSplitter::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut frame_count = 0u64;

    loop {
        match reader.read(&mut buf) {
            Ok(0) => {
                info!("{} stream ended (EOF)", name);
                break;
            }
            Ok(n) => {
                if let Some(frame) = splitter.push(&buf[..n]).pop() {
                    frame_count += 1;
                    if frame_count % 300 == 0 {
                        debug!("{}: {} frames read", name, frame_count);
                    }
                    if tx.send(Some((Instant::now(), frame))).is_err() {
                        debug!("{} frame receiver dropped, stopping reader", name);
                        break;
                    }
                }
            }
            Err(e) => {
                error!("Error reading {} stream: {}", name, e);
                break;
            }
        }
    }

    info!("{} reader finished after {} frames", name, frame_count);
}

/// Frame source backed by an MJPEG-emitting child process.
///
/// The process is started lazily on the first [`MjpegSource::produce`] and
/// restarted, no more often than [`RESPAWN_BACKOFF`], after it exits.
pub struct MjpegSource {
    program: String,
    args: Vec<String>,
    process: Option<MjpegProcess>,
    last_spawn: Option<Instant>,
}

impl MjpegSource {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            process: None,
            last_spawn: None,
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn is_running(&self) -> bool {
        self.process.is_some()
    }

    /// Latest captured frame
    pub fn produce(&mut self) -> Result<Frame> {
        self.ensure_running()?;
        let Some(process) = self.process.as_ref() else {
            bail!("{} is not running", self.program);
        };

        let latest = process.latest.borrow().clone();
        match latest {
            None => bail!("No frame captured yet from {}", self.program),
            Some((at, _)) if at.elapsed() > STALE_AFTER => {
                bail!(
                    "Latest frame from {} is stale ({:.1}s old)",
                    self.program,
                    at.elapsed().as_secs_f32()
                )
            }
            Some((_, jpeg)) => Ok(Frame::jpeg(jpeg)),
        }
    }

    fn ensure_running(&mut self) -> Result<()> {
        if let Some(process) = self.process.as_mut() {
            match process.child.try_wait() {
                Ok(None) => return Ok(()),
                Ok(Some(status)) => {
                    self.process = None;
                    bail!("{} exited with {}", self.program, status);
                }
                Err(e) => {
                    self.process = None;
                    return Err(e).with_context(|| format!("Failed to poll {}", self.program));
                }
            }
        }

        if let Some(at) = self.last_spawn {
            let waited = at.elapsed();
            if waited < RESPAWN_BACKOFF {
                bail!(
                    "{} is not running, restart in {:.1}s",
                    self.program,
                    (RESPAWN_BACKOFF - waited).as_secs_f32()
                );
            }
        }

        self.last_spawn = Some(Instant::now());
        info!("Starting {}", self.program);
        self.process = Some(MjpegProcess::spawn(&self.program, &self.args)?);
        Ok(())
    }

    /// Kill the capture process, if any
    pub fn stop(&mut self) {
        if self.process.take().is_some() {
            info!("Stopped {}", self.program);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jpeg(body: &[u8]) -> Vec<u8> {
        let mut v = JPEG_SOI.to_vec();
        v.extend_from_slice(body);
        v.extend_from_slice(&JPEG_EOI);
        v
    }

    #[test]
    fn splits_concatenated_images() {
        let mut stream = jpeg(b"one");
        stream.extend(jpeg(b"two"));
        let mut splitter = JpegSplitter::new();
        let frames = splitter.push(&stream);
        assert_eq!(frames, vec![Bytes::from(jpeg(b"one")), Bytes::from(jpeg(b"two"))]);
        assert_eq!(splitter.pending(), 0);
    }

    #[test]
    fn reassembles_images_across_chunks() {
        let image = jpeg(b"split across reads");
        let mut splitter = JpegSplitter::new();

        // Cut through the SOI and through the EOI
        assert!(splitter.push(&image[..1]).is_empty());
        assert!(splitter.push(&image[1..image.len() - 1]).is_empty());
        let frames = splitter.push(&image[image.len() - 1..]);
        assert_eq!(frames, vec![Bytes::from(image)]);
    }

    #[test]
    fn skips_garbage_between_images() {
        let mut stream = b"noise".to_vec();
        stream.extend(jpeg(b"a"));
        stream.extend_from_slice(b"\x00\x01junk");
        stream.extend(jpeg(b"b"));
        let frames = JpegSplitter::new().push(&stream);
        assert_eq!(frames.len(), 2);
        assert!(frames.iter().all(|f| Frame::jpeg(f.clone()).is_well_formed()));
    }

    #[tokio::test]
    async fn missing_program_fails_then_backs_off() {
        let mut source = MjpegSource::new("tether-no-such-encoder", Vec::new());
        let first = source.produce().unwrap_err().to_string();
        assert!(first.contains("Failed to spawn"), "{first}");
        let second = source.produce().unwrap_err().to_string();
        assert!(second.contains("restart in"), "{second}");
        assert!(!source.is_running());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn reads_frames_from_child_stdout() {
        let script = r"printf '\377\330frame\377\331'; sleep 5";
        let mut source = MjpegSource::new("sh", vec!["-c".into(), script.into()]);

        let deadline = Instant::now() + Duration::from_secs(3);
        let frame = loop {
            match source.produce() {
                Ok(frame) => break frame,
                Err(e) if Instant::now() > deadline => panic!("no frame: {e:#}"),
                Err(_) => tokio::time::sleep(Duration::from_millis(20)).await,
            }
        };
        assert!(frame.is_well_formed());
        assert_eq!(&frame.payload[2..7], b"frame");
        source.stop();
        assert!(!source.is_running());
    }
}
