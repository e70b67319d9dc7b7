//! Encoded video frames and their text-safe wire form

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;

/// JPEG start-of-image marker
pub const JPEG_SOI: [u8; 2] = [0xFF, 0xD8];
/// JPEG end-of-image marker
pub const JPEG_EOI: [u8; 2] = [0xFF, 0xD9];

const DATA_URL_PREFIX: &str = "data:image/jpeg;base64,";

/// A single encoded image (always JPEG).
///
/// Frames are transient: produced by a source, encoded once for the wire,
/// and dropped at the end of the broadcast tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub payload: Bytes,
}

impl Frame {
    /// Wrap JPEG bytes
    pub fn jpeg(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
        }
    }

    /// Check the payload is framed by JPEG SOI/EOI markers
    pub fn is_well_formed(&self) -> bool {
        self.payload.len() >= 4
            && self.payload[..2] == JPEG_SOI
            && self.payload[self.payload.len() - 2..] == JPEG_EOI
    }

    /// Encode as a `data:` URL that browsers can assign straight to an `<img>`
    pub fn to_data_url(&self) -> String {
        let mut out =
            String::with_capacity(DATA_URL_PREFIX.len() + self.payload.len().div_ceil(3) * 4);
        out.push_str(DATA_URL_PREFIX);
        STANDARD.encode_string(&self.payload, &mut out);
        out
    }

    /// Decode a `data:` URL produced by [`Frame::to_data_url`]
    pub fn from_data_url(url: &str) -> Option<Self> {
        let encoded = url.strip_prefix(DATA_URL_PREFIX)?;
        STANDARD.decode(encoded).ok().map(Self::jpeg)
    }
}
