#![forbid(unsafe_code)]

//! Frame handling for Shroud.
//!
//! Video codecs are treated as an opaque capability: anything implementing
//! [`FrameCodec`] can turn a [`RawFrame`] into bytes and back. The built-in
//! [`RawCodec`] wraps uncompressed pixels in a small self-describing header.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod codec;
pub mod noise;
pub mod scale;
pub mod source;

pub use codec::RawCodec;
pub use noise::noise_frame;
pub use scale::resize;
pub use source::{open_source, PatternSource, RawFileSource};

/// Bytes per pixel. Frames are packed 8-bit, three channels.
pub const CHANNELS: usize = 3;

/// Resolution frames are sent at by producers.
pub const TRANSMIT_RESOLUTION: Resolution = Resolution::new(1280, 720);

/// Resolution the relay broadcasts at.
pub const BROADCAST_RESOLUTION: Resolution = Resolution::new(640, 360);

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("invalid resolution {0}x{1}")]
    InvalidResolution(u16, u16),

    #[error("pixel buffer is {actual} bytes, expected {expected}")]
    BufferSize { expected: usize, actual: usize },

    #[error("malformed encoded frame: {0}")]
    Malformed(String),

    #[error("cannot synthesize a frame from empty input")]
    EmptyInput,

    #[error("source error: {0}")]
    Source(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, MediaError>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Resolution {
    pub width: u16,
    pub height: u16,
}

impl Resolution {
    pub const fn new(width: u16, height: u16) -> Self {
        Self { width, height }
    }

    /// Size of one packed frame at this resolution.
    pub const fn frame_len(&self) -> usize {
        self.width as usize * self.height as usize * CHANNELS
    }

    pub const fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Packed, row-major, three-channel frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub width: u16,
    pub height: u16,
    pub data: Vec<u8>,
}

impl RawFrame {
    /// Wrap a pixel buffer, checking its length against the geometry.
    pub fn new(width: u16, height: u16, data: Vec<u8>) -> Result<Self> {
        let frame = Self {
            width,
            height,
            data,
        };
        frame.validate()?;
        Ok(frame)
    }

    /// Frame of one repeated byte value.
    pub fn filled(resolution: Resolution, value: u8) -> Self {
        Self {
            width: resolution.width,
            height: resolution.height,
            data: vec![value; resolution.frame_len()],
        }
    }

    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.width, self.height)
    }

    pub fn validate(&self) -> Result<()> {
        let resolution = self.resolution();
        if resolution.is_empty() {
            return Err(MediaError::InvalidResolution(self.width, self.height));
        }
        if self.data.len() != resolution.frame_len() {
            return Err(MediaError::BufferSize {
                expected: resolution.frame_len(),
                actual: self.data.len(),
            });
        }
        Ok(())
    }

    /// Pixel at (x, y), or `None` outside the frame.
    pub fn pixel(&self, x: u16, y: u16) -> Option<[u8; CHANNELS]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let offset = (y as usize * self.width as usize + x as usize) * CHANNELS;
        let px = self.data.get(offset..offset + CHANNELS)?;
        Some([px[0], px[1], px[2]])
    }
}

/// Opaque image codec used on both sides of the relay.
pub trait FrameCodec: Send + Sync {
    fn encode(&self, frame: &RawFrame) -> Result<Vec<u8>>;
    fn decode(&self, payload: &[u8]) -> Result<RawFrame>;
}

/// Blocking producer of raw frames.
pub trait FrameSource: Send {
    /// Next frame, or `Ok(None)` at end of source.
    fn next_frame(&mut self) -> Result<Option<RawFrame>>;

    /// Native geometry of the frames this source yields.
    fn resolution(&self) -> Resolution;
}
