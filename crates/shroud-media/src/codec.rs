//! Uncompressed frame container.
//!
//! ```text
//! [4 bytes: "SHRF"] [1 byte: version] [2 bytes: width LE] [2 bytes: height LE]
//! [1 byte: channels] [width * height * channels bytes: pixels]
//! ```

use crate::{FrameCodec, MediaError, RawFrame, Result, CHANNELS};

const MAGIC: &[u8; 4] = b"SHRF";
const VERSION: u8 = 1;
const HEADER_LEN: usize = 10;

/// Built-in [`FrameCodec`] carrying raw pixels.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawCodec;

impl FrameCodec for RawCodec {
    fn encode(&self, frame: &RawFrame) -> Result<Vec<u8>> {
        frame.validate()?;
        let mut out = Vec::with_capacity(HEADER_LEN + frame.data.len());
        out.extend_from_slice(MAGIC);
        out.push(VERSION);
        out.extend_from_slice(&frame.width.to_le_bytes());
        out.extend_from_slice(&frame.height.to_le_bytes());
        out.push(CHANNELS as u8);
        out.extend_from_slice(&frame.data);
        Ok(out)
    }

    fn decode(&self, payload: &[u8]) -> Result<RawFrame> {
        if payload.len() < HEADER_LEN {
            return Err(MediaError::Malformed(format!(
                "{} bytes is shorter than the header",
                payload.len()
            )));
        }
        let (header, pixels) = payload.split_at(HEADER_LEN);
        if &header[0..4] != MAGIC {
            return Err(MediaError::Malformed("bad magic".into()));
        }
        if header[4] != VERSION {
            return Err(MediaError::Malformed(format!(
                "unsupported version {}",
                header[4]
            )));
        }
        if header[9] as usize != CHANNELS {
            return Err(MediaError::Malformed(format!(
                "unsupported channel count {}",
                header[9]
            )));
        }
        let width = u16::from_le_bytes([header[5], header[6]]);
        let height = u16::from_le_bytes([header[7], header[8]]);
        RawFrame::new(width, height, pixels.to_vec())
    }
}
