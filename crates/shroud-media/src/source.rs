//! Frame sources for producers.
//!
//! Camera capture is out of reach for this crate; producers either generate
//! a numbered test pattern or replay raw frames from a file.

use std::fs::File;
use std::io::{BufReader, ErrorKind, Read};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::{FrameSource, MediaError, RawFrame, Resolution, Result};

/// Keyword selecting [`PatternSource`] on the command line.
pub const PATTERN_SOURCE: &str = "pattern";

/// Uniform frames whose byte value is the wrapping sequence number.
///
/// Frame `n` (1-based) is filled with `n as u8`, which lets a subscriber
/// check ordering by looking at any single pixel.
#[derive(Debug, Clone)]
pub struct PatternSource {
    resolution: Resolution,
    seq: u64,
    limit: Option<u64>,
}

impl PatternSource {
    /// `limit` of `None` produces frames forever.
    pub fn new(resolution: Resolution, limit: Option<u64>) -> Self {
        Self {
            resolution,
            seq: 0,
            limit,
        }
    }

    pub fn frames_emitted(&self) -> u64 {
        self.seq
    }
}

impl FrameSource for PatternSource {
    fn next_frame(&mut self) -> Result<Option<RawFrame>> {
        if self.resolution.is_empty() {
            return Err(MediaError::InvalidResolution(
                self.resolution.width,
                self.resolution.height,
            ));
        }
        if self.limit.is_some_and(|limit| self.seq >= limit) {
            return Ok(None);
        }
        self.seq += 1;
        Ok(Some(RawFrame::filled(self.resolution, self.seq as u8)))
    }

    fn resolution(&self) -> Resolution {
        self.resolution
    }
}

/// Consecutive packed frames of a fixed geometry read from a file.
#[derive(Debug)]
pub struct RawFileSource {
    path: PathBuf,
    reader: BufReader<File>,
    resolution: Resolution,
    frames_read: u64,
    limit: Option<u64>,
}

impl RawFileSource {
    pub fn open(path: impl AsRef<Path>, resolution: Resolution) -> Result<Self> {
        if resolution.is_empty() {
            return Err(MediaError::InvalidResolution(
                resolution.width,
                resolution.height,
            ));
        }
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)
            .map_err(|e| MediaError::Source(format!("{}: {}", path.display(), e)))?;
        Ok(Self {
            path,
            reader: BufReader::new(file),
            resolution,
            frames_read: 0,
            limit: None,
        })
    }

    /// Stop after `limit` frames even if the file holds more.
    pub fn with_limit(mut self, limit: Option<u64>) -> Self {
        self.limit = limit;
        self
    }
}

impl FrameSource for RawFileSource {
    fn next_frame(&mut self) -> Result<Option<RawFrame>> {
        if self.limit.is_some_and(|limit| self.frames_read >= limit) {
            return Ok(None);
        }
        let mut data = vec![0u8; self.resolution.frame_len()];
        let mut filled = 0;
        while filled < data.len() {
            match self.reader.read(&mut data[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }

        if filled == 0 {
            debug!(
                "{}: end of source after {} frames",
                self.path.display(),
                self.frames_read
            );
            return Ok(None);
        }
        if filled < data.len() {
            warn!(
                "{}: ignoring trailing partial frame ({} of {} bytes)",
                self.path.display(),
                filled,
                data.len()
            );
            return Ok(None);
        }

        self.frames_read += 1;
        RawFrame::new(self.resolution.width, self.resolution.height, data).map(Some)
    }

    fn resolution(&self) -> Resolution {
        self.resolution
    }
}

/// Open the source named on the command line.
///
/// `"pattern"` selects the generated test pattern; anything else is a path
/// to a raw frame file.
pub fn open_source(
    location: &str,
    resolution: Resolution,
    limit: Option<u64>,
) -> Result<Box<dyn FrameSource>> {
    if location.eq_ignore_ascii_case(PATTERN_SOURCE) {
        Ok(Box::new(PatternSource::new(resolution, limit)))
    } else {
        Ok(Box::new(
            RawFileSource::open(location, resolution)?.with_limit(limit),
        ))
    }
}
