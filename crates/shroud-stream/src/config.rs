//! Producer configuration.

use std::time::Duration;

use anyhow::{anyhow, Result};
use shroud_media::Resolution;
use url::Url;

use crate::capture::CaptureConfig;

pub const DEFAULT_SERVER_URL: &str = "ws://127.0.0.1:5000/video";
pub const DEFAULT_STREAM_NAME: &str = "Big Buck Bunny";
pub const DEFAULT_FPS: u32 = 30;
pub const MAX_FPS: u32 = 240;
pub const DEFAULT_QUEUE_CAPACITY: usize = 50;
pub const DEFAULT_OUTBOX_CAPACITY: usize = 64;
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
pub const FULL_QUEUE_BACKOFF: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub server_url: Url,
    pub stream_id: String,
    /// `pattern` or a path to a raw frame file.
    pub source: String,
    pub source_resolution: Resolution,
    pub frame_limit: Option<u64>,
    pub capture: CaptureConfig,
    pub outbox_capacity: usize,
    pub handshake_timeout: Duration,
    /// How long to stay connected after the source ends. `None` waits for
    /// the relay to close the connection or for Ctrl-C.
    pub linger: Option<Duration>,
}

impl StreamConfig {
    pub fn new(server_url: Url, stream_id: impl Into<String>) -> Self {
        Self {
            server_url,
            stream_id: stream_id.into(),
            source: shroud_media::source::PATTERN_SOURCE.to_string(),
            source_resolution: shroud_media::TRANSMIT_RESOLUTION,
            frame_limit: None,
            capture: CaptureConfig::default(),
            outbox_capacity: DEFAULT_OUTBOX_CAPACITY,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            linger: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self.server_url.scheme() {
            "ws" | "wss" => {}
            other => return Err(anyhow!("server url must use ws:// or wss://, got {}://", other)),
        }
        if self.stream_id.is_empty()
            || self.stream_id.len() > shroud_common::MAX_STREAM_ID_LEN
        {
            return Err(anyhow!(
                "stream name must be 1 to {} bytes",
                shroud_common::MAX_STREAM_ID_LEN
            ));
        }
        if self.source_resolution.is_empty() {
            return Err(anyhow!("source resolution must be non-zero"));
        }
        if self.outbox_capacity == 0 {
            return Err(anyhow!("outbox capacity must be at least 1"));
        }
        if self.handshake_timeout.is_zero() {
            return Err(anyhow!("handshake timeout must be at least 1s"));
        }
        self.capture.validate()
    }
}
