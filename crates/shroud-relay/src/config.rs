use std::net::SocketAddr;

use shroud_common::{Error, Result, DEFAULT_NAMESPACE};
use shroud_crypto::NonceWindow;
use shroud_media::{Resolution, BROADCAST_RESOLUTION};

pub const DEFAULT_LISTEN: &str = "127.0.0.1:5000";
pub const DEFAULT_DECODE_WORKERS: usize = 16;
pub const DEFAULT_INGEST_QUEUE: usize = 256;
pub const DEFAULT_OUTBOX_CAPACITY: usize = 128;
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 50 * 1024 * 1024;

/// Runtime settings for one relay process.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen: SocketAddr,
    /// Path the transport is served on.
    pub namespace: String,
    /// Size of the shared decode pool.
    pub decode_workers: usize,
    /// Bound of each stream's ingest queue.
    pub ingest_queue: usize,
    /// Bound of each connection's outbound queue.
    pub outbox_capacity: usize,
    pub max_message_bytes: usize,
    pub output_resolution: Resolution,
    /// Initial state of the decryption toggle.
    pub decryption_enabled: bool,
    /// Recent nonces remembered per stream for replay detection.
    pub replay_window: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 5000)),
            namespace: DEFAULT_NAMESPACE.to_string(),
            decode_workers: DEFAULT_DECODE_WORKERS,
            ingest_queue: DEFAULT_INGEST_QUEUE,
            outbox_capacity: DEFAULT_OUTBOX_CAPACITY,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            output_resolution: BROADCAST_RESOLUTION,
            decryption_enabled: true,
            replay_window: NonceWindow::DEFAULT_CAPACITY,
        }
    }
}

impl RelayConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.namespace.starts_with('/') || self.namespace.len() < 2 {
            return Err(Error::config(format!(
                "namespace must look like /name, got {:?}",
                self.namespace
            )));
        }
        for (name, value) in [
            ("decode-workers", self.decode_workers),
            ("ingest-queue", self.ingest_queue),
            ("outbox-capacity", self.outbox_capacity),
            ("max-message-bytes", self.max_message_bytes),
            ("replay-window", self.replay_window),
        ] {
            if value == 0 {
                return Err(Error::config(format!("--{} must be greater than 0", name)));
            }
        }
        if self.output_resolution.is_empty() {
            return Err(Error::config(format!(
                "invalid output resolution {}",
                self.output_resolution
            )));
        }
        Ok(())
    }
}
