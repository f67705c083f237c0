//! Capture, encrypt and pace frames for one stream.
//!
//! Two stages share a bounded queue. The capture stage runs on its own OS
//! thread because frame sources block; it reads one frame, scales it to the
//! transmit resolution and sleeps out the rest of the frame interval. When
//! the queue is full it backs off instead of reading ahead. The send stage
//! encodes and seals each frame on the blocking pool and hands the result
//! to the connection's outbox in capture order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use bytes::Bytes;
use shroud_common::{FrameEnvelope, RelayMessage};
use shroud_crypto::{CryptoError, FrameCipher, SealedFrame};
use shroud_media::{resize, FrameCodec, FrameSource, MediaError, RawCodec, RawFrame, Resolution};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::{DEFAULT_FPS, DEFAULT_QUEUE_CAPACITY, FULL_QUEUE_BACKOFF, MAX_FPS};

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("media error: {0}")]
    Media(#[from] MediaError),

    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("outbox closed")]
    OutboxClosed,

    #[error("capture thread failed: {0}")]
    Thread(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureConfig {
    pub fps: u32,
    /// Every frame is scaled to this before encoding.
    pub resolution: Resolution,
    pub queue_capacity: usize,
    pub full_queue_backoff: Duration,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            fps: DEFAULT_FPS,
            resolution: shroud_media::TRANSMIT_RESOLUTION,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            full_queue_backoff: FULL_QUEUE_BACKOFF,
        }
    }
}

impl CaptureConfig {
    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs(1) / self.fps.max(1)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.fps == 0 || self.fps > MAX_FPS {
            return Err(anyhow!("fps must be between 1 and {}", MAX_FPS));
        }
        if self.resolution.is_empty() {
            return Err(anyhow!("transmit resolution must be non-zero"));
        }
        if self.queue_capacity == 0 {
            return Err(anyhow!("queue capacity must be at least 1"));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct PipelineCounters {
    captured: AtomicU64,
    sent: AtomicU64,
    failed: AtomicU64,
}

impl PipelineCounters {
    fn snapshot(&self) -> PipelineStats {
        PipelineStats {
            frames_captured: self.captured.load(Ordering::Relaxed),
            frames_sent: self.sent.load(Ordering::Relaxed),
            frames_failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub frames_captured: u64,
    pub frames_sent: u64,
    pub frames_failed: u64,
}

enum CaptureItem {
    Frame(RawFrame),
    End,
}

pub struct CapturePipeline {
    stream_id: String,
    cipher: FrameCipher,
    codec: Arc<dyn FrameCodec>,
    config: CaptureConfig,
    counters: Arc<PipelineCounters>,
}

impl CapturePipeline {
    pub fn new(stream_id: impl Into<String>, cipher: FrameCipher, config: CaptureConfig) -> Self {
        Self {
            stream_id: stream_id.into(),
            cipher,
            codec: Arc::new(RawCodec),
            config,
            counters: Arc::default(),
        }
    }

    pub fn with_codec(mut self, codec: Arc<dyn FrameCodec>) -> Self {
        self.codec = codec;
        self
    }

    /// Counts so far. Still readable after [`run`](Self::run) was cancelled.
    pub fn stats(&self) -> PipelineStats {
        self.counters.snapshot()
    }

    /// Stream every frame of `source` into `outbox`, then return the counts.
    ///
    /// Frames that fail to encode or seal are counted and skipped. A closed
    /// outbox stops both stages, and so does dropping the returned future.
    pub async fn run(
        &self,
        source: Box<dyn FrameSource>,
        outbox: mpsc::Sender<RelayMessage>,
    ) -> Result<PipelineStats, CaptureError> {
        let counters = &self.counters;
        let (tx, rx) = mpsc::channel(self.config.queue_capacity.max(1));

        info!(
            "capture for stream {} started at {} fps, {}",
            self.stream_id, self.config.fps, self.config.resolution
        );

        let capture = {
            let counters = counters.clone();
            let config = self.config;
            thread::Builder::new()
                .name(format!("capture-{}", self.stream_id))
                .spawn(move || capture_loop(source, tx, config, &counters))
                .map_err(|e| CaptureError::Thread(e.to_string()))?
        };

        let sent = send_loop(
            rx,
            &self.stream_id,
            &self.cipher,
            &self.codec,
            &outbox,
            counters,
        )
        .await;

        let captured = match tokio::task::spawn_blocking(move || capture.join()).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CaptureError::Thread("capture thread panicked".into())),
            Err(e) => Err(CaptureError::Thread(e.to_string())),
        };

        let stats = counters.snapshot();
        info!(
            "capture for stream {} stopped: {} captured, {} sent, {} failed",
            self.stream_id, stats.frames_captured, stats.frames_sent, stats.frames_failed
        );
        sent?;
        captured?;
        Ok(stats)
    }
}

fn capture_loop(
    mut source: Box<dyn FrameSource>,
    tx: mpsc::Sender<CaptureItem>,
    config: CaptureConfig,
    counters: &PipelineCounters,
) -> Result<(), CaptureError> {
    let interval = config.frame_interval();
    let mut result = Ok(());

    loop {
        let started = Instant::now();
        if tx.is_closed() {
            debug!("send stage gone, stopping capture");
            return Ok(());
        }
        if tx.capacity() == 0 {
            thread::sleep(config.full_queue_backoff);
            continue;
        }

        let frame = match source.next_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                info!("end of source");
                break;
            }
            Err(e) => {
                warn!("source failed: {}", e);
                result = Err(e.into());
                break;
            }
        };
        let frame = match resize(frame, config.resolution) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("dropping frame that could not be scaled: {}", e);
                counters.failed.fetch_add(1, Ordering::Relaxed);
                continue;
            }
        };

        // Sole sender and capacity was checked, so this never waits.
        if tx.blocking_send(CaptureItem::Frame(frame)).is_err() {
            return Ok(());
        }
        counters.captured.fetch_add(1, Ordering::Relaxed);

        if let Some(rest) = interval.checked_sub(started.elapsed()) {
            thread::sleep(rest);
        }
    }

    let _ = tx.blocking_send(CaptureItem::End);
    result
}

async fn send_loop(
    mut rx: mpsc::Receiver<CaptureItem>,
    stream_id: &str,
    cipher: &FrameCipher,
    codec: &Arc<dyn FrameCodec>,
    outbox: &mpsc::Sender<RelayMessage>,
    counters: &PipelineCounters,
) -> Result<(), CaptureError> {
    while let Some(CaptureItem::Frame(frame)) = rx.recv().await {
        let cipher = cipher.clone();
        let codec = codec.clone();
        let sealed = tokio::task::spawn_blocking(move || -> Result<SealedFrame, CaptureError> {
            let encoded = codec.encode(&frame)?;
            Ok(cipher.seal(&encoded)?)
        })
        .await;

        let sealed = match sealed {
            Ok(Ok(sealed)) => sealed,
            Ok(Err(e)) => {
                warn!("failed to prepare frame for stream {}: {}", stream_id, e);
                counters.failed.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            Err(e) => {
                warn!("encode task for stream {} failed: {}", stream_id, e);
                counters.failed.fetch_add(1, Ordering::Relaxed);
                continue;
            }
        };

        let message = RelayMessage::VideoFrame(FrameEnvelope {
            stream_id: stream_id.to_string(),
            ciphertext: Bytes::from(sealed.ciphertext),
            nonce: Bytes::copy_from_slice(&sealed.nonce),
            tag: Bytes::copy_from_slice(&sealed.tag),
        });
        if outbox.send(message).await.is_err() {
            return Err(CaptureError::OutboxClosed);
        }
        counters.sent.fetch_add(1, Ordering::Relaxed);
        debug!("frame sent for stream {}", stream_id);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_interval() {
        let config = CaptureConfig {
            fps: 30,
            ..CaptureConfig::default()
        };
        assert_eq!(config.frame_interval(), Duration::from_nanos(33_333_333));
        let config = CaptureConfig {
            fps: 240,
            ..CaptureConfig::default()
        };
        assert_eq!(config.frame_interval(), Duration::from_nanos(4_166_666));
    }

    #[test]
    fn test_rejects_empty_queue() {
        let config = CaptureConfig {
            queue_capacity: 0,
            ..CaptureConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
