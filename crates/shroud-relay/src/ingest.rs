//! Per-stream ingestion pipeline.
//!
//! Each active stream owns one bounded queue and one worker task. The worker
//! drains the queue strictly in arrival order and for every frame either
//! decrypts, decodes, rescales and re-encodes it, or, while decryption is
//! switched off, turns the raw ciphertext into a noise frame. CPU-bound steps
//! go through the shared [`DecodePool`]; the worker waits for each one, which
//! keeps per-stream ordering intact.
//!
//! # Shutdown
//!
//! - [`IngestHandle::close`] (disconnect): frames still queued or in flight
//!   are discarded, then the worker exits on the sentinel.
//! - [`IngestHandle::seal`] (re-key): queued frames are still processed with
//!   the old key, then the worker exits. The returned [`SealedPipeline`] lets
//!   the next pipeline wait for it and can still be closed on disconnect.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;
use shroud_common::FrameEnvelope;
use shroud_crypto::{CryptoError, FrameCipher, NonceWindow};
use shroud_media::{noise_frame, resize, FrameCodec, MediaError, RawFrame, Resolution};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::hub::Hub;
use crate::pool::{DecodePool, PoolError};
use crate::toggle::DecryptionToggle;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Media(#[from] MediaError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("ingest queue full")]
    QueueFull,

    #[error("ingest pipeline closed")]
    Closed,
}

/// Everything a worker needs besides its own key.
#[derive(Clone)]
pub struct IngestContext {
    pub hub: Hub,
    pub pool: DecodePool,
    pub toggle: DecryptionToggle,
    pub codec: Arc<dyn FrameCodec>,
    pub output: Resolution,
    pub queue_capacity: usize,
    pub replay_window: usize,
}

/// Frame counters for one stream session.
#[derive(Debug, Default)]
pub struct StreamCounters {
    pub received: AtomicU64,
    pub broadcast: AtomicU64,
    pub dropped: AtomicU64,
    pub overflowed: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StreamStats {
    pub frames_received: u64,
    pub frames_broadcast: u64,
    pub frames_dropped: u64,
    pub frames_overflowed: u64,
}

impl StreamCounters {
    pub fn snapshot(&self) -> StreamStats {
        StreamStats {
            frames_received: self.received.load(Ordering::Relaxed),
            frames_broadcast: self.broadcast.load(Ordering::Relaxed),
            frames_dropped: self.dropped.load(Ordering::Relaxed),
            frames_overflowed: self.overflowed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug)]
enum IngestItem {
    Frame(FrameEnvelope),
    Shutdown,
}

/// Owning side of a running pipeline.
#[derive(Debug)]
pub struct IngestHandle {
    tx: mpsc::Sender<IngestItem>,
    closed: Arc<AtomicBool>,
    /// Close flags of sealed predecessors that may still be draining.
    upstream: Vec<Arc<AtomicBool>>,
    task: JoinHandle<()>,
}

/// A pipeline that stopped accepting frames but may still be draining.
///
/// Closing it discards whatever it has not broadcast yet, including frames
/// queued in earlier pipelines it was chained behind.
#[derive(Debug)]
pub struct SealedPipeline {
    flags: Vec<Arc<AtomicBool>>,
    task: JoinHandle<()>,
}

impl SealedPipeline {
    pub fn close(self) -> JoinHandle<()> {
        raise(&self.flags);
        self.task
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

fn raise(flags: &[Arc<AtomicBool>]) {
    for flag in flags {
        flag.store(true, Ordering::Release);
    }
}

impl IngestHandle {
    /// Start a worker for `stream_id`.
    ///
    /// With a `predecessor`, the new worker waits for that pipeline to finish
    /// before touching its own queue, and closing the new handle also closes
    /// the predecessor.
    pub fn spawn(
        ctx: &IngestContext,
        stream_id: String,
        cipher: FrameCipher,
        counters: Arc<StreamCounters>,
        predecessor: Option<SealedPipeline>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(ctx.queue_capacity.max(1));
        let closed = Arc::new(AtomicBool::new(false));
        let (upstream, wait_for) = match predecessor {
            Some(sealed) => (sealed.flags, Some(sealed.task)),
            None => (Vec::new(), None),
        };
        let worker = IngestWorker {
            stream_id,
            ctx: ctx.clone(),
            cipher,
            window: NonceWindow::with_capacity(ctx.replay_window),
            closed: closed.clone(),
            counters,
        };
        let task = tokio::spawn(worker.run(rx, wait_for));
        Self {
            tx,
            closed,
            upstream,
            task,
        }
    }

    /// Queue a frame without waiting. A full queue drops the frame.
    pub fn try_enqueue(&self, envelope: FrameEnvelope) -> Result<(), IngestError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(IngestError::Closed);
        }
        self.tx
            .try_send(IngestItem::Frame(envelope))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => IngestError::QueueFull,
                mpsc::error::TrySendError::Closed(_) => IngestError::Closed,
            })
    }

    /// Stop accepting frames but let queued ones finish.
    pub fn seal(self) -> SealedPipeline {
        // If the queue is full the sentinel does not fit; dropping the
        // sender below still ends the worker once it has drained.
        let _ = self.tx.try_send(IngestItem::Shutdown);
        let mut flags = self.upstream;
        flags.push(self.closed);
        SealedPipeline {
            flags,
            task: self.task,
        }
    }

    /// Stop the pipeline and its predecessors, discarding anything not yet
    /// broadcast.
    pub fn close(self) -> JoinHandle<()> {
        self.closed.store(true, Ordering::Release);
        raise(&self.upstream);
        let _ = self.tx.try_send(IngestItem::Shutdown);
        self.task
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

struct IngestWorker {
    stream_id: String,
    ctx: IngestContext,
    cipher: FrameCipher,
    window: NonceWindow,
    closed: Arc<AtomicBool>,
    counters: Arc<StreamCounters>,
}

impl IngestWorker {
    async fn run(
        mut self,
        mut rx: mpsc::Receiver<IngestItem>,
        predecessor: Option<JoinHandle<()>>,
    ) {
        if let Some(previous) = predecessor {
            let _ = previous.await;
        }
        info!("ingest worker for stream {} started", self.stream_id);

        while let Some(item) = rx.recv().await {
            let IngestItem::Frame(envelope) = item else {
                break;
            };
            if self.is_closed() {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            match self.process(envelope).await {
                // The session may have closed while the pool was busy.
                Ok(_) if self.is_closed() => {
                    self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                    debug!("discarded late frame for closed stream {}", self.stream_id);
                }
                Ok(encoded) => {
                    self.ctx.hub.broadcast_frame(&self.stream_id, encoded).await;
                    self.counters.broadcast.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                    match e {
                        IngestError::Crypto(_) => {
                            warn!("frame for stream {} rejected: {}", self.stream_id, e)
                        }
                        _ => debug!("frame for stream {} dropped: {}", self.stream_id, e),
                    }
                }
            }
        }

        info!("ingest worker for stream {} stopped", self.stream_id);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    async fn process(&mut self, envelope: FrameEnvelope) -> Result<Bytes, IngestError> {
        if self.ctx.toggle.is_enabled() {
            self.decrypt_and_transcode(envelope).await
        } else {
            self.synthesize_noise(envelope).await
        }
    }

    async fn decrypt_and_transcode(
        &mut self,
        envelope: FrameEnvelope,
    ) -> Result<Bytes, IngestError> {
        if !self.window.check(&envelope.nonce) {
            return Err(CryptoError::Replay.into());
        }
        let nonce = envelope.nonce.clone();

        let cipher = self.cipher.clone();
        let codec = self.ctx.codec.clone();
        let decoded = self
            .ctx
            .pool
            .run(move || -> Result<RawFrame, IngestError> {
                let plaintext = cipher.open(&envelope.ciphertext, &envelope.nonce, &envelope.tag)?;
                Ok(codec.decode(&plaintext)?)
            })
            .await??;
        // Only authenticated nonces enter the window.
        self.window.check_and_insert(&nonce);

        let codec = self.ctx.codec.clone();
        let output = self.ctx.output;
        let encoded = self
            .ctx
            .pool
            .run(move || -> Result<Vec<u8>, IngestError> {
                let frame = resize(decoded, output)?;
                Ok(codec.encode(&frame)?)
            })
            .await??;
        Ok(Bytes::from(encoded))
    }

    async fn synthesize_noise(&self, envelope: FrameEnvelope) -> Result<Bytes, IngestError> {
        let codec = self.ctx.codec.clone();
        let output = self.ctx.output;
        let encoded = self
            .ctx
            .pool
            .run(move || -> Result<Vec<u8>, IngestError> {
                let frame = noise_frame(&envelope.ciphertext, output)?;
                Ok(codec.encode(&frame)?)
            })
            .await??;
        Ok(Bytes::from(encoded))
    }
}
