use std::collections::HashSet;
use std::time::{Duration, Instant};

use shroud_common::RelayMessage;
use shroud_crypto::FrameCipher;
use shroud_media::{
    FrameCodec, FrameSource, MediaError, PatternSource, RawCodec, RawFrame, Resolution,
};
use shroud_stream::{CaptureConfig, CaptureError, CapturePipeline};
use tokio::sync::mpsc;
use tokio::time::timeout;

const KEY: [u8; 32] = [7; 32];
const SOURCE: Resolution = Resolution::new(64, 36);

fn fast_config() -> CaptureConfig {
    CaptureConfig {
        fps: 240,
        resolution: SOURCE,
        ..CaptureConfig::default()
    }
}

fn open(cipher: &FrameCipher, message: RelayMessage) -> (Vec<u8>, RawFrame) {
    let RelayMessage::VideoFrame(envelope) = message else {
        panic!("expected video_frame, got {}", message.event());
    };
    assert_eq!(envelope.stream_id, "demo");
    let plaintext = cipher
        .open(&envelope.ciphertext, &envelope.nonce, &envelope.tag)
        .unwrap();
    (envelope.nonce.to_vec(), RawCodec.decode(&plaintext).unwrap())
}

fn drain(rx: &mut mpsc::Receiver<RelayMessage>) -> Vec<RelayMessage> {
    let mut messages = Vec::new();
    while let Ok(message) = rx.try_recv() {
        messages.push(message);
    }
    messages
}

/// Yields `good` frames, then fails.
struct FlakySource {
    good: u8,
    emitted: u8,
}

impl FrameSource for FlakySource {
    fn next_frame(&mut self) -> shroud_media::Result<Option<RawFrame>> {
        if self.emitted == self.good {
            return Err(MediaError::Source("device unplugged".into()));
        }
        self.emitted += 1;
        Ok(Some(RawFrame::filled(SOURCE, self.emitted)))
    }

    fn resolution(&self) -> Resolution {
        SOURCE
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_frames_arrive_sealed_and_in_order() {
    let cipher = FrameCipher::new(&KEY);
    let pipeline = CapturePipeline::new("demo", cipher.clone(), fast_config());
    let (tx, mut rx) = mpsc::channel(64);

    let source = Box::new(PatternSource::new(SOURCE, Some(30)));
    let stats = timeout(Duration::from_secs(10), pipeline.run(source, tx))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(stats.frames_captured, 30);
    assert_eq!(stats.frames_sent, 30);
    assert_eq!(stats.frames_failed, 0);

    let messages = drain(&mut rx);
    assert_eq!(messages.len(), 30);
    let mut nonces = HashSet::new();
    for (i, message) in messages.into_iter().enumerate() {
        let (nonce, frame) = open(&cipher, message);
        assert!(nonces.insert(nonce));
        assert!(frame.data.iter().all(|&b| b == i as u8 + 1));
    }
}

#[tokio::test]
async fn test_frames_scaled_to_transmit_resolution() {
    let cipher = FrameCipher::new(&KEY);
    let config = CaptureConfig {
        resolution: Resolution::new(32, 18),
        ..fast_config()
    };
    let pipeline = CapturePipeline::new("demo", cipher.clone(), config);
    let (tx, mut rx) = mpsc::channel(8);

    let source = Box::new(PatternSource::new(SOURCE, Some(3)));
    pipeline.run(source, tx).await.unwrap();

    for message in drain(&mut rx) {
        let (_, frame) = open(&cipher, message);
        assert_eq!(frame.resolution(), Resolution::new(32, 18));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_slow_consumer_loses_nothing() {
    let cipher = FrameCipher::new(&KEY);
    let config = CaptureConfig {
        queue_capacity: 2,
        ..fast_config()
    };
    let pipeline = CapturePipeline::new("demo", cipher.clone(), config);
    let (tx, mut rx) = mpsc::channel(1);

    let consumer = tokio::spawn(async move {
        let mut received = Vec::new();
        while let Some(message) = rx.recv().await {
            tokio::time::sleep(Duration::from_millis(15)).await;
            received.push(message);
        }
        received
    });

    let source = Box::new(PatternSource::new(SOURCE, Some(12)));
    let stats = timeout(Duration::from_secs(10), pipeline.run(source, tx))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stats.frames_sent, 12);

    let received = consumer.await.unwrap();
    let seqs: Vec<u8> = received
        .into_iter()
        .map(|m| open(&cipher, m).1.data[0])
        .collect();
    assert_eq!(seqs, (1..=12).collect::<Vec<u8>>());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_paced_to_frame_rate() {
    let config = CaptureConfig {
        fps: 50,
        ..fast_config()
    };
    let pipeline = CapturePipeline::new("demo", FrameCipher::new(&KEY), config);
    let (tx, _rx) = mpsc::channel(64);

    let started = Instant::now();
    let source = Box::new(PatternSource::new(SOURCE, Some(10)));
    pipeline.run(source, tx).await.unwrap();

    // Ten frames at 20ms each, allowing for timer slack.
    assert!(started.elapsed() >= Duration::from_millis(180));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_closed_outbox_stops_pipeline() {
    let pipeline = CapturePipeline::new("demo", FrameCipher::new(&KEY), fast_config());
    let (tx, rx) = mpsc::channel(4);
    drop(rx);

    let source = Box::new(PatternSource::new(SOURCE, None));
    let result = timeout(Duration::from_secs(10), pipeline.run(source, tx))
        .await
        .unwrap();
    assert!(matches!(result, Err(CaptureError::OutboxClosed)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_source_failure_after_partial_stream() {
    let cipher = FrameCipher::new(&KEY);
    let pipeline = CapturePipeline::new("demo", cipher.clone(), fast_config());
    let (tx, mut rx) = mpsc::channel(16);

    let source = Box::new(FlakySource { good: 3, emitted: 0 });
    let result = pipeline.run(source, tx).await;
    assert!(matches!(result, Err(CaptureError::Media(MediaError::Source(_)))));

    // Frames captured before the failure were still delivered.
    assert_eq!(pipeline.stats().frames_sent, 3);
    assert_eq!(drain(&mut rx).len(), 3);
}
