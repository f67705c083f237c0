#![forbid(unsafe_code)]

//! Shroud Stream - encrypted video producer.
//!
//! Registers a stream with the relay, derives a key through a Kyber
//! handshake and sends sealed frames from a test pattern or a raw file.

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use shroud_media::Resolution;
use shroud_stream::config::{
    DEFAULT_FPS, DEFAULT_OUTBOX_CAPACITY, DEFAULT_QUEUE_CAPACITY, DEFAULT_SERVER_URL,
    DEFAULT_STREAM_NAME, MAX_FPS,
};
use shroud_stream::{producer, CaptureConfig, StreamConfig};
use tracing::{info, warn};
use url::Url;

#[derive(Parser, Debug)]
#[command(name = "shroud-stream")]
#[command(about = "Stream encrypted video to a Shroud relay")]
struct Args {
    /// Unique stream identifier
    #[arg(long, env = "SHROUD_STREAM_NAME", default_value = DEFAULT_STREAM_NAME)]
    stream_name: String,

    /// Video source: "pattern" or a path to raw RGB frames
    #[arg(long, env = "SHROUD_SOURCE", default_value = shroud_media::source::PATTERN_SOURCE)]
    source: String,

    /// Relay WebSocket URL including the namespace
    #[arg(long, env = "SHROUD_SERVER_URL", default_value = DEFAULT_SERVER_URL)]
    server_url: Url,

    /// Target frame rate
    #[arg(long, default_value_t = DEFAULT_FPS,
          value_parser = clap::value_parser!(u32).range(1..=MAX_FPS as i64))]
    fps: u32,

    /// Transmit width
    #[arg(long, default_value_t = 1280)]
    width: u16,

    /// Transmit height
    #[arg(long, default_value_t = 720)]
    height: u16,

    /// Width of frames in a raw source file
    #[arg(long, default_value_t = 1280)]
    source_width: u16,

    /// Height of frames in a raw source file
    #[arg(long, default_value_t = 720)]
    source_height: u16,

    /// Stop after this many frames
    #[arg(long)]
    frames: Option<u64>,

    /// Frames buffered between capture and encryption
    #[arg(long, default_value_t = DEFAULT_QUEUE_CAPACITY)]
    queue: usize,

    /// Messages buffered ahead of the socket
    #[arg(long, default_value_t = DEFAULT_OUTBOX_CAPACITY)]
    outbox: usize,

    /// Seconds to wait for the key exchange response
    #[arg(long, default_value_t = 10)]
    handshake_timeout_secs: u64,

    /// Seconds to stay connected after the source ends (default: until Ctrl-C)
    #[arg(long)]
    linger_secs: Option<u64>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn into_config(self) -> StreamConfig {
        let mut config = StreamConfig::new(self.server_url, self.stream_name);
        config.source = self.source;
        config.source_resolution = Resolution::new(self.source_width, self.source_height);
        config.frame_limit = self.frames;
        config.capture = CaptureConfig {
            fps: self.fps,
            resolution: Resolution::new(self.width, self.height),
            queue_capacity: self.queue,
            ..CaptureConfig::default()
        };
        config.outbox_capacity = self.outbox;
        config.handshake_timeout = Duration::from_secs(self.handshake_timeout_secs);
        config.linger = self.linger_secs.map(Duration::from_secs);
        config
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    shroud_common::init_tracing_with_default(&args.log_level);

    info!("Starting shroud-stream v{}", env!("CARGO_PKG_VERSION"));

    let config = args.into_config();
    config.validate().context("invalid stream configuration")?;
    info!(
        "streaming {} from {} to {} at {} fps",
        config.stream_id, config.source, config.server_url, config.capture.fps
    );

    let stats = producer::run(config, shutdown_signal()).await?;
    info!(
        "video capture stopped: {} captured, {} sent, {} failed",
        stats.frames_captured, stats.frames_sent, stats.frames_failed
    );
    Ok(())
}
