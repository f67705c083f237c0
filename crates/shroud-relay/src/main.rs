#![forbid(unsafe_code)]

//! Shroud Relay - decrypting fan-out for post-quantum encrypted video streams.
//!
//! The relay:
//! 1. Accepts producer and subscriber connections on one WebSocket namespace
//! 2. Runs a Kyber handshake per stream and keeps the derived key
//! 3. Decrypts, rescales and rebroadcasts every stream's frames

use std::net::SocketAddr;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use shroud_common::helpers::{env_bool, env_parse};
use shroud_crypto::NonceWindow;
use shroud_media::Resolution;
use shroud_relay::config::{
    DEFAULT_DECODE_WORKERS, DEFAULT_INGEST_QUEUE, DEFAULT_LISTEN, DEFAULT_MAX_MESSAGE_BYTES,
    DEFAULT_OUTBOX_CAPACITY,
};
use shroud_relay::{http, Relay, RelayConfig};
use tokio::net::TcpListener;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "shroud-relay")]
#[command(about = "Shroud relay - decrypts encrypted video streams and rebroadcasts them")]
struct Args {
    /// TCP listen address
    #[arg(long, env = "SHROUD_LISTEN", default_value = DEFAULT_LISTEN)]
    listen: SocketAddr,

    /// Path the WebSocket transport is served on
    #[arg(long, env = "SHROUD_NAMESPACE", default_value = shroud_common::DEFAULT_NAMESPACE)]
    namespace: String,

    /// Maximum concurrent decode jobs across all streams
    #[arg(long, env = "SHROUD_DECODE_WORKERS", default_value_t = DEFAULT_DECODE_WORKERS)]
    decode_workers: usize,

    /// Frames buffered per stream before new ones are dropped
    #[arg(long, env = "SHROUD_INGEST_QUEUE", default_value_t = DEFAULT_INGEST_QUEUE)]
    ingest_queue: usize,

    /// Messages buffered per connection before new ones are dropped
    #[arg(long, env = "SHROUD_OUTBOX_CAPACITY", default_value_t = DEFAULT_OUTBOX_CAPACITY)]
    outbox_capacity: usize,

    /// Largest accepted WebSocket message
    #[arg(long, env = "SHROUD_MAX_MESSAGE_BYTES", default_value_t = DEFAULT_MAX_MESSAGE_BYTES)]
    max_message_bytes: usize,

    /// Broadcast frame width
    #[arg(long, env = "SHROUD_OUTPUT_WIDTH", default_value_t = 640)]
    output_width: u16,

    /// Broadcast frame height
    #[arg(long, env = "SHROUD_OUTPUT_HEIGHT", default_value_t = 360)]
    output_height: u16,

    /// Start with decryption enabled
    #[arg(long, env = "SHROUD_DECRYPTION", default_value_t = true, action = ArgAction::Set)]
    decryption: bool,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn into_config(self) -> RelayConfig {
        RelayConfig {
            listen: self.listen,
            namespace: self.namespace,
            decode_workers: self.decode_workers,
            ingest_queue: self.ingest_queue,
            outbox_capacity: self.outbox_capacity,
            max_message_bytes: self.max_message_bytes,
            output_resolution: Resolution::new(self.output_width, self.output_height),
            decryption_enabled: self.decryption,
            replay_window: env_parse("SHROUD_REPLAY_WINDOW", NonceWindow::DEFAULT_CAPACITY),
        }
    }
}

fn check_public_bind_allowed(addr: SocketAddr) -> Result<()> {
    if addr.ip().is_loopback() {
        return Ok(());
    }
    if env_bool("SHROUD_ALLOW_PUBLIC_BIND", false) {
        warn!("binding {} without TLS; frames are only protected by their own encryption", addr);
        return Ok(());
    }
    Err(anyhow::anyhow!(
        "refusing non-loopback bind without SHROUD_ALLOW_PUBLIC_BIND=1"
    ))
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

    info!("Starting shroud-relay v{}", env!("CARGO_PKG_VERSION"));

    let config = args.into_config();
    config.validate().context("invalid relay configuration")?;
    check_public_bind_allowed(config.listen)?;

    info!(
        "decode workers: {}, ingest queue: {}, output: {}, decryption {}",
        config.decode_workers,
        config.ingest_queue,
        config.output_resolution,
        if config.decryption_enabled { "on" } else { "off" }
    );

    let relay = Relay::new(config.clone());
    let app = http::router(relay);

    let listener = TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.listen))?;
    info!(
        "relay listening on {} (namespace {})",
        listener.local_addr()?,
        config.namespace
    );

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("relay stopped");
    Ok(())
}
