//! End-to-end producer session: connect, handshake, stream, disconnect.

use std::future::Future;

use anyhow::{Context, Result};
use shroud_media::open_source;
use tracing::{info, warn};

use crate::capture::{CaptureError, CapturePipeline, PipelineStats};
use crate::client::{ClientTasks, RelayClient};
use crate::config::StreamConfig;

/// Stream one source to the relay.
///
/// Resolving `shutdown` stops capture early and closes the connection. After
/// the source ends the connection is kept for [`StreamConfig::linger`], or
/// until `shutdown` or the relay closes it when no linger is set.
pub async fn run(config: StreamConfig, shutdown: impl Future<Output = ()>) -> Result<PipelineStats> {
    config.validate()?;
    tokio::pin!(shutdown);

    let mut client = RelayClient::connect(&config.server_url)
        .await
        .with_context(|| format!("failed to connect to {}", config.server_url))?;
    client.register(&config.stream_id).await?;
    let cipher = client
        .handshake(&config.stream_id, config.handshake_timeout)
        .await
        .context("key exchange failed")?;

    let source = open_source(&config.source, config.source_resolution, config.frame_limit)
        .with_context(|| format!("failed to open video source {}", config.source))?;

    let ClientTasks {
        outbox,
        writer,
        mut reader,
    } = client.spawn_io(config.outbox_capacity);
    let pipeline = CapturePipeline::new(&config.stream_id, cipher, config.capture);

    let (outcome, interrupted) = tokio::select! {
        result = pipeline.run(source, outbox.clone()) => (result, false),
        _ = &mut shutdown => (Ok(pipeline.stats()), true),
    };

    if !interrupted && outcome.is_ok() {
        match config.linger {
            Some(linger) => tokio::select! {
                _ = tokio::time::sleep(linger) => {}
                _ = &mut reader => {}
                _ = &mut shutdown => {}
            },
            None => {
                info!("source finished, staying connected until shutdown");
                tokio::select! {
                    _ = &mut reader => {}
                    _ = &mut shutdown => {}
                }
            }
        }
    }

    drop(outbox);
    match writer.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("writer stopped with error: {}", e),
        Err(e) => warn!("writer task failed: {}", e),
    }
    reader.abort();

    match outcome {
        Ok(stats) => Ok(stats),
        Err(CaptureError::OutboxClosed) => {
            Err(CaptureError::OutboxClosed).context("connection to relay lost while streaming")
        }
        Err(e) => Err(e.into()),
    }
}
