//! WebSocket connection to the relay.
//!
//! The client owns the socket until the handshake completes. After that the
//! socket is split: a writer task drains the bounded outbox and a reader
//! task logs what the relay announces.

use std::time::Duration;

use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use shroud_common::RelayMessage;
use shroud_crypto::{CryptoError, FrameCipher, KemKeypair};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("transport error: {0}")]
    Transport(#[from] tungstenite::Error),

    #[error(transparent)]
    Protocol(#[from] shroud_common::Error),

    #[error("key exchange failed: {0}")]
    Crypto(#[from] CryptoError),

    #[error("no key exchange response within {0:?}")]
    HandshakeTimeout(Duration),

    #[error("connection closed by relay")]
    Closed,
}

pub struct RelayClient {
    ws: WsStream,
}

impl RelayClient {
    pub async fn connect(url: &Url) -> Result<Self, ClientError> {
        let (ws, _) = connect_async(url.as_str()).await?;
        info!("connected to {}", url);
        Ok(Self { ws })
    }

    pub async fn send(&mut self, message: &RelayMessage) -> Result<(), ClientError> {
        let text = shroud_common::encode(message)?;
        self.ws.send(Message::Text(text)).await?;
        Ok(())
    }

    /// Next valid message from the relay. Malformed messages are skipped.
    pub async fn recv(&mut self) -> Result<RelayMessage, ClientError> {
        while let Some(frame) = self.ws.next().await {
            match frame? {
                Message::Text(text) => match shroud_common::decode(&text) {
                    Ok(message) => return Ok(message),
                    Err(e) => warn!("ignoring malformed message from relay: {}", e),
                },
                Message::Close(_) => return Err(ClientError::Closed),
                _ => {}
            }
        }
        Err(ClientError::Closed)
    }

    pub async fn register(&mut self, stream_id: &str) -> Result<(), ClientError> {
        self.send(&RelayMessage::RegisterStream {
            stream_id: stream_id.to_string(),
        })
        .await
    }

    /// Run the Kyber handshake for `stream_id` and derive the frame cipher.
    ///
    /// Messages other than the matching response are logged and skipped.
    pub async fn handshake(
        &mut self,
        stream_id: &str,
        timeout: Duration,
    ) -> Result<FrameCipher, ClientError> {
        let keypair = KemKeypair::generate()?;
        self.send(&RelayMessage::KeyExchange {
            stream_id: stream_id.to_string(),
            public_key: Bytes::copy_from_slice(keypair.public_key()),
        })
        .await?;

        let ciphertext = tokio::time::timeout(timeout, self.await_response(stream_id))
            .await
            .map_err(|_| ClientError::HandshakeTimeout(timeout))??;

        let secret = keypair.decapsulate(&ciphertext)?;
        info!("shared secret established for stream {}", stream_id);
        Ok(FrameCipher::from_secret(&secret))
    }

    async fn await_response(&mut self, stream_id: &str) -> Result<Bytes, ClientError> {
        loop {
            match self.recv().await? {
                RelayMessage::KeyExchangeResponse {
                    stream_id: id,
                    ciphertext,
                } if id == stream_id => return Ok(ciphertext),
                other => log_announcement(&other),
            }
        }
    }

    /// Hand the socket to background tasks.
    ///
    /// Messages pushed into the returned sender are written in order. The
    /// writer ends once every sender is dropped and the queue is flushed.
    pub fn spawn_io(self, outbox_capacity: usize) -> ClientTasks {
        let (sink, stream) = self.ws.split();
        let (tx, rx) = mpsc::channel(outbox_capacity.max(1));
        ClientTasks {
            outbox: tx,
            writer: tokio::spawn(write_loop(sink, rx)),
            reader: tokio::spawn(read_loop(stream)),
        }
    }
}

pub struct ClientTasks {
    pub outbox: mpsc::Sender<RelayMessage>,
    pub writer: JoinHandle<Result<(), ClientError>>,
    pub reader: JoinHandle<Result<(), ClientError>>,
}

async fn write_loop(
    mut sink: SplitSink<WsStream, Message>,
    mut rx: mpsc::Receiver<RelayMessage>,
) -> Result<(), ClientError> {
    while let Some(message) = rx.recv().await {
        let text = shroud_common::encode(&message)?;
        sink.send(Message::Text(text)).await?;
    }
    debug!("outbox drained, closing connection");
    sink.close().await?;
    Ok(())
}

async fn read_loop(mut stream: SplitStream<WsStream>) -> Result<(), ClientError> {
    while let Some(frame) = stream.next().await {
        match frame? {
            Message::Text(text) => match shroud_common::decode(&text) {
                Ok(message) => log_announcement(&message),
                Err(e) => warn!("ignoring malformed message from relay: {}", e),
            },
            Message::Close(_) => break,
            _ => {}
        }
    }
    info!("relay closed the connection");
    Ok(())
}

fn log_announcement(message: &RelayMessage) {
    match message {
        RelayMessage::DecryptionStatus { enabled } => info!(
            "relay decryption {}",
            if *enabled { "enabled" } else { "disabled" }
        ),
        RelayMessage::StreamListUpdate { stream_ids } => {
            debug!("relay directory: {:?}", stream_ids)
        }
        other => debug!("ignoring {} from relay", other.event()),
    }
}
