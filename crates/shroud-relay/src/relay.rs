//! Relay core: dispatches namespace messages to the registry and hub.
//!
//! Transport-agnostic. The WebSocket adapter in [`crate::signal`] and the
//! tests both drive it through [`Relay::connect`], [`Relay::handle_text`]
//! and [`Relay::disconnect`].

use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;
use shroud_common::{FrameEnvelope, RelayMessage};
use shroud_crypto::CryptoError;
use shroud_media::{FrameCodec, RawCodec};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::RelayConfig;
use crate::hub::{ConnectionId, Hub, Outbox};
use crate::ingest::IngestContext;
use crate::pool::{DecodePool, PoolStats};
use crate::registry::{
    RegisterOutcome, RegistryError, SessionSummary, StreamRegistry, StreamStateCounts,
};
use crate::toggle::DecryptionToggle;

#[derive(Debug, Error)]
pub enum RelayError {
    /// Malformed or unexpected message.
    #[error(transparent)]
    Protocol(#[from] shroud_common::Error),

    /// Handshake rejected; the requester gets no response.
    #[error("handshake for stream {stream_id} rejected: {source}")]
    Handshake {
        stream_id: String,
        #[source]
        source: CryptoError,
    },

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Point-in-time view used by the health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct RelaySnapshot {
    pub connections: usize,
    pub decryption_enabled: bool,
    pub sessions: StreamStateCounts,
    pub streams: Vec<SessionSummary>,
    pub pool: PoolStats,
}

#[derive(Clone)]
pub struct Relay {
    inner: Arc<RelayInner>,
}

struct RelayInner {
    config: RelayConfig,
    registry: Mutex<StreamRegistry>,
    ingest: IngestContext,
}

impl Relay {
    pub fn new(config: RelayConfig) -> Self {
        Self::with_codec(config, Arc::new(RawCodec))
    }

    /// Build a relay that rebroadcasts through `codec`.
    pub fn with_codec(config: RelayConfig, codec: Arc<dyn FrameCodec>) -> Self {
        let ingest = IngestContext {
            hub: Hub::new(config.outbox_capacity),
            pool: DecodePool::new(config.decode_workers),
            toggle: DecryptionToggle::new(config.decryption_enabled),
            codec,
            output: config.output_resolution,
            queue_capacity: config.ingest_queue,
            replay_window: config.replay_window,
        };
        Self {
            inner: Arc::new(RelayInner {
                config,
                registry: Mutex::new(StreamRegistry::new()),
                ingest,
            }),
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.inner.config
    }

    pub fn hub(&self) -> &Hub {
        &self.inner.ingest.hub
    }

    pub fn decryption_enabled(&self) -> bool {
        self.inner.ingest.toggle.is_enabled()
    }

    /// Attach a new connection.
    ///
    /// The connection immediately receives the directory and the current
    /// decryption state.
    pub async fn connect(&self) -> (ConnectionId, Outbox) {
        let (conn, rx) = self.hub().connect().await;
        let stream_ids = self.directory().await;
        self.hub()
            .send_to(conn, RelayMessage::StreamListUpdate { stream_ids })
            .await;
        self.hub()
            .send_to(
                conn,
                RelayMessage::DecryptionStatus {
                    enabled: self.decryption_enabled(),
                },
            )
            .await;
        debug!("connection {} attached", conn);
        (conn, rx)
    }

    /// Detach a connection and tear down every stream it owned.
    pub async fn disconnect(&self, conn: ConnectionId) {
        self.hub().disconnect(conn).await;
        let (closed, stream_ids) = {
            let mut registry = self.inner.registry.lock().await;
            let closed = registry.remove_connection(conn);
            (closed, registry.snapshot())
        };
        if closed.is_empty() {
            debug!("connection {} detached", conn);
            return;
        }
        for session in &closed {
            info!(
                "stream {} closed after {:?} ({} frames received)",
                session.stream_id(),
                session.age(),
                session.stats().frames_received
            );
        }
        drop(closed);
        self.hub()
            .broadcast(RelayMessage::StreamListUpdate { stream_ids })
            .await;
    }

    /// Decode one text frame from `conn` and act on it.
    pub async fn handle_text(&self, conn: ConnectionId, text: &str) -> Result<(), RelayError> {
        let message = shroud_common::decode(text)?;
        self.handle_message(conn, message).await
    }

    pub async fn handle_message(
        &self,
        conn: ConnectionId,
        message: RelayMessage,
    ) -> Result<(), RelayError> {
        match message {
            RelayMessage::RegisterStream { stream_id } => self.register(conn, stream_id).await,
            RelayMessage::GetStreamList => {
                let stream_ids = self.directory().await;
                self.hub()
                    .send_to(conn, RelayMessage::StreamListUpdate { stream_ids })
                    .await;
                Ok(())
            }
            RelayMessage::KeyExchange {
                stream_id,
                public_key,
            } => self.key_exchange(conn, stream_id, &public_key).await,
            RelayMessage::VideoFrame(envelope) => self.video_frame(conn, envelope).await,
            RelayMessage::ToggleDecryption => {
                self.toggle_decryption().await;
                Ok(())
            }
            other => Err(shroud_common::Error::protocol(format!(
                "{} is not accepted from clients",
                other.event()
            ))
            .into()),
        }
    }

    async fn register(&self, conn: ConnectionId, stream_id: String) -> Result<(), RelayError> {
        let (outcome, stream_ids) = {
            let mut registry = self.inner.registry.lock().await;
            let outcome = registry.register(&stream_id, conn);
            (outcome, registry.snapshot())
        };
        self.hub().mark_producer(conn).await;

        match outcome {
            RegisterOutcome::Inserted => {
                info!("stream {} registered by connection {}", stream_id, conn);
                self.hub()
                    .broadcast(RelayMessage::StreamListUpdate { stream_ids })
                    .await;
            }
            RegisterOutcome::Rebound => {
                info!("stream {} rebound to connection {}", stream_id, conn);
            }
            RegisterOutcome::Unchanged => {}
        }
        Ok(())
    }

    async fn key_exchange(
        &self,
        conn: ConnectionId,
        stream_id: String,
        public_key: &[u8],
    ) -> Result<(), RelayError> {
        let (ciphertext, secret) =
            shroud_crypto::encapsulate(public_key).map_err(|source| RelayError::Handshake {
                stream_id: stream_id.clone(),
                source,
            })?;

        self.inner
            .registry
            .lock()
            .await
            .complete_handshake(&stream_id, conn, secret)?;

        info!("key exchange completed for stream {}", stream_id);
        let delivered = self
            .hub()
            .send_to(
                conn,
                RelayMessage::KeyExchangeResponse {
                    stream_id,
                    ciphertext: Bytes::from(ciphertext),
                },
            )
            .await;
        if !delivered {
            warn!("key exchange response to connection {} not delivered", conn);
        }
        Ok(())
    }

    async fn video_frame(
        &self,
        conn: ConnectionId,
        envelope: FrameEnvelope,
    ) -> Result<(), RelayError> {
        let result = self
            .inner
            .registry
            .lock()
            .await
            .enqueue(conn, envelope, &self.inner.ingest);
        if let Err(RegistryError::Ingest { stream_id, source }) = &result {
            warn!("frame for stream {} not queued: {}", stream_id, source);
        }
        result.map_err(Into::into)
    }

    /// Flip the global toggle and announce the new state to everyone.
    pub async fn toggle_decryption(&self) -> bool {
        let enabled = self.inner.ingest.toggle.flip();
        info!(
            "decryption {}",
            if enabled { "enabled" } else { "disabled" }
        );
        self.hub()
            .broadcast(RelayMessage::DecryptionStatus { enabled })
            .await;
        enabled
    }

    pub async fn directory(&self) -> Vec<String> {
        self.inner.registry.lock().await.snapshot()
    }

    pub async fn snapshot(&self) -> RelaySnapshot {
        let (sessions, streams) = {
            let registry = self.inner.registry.lock().await;
            (registry.state_counts(), registry.summaries())
        };
        RelaySnapshot {
            connections: self.hub().len().await,
            decryption_enabled: self.decryption_enabled(),
            sessions,
            streams,
            pool: self.inner.ingest.pool.stats(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shroud_crypto::KemKeypair;

    fn relay() -> Relay {
        Relay::new(RelayConfig::default())
    }

    fn drain(rx: &mut Outbox) -> Vec<RelayMessage> {
        let mut out = Vec::new();
        while let Ok(message) = rx.try_recv() {
            out.push(message);
        }
        out
    }

    #[tokio::test]
    async fn test_connect_sends_directory_then_status() {
        let relay = relay();
        let (_conn, mut rx) = relay.connect().await;
        assert_eq!(
            drain(&mut rx),
            vec![
                RelayMessage::StreamListUpdate { stream_ids: vec![] },
                RelayMessage::DecryptionStatus { enabled: true },
            ]
        );
    }

    #[tokio::test]
    async fn test_register_broadcasts_once() {
        let relay = relay();
        let (producer, _producer_rx) = relay.connect().await;
        let (_viewer, mut viewer_rx) = relay.connect().await;
        drain(&mut viewer_rx);

        let register = RelayMessage::RegisterStream {
            stream_id: "demo".into(),
        };
        relay.handle_message(producer, register.clone()).await.unwrap();
        relay.handle_message(producer, register).await.unwrap();

        assert_eq!(
            drain(&mut viewer_rx),
            vec![RelayMessage::StreamListUpdate {
                stream_ids: vec!["demo".into()]
            }]
        );
        assert_eq!(relay.directory().await, vec!["demo"]);
    }

    #[tokio::test]
    async fn test_key_exchange_answers_requester_only() {
        let relay = relay();
        let (producer, mut producer_rx) = relay.connect().await;
        let (_viewer, mut viewer_rx) = relay.connect().await;
        relay
            .handle_message(
                producer,
                RelayMessage::RegisterStream {
                    stream_id: "demo".into(),
                },
            )
            .await
            .unwrap();
        drain(&mut producer_rx);
        drain(&mut viewer_rx);

        let keypair = KemKeypair::generate().unwrap();
        relay
            .handle_message(
                producer,
                RelayMessage::KeyExchange {
                    stream_id: "demo".into(),
                    public_key: Bytes::copy_from_slice(keypair.public_key()),
                },
            )
            .await
            .unwrap();

        let responses = drain(&mut producer_rx);
        assert_eq!(responses.len(), 1);
        match &responses[0] {
            RelayMessage::KeyExchangeResponse {
                stream_id,
                ciphertext,
            } => {
                assert_eq!(stream_id, "demo");
                assert!(keypair.decapsulate(ciphertext).is_ok());
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(drain(&mut viewer_rx).is_empty());
    }

    #[tokio::test]
    async fn test_bad_public_key_gets_no_response() {
        let relay = relay();
        let (producer, mut rx) = relay.connect().await;
        relay
            .handle_message(
                producer,
                RelayMessage::RegisterStream {
                    stream_id: "demo".into(),
                },
            )
            .await
            .unwrap();
        drain(&mut rx);

        let result = relay
            .handle_message(
                producer,
                RelayMessage::KeyExchange {
                    stream_id: "demo".into(),
                    public_key: Bytes::from_static(b"short"),
                },
            )
            .await;
        assert!(matches!(result, Err(RelayError::Handshake { .. })));
        assert!(drain(&mut rx).is_empty());
        assert_eq!(relay.snapshot().await.sessions.registered, 1);
    }

    #[tokio::test]
    async fn test_short_public_key_rejected_at_decode() {
        let relay = relay();
        let (producer, mut rx) = relay.connect().await;
        relay
            .handle_message(
                producer,
                RelayMessage::RegisterStream {
                    stream_id: "demo".into(),
                },
            )
            .await
            .unwrap();
        drain(&mut rx);

        let text = shroud_common::encode(&RelayMessage::KeyExchange {
            stream_id: "demo".into(),
            public_key: Bytes::from_static(b"short"),
        })
        .unwrap();
        let result = relay.handle_text(producer, &text).await;
        assert!(matches!(result, Err(RelayError::Protocol(_))));
        assert!(drain(&mut rx).is_empty());
        assert_eq!(relay.snapshot().await.sessions.registered, 1);
    }

    #[tokio::test]
    async fn test_toggle_broadcasts_status() {
        let relay = relay();
        let (conn, mut rx) = relay.connect().await;
        drain(&mut rx);

        relay
            .handle_message(conn, RelayMessage::ToggleDecryption)
            .await
            .unwrap();
        assert!(!relay.decryption_enabled());
        assert_eq!(
            drain(&mut rx),
            vec![RelayMessage::DecryptionStatus { enabled: false }]
        );
    }

    #[tokio::test]
    async fn test_relay_only_messages_rejected() {
        let relay = relay();
        let (conn, _rx) = relay.connect().await;
        let result = relay
            .handle_message(conn, RelayMessage::DecryptionStatus { enabled: false })
            .await;
        assert!(matches!(result, Err(RelayError::Protocol(_))));
        assert!(relay.decryption_enabled());
    }

    #[tokio::test]
    async fn test_malformed_text_rejected() {
        let relay = relay();
        let (conn, _rx) = relay.connect().await;
        assert!(relay.handle_text(conn, "{\"v\":1}").await.is_err());
        assert!(relay
            .handle_text(conn, r#"{"v":1,"event":"get_stream_list"}"#)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_disconnect_without_streams_is_quiet() {
        let relay = relay();
        let (quiet, _quiet_rx) = relay.connect().await;
        let (_viewer, mut viewer_rx) = relay.connect().await;
        drain(&mut viewer_rx);

        relay.disconnect(quiet).await;
        assert!(drain(&mut viewer_rx).is_empty());
        assert_eq!(relay.hub().len().await, 1);
    }
}
