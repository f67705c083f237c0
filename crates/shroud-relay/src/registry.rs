//! Stream registry and per-stream handshake state machine.
//!
//! ```text
//! Unregistered -> Registered -> KeyExchanged -> Active -> Closed
//!                                   ^             |
//!                                   +-- re-key ---+
//! ```
//!
//! - `Registered`: a producer connection claimed the id
//! - `KeyExchanged`: a handshake stored the stream secret
//! - `Active`: the first frame started the ingest pipeline
//! - `Closed`: the owning connection went away; terminal
//!
//! The registry is a plain struct; the relay wraps it in a single mutex so
//! every operation here is atomic with respect to the others.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use shroud_common::FrameEnvelope;
use shroud_crypto::{FrameCipher, SharedSecret};
use tracing::info;

use crate::hub::ConnectionId;
use crate::ingest::{
    IngestContext, IngestError, IngestHandle, SealedPipeline, StreamCounters, StreamStats,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    Registered,
    KeyExchanged,
    Active,
    Closed,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("unknown stream {0}")]
    UnknownStream(String),

    #[error("connection {connection} does not own stream {stream_id}")]
    NotOwner {
        stream_id: String,
        connection: ConnectionId,
    },

    #[error("no completed handshake for stream {0}")]
    MissingSecret(String),

    #[error("stream {stream_id}: {source}")]
    Ingest {
        stream_id: String,
        #[source]
        source: IngestError,
    },
}

/// What a `register` call changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    /// New id, directory changed.
    Inserted,
    /// Known id, now bound to a different connection.
    Rebound,
    /// Known id, same connection.
    Unchanged,
}

/// One logical producer stream.
#[derive(Debug)]
pub struct StreamSession {
    stream_id: String,
    state: StreamState,
    secret: Option<SharedSecret>,
    owner: ConnectionId,
    ingest: Option<IngestHandle>,
    /// Pipeline replaced by a re-key, possibly still draining.
    draining: Option<SealedPipeline>,
    counters: Arc<StreamCounters>,
    handshakes: u64,
    created_at: Instant,
}

impl StreamSession {
    fn new(stream_id: String, owner: ConnectionId) -> Self {
        Self {
            stream_id,
            state: StreamState::Registered,
            secret: None,
            owner,
            ingest: None,
            draining: None,
            counters: Arc::new(StreamCounters::default()),
            handshakes: 0,
            created_at: Instant::now(),
        }
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn owner(&self) -> ConnectionId {
        self.owner
    }

    pub fn has_secret(&self) -> bool {
        self.secret.is_some()
    }

    pub fn handshakes(&self) -> u64 {
        self.handshakes
    }

    pub fn age(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }

    pub fn stats(&self) -> StreamStats {
        self.counters.snapshot()
    }

    /// Store a handshake secret. Last handshake wins.
    ///
    /// An active pipeline keeps its old key: it is sealed so it finishes the
    /// frames already queued, and the session drops back to `KeyExchanged`.
    fn install_secret(&mut self, secret: SharedSecret) {
        if let Some(handle) = self.ingest.take() {
            self.draining = Some(handle.seal());
        }
        self.secret = Some(secret);
        self.state = StreamState::KeyExchanged;
        self.handshakes += 1;
    }

    fn activate(&mut self, ctx: &IngestContext) -> Result<(), RegistryError> {
        let secret = self
            .secret
            .as_ref()
            .ok_or_else(|| RegistryError::MissingSecret(self.stream_id.clone()))?;
        let handle = IngestHandle::spawn(
            ctx,
            self.stream_id.clone(),
            FrameCipher::from_secret(secret),
            self.counters.clone(),
            self.draining.take(),
        );
        self.ingest = Some(handle);
        self.state = StreamState::Active;
        info!("stream {} active", self.stream_id);
        Ok(())
    }

    /// Release the secret and stop the pipeline, including one still
    /// draining from before a re-key.
    fn close(&mut self) {
        if let Some(handle) = self.ingest.take() {
            drop(handle.close());
        }
        if let Some(sealed) = self.draining.take() {
            drop(sealed.close());
        }
        self.secret = None;
        self.state = StreamState::Closed;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StreamStateCounts {
    pub registered: usize,
    pub key_exchanged: usize,
    pub active: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub stream_id: String,
    pub state: StreamState,
    #[serde(flatten)]
    pub stats: StreamStats,
}

#[derive(Debug, Default)]
pub struct StreamRegistry {
    sessions: HashMap<String, StreamSession>,
    /// Registration order of live ids.
    directory: Vec<String>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `stream_id` for `owner`.
    ///
    /// Idempotent: a known id is never duplicated in the directory, only
    /// rebound to the calling connection.
    pub fn register(&mut self, stream_id: &str, owner: ConnectionId) -> RegisterOutcome {
        if let Some(session) = self.sessions.get_mut(stream_id) {
            if session.owner == owner {
                return RegisterOutcome::Unchanged;
            }
            session.owner = owner;
            return RegisterOutcome::Rebound;
        }
        self.sessions.insert(
            stream_id.to_string(),
            StreamSession::new(stream_id.to_string(), owner),
        );
        self.directory.push(stream_id.to_string());
        RegisterOutcome::Inserted
    }

    /// Record the secret of a completed handshake.
    ///
    /// Only the owning connection may key a registered stream.
    pub fn complete_handshake(
        &mut self,
        stream_id: &str,
        owner: ConnectionId,
        secret: SharedSecret,
    ) -> Result<(), RegistryError> {
        let session = self.owned_session(stream_id, owner)?;
        session.install_secret(secret);
        Ok(())
    }

    /// Hand a frame to its stream's pipeline, starting the pipeline on the
    /// first frame after a handshake.
    pub fn enqueue(
        &mut self,
        owner: ConnectionId,
        envelope: FrameEnvelope,
        ctx: &IngestContext,
    ) -> Result<(), RegistryError> {
        let session = self.owned_session(&envelope.stream_id, owner)?;

        match session.state {
            StreamState::Registered | StreamState::Closed => {
                return Err(RegistryError::MissingSecret(session.stream_id.clone()));
            }
            StreamState::KeyExchanged => session.activate(ctx)?,
            StreamState::Active => {}
        }
        session
            .counters
            .received
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        let handle = session
            .ingest
            .as_ref()
            .ok_or_else(|| RegistryError::MissingSecret(session.stream_id.clone()))?;
        handle.try_enqueue(envelope).map_err(|source| {
            if matches!(source, IngestError::QueueFull) {
                session
                    .counters
                    .overflowed
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            }
            RegistryError::Ingest {
                stream_id: session.stream_id.clone(),
                source,
            }
        })
    }

    pub fn lookup(&self, stream_id: &str) -> Option<&StreamSession> {
        self.sessions.get(stream_id)
    }

    /// Close and remove every stream owned by `owner`.
    ///
    /// Returns the closed sessions; their secrets are already gone.
    pub fn remove_connection(&mut self, owner: ConnectionId) -> Vec<StreamSession> {
        let owned: Vec<String> = self
            .directory
            .iter()
            .filter(|id| self.sessions.get(*id).is_some_and(|s| s.owner == owner))
            .cloned()
            .collect();

        let mut closed = Vec::with_capacity(owned.len());
        for stream_id in owned {
            if let Some(mut session) = self.remove(&stream_id) {
                session.close();
                closed.push(session);
            }
        }
        closed
    }

    fn remove(&mut self, stream_id: &str) -> Option<StreamSession> {
        self.directory.retain(|id| id != stream_id);
        self.sessions.remove(stream_id)
    }

    /// Directory in registration order.
    pub fn snapshot(&self) -> Vec<String> {
        self.directory.clone()
    }

    pub fn summaries(&self) -> Vec<SessionSummary> {
        self.directory
            .iter()
            .filter_map(|id| self.sessions.get(id))
            .map(|session| SessionSummary {
                stream_id: session.stream_id.clone(),
                state: session.state,
                stats: session.stats(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn state_counts(&self) -> StreamStateCounts {
        let mut counts = StreamStateCounts::default();
        for session in self.sessions.values() {
            match session.state {
                StreamState::Registered => counts.registered += 1,
                StreamState::KeyExchanged => counts.key_exchanged += 1,
                StreamState::Active => counts.active += 1,
                StreamState::Closed => {}
            }
        }
        counts
    }

    fn owned_session(
        &mut self,
        stream_id: &str,
        owner: ConnectionId,
    ) -> Result<&mut StreamSession, RegistryError> {
        let session = self
            .sessions
            .get_mut(stream_id)
            .ok_or_else(|| RegistryError::UnknownStream(stream_id.to_string()))?;
        if session.owner != owner {
            return Err(RegistryError::NotOwner {
                stream_id: stream_id.to_string(),
                connection: owner,
            });
        }
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::Hub;
    use crate::pool::DecodePool;
    use crate::toggle::DecryptionToggle;
    use bytes::Bytes;
    use shroud_crypto::kem::SHARED_SECRET_LEN;
    use shroud_media::{RawCodec, Resolution};

    fn secret(byte: u8) -> SharedSecret {
        SharedSecret::from_bytes([byte; SHARED_SECRET_LEN])
    }

    fn context() -> IngestContext {
        IngestContext {
            hub: Hub::new(8),
            pool: DecodePool::new(1),
            toggle: DecryptionToggle::new(true),
            codec: Arc::new(RawCodec),
            output: Resolution::new(4, 4),
            queue_capacity: 8,
            replay_window: 16,
        }
    }

    fn envelope(stream_id: &str) -> FrameEnvelope {
        FrameEnvelope {
            stream_id: stream_id.into(),
            ciphertext: Bytes::from_static(b"opaque"),
            nonce: Bytes::from(vec![0u8; 12]),
            tag: Bytes::from(vec![0u8; 16]),
        }
    }

    #[test]
    fn test_register_idempotent() {
        let mut registry = StreamRegistry::new();
        assert_eq!(registry.register("demo", 1), RegisterOutcome::Inserted);
        assert_eq!(registry.register("demo", 1), RegisterOutcome::Unchanged);
        assert_eq!(registry.register("demo", 2), RegisterOutcome::Rebound);
        assert_eq!(registry.snapshot(), vec!["demo"]);
        assert_eq!(registry.lookup("demo").unwrap().owner(), 2);
    }

    #[test]
    fn test_directory_keeps_registration_order() {
        let mut registry = StreamRegistry::new();
        for id in ["c", "a", "b"] {
            registry.register(id, 1);
        }
        assert_eq!(registry.snapshot(), vec!["c", "a", "b"]);
    }

    #[test]
    fn test_handshake_lifecycle() {
        let mut registry = StreamRegistry::new();
        registry.register("demo", 1);
        let session = registry.lookup("demo").unwrap();
        assert_eq!(session.state(), StreamState::Registered);
        assert!(!session.has_secret());

        registry.complete_handshake("demo", 1, secret(1)).unwrap();
        let session = registry.lookup("demo").unwrap();
        assert_eq!(session.state(), StreamState::KeyExchanged);
        assert!(session.has_secret());

        // Last handshake wins.
        registry.complete_handshake("demo", 1, secret(2)).unwrap();
        assert_eq!(registry.lookup("demo").unwrap().handshakes(), 2);
    }

    #[test]
    fn test_handshake_requires_registration_and_ownership() {
        let mut registry = StreamRegistry::new();
        assert!(matches!(
            registry.complete_handshake("ghost", 1, secret(1)),
            Err(RegistryError::UnknownStream(_))
        ));

        registry.register("demo", 1);
        assert!(matches!(
            registry.complete_handshake("demo", 2, secret(1)),
            Err(RegistryError::NotOwner { connection: 2, .. })
        ));
        assert_eq!(
            registry.lookup("demo").unwrap().state(),
            StreamState::Registered
        );
    }

    #[tokio::test]
    async fn test_frame_before_handshake_rejected() {
        let mut registry = StreamRegistry::new();
        let ctx = context();
        assert!(matches!(
            registry.enqueue(1, envelope("demo"), &ctx),
            Err(RegistryError::UnknownStream(_))
        ));

        registry.register("demo", 1);
        assert!(matches!(
            registry.enqueue(1, envelope("demo"), &ctx),
            Err(RegistryError::MissingSecret(_))
        ));
        assert_eq!(
            registry.lookup("demo").unwrap().state(),
            StreamState::Registered
        );
        assert_eq!(registry.lookup("demo").unwrap().stats().frames_received, 0);
    }

    #[tokio::test]
    async fn test_first_frame_activates() {
        let mut registry = StreamRegistry::new();
        let ctx = context();
        registry.register("demo", 1);
        registry.complete_handshake("demo", 1, secret(1)).unwrap();

        registry.enqueue(1, envelope("demo"), &ctx).unwrap();
        assert_eq!(registry.lookup("demo").unwrap().state(), StreamState::Active);
        assert_eq!(registry.state_counts().active, 1);

        registry.enqueue(1, envelope("demo"), &ctx).unwrap();
        assert_eq!(registry.lookup("demo").unwrap().stats().frames_received, 2);
    }

    #[tokio::test]
    async fn test_frames_from_other_connection_rejected() {
        let mut registry = StreamRegistry::new();
        let ctx = context();
        registry.register("demo", 1);
        registry.complete_handshake("demo", 1, secret(1)).unwrap();
        assert!(matches!(
            registry.enqueue(7, envelope("demo"), &ctx),
            Err(RegistryError::NotOwner { .. })
        ));
    }

    #[tokio::test]
    async fn test_rekey_while_active_returns_to_key_exchanged() {
        let mut registry = StreamRegistry::new();
        let ctx = context();
        registry.register("demo", 1);
        registry.complete_handshake("demo", 1, secret(1)).unwrap();
        registry.enqueue(1, envelope("demo"), &ctx).unwrap();

        registry.complete_handshake("demo", 1, secret(2)).unwrap();
        assert_eq!(
            registry.lookup("demo").unwrap().state(),
            StreamState::KeyExchanged
        );

        registry.enqueue(1, envelope("demo"), &ctx).unwrap();
        assert_eq!(registry.lookup("demo").unwrap().state(), StreamState::Active);
    }

    #[tokio::test]
    async fn test_remove_connection_closes_owned_streams() {
        let mut registry = StreamRegistry::new();
        let ctx = context();
        registry.register("a", 1);
        registry.register("b", 2);
        registry.register("c", 1);
        registry.complete_handshake("a", 1, secret(1)).unwrap();
        registry.enqueue(1, envelope("a"), &ctx).unwrap();

        let closed = registry.remove_connection(1);
        let ids: Vec<&str> = closed.iter().map(|s| s.stream_id()).collect();
        assert_eq!(ids, vec!["a", "c"]);
        for session in &closed {
            assert_eq!(session.state(), StreamState::Closed);
            assert!(!session.has_secret());
        }

        assert_eq!(registry.snapshot(), vec!["b"]);
        assert!(matches!(
            registry.enqueue(1, envelope("a"), &ctx),
            Err(RegistryError::UnknownStream(_))
        ));
        assert!(registry.remove_connection(1).is_empty());
    }

    #[test]
    fn test_closed_id_can_be_reused() {
        let mut registry = StreamRegistry::new();
        registry.register("demo", 1);
        registry.complete_handshake("demo", 1, secret(1)).unwrap();
        registry.remove_connection(1);

        assert_eq!(registry.register("demo", 2), RegisterOutcome::Inserted);
        let session = registry.lookup("demo").unwrap();
        assert_eq!(session.state(), StreamState::Registered);
        assert!(!session.has_secret());
        assert_eq!(session.handshakes(), 0);
    }

    #[test]
    fn test_summaries_follow_directory() {
        let mut registry = StreamRegistry::new();
        registry.register("x", 1);
        registry.register("y", 1);
        registry.complete_handshake("y", 1, secret(3)).unwrap();
        let summaries = registry.summaries();
        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].stream_id, "x");
        assert_eq!(summaries[1].state, StreamState::KeyExchanged);
        assert_eq!(registry.len(), 2);
    }
}
