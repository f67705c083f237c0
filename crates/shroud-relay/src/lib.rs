//! Shroud relay.
//!
//! Producers register a stream, run a Kyber handshake and send
//! ChaCha20-Poly1305 sealed frames. The relay decrypts each stream on its
//! own ingest worker, re-encodes the frames at the broadcast resolution and
//! fans them out to every subscriber on the namespace.
//!
//! # Design
//!
//! - [`registry`]: one registry behind one mutex holds every stream's state
//! - [`ingest`]: one bounded queue and one worker per active stream
//! - [`pool`]: a fixed-size pool shared by all workers for CPU-bound steps
//! - [`hub`]: per-connection outboxes; frames are lossy, control is not
//! - [`toggle`]: the global decryption switch, an atomic flag

#![forbid(unsafe_code)]

pub mod config;
pub mod http;
pub mod hub;
pub mod ingest;
pub mod pool;
pub mod registry;
pub mod relay;
pub mod signal;
pub mod toggle;

pub use config::RelayConfig;
pub use hub::{ConnectionId, Hub, Outbox};
pub use ingest::{IngestError, SealedPipeline, StreamStats};
pub use pool::{DecodePool, PoolError, PoolStats};
pub use registry::{RegisterOutcome, RegistryError, StreamRegistry, StreamState};
pub use relay::{Relay, RelayError, RelaySnapshot};
pub use toggle::DecryptionToggle;
