//! Shroud producer.
//!
//! Opens a frame source, performs the Kyber handshake with the relay and
//! streams ChaCha20-Poly1305 sealed frames at a fixed rate.

#![forbid(unsafe_code)]

pub mod capture;
pub mod client;
pub mod config;
pub mod producer;

pub use capture::{CaptureConfig, CaptureError, CapturePipeline, PipelineStats};
pub use client::{ClientError, ClientTasks, RelayClient};
pub use config::StreamConfig;
