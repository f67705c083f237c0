//! Cryptographic primitives for Shroud.
//!
//! This crate provides:
//! - Kyber key encapsulation for the per-stream handshake
//! - ChaCha20-Poly1305 sealing of individual frames with detached tags
//! - A bounded nonce window the relay uses to drop replayed frames
//!
//! # Design
//!
//! The producer holds a Kyber keypair for the lifetime of the process. For
//! every stream it sends the public key to the relay, which encapsulates
//! against it and keeps the resulting secret. Both sides use the first 32
//! bytes of that secret as the ChaCha20-Poly1305 key.
//!
//! Every frame carries its own random 96-bit nonce, so frames can be opened
//! independently of each other and in any order.

#![forbid(unsafe_code)]

pub mod aead;
pub mod error;
pub mod kem;
pub mod replay;

pub use aead::{FrameCipher, SealedFrame, AEAD_KEY_LEN};
pub use error::CryptoError;
pub use kem::{encapsulate, KemKeypair, SharedSecret};
pub use replay::NonceWindow;
