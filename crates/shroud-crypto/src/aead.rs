//! Per-frame authenticated encryption.
//!
//! # Wire Format
//!
//! A sealed frame is carried as three separate fields:
//! ```text
//! frame: [ciphertext, same length as plaintext]
//! nonce: [12 bytes, random per frame]
//! tag:   [16 bytes, Poly1305]
//! ```
//!
//! No associated data is bound. The stream id travels in clear next to the
//! frame and is checked by the relay against the session that owns the key.

use chacha20poly1305::{
    aead::{AeadInPlace, KeyInit},
    ChaCha20Poly1305, Key, Nonce, Tag,
};
use rand::{rngs::OsRng, RngCore};
use shroud_common::{NONCE_LEN, TAG_LEN};

use crate::error::CryptoError;
use crate::kem::SharedSecret;

/// ChaCha20-Poly1305 key length.
pub const AEAD_KEY_LEN: usize = 32;

/// Output of [`FrameCipher::seal`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedFrame {
    pub ciphertext: Vec<u8>,
    pub nonce: [u8; NONCE_LEN],
    pub tag: [u8; TAG_LEN],
}

/// Frame cipher bound to one stream key.
#[derive(Clone)]
pub struct FrameCipher {
    cipher: ChaCha20Poly1305,
}

impl std::fmt::Debug for FrameCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameCipher").finish_non_exhaustive()
    }
}

impl FrameCipher {
    /// Create a cipher from a raw 32-byte key.
    pub fn new(key: &[u8; AEAD_KEY_LEN]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key)),
        }
    }

    /// Create a cipher keyed with the prefix of a handshake secret.
    pub fn from_secret(secret: &SharedSecret) -> Self {
        Self::new(&secret.aead_key())
    }

    /// Encrypt a frame under a fresh random nonce.
    ///
    /// The nonce is drawn from the operating system CSPRNG, so with a
    /// 96-bit space collisions under one key are not a practical concern
    /// for the lifetime of a stream.
    pub fn seal(&self, plaintext: &[u8]) -> Result<SealedFrame, CryptoError> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        self.seal_with_nonce(plaintext, nonce)
    }

    /// Encrypt a frame under a caller-chosen nonce.
    ///
    /// The caller is responsible for never reusing `nonce` under this key.
    pub fn seal_with_nonce(
        &self,
        plaintext: &[u8],
        nonce: [u8; NONCE_LEN],
    ) -> Result<SealedFrame, CryptoError> {
        let mut buffer = plaintext.to_vec();
        let tag = self
            .cipher
            .encrypt_in_place_detached(Nonce::from_slice(&nonce), b"", &mut buffer)
            .map_err(|_| CryptoError::EncryptionFailed)?;

        let mut tag_bytes = [0u8; TAG_LEN];
        tag_bytes.copy_from_slice(tag.as_slice());

        Ok(SealedFrame {
            ciphertext: buffer,
            nonce,
            tag: tag_bytes,
        })
    }

    /// Decrypt and verify a frame.
    ///
    /// # Errors
    ///
    /// - [`CryptoError::InvalidNonce`] / [`CryptoError::InvalidTag`] on wrong lengths
    /// - [`CryptoError::AuthenticationFailed`] if the tag does not verify
    pub fn open(&self, ciphertext: &[u8], nonce: &[u8], tag: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if nonce.len() != NONCE_LEN {
            return Err(CryptoError::InvalidNonce(nonce.len()));
        }
        if tag.len() != TAG_LEN {
            return Err(CryptoError::InvalidTag(tag.len()));
        }

        let mut buffer = ciphertext.to_vec();
        self.cipher
            .decrypt_in_place_detached(
                Nonce::from_slice(nonce),
                b"",
                &mut buffer,
                Tag::from_slice(tag),
            )
            .map_err(|_| CryptoError::AuthenticationFailed)?;
        Ok(buffer)
    }
}
