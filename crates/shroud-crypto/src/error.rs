use thiserror::Error;

/// Errors raised by the handshake and frame cipher.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid public key: expected {expected} bytes, got {actual}")]
    InvalidPublicKey { expected: usize, actual: usize },

    #[error("invalid KEM ciphertext: expected {expected} bytes, got {actual}")]
    InvalidCiphertext { expected: usize, actual: usize },

    #[error("key encapsulation failed: {0}")]
    Encapsulation(String),

    #[error("key decapsulation failed: {0}")]
    Decapsulation(String),

    #[error("invalid nonce length {0}")]
    InvalidNonce(usize),

    #[error("invalid tag length {0}")]
    InvalidTag(usize),

    #[error("encryption failed")]
    EncryptionFailed,

    /// Tag mismatch. Never returns partial plaintext.
    #[error("authentication failed")]
    AuthenticationFailed,

    #[error("replayed nonce")]
    Replay,
}
